//! Server version coercion.

use regex::Regex;
use semver::Version;
use serde::Serialize;
use std::sync::LazyLock;

static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("valid regex"));

/// Version reported by a server, coerced to semver when a numeric version can be
/// found in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseVersion {
    raw: String,
    #[serde(skip)]
    parsed: Option<Version>,
}

impl DatabaseVersion {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let parsed = coerce(&raw);
        Self { raw, parsed }
    }

    /// The string the server returned.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn semver(&self) -> Option<&Version> {
        self.parsed.as_ref()
    }

    /// Whether this version is older than `minimum`. Unparseable versions are
    /// never considered older.
    pub fn is_below(&self, minimum: &str) -> bool {
        match (&self.parsed, coerce(minimum)) {
            (Some(version), Some(minimum)) => *version < minimum,
            _ => false,
        }
    }
}

impl std::fmt::Display for DatabaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.parsed {
            Some(version) => write!(f, "{}", version),
            None => f.write_str(&self.raw),
        }
    }
}

/// Pull the first `major[.minor[.patch]]` out of a version string, so that
/// "8.0.34-0ubuntu0.22.04.1" becomes 8.0.34 and "15.4" becomes 15.4.0.
pub fn coerce(raw: &str) -> Option<Version> {
    let captures = VERSION_REGEX.captures(raw)?;
    let part = |index: usize| -> Option<u64> {
        match captures.get(index) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(0),
        }
    };
    Some(Version::new(part(1)?, part(2)?, part(3)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_from_many_threads() {
        let handles: Vec<_> = (0..8)
            .map(|i| std::thread::spawn(move || coerce(&format!("{}.1.2-log", i))))
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), Some(Version::new(i as u64, 1, 2)));
        }
    }

    #[test]
    fn test_coerce_common_server_strings() {
        let cases = [
            ("15.4", "15.4.0"),
            ("8.0.34-0ubuntu0.22.04.1", "8.0.34"),
            ("10.6.12-MariaDB-1:10.6.12+maria~ubu2004", "10.6.12"),
            ("3.45.1", "3.45.1"),
            ("16.00.1000", "16.0.1000"),
            ("PostgreSQL 9.6.24 on x86_64", "9.6.24"),
            ("23", "23.0.0"),
        ];
        for (raw, expected) in cases {
            assert_eq!(coerce(raw).unwrap().to_string(), expected, "{}", raw);
        }
    }

    #[test]
    fn test_unparseable_keeps_raw() {
        let version = DatabaseVersion::parse("unknown");
        assert!(version.semver().is_none());
        assert_eq!(version.to_string(), "unknown");
        assert!(!version.is_below("9.5.0"));
    }

    #[test]
    fn test_is_below_minimum() {
        assert!(DatabaseVersion::parse("9.4.26").is_below("9.5.0"));
        assert!(!DatabaseVersion::parse("9.5").is_below("9.5.0"));
        assert!(DatabaseVersion::parse("10.1.40-MariaDB").is_below("10.1.44"));
    }
}
