//! MariaDB connector: the MySQL wire protocol with MariaDB's error table and
//! time zone handling.

use super::mysql::{self, MySqlConnection};
use super::{DialectConnector, ErrorListener, is_zone_name, utc_offset};
use crate::error::{DbError, DbResult, NativeError};
use crate::models::{ConnectionOptions, Dialect};
use async_trait::async_trait;
use chrono::{Offset, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, Default)]
pub struct MariaDbConnector;

impl MariaDbConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Session time zone to set, or `None` to keep the server default.
///
/// Offsets are rewritten to the canonical `+HH:MM` form MariaDB accepts
/// (`Z`, `+2`, `+0200` all work). Zone names are resolved to their current
/// offset, so servers without time zone tables accept them. Names missing
/// from the bundled database are sent unchanged.
fn session_timezone(options: &ConnectionOptions) -> DbResult<Option<String>> {
    if options.keep_default_timezone() {
        return Ok(None);
    }
    let timezone = options.timezone_or_default();
    if let Some(offset) = utc_offset(timezone) {
        return Ok(Some(offset.to_string()));
    }
    if let Ok(zone) = timezone.parse::<Tz>() {
        let offset = zone.offset_from_utc_datetime(&Utc::now().naive_utc()).fix();
        return Ok(Some(offset.to_string()));
    }
    if is_zone_name(timezone) {
        return Ok(Some(timezone.to_string()));
    }
    Err(DbError::InvalidConnectionParameters(NativeError::coded(
        "EINVAL",
        format!("invalid time zone '{}'", timezone),
    )))
}

#[async_trait]
impl DialectConnector for MariaDbConnector {
    type Connection = MySqlConnection;

    fn dialect(&self) -> Dialect {
        Dialect::Mariadb
    }

    async fn connect(
        &self,
        options: &ConnectionOptions,
        listener: ErrorListener,
    ) -> DbResult<MySqlConnection> {
        let timezone = session_timezone(options)?;
        mysql::open(Dialect::Mariadb, options, listener, timezone).await
    }

    async fn disconnect(&self, connection: &mut MySqlConnection) -> DbResult<()> {
        connection.close().await
    }

    fn validate(&self, connection: &MySqlConnection) -> bool {
        connection.is_valid()
    }

    async fn database_version(&self, connection: &mut MySqlConnection) -> DbResult<String> {
        mysql::server_version(connection).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_timezone(tz: &str) -> ConnectionOptions {
        ConnectionOptions {
            timezone: Some(tz.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_offsets_are_normalized() {
        assert_eq!(session_timezone(&ConnectionOptions::default()).unwrap().as_deref(), Some("+00:00"));
        assert_eq!(session_timezone(&with_timezone("Z")).unwrap().as_deref(), Some("+00:00"));
        assert_eq!(session_timezone(&with_timezone("+0200")).unwrap().as_deref(), Some("+02:00"));
        assert_eq!(session_timezone(&with_timezone("-5")).unwrap().as_deref(), Some("-05:00"));
    }

    #[test]
    fn test_zone_names_resolve_to_offsets() {
        let resolved = session_timezone(&with_timezone("America/New_York")).unwrap().unwrap();
        assert!(resolved == "-05:00" || resolved == "-04:00", "got {resolved}");
        assert_eq!(session_timezone(&with_timezone("Asia/Kolkata")).unwrap().as_deref(), Some("+05:30"));
        assert_eq!(session_timezone(&with_timezone("Etc/UTC")).unwrap().as_deref(), Some("+00:00"));
    }

    #[test]
    fn test_unknown_zone_names_pass_through() {
        assert_eq!(
            session_timezone(&with_timezone("Mars/Olympus_Mons")).unwrap().as_deref(),
            Some("Mars/Olympus_Mons")
        );
    }

    #[test]
    fn test_out_of_range_offset_rejected() {
        let err = session_timezone(&with_timezone("+9999999")).unwrap_err();
        assert!(matches!(err, DbError::InvalidConnectionParameters(_)), "unexpected error: {err}");
    }

    #[test]
    fn test_keep_default_timezone() {
        let options = ConnectionOptions {
            keep_default_timezone: Some(true),
            timezone: Some("+05:00".into()),
            ..Default::default()
        };
        assert!(session_timezone(&options).unwrap().is_none());
    }

    #[test]
    fn test_garbage_timezone_rejected() {
        assert!(session_timezone(&with_timezone("!!")).is_err());
    }
}
