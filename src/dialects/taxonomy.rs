//! Native error code tables.
//!
//! Each dialect maps the codes its driver reports onto [`ConnectionErrorKind`].
//! Anything not in a table, including errors without a code, is
//! [`ConnectionErrorKind::Generic`]. The tables also list which codes mean the
//! socket is gone and the connection must never be lent out again.

use crate::error::{ConnectionErrorKind, DbError, NativeError};
use crate::models::Dialect;

use ConnectionErrorKind::{
    AccessDenied, HostNotFound, HostNotReachable, InvalidConnection, Refused, TimedOut,
};

pub const POSTGRES_CODES: &[(&str, ConnectionErrorKind)] = &[
    ("ECONNREFUSED", Refused),
    ("ENOTFOUND", HostNotFound),
    ("EHOSTUNREACH", HostNotReachable),
    ("EINVAL", InvalidConnection),
    ("ETIMEDOUT", TimedOut),
    ("28P01", AccessDenied),
    ("28000", AccessDenied),
];

pub const MYSQL_CODES: &[(&str, ConnectionErrorKind)] = &[
    ("ECONNREFUSED", Refused),
    ("ER_ACCESS_DENIED_ERROR", AccessDenied),
    ("ENOTFOUND", HostNotFound),
    ("EHOSTUNREACH", HostNotReachable),
    ("EINVAL", InvalidConnection),
    ("ETIMEDOUT", TimedOut),
];

pub const MARIADB_CODES: &[(&str, ConnectionErrorKind)] = &[
    ("ECONNREFUSED", Refused),
    ("ER_ACCESS_DENIED_ERROR", AccessDenied),
    ("ER_ACCESS_DENIED_NO_PASSWORD_ERROR", AccessDenied),
    ("ENOTFOUND", HostNotFound),
    ("EHOSTUNREACH", HostNotReachable),
    ("ENETUNREACH", HostNotReachable),
    ("EINVAL", InvalidConnection),
    ("ETIMEDOUT", TimedOut),
];

pub const SQLITE_CODES: &[(&str, ConnectionErrorKind)] = &[
    // SQLITE_CANTOPEN
    ("14", InvalidConnection),
    // SQLITE_NOTADB
    ("26", InvalidConnection),
    // SQLITE_PERM
    ("3", AccessDenied),
    // SQLITE_AUTH
    ("23", AccessDenied),
    ("ETIMEDOUT", TimedOut),
];

pub const MSSQL_CODES: &[(&str, ConnectionErrorKind)] = &[
    ("ECONNREFUSED", Refused),
    ("ENOTFOUND", HostNotFound),
    ("EHOSTUNREACH", HostNotReachable),
    ("ENETUNREACH", HostNotReachable),
    ("EADDRNOTAVAIL", HostNotReachable),
    ("ELOGIN", AccessDenied),
    ("ER_ACCESS_DENIED_ERROR", AccessDenied),
    ("EINVAL", InvalidConnection),
    ("ETIMEOUT", TimedOut),
    ("ETIMEDOUT", TimedOut),
];

/// Socket failures reported under `ESOCKET`, recognised by the text of the message.
pub const MSSQL_SOCKET_MESSAGES: &[(&str, ConnectionErrorKind)] = &[
    ("EHOSTUNREACH", HostNotReachable),
    ("ENETUNREACH", HostNotReachable),
    ("EADDRNOTAVAIL", HostNotReachable),
    ("ENOTFOUND", HostNotFound),
    ("ECONNREFUSED", Refused),
];

pub const ORACLE_CODES: &[(&str, ConnectionErrorKind)] = &[
    // TNS: protocol adapter error
    ("ORA-12560", Refused),
    // TNS: could not resolve the connect identifier
    ("ORA-12154", Refused),
    // TNS: listener does not know of SID
    ("ORA-12505", Refused),
    // TNS: listener does not know of service
    ("ORA-12514", Refused),
    ("NJS-511", Refused),
    ("NJS-516", Refused),
    ("NJS-517", Refused),
    ("NJS-520", Refused),
    // account locked
    ("ORA-28000", AccessDenied),
    // no matching authentication protocol
    ("ORA-28040", AccessDenied),
    // invalid username/password
    ("ORA-01017", AccessDenied),
    ("NJS-506", AccessDenied),
    ("NJS-507", AccessDenied),
    ("NJS-508", AccessDenied),
    ("NJS-509", AccessDenied),
    // TNS: no listener
    ("ORA-12541", HostNotReachable),
    ("NJS-503", HostNotReachable),
    ("NJS-500", HostNotReachable),
    ("NJS-512", InvalidConnection),
    ("NJS-515", InvalidConnection),
    ("NJS-518", InvalidConnection),
    ("NJS-519", InvalidConnection),
    // TNS: connect timeout
    ("ORA-12170", TimedOut),
];

const MYSQL_FATAL: &[&str] = &["ESOCKET", "ECONNRESET", "EPIPE", "PROTOCOL_CONNECTION_LOST"];
const MSSQL_FATAL: &[&str] = &["ESOCKET", "ECONNRESET"];
const POSTGRES_FATAL: &[&str] = &[
    "ESOCKET",
    "ECONNRESET",
    "EPIPE",
    "PROTOCOL_CONNECTION_LOST",
    // admin_shutdown, crash_shutdown, cannot_connect_now
    "57P01",
    "57P02",
    "57P03",
    // connection_failure, connection_does_not_exist
    "08006",
    "08003",
];
const ORACLE_FATAL: &[&str] = &["ORA-03113", "ORA-03114", "DPI-1080", "DPI-1010"];

/// The code table for `dialect`.
pub fn codes(dialect: Dialect) -> &'static [(&'static str, ConnectionErrorKind)] {
    match dialect {
        Dialect::Postgres => POSTGRES_CODES,
        Dialect::Mysql => MYSQL_CODES,
        Dialect::Mariadb => MARIADB_CODES,
        Dialect::Sqlite => SQLITE_CODES,
        Dialect::Mssql => MSSQL_CODES,
        Dialect::Oracle => ORACLE_CODES,
    }
}

/// Codes after which the connection is dead.
pub fn fatal_codes(dialect: Dialect) -> &'static [&'static str] {
    match dialect {
        Dialect::Postgres => POSTGRES_FATAL,
        Dialect::Mysql | Dialect::Mariadb => MYSQL_FATAL,
        Dialect::Mssql => MSSQL_FATAL,
        Dialect::Oracle => ORACLE_FATAL,
        Dialect::Sqlite => &[],
    }
}

pub fn is_fatal(dialect: Dialect, code: &str) -> bool {
    fatal_codes(dialect).contains(&code)
}

/// Classify a native error for `dialect`.
pub fn classify(dialect: Dialect, native: &NativeError) -> ConnectionErrorKind {
    let code = match dialect {
        // Oracle codes are the message prefix, e.g. "ORA-01017: invalid username/password".
        Dialect::Oracle => native
            .code()
            .or_else(|| native.message.split(':').next())
            .map(str::trim),
        _ => native.code(),
    };
    let Some(code) = code else {
        return ConnectionErrorKind::Generic;
    };

    if dialect == Dialect::Mssql && code == "ESOCKET" {
        return MSSQL_SOCKET_MESSAGES
            .iter()
            .find(|(needle, _)| native.message.contains(needle))
            .map(|(_, kind)| *kind)
            .unwrap_or(ConnectionErrorKind::Generic);
    }

    codes(dialect)
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, kind)| *kind)
        .unwrap_or(ConnectionErrorKind::Generic)
}

/// Classify and wrap a native error in one step.
pub fn into_error(dialect: Dialect, native: NativeError) -> DbError {
    let kind = classify(dialect, &native);
    DbError::from_kind(kind, native)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_entry_maps_to_its_kind() {
        for dialect in Dialect::ALL {
            for (code, kind) in codes(dialect) {
                let native = NativeError::coded(*code, "boom");
                assert_eq!(
                    classify(dialect, &native),
                    *kind,
                    "{} code {} misclassified",
                    dialect,
                    code
                );
            }
        }
    }

    #[test]
    fn test_unknown_and_missing_codes_are_generic() {
        for dialect in Dialect::ALL {
            let unknown = NativeError::coded("E_SOMETHING_NEW", "unexpected");
            assert_eq!(classify(dialect, &unknown), ConnectionErrorKind::Generic);
            let missing = NativeError::uncoded("no code at all");
            assert_eq!(classify(dialect, &missing), ConnectionErrorKind::Generic);
        }
    }

    #[test]
    fn test_mssql_esocket_message_sniffing() {
        let cases = [
            ("connect EHOSTUNREACH 10.0.0.1:1433", HostNotReachable),
            ("connect ENETUNREACH 10.0.0.1:1433", HostNotReachable),
            ("connect EADDRNOTAVAIL 10.0.0.1:1433", HostNotReachable),
            ("getaddrinfo ENOTFOUND db.invalid", HostNotFound),
            ("connect ECONNREFUSED 127.0.0.1:1433", Refused),
        ];
        for (message, kind) in cases {
            let native = NativeError::coded("ESOCKET", message);
            assert_eq!(classify(Dialect::Mssql, &native), kind, "{}", message);
        }
        let other = NativeError::coded("ESOCKET", "socket hang up");
        assert_eq!(classify(Dialect::Mssql, &other), ConnectionErrorKind::Generic);
    }

    #[test]
    fn test_oracle_code_from_message_prefix() {
        let native = NativeError::uncoded("ORA-01017: invalid username/password; logon denied");
        assert_eq!(classify(Dialect::Oracle, &native), AccessDenied);
    }

    #[test]
    fn test_fatal_codes() {
        assert!(is_fatal(Dialect::Mysql, "PROTOCOL_CONNECTION_LOST"));
        assert!(is_fatal(Dialect::Mariadb, "EPIPE"));
        assert!(is_fatal(Dialect::Mssql, "ECONNRESET"));
        assert!(!is_fatal(Dialect::Mssql, "EPIPE"));
        assert!(is_fatal(Dialect::Postgres, "57P01"));
        assert!(is_fatal(Dialect::Oracle, "ORA-03113"));
        assert!(!is_fatal(Dialect::Sqlite, "ECONNRESET"));
        assert!(!is_fatal(Dialect::Mysql, "ER_DUP_ENTRY"));
    }

    #[test]
    fn test_into_error_carries_native() {
        let err = into_error(Dialect::Postgres, NativeError::coded("ECONNREFUSED", "refused"));
        assert!(matches!(err, DbError::ConnectionRefused(_)));
        assert_eq!(err.native().and_then(|n| n.code()), Some("ECONNREFUSED"));
    }
}
