// Error Types
// Backend-level errors plus the registry's driver-tagged wrapping

use serde::Serialize;

/// Errors produced by a backend connection capability or a driver.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid connection type")]
    InvalidConnection,

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("sqlserver error: {0}")]
    Mssql(#[from] tiberius::error::Error),
}

/// Error shape returned by registry entry points.
///
/// Any backend failure is wrapped with the driver identifier that produced
/// it, so callers (e.g. password-error classification) can recover both the
/// original error and the backend without re-deriving it from context.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The resolved driver identifier has no registered descriptor.
    #[error("driver not available for `{0}`")]
    DriverNotAvailable(String),

    /// A backend error tagged with the driver identifier.
    #[error("{driver}: {source}")]
    Driver {
        driver: String,
        #[source]
        source: DatabaseError,
    },
}

impl Error {
    /// Wrap a backend error with the driver identifier that produced it.
    pub fn wrap(driver: &str, source: DatabaseError) -> Self {
        Error::Driver {
            driver: driver.to_string(),
            source,
        }
    }

    /// The driver identifier attached to this error, if any.
    pub fn driver(&self) -> Option<&str> {
        match self {
            Error::DriverNotAvailable(_) => None,
            Error::Driver { driver, .. } => Some(driver),
        }
    }

    /// The underlying backend error, if this wraps one.
    pub fn backend(&self) -> Option<&DatabaseError> {
        match self {
            Error::DriverNotAvailable(_) => None,
            Error::Driver { source, .. } => Some(source),
        }
    }
}

/// Structured decomposition of a backend error, for drivers whose wire
/// protocol reports more than a message string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerboseError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
