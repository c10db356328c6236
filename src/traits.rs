// Backend Capability Contracts
// Defines the connection capability each backend supplies and the driver
// capability trait the registry dispatches through

use crate::error::{DatabaseError, VerboseError};
use crate::meta::MetadataReader;
use crate::stmt::{classify, ProcessedStatement};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A connection URL already resolved by the external URL parser into a
/// driver identifier and an opaque, backend-specific DSN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverUrl {
    pub driver: String,
    pub dsn: String,
}

impl DriverUrl {
    pub fn new(driver: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            dsn: dsn.into(),
        }
    }
}

/// Connection trait - all backend connections implement this.
///
/// A connection is an independently owned resource; operations on one
/// connection are not required to be safe for concurrent invocation, but
/// distinct connections are fully independent.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Execute a row-returning statement.
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Box<dyn Rows>, DatabaseError>;

    /// Execute a non-row-returning statement.
    async fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Box<dyn ExecResult>, DatabaseError>;

    /// Native liveness check.
    async fn ping(&self) -> Result<(), DatabaseError>;

    /// Allow downcasting for driver-specific operations.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Result handle for a row-returning statement.
#[async_trait::async_trait]
pub trait Rows: Send {
    /// Native column names, in result order.
    fn columns(&self) -> &[String];

    /// Advance to the next row, or `None` once exhausted.
    async fn next(&mut self) -> Result<Option<Vec<Value>>, DatabaseError>;

    /// Terminal iteration error, checked after the last row.
    ///
    /// Some backends only report a failure once the cursor is exhausted; a
    /// result set is not complete, even if every visited row decoded, until
    /// this confirms no iteration error occurred.
    fn finish(&mut self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

/// Result handle for a non-row-returning statement.
pub trait ExecResult: Send {
    fn rows_affected(&self) -> Result<i64, DatabaseError>;
}

/// The common `ExecResult` carrier for backends that report a plain count.
#[derive(Debug, Clone, Copy)]
pub struct AffectedRows(pub i64);

impl ExecResult for AffectedRows {
    fn rows_affected(&self) -> Result<i64, DatabaseError> {
        Ok(self.0)
    }
}

/// Driver capability trait.
///
/// Each backend integration implements `name` and `open` and overrides only
/// the behaviors its backend diverges on; every other method carries the
/// documented default the registry falls back to.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// Canonical driver identifier (short lowercase token).
    fn name(&self) -> &'static str;

    /// Additional identifiers resolving to this driver.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Open a live connection from an opaque, backend-specific DSN.
    async fn open(&self, dsn: &str) -> Result<Box<dyn Connection>, DatabaseError>;

    /// Report the backend version.
    ///
    /// The default issues a generic `select version()` probe and normalizes
    /// an empty result to the `<unknown>` sentinel rather than failing.
    async fn version(&self, conn: &dyn Connection) -> Result<String, DatabaseError> {
        let mut rows = conn.query("select version();", &[]).await?;
        let ver = match rows.next().await? {
            Some(row) => row
                .first()
                .and_then(Value::as_text)
                .unwrap_or_default()
                .to_string(),
            None => String::new(),
        };
        rows.finish()?;
        if ver.is_empty() {
            Ok("<unknown>".to_string())
        } else {
            Ok(ver)
        }
    }

    /// Classify a statement. Overrides may rewrite the text or change the
    /// query/non-query classification.
    fn process(&self, prefix: &str, sql: &str) -> Result<ProcessedStatement, DatabaseError> {
        Ok(classify(prefix, sql))
    }

    /// Whether the error indicates an authentication/password failure.
    fn is_password_error(&self, _err: &DatabaseError) -> bool {
        false
    }

    /// Column names for a result handle.
    fn columns(&self, rows: &dyn Rows) -> Result<Vec<String>, DatabaseError> {
        Ok(rows.columns().to_vec())
    }

    /// Convert a raw byte value to display text. Formatting hook only; for
    /// backends whose binary encodings need decoding (hex, UUID layouts).
    fn convert_bytes(&self, raw: &[u8]) -> String {
        String::from_utf8_lossy(raw).into_owned()
    }

    /// Affected-row count for an execution result.
    fn rows_affected(&self, res: &dyn ExecResult) -> Result<i64, DatabaseError> {
        res.rows_affected()
    }

    /// Short textual decomposition of a backend error: `(code, message)`.
    fn describe_error(&self, err: &DatabaseError) -> (String, String) {
        (String::new(), err.to_string())
    }

    /// Structured decomposition of a backend error, when the backend
    /// reports one.
    fn verbose_error(&self, _err: &DatabaseError) -> Option<VerboseError> {
        None
    }

    /// System-catalog reader scoped to `conn`, if this backend supports
    /// metadata introspection.
    fn reader<'c>(&self, _conn: &'c dyn Connection) -> Option<Box<dyn MetadataReader + 'c>> {
        None
    }
}
