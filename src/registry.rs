// Driver Capability Registry
// Immutable-after-build map from driver identifier to driver capabilities,
// with uniform override-or-default entry points and driver-tagged errors

use crate::error::{DatabaseError, Error, VerboseError};
use crate::meta::MetadataReader;
use crate::stmt::{BufferConfig, ProcessedStatement};
use crate::traits::{Connection, Driver, DriverUrl, ExecResult, Rows};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of database drivers, keyed by canonical name and aliases.
///
/// Built once at process initialization and immutable thereafter; lookups
/// are unsynchronized reads.
pub struct Registry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Composition root: a registry with all built-in drivers registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::drivers::sqlite::SqliteDriver::new()));
        registry.register(Arc::new(crate::drivers::postgres::PostgresDriver::new()));
        registry.register(Arc::new(crate::drivers::mssql::MssqlDriver::new()));
        registry
    }

    /// Register a driver under its canonical name and aliases.
    ///
    /// Panics if the name or any alias is already registered: silently
    /// overriding one backend's behavior with another is never a valid
    /// state, so a collision is a fatal configuration error at startup.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        let name = driver.name();
        if self.drivers.contains_key(name) {
            panic!("driver {name} is already registered");
        }
        tracing::info!(driver = name, "registering database driver");
        self.drivers.insert(name.to_string(), Arc::clone(&driver));
        for alias in driver.aliases() {
            if self.drivers.contains_key(*alias) {
                panic!("alias {alias} is already registered");
            }
            self.drivers.insert(alias.to_string(), Arc::clone(&driver));
        }
    }

    /// Whether a driver identifier (name or alias) is registered.
    pub fn registered(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    /// All registered identifiers, sorted.
    pub fn available(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn get(&self, name: &str) -> Result<&Arc<dyn Driver>, Error> {
        self.drivers
            .get(name)
            .ok_or_else(|| Error::DriverNotAvailable(name.to_string()))
    }

    /// Open a connection for the URL's driver.
    ///
    /// Before delegating to the opener, the external statement buffer is
    /// configured: dollar quoting and multi-line comments are enabled only
    /// for the postgres driver family. This is registry policy, not a
    /// per-driver override, since it configures the statement buffer rather
    /// than the connection.
    pub async fn open(
        &self,
        url: &DriverUrl,
        buf: &mut BufferConfig,
    ) -> Result<Box<dyn Connection>, Error> {
        let driver = self.get(&url.driver)?;
        let is_pg = driver.name() == "postgres";
        buf.allow_dollar(is_pg);
        buf.allow_multiline_comments(is_pg);
        driver
            .open(&url.dsn)
            .await
            .map_err(|e| Error::wrap(&url.driver, e))
    }

    /// Report version information for the URL's driver.
    pub async fn version(&self, url: &DriverUrl, conn: &dyn Connection) -> Result<String, Error> {
        let driver = self.get(&url.driver)?;
        driver
            .version(conn)
            .await
            .map_err(|e| Error::wrap(&url.driver, e))
    }

    /// Classify (and possibly rewrite) a statement for the URL's driver.
    pub fn process(
        &self,
        url: &DriverUrl,
        prefix: &str,
        sql: &str,
    ) -> Result<ProcessedStatement, Error> {
        let driver = self.get(&url.driver)?;
        driver
            .process(prefix, sql)
            .map_err(|e| Error::wrap(&url.driver, e))
    }

    /// Whether the error is a password failure for the URL's driver.
    ///
    /// An error wrapped by this registry is unwrapped first, and the driver
    /// identity recorded in the wrapping takes precedence over the URL.
    pub fn is_password_error(&self, url: &DriverUrl, err: &Error) -> bool {
        let (name, source) = match err {
            Error::Driver { driver, source } => (driver.as_str(), source),
            Error::DriverNotAvailable(_) => return false,
        };
        let name = if name.is_empty() { &url.driver } else { name };
        match self.drivers.get(name) {
            Some(driver) => driver.is_password_error(source),
            None => false,
        }
    }

    /// Column names for a result handle.
    ///
    /// After either the override or the default path, any empty or
    /// whitespace-only name is replaced with a positional `colN` placeholder.
    pub fn columns(&self, url: &DriverUrl, rows: &dyn Rows) -> Result<Vec<String>, Error> {
        let driver = self.get(&url.driver)?;
        let mut cols = driver
            .columns(rows)
            .map_err(|e| Error::wrap(&url.driver, e))?;
        for (i, col) in cols.iter_mut().enumerate() {
            if col.trim().is_empty() {
                *col = format!("col{i}");
            }
        }
        Ok(cols)
    }

    /// Convert a raw byte value to display text for the URL's driver.
    pub fn convert_bytes(&self, url: &DriverUrl, raw: &[u8]) -> Result<String, Error> {
        let driver = self.get(&url.driver)?;
        Ok(driver.convert_bytes(raw))
    }

    /// Affected-row count for an execution result.
    pub fn rows_affected(&self, url: &DriverUrl, res: &dyn ExecResult) -> Result<i64, Error> {
        let driver = self.get(&url.driver)?;
        driver
            .rows_affected(res)
            .map_err(|e| Error::wrap(&url.driver, e))
    }

    /// Liveness check through the connection's native mechanism.
    pub async fn ping(&self, url: &DriverUrl, conn: &dyn Connection) -> Result<(), Error> {
        self.get(&url.driver)?;
        conn.ping().await.map_err(|e| Error::wrap(&url.driver, e))
    }

    /// Short `(code, message)` decomposition of an error.
    pub fn describe_error(&self, url: &DriverUrl, err: &Error) -> (String, String) {
        if let Error::Driver { driver, source } = err {
            let name = if driver.is_empty() { &url.driver } else { driver };
            if let Some(d) = self.drivers.get(name) {
                return d.describe_error(source);
            }
        }
        (String::new(), err.to_string())
    }

    /// Structured decomposition of an error, when the driver supplies one.
    pub fn verbose_error(&self, url: &DriverUrl, err: &Error) -> Option<VerboseError> {
        let Error::Driver { driver, source } = err else {
            return None;
        };
        let name = if driver.is_empty() { &url.driver } else { driver };
        self.drivers.get(name)?.verbose_error(source)
    }

    /// System-catalog reader for the URL's driver, scoped to `conn`.
    pub fn metadata_reader<'c>(
        &self,
        url: &DriverUrl,
        conn: &'c dyn Connection,
    ) -> Result<Box<dyn MetadataReader + 'c>, Error> {
        let driver = self.get(&url.driver)?;
        driver.reader(conn).ok_or_else(|| {
            Error::wrap(
                &url.driver,
                DatabaseError::NotSupported("metadata introspection".to_string()),
            )
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::AffectedRows;
    use crate::value::Value;

    struct StubRows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    }

    #[async_trait::async_trait]
    impl Rows for StubRows {
        fn columns(&self) -> &[String] {
            &self.columns
        }

        async fn next(&mut self) -> Result<Option<Vec<Value>>, DatabaseError> {
            Ok(if self.rows.is_empty() {
                None
            } else {
                Some(self.rows.remove(0))
            })
        }
    }

    struct StubConnection {
        version: Option<String>,
    }

    #[async_trait::async_trait]
    impl Connection for StubConnection {
        async fn query(
            &self,
            _sql: &str,
            _params: &[Value],
        ) -> Result<Box<dyn Rows>, DatabaseError> {
            let rows = match &self.version {
                Some(v) => vec![vec![Value::Text(v.clone())]],
                None => vec![],
            };
            Ok(Box::new(StubRows {
                columns: vec!["version".to_string()],
                rows,
            }))
        }

        async fn execute(
            &self,
            _sql: &str,
            _params: &[Value],
        ) -> Result<Box<dyn ExecResult>, DatabaseError> {
            Ok(Box::new(AffectedRows(3)))
        }

        async fn ping(&self) -> Result<(), DatabaseError> {
            Ok(())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    // Driver with no overrides: every registry entry point exercises the
    // documented default.
    struct PlainDriver {
        name: &'static str,
        version: Option<String>,
    }

    #[async_trait::async_trait]
    impl Driver for PlainDriver {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn open(&self, _dsn: &str) -> Result<Box<dyn Connection>, DatabaseError> {
            Ok(Box::new(StubConnection {
                version: self.version.clone(),
            }))
        }
    }

    // Driver overriding most capability points.
    struct OverridingDriver;

    #[async_trait::async_trait]
    impl Driver for OverridingDriver {
        fn name(&self) -> &'static str {
            "custom"
        }

        fn aliases(&self) -> &'static [&'static str] {
            &["cu"]
        }

        async fn open(&self, _dsn: &str) -> Result<Box<dyn Connection>, DatabaseError> {
            Ok(Box::new(StubConnection { version: None }))
        }

        async fn version(&self, _conn: &dyn Connection) -> Result<String, DatabaseError> {
            Ok("9.9.9".to_string())
        }

        fn process(&self, prefix: &str, sql: &str) -> Result<ProcessedStatement, DatabaseError> {
            let _ = prefix;
            Ok(ProcessedStatement {
                command: "LIST".to_string(),
                sql: sql.replace("\\dt", "SELECT name FROM tables"),
                is_query: true,
            })
        }

        fn is_password_error(&self, err: &DatabaseError) -> bool {
            matches!(err, DatabaseError::ConnectionFailed(msg) if msg.contains("access denied"))
        }

        fn columns(&self, rows: &dyn Rows) -> Result<Vec<String>, DatabaseError> {
            Ok(rows.columns().iter().map(|c| c.to_uppercase()).collect())
        }

        fn convert_bytes(&self, raw: &[u8]) -> String {
            raw.iter().map(|b| format!("{b:02x}")).collect()
        }

        fn describe_error(&self, err: &DatabaseError) -> (String, String) {
            ("CUSTOM-1".to_string(), err.to_string())
        }

        fn verbose_error(&self, err: &DatabaseError) -> Option<VerboseError> {
            Some(VerboseError {
                severity: "ERROR".to_string(),
                code: "CUSTOM-1".to_string(),
                message: err.to_string(),
                detail: None,
                hint: None,
                position: None,
            })
        }
    }

    fn registry() -> Registry {
        let mut r = Registry::new();
        r.register(Arc::new(PlainDriver {
            name: "plain",
            version: Some(String::new()),
        }));
        r.register(Arc::new(OverridingDriver));
        r
    }

    fn url(driver: &str) -> DriverUrl {
        DriverUrl::new(driver, "dsn")
    }

    #[tokio::test]
    async fn test_unregistered_driver_is_not_available_everywhere() {
        let r = registry();
        let u = url("nope");
        let conn = StubConnection { version: None };
        let mut buf = BufferConfig::new();
        assert!(matches!(
            r.open(&u, &mut buf).await,
            Err(Error::DriverNotAvailable(_))
        ));
        assert!(matches!(
            r.version(&u, &conn).await,
            Err(Error::DriverNotAvailable(_))
        ));
        assert!(matches!(
            r.process(&u, "SELECT", "SELECT 1"),
            Err(Error::DriverNotAvailable(_))
        ));
        let rows = StubRows {
            columns: vec![],
            rows: vec![],
        };
        assert!(matches!(r.columns(&u, &rows), Err(Error::DriverNotAvailable(_))));
        assert!(matches!(
            r.convert_bytes(&u, b"x"),
            Err(Error::DriverNotAvailable(_))
        ));
        assert!(matches!(
            r.rows_affected(&u, &AffectedRows(1)),
            Err(Error::DriverNotAvailable(_))
        ));
        assert!(matches!(
            r.ping(&u, &conn).await,
            Err(Error::DriverNotAvailable(_))
        ));
        assert!(matches!(
            r.metadata_reader(&u, &conn),
            Err(Error::DriverNotAvailable(_))
        ));
    }

    #[test]
    #[should_panic(expected = "driver plain is already registered")]
    fn test_duplicate_name_is_fatal() {
        let mut r = registry();
        r.register(Arc::new(PlainDriver {
            name: "plain",
            version: None,
        }));
    }

    #[test]
    #[should_panic(expected = "alias cu is already registered")]
    fn test_duplicate_alias_is_fatal() {
        struct Clashing;

        #[async_trait::async_trait]
        impl Driver for Clashing {
            fn name(&self) -> &'static str {
                "clashing"
            }

            fn aliases(&self) -> &'static [&'static str] {
                &["cu"]
            }

            async fn open(&self, _dsn: &str) -> Result<Box<dyn Connection>, DatabaseError> {
                Err(DatabaseError::InvalidConnection)
            }
        }

        let mut r = registry();
        r.register(Arc::new(Clashing));
    }

    #[test]
    #[should_panic(expected = "driver custom is already registered")]
    fn test_alias_colliding_with_name_is_fatal() {
        let mut r = registry();
        // "custom" is taken as a canonical name already
        r.register(Arc::new(PlainDriver {
            name: "custom",
            version: None,
        }));
    }

    #[test]
    fn test_available_and_registered() {
        let r = registry();
        assert!(r.registered("plain"));
        assert!(r.registered("custom"));
        assert!(r.registered("cu"));
        assert!(!r.registered("nope"));
        assert_eq!(r.available(), vec!["cu", "custom", "plain"]);
    }

    #[tokio::test]
    async fn test_version_override_is_verbatim() {
        let r = registry();
        let conn = StubConnection { version: None };
        assert_eq!(r.version(&url("custom"), &conn).await.unwrap(), "9.9.9");
        // alias resolves to the same descriptor
        assert_eq!(r.version(&url("cu"), &conn).await.unwrap(), "9.9.9");
    }

    #[tokio::test]
    async fn test_version_default_normalizes_empty_probe() {
        let r = registry();
        let conn = StubConnection {
            version: Some(String::new()),
        };
        assert_eq!(r.version(&url("plain"), &conn).await.unwrap(), "<unknown>");
    }

    #[tokio::test]
    async fn test_version_default_passes_probe_through() {
        let r = registry();
        let conn = StubConnection {
            version: Some("PostgreSQL 16.1".to_string()),
        };
        assert_eq!(
            r.version(&url("plain"), &conn).await.unwrap(),
            "PostgreSQL 16.1"
        );
    }

    #[test]
    fn test_column_normalization_after_default_path() {
        let r = registry();
        let rows = StubRows {
            columns: vec!["".to_string(), "  ".to_string(), "id".to_string()],
            rows: vec![],
        };
        assert_eq!(r.columns(&url("plain"), &rows).unwrap(), vec!["col0", "col1", "id"]);
    }

    #[test]
    fn test_column_normalization_after_override_path() {
        let r = registry();
        let rows = StubRows {
            columns: vec!["".to_string(), "name".to_string()],
            rows: vec![],
        };
        // override uppercases, then normalization fills the empty slot
        assert_eq!(r.columns(&url("custom"), &rows).unwrap(), vec!["col0", "NAME"]);
    }

    #[test]
    fn test_process_default_and_override() {
        let r = registry();
        let st = r.process(&url("plain"), "SELECT", "select * from t").unwrap();
        assert_eq!(st.command, "SELECT");
        assert_eq!(st.sql, "select * from t");
        assert!(st.is_query);

        let st = r.process(&url("custom"), "", "\\dt").unwrap();
        assert_eq!(st.sql, "SELECT name FROM tables");
        assert!(st.is_query);
    }

    #[test]
    fn test_is_password_error_unwraps_registry_wrapping() {
        let r = registry();
        let err = Error::wrap(
            "custom",
            DatabaseError::ConnectionFailed("access denied for user".to_string()),
        );
        // the driver recorded in the wrapping wins over the URL's driver
        assert!(r.is_password_error(&url("plain"), &err));

        let err = Error::wrap("plain", DatabaseError::ConnectionFailed("access denied".to_string()));
        assert!(!r.is_password_error(&url("plain"), &err));

        let err = Error::DriverNotAvailable("custom".to_string());
        assert!(!r.is_password_error(&url("custom"), &err));
    }

    #[test]
    fn test_convert_bytes_default_and_override() {
        let r = registry();
        assert_eq!(r.convert_bytes(&url("plain"), b"abc").unwrap(), "abc");
        assert_eq!(r.convert_bytes(&url("custom"), &[0xde, 0xad]).unwrap(), "dead");
    }

    #[test]
    fn test_rows_affected_default() {
        let r = registry();
        assert_eq!(r.rows_affected(&url("plain"), &AffectedRows(42)).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_open_forces_buffer_policy() {
        let mut r = registry();
        r.register(Arc::new(PlainDriver {
            name: "postgres",
            version: None,
        }));

        let mut buf = BufferConfig::new();
        r.open(&url("postgres"), &mut buf).await.unwrap();
        assert!(buf.dollar_allowed());
        assert!(buf.multiline_comments_allowed());

        // a non-postgres open disables the toggles again
        r.open(&url("plain"), &mut buf).await.unwrap();
        assert!(!buf.dollar_allowed());
        assert!(!buf.multiline_comments_allowed());
    }

    #[test]
    fn test_describe_and_verbose_error() {
        let r = registry();
        let err = Error::wrap("custom", DatabaseError::Query("boom".to_string()));
        let (code, msg) = r.describe_error(&url("custom"), &err);
        assert_eq!(code, "CUSTOM-1");
        assert!(msg.contains("boom"));

        let verbose = r.verbose_error(&url("custom"), &err).unwrap();
        assert_eq!(verbose.code, "CUSTOM-1");
        assert_eq!(verbose.severity, "ERROR");

        // defaults: empty code, display string, no verbose form
        let err = Error::wrap("plain", DatabaseError::Query("boom".to_string()));
        let (code, msg) = r.describe_error(&url("plain"), &err);
        assert!(code.is_empty());
        assert!(msg.contains("boom"));
        assert!(r.verbose_error(&url("plain"), &err).is_none());
    }

    #[tokio::test]
    async fn test_metadata_reader_not_supported_by_default() {
        let r = registry();
        let conn = StubConnection { version: None };
        let err = r.metadata_reader(&url("plain"), &conn).unwrap_err();
        assert!(matches!(
            err.backend(),
            Some(DatabaseError::NotSupported(_))
        ));
    }

    // ========================================================================
    // End-to-end over the real sqlite backend
    // ========================================================================

    #[test]
    fn test_defaults_register_builtin_drivers() {
        let r = Registry::with_defaults();
        for name in ["sqlite", "sqlite3", "file", "postgres", "postgresql", "pg", "sqlserver", "mssql", "ms"] {
            assert!(r.registered(name), "{name} should be registered");
        }
        assert!(!r.registered("oracle"));
    }

    #[tokio::test]
    async fn test_sqlite_end_to_end() {
        let r = Registry::with_defaults();
        // alias resolves to the canonical descriptor
        let u = DriverUrl::new("sqlite3", ":memory:");

        let mut buf = BufferConfig::new();
        let conn = r.open(&u, &mut buf).await.unwrap();
        // buffer policy only applies to the postgres family
        assert!(!buf.dollar_allowed());
        assert!(!buf.multiline_comments_allowed());

        let ver = r.version(&u, conn.as_ref()).await.unwrap();
        assert!(ver.starts_with("SQLite"), "unexpected version: {ver}");

        let st = r.process(&u, "SELECT", "select 1").unwrap();
        assert_eq!(st.command, "SELECT");
        assert!(st.is_query);

        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();
        let res = conn
            .execute(
                "INSERT INTO t (name) VALUES (?), (?)",
                &[Value::Text("a".into()), Value::Text("b".into())],
            )
            .await
            .unwrap();
        assert_eq!(r.rows_affected(&u, res.as_ref()).unwrap(), 2);

        // unnamed result expressions come back as positional placeholders
        let rows = conn
            .query("SELECT 1 AS '', 2 AS '  ', 3 AS id", &[])
            .await
            .unwrap();
        assert_eq!(
            r.columns(&u, rows.as_ref()).unwrap(),
            vec!["col0", "col1", "id"]
        );

        r.ping(&u, conn.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_metadata_filters_and_limit() {
        let r = Registry::with_defaults();
        let u = DriverUrl::new("sqlite", ":memory:");
        let mut buf = BufferConfig::new();
        let conn = r.open(&u, &mut buf).await.unwrap();
        for ddl in [
            "CREATE TABLE orders (id INTEGER)",
            "CREATE TABLE order_lines (id INTEGER)",
            "CREATE TABLE customers (id INTEGER)",
        ] {
            conn.execute(ddl, &[]).await.unwrap();
        }

        let mut reader = r.metadata_reader(&u, conn.as_ref()).unwrap();

        let all = reader
            .tables(&crate::meta::Filter::new())
            .await
            .unwrap()
            .into_vec();
        assert_eq!(all.len(), 3);

        // a name pattern returns a subset of the unfiltered listing
        let narrowed = reader
            .tables(&crate::meta::Filter::new().name("order%"))
            .await
            .unwrap()
            .into_vec();
        assert_eq!(narrowed.len(), 2);
        assert!(narrowed.iter().all(|t| all.contains(t)));

        // limited listing is a prefix of the unlimited one
        reader.set_limit(1);
        let limited = reader
            .tables(&crate::meta::Filter::new())
            .await
            .unwrap()
            .into_vec();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0], all[0]);
    }
}
