// SQLite Driver
// Backend integration over rusqlite; file-path DSN, metadata via
// sqlite_master and the pragma table-valued functions

use crate::error::DatabaseError;
use crate::meta::{
    self, Catalog, CatalogSet, Filter, Index, IndexColumn, IndexColumnSet, IndexSet, LimitSyntax,
    MetadataReader, Placeholder, QueryTemplate, Table, TableSet,
};
use crate::traits::{AffectedRows, Connection, Driver, ExecResult, Rows};
use crate::value::Value;
use rusqlite::{params_from_iter, Connection as RusqliteConnection, OpenFlags};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(*b as i64)),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) | Value::DateTime(s) => {
                ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))
            }
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn value_from_ref(v: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

/// SQLite connection wrapper. rusqlite is synchronous, so the connection
/// lives behind an async mutex and each statement is fully materialized
/// before the lock is released.
pub struct SqliteConnection {
    conn: Arc<tokio::sync::Mutex<RusqliteConnection>>,
}

struct SqliteRows {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
}

#[async_trait::async_trait]
impl Rows for SqliteRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next(&mut self) -> Result<Option<Vec<Value>>, DatabaseError> {
        Ok(self.rows.pop_front())
    }
}

#[async_trait::async_trait]
impl Connection for SqliteConnection {
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Box<dyn Rows>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let ncols = columns.len();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut buffered = VecDeque::new();
        while let Some(row) = rows.next()? {
            let mut rec = Vec::with_capacity(ncols);
            for idx in 0..ncols {
                rec.push(value_from_ref(row.get_ref(idx)?));
            }
            buffered.push_back(rec);
        }
        Ok(Box::new(SqliteRows {
            columns,
            rows: buffered,
        }))
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Box<dyn ExecResult>, DatabaseError> {
        let conn = self.conn.lock().await;
        let count = conn.execute(sql, params_from_iter(params.iter()))?;
        Ok(Box::new(AffectedRows(count as i64)))
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// SQLite driver implementation.
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }

    /// Expand `~/` in the DSN; everything else passes through, including
    /// `:memory:`.
    fn database_path(dsn: &str) -> Result<String, DatabaseError> {
        if dsn.is_empty() {
            return Err(DatabaseError::InvalidConfig(
                "sqlite database path is required".to_string(),
            ));
        }
        if let Some(rest) = dsn.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return Ok(Path::new(&home).join(rest).to_string_lossy().into_owned());
            }
        }
        Ok(dsn.to_string())
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["sqlite3", "file"]
    }

    async fn open(&self, dsn: &str) -> Result<Box<dyn Connection>, DatabaseError> {
        let path = Self::database_path(dsn)?;
        let conn = RusqliteConnection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| DatabaseError::ConnectionFailed(format!("failed to open {path}: {e}")))?;
        Ok(Box::new(SqliteConnection {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
        }))
    }

    // sqlite has no version() function; probe its own pragma-style call.
    async fn version(&self, conn: &dyn Connection) -> Result<String, DatabaseError> {
        let mut rows = conn.query("select sqlite_version();", &[]).await?;
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
            Ok(format!("SQLite {ver}"))
        }
    }

    fn reader<'c>(&self, conn: &'c dyn Connection) -> Option<Box<dyn MetadataReader + 'c>> {
        Some(Box::new(SqliteReader { conn, limit: 0 }))
    }
}

// sqlite has no schema dimension, so its templates carry no schema pattern
// column and a schema filter is a no-op here. Catalog and schema fields of
// the records are the literal `main`.

const CATALOGS: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT name\nFROM pragma_database_list",
    fixed_cond: None,
    visible_cond: None,
    system_cond: None,
    schema_column: None,
    parent_column: None,
    name_column: Some("name"),
    order_by: "name",
    placeholder: Placeholder::Question,
    limit: LimitSyntax::Limit,
};

const TABLES: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT 'main', 'main', m.name, m.type\nFROM sqlite_master m",
    fixed_cond: Some("m.type IN ('table', 'view')"),
    visible_cond: None,
    system_cond: Some("m.name NOT LIKE 'sqlite_%'"),
    schema_column: None,
    parent_column: None,
    name_column: Some("m.name"),
    order_by: "m.name",
    placeholder: Placeholder::Question,
    limit: LimitSyntax::Limit,
};

const INDEXES: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT 'main', 'main', m.name, il.name,\n  \
           CASE il.\"unique\" WHEN 1 THEN 'YES' ELSE 'NO' END,\n  \
           CASE il.origin WHEN 'pk' THEN 'YES' ELSE 'NO' END,\n  ''\n\
           FROM sqlite_master m, pragma_index_list(m.name) il",
    fixed_cond: Some("m.type = 'table'"),
    visible_cond: None,
    system_cond: Some("m.name NOT LIKE 'sqlite_%' AND il.name NOT LIKE 'sqlite_%'"),
    schema_column: None,
    parent_column: Some("m.name"),
    name_column: Some("il.name"),
    order_by: "m.name, il.name",
    placeholder: Placeholder::Question,
    limit: LimitSyntax::Limit,
};

const INDEX_COLUMNS: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT 'main', 'main', m.name, il.name, COALESCE(ii.name, ''), '', ii.seqno + 1\n\
           FROM sqlite_master m, pragma_index_list(m.name) il, pragma_index_info(il.name) ii",
    fixed_cond: Some("m.type = 'table'"),
    visible_cond: None,
    system_cond: Some("m.name NOT LIKE 'sqlite_%' AND il.name NOT LIKE 'sqlite_%'"),
    schema_column: None,
    parent_column: Some("m.name"),
    name_column: Some("il.name"),
    order_by: "m.name, il.name, ii.seqno",
    placeholder: Placeholder::Question,
    limit: LimitSyntax::Limit,
};

/// System-catalog reader for SQLite.
pub struct SqliteReader<'c> {
    conn: &'c dyn Connection,
    limit: usize,
}

impl std::fmt::Debug for SqliteReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteReader")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl MetadataReader for SqliteReader<'_> {
    fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    async fn catalogs(&self, f: &Filter) -> Result<CatalogSet, DatabaseError> {
        let records = meta::fetch_all(self.conn, &CATALOGS, f, self.limit, |row| {
            Ok(Catalog {
                name: meta::text_at(row, 0)?,
            })
        })
        .await?;
        Ok(CatalogSet::new(records))
    }

    async fn tables(&self, f: &Filter) -> Result<TableSet, DatabaseError> {
        let records = meta::fetch_all(self.conn, &TABLES, f, self.limit, |row| {
            Ok(Table {
                catalog: meta::text_at(row, 0)?,
                schema: meta::text_at(row, 1)?,
                name: meta::text_at(row, 2)?,
                kind: meta::text_at(row, 3)?,
            })
        })
        .await?;
        Ok(TableSet::new(records))
    }

    async fn indexes(&self, f: &Filter) -> Result<IndexSet, DatabaseError> {
        let records = meta::fetch_all(self.conn, &INDEXES, f, self.limit, |row| {
            Ok(Index {
                catalog: meta::text_at(row, 0)?,
                schema: meta::text_at(row, 1)?,
                table: meta::text_at(row, 2)?,
                name: meta::text_at(row, 3)?,
                is_unique: meta::yes_no_at(row, 4)?,
                is_primary: meta::yes_no_at(row, 5)?,
                kind: meta::text_at(row, 6)?,
            })
        })
        .await?;
        Ok(IndexSet::new(records))
    }

    async fn index_columns(&self, f: &Filter) -> Result<IndexColumnSet, DatabaseError> {
        let records = meta::fetch_all(self.conn, &INDEX_COLUMNS, f, self.limit, |row| {
            Ok(IndexColumn {
                catalog: meta::text_at(row, 0)?,
                schema: meta::text_at(row, 1)?,
                table: meta::text_at(row, 2)?,
                index: meta::text_at(row, 3)?,
                name: meta::text_at(row, 4)?,
                data_type: meta::text_at(row, 5)?,
                ordinal: meta::i64_at(row, 6)?,
            })
        })
        .await?;
        Ok(IndexColumnSet::new(records))
    }
}
