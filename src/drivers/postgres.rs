// PostgreSQL Driver
// Backend integration over tokio-postgres; libpq-style DSN, metadata via
// pg_catalog

use crate::error::{DatabaseError, VerboseError};
use crate::meta::{
    self, Catalog, CatalogSet, Filter, Index, IndexColumn, IndexColumnSet, IndexSet, LimitSyntax,
    MetadataReader, Placeholder, QueryTemplate, Schema, SchemaSet, Table, TableSet,
};
use crate::traits::{AffectedRows, Connection, Driver, ExecResult, Rows};
use crate::value::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::collections::VecDeque;
use std::fmt::Write as _;
use tokio_postgres::error::ErrorPosition;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;

/// PostgreSQL connection wrapper. The protocol driver runs on a spawned
/// task; the client itself takes `&self` for queries.
pub struct PostgresConnection {
    client: tokio_postgres::Client,
}

struct PgRows {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
}

#[async_trait::async_trait]
impl Rows for PgRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next(&mut self) -> Result<Option<Vec<Value>>, DatabaseError> {
        Ok(self.rows.pop_front())
    }
}

fn bind_params(params: &[Value]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|v| -> Box<dyn ToSql + Sync + Send> {
            match v {
                Value::Null => Box::new(Option::<String>::None),
                Value::Bool(b) => Box::new(*b),
                Value::Int(i) => Box::new(*i),
                Value::Float(f) => Box::new(*f),
                Value::Text(s) | Value::DateTime(s) => Box::new(s.clone()),
                Value::Bytes(b) => Box::new(b.clone()),
            }
        })
        .collect()
}

fn decode_column(row: &tokio_postgres::Row, idx: usize) -> Result<Value, DatabaseError> {
    let ty = row.columns()[idx].type_();
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v as i64))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v as i64))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Int)
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(idx)?.map(|v| Value::Int(v as i64))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v as f64))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes)
    } else if *ty == Type::UUID {
        row.try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|u| Value::Text(u.to_string()))
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| Value::DateTime(v.to_string()))
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::DateTime(v.to_rfc3339()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<NaiveDate>>(idx)?
            .map(|v| Value::DateTime(v.to_string()))
    } else if *ty == Type::TIME {
        row.try_get::<_, Option<NaiveTime>>(idx)?
            .map(|v| Value::DateTime(v.to_string()))
    } else {
        // text-typed and anything else with a textual representation
        match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => v.map(Value::Text),
            Err(_) => None,
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

#[async_trait::async_trait]
impl Connection for PostgresConnection {
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Box<dyn Rows>, DatabaseError> {
        // prepared path keeps column names available for empty result sets
        let stmt = self.client.prepare(sql).await?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let owned = bind_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let raw = self.client.query(&stmt, &refs).await?;
        let mut rows = VecDeque::with_capacity(raw.len());
        for row in &raw {
            let mut rec = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                rec.push(decode_column(row, idx)?);
            }
            rows.push_back(rec);
        }
        Ok(Box::new(PgRows { columns, rows }))
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Box<dyn ExecResult>, DatabaseError> {
        let owned = bind_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let count = self.client.execute(sql, &refs).await?;
        Ok(Box::new(AffectedRows(count as i64)))
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        self.client.simple_query("").await?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// PostgreSQL driver implementation.
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }

    fn db_error<'e>(err: &'e DatabaseError) -> Option<&'e tokio_postgres::error::DbError> {
        match err {
            DatabaseError::Postgres(e) => e.as_db_error(),
            _ => None,
        }
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["postgresql", "pg"]
    }

    async fn open(&self, dsn: &str) -> Result<Box<dyn Connection>, DatabaseError> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection task ended with error");
            }
        });
        Ok(Box::new(PostgresConnection { client }))
    }

    fn is_password_error(&self, err: &DatabaseError) -> bool {
        let DatabaseError::Postgres(e) = err else {
            return false;
        };
        matches!(
            e.code(),
            Some(c) if *c == SqlState::INVALID_PASSWORD
                || *c == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
        )
    }

    // bytea display convention: printable text passes through, anything
    // else renders as \x-prefixed hex
    fn convert_bytes(&self, raw: &[u8]) -> String {
        match std::str::from_utf8(raw) {
            Ok(s) => s.to_string(),
            Err(_) => {
                let mut out = String::with_capacity(2 + raw.len() * 2);
                out.push_str("\\x");
                for b in raw {
                    let _ = write!(out, "{b:02x}");
                }
                out
            }
        }
    }

    fn describe_error(&self, err: &DatabaseError) -> (String, String) {
        match Self::db_error(err) {
            Some(db) => (db.code().code().to_string(), db.message().to_string()),
            None => (String::new(), err.to_string()),
        }
    }

    fn verbose_error(&self, err: &DatabaseError) -> Option<VerboseError> {
        let db = Self::db_error(err)?;
        Some(VerboseError {
            severity: db.severity().to_string(),
            code: db.code().code().to_string(),
            message: db.message().to_string(),
            detail: db.detail().map(str::to_string),
            hint: db.hint().map(str::to_string),
            position: db.position().map(|p| match p {
                ErrorPosition::Original(n) => n.to_string(),
                ErrorPosition::Internal { position, .. } => position.to_string(),
            }),
        })
    }

    fn reader<'c>(&self, conn: &'c dyn Connection) -> Option<Box<dyn MetadataReader + 'c>> {
        Some(Box::new(PostgresReader { conn, limit: 0 }))
    }
}

const SYSTEM_SCHEMAS: &str =
    "n.nspname NOT IN ('pg_catalog', 'information_schema') AND n.nspname NOT LIKE 'pg_toast%'";

const CATALOGS: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT d.datname\nFROM pg_catalog.pg_database d",
    fixed_cond: None,
    visible_cond: None,
    system_cond: None,
    schema_column: None,
    parent_column: None,
    name_column: Some("d.datname"),
    order_by: "d.datname",
    placeholder: Placeholder::Dollar,
    limit: LimitSyntax::Limit,
};

const SCHEMAS: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT current_database(), n.nspname\nFROM pg_catalog.pg_namespace n",
    fixed_cond: None,
    visible_cond: Some("n.nspname = current_schema()"),
    system_cond: Some(SYSTEM_SCHEMAS),
    schema_column: Some("n.nspname"),
    parent_column: None,
    name_column: Some("n.nspname"),
    order_by: "n.nspname",
    placeholder: Placeholder::Dollar,
    limit: LimitSyntax::Limit,
};

const TABLES: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT current_database(), n.nspname, c.relname,\n  \
           CASE c.relkind WHEN 'r' THEN 'TABLE' WHEN 'p' THEN 'TABLE' \
           WHEN 'v' THEN 'VIEW' WHEN 'm' THEN 'MATERIALIZED VIEW' \
           ELSE c.relkind::text END\n\
           FROM pg_catalog.pg_class c\n\
           JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace",
    fixed_cond: Some("c.relkind IN ('r', 'p', 'v', 'm')"),
    visible_cond: Some("pg_catalog.pg_table_is_visible(c.oid)"),
    system_cond: Some(SYSTEM_SCHEMAS),
    schema_column: Some("n.nspname"),
    parent_column: None,
    name_column: Some("c.relname"),
    order_by: "n.nspname, c.relname",
    placeholder: Placeholder::Dollar,
    limit: LimitSyntax::Limit,
};

const INDEXES: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT current_database(), n.nspname, t.relname, i.relname,\n  \
           CASE WHEN x.indisunique THEN 'YES' ELSE 'NO' END,\n  \
           CASE WHEN x.indisprimary THEN 'YES' ELSE 'NO' END,\n  \
           am.amname\n\
           FROM pg_catalog.pg_index x\n\
           JOIN pg_catalog.pg_class t ON t.oid = x.indrelid\n\
           JOIN pg_catalog.pg_class i ON i.oid = x.indexrelid\n\
           JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace\n\
           JOIN pg_catalog.pg_am am ON am.oid = i.relam",
    fixed_cond: None,
    visible_cond: Some("pg_catalog.pg_table_is_visible(t.oid)"),
    system_cond: Some(SYSTEM_SCHEMAS),
    schema_column: Some("n.nspname"),
    parent_column: Some("t.relname"),
    name_column: Some("i.relname"),
    order_by: "n.nspname, t.relname, i.relname",
    placeholder: Placeholder::Dollar,
    limit: LimitSyntax::Limit,
};

const INDEX_COLUMNS: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT current_database(), n.nspname, t.relname, i.relname, a.attname,\n  \
           pg_catalog.format_type(a.atttypid, a.atttypmod), a.attnum\n\
           FROM pg_catalog.pg_index x\n\
           JOIN pg_catalog.pg_class t ON t.oid = x.indrelid\n\
           JOIN pg_catalog.pg_class i ON i.oid = x.indexrelid\n\
           JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace\n\
           JOIN pg_catalog.pg_attribute a ON a.attrelid = i.oid",
    fixed_cond: Some("a.attnum > 0 AND NOT a.attisdropped"),
    visible_cond: Some("pg_catalog.pg_table_is_visible(t.oid)"),
    system_cond: Some(SYSTEM_SCHEMAS),
    schema_column: Some("n.nspname"),
    parent_column: Some("t.relname"),
    name_column: Some("i.relname"),
    order_by: "n.nspname, t.relname, i.relname, a.attnum",
    placeholder: Placeholder::Dollar,
    limit: LimitSyntax::Limit,
};

/// System-catalog reader for PostgreSQL.
pub struct PostgresReader<'c> {
    conn: &'c dyn Connection,
    limit: usize,
}

impl std::fmt::Debug for PostgresReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresReader")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl MetadataReader for PostgresReader<'_> {
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

    async fn schemas(&self, f: &Filter) -> Result<SchemaSet, DatabaseError> {
        let records = meta::fetch_all(self.conn, &SCHEMAS, f, self.limit, |row| {
            Ok(Schema {
                catalog: meta::text_at(row, 0)?,
                name: meta::text_at(row, 1)?,
            })
        })
        .await?;
        Ok(SchemaSet::new(records))
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
