// SQL Server Driver
// Backend integration over tiberius; ADO-style connection strings, metadata
// via the sys catalog views

use crate::error::DatabaseError;
use crate::meta::{
    self, Catalog, CatalogSet, Filter, Index, IndexColumn, IndexColumnSet, IndexSet, LimitSyntax,
    MetadataReader, Placeholder, QueryTemplate, Schema, SchemaSet, Table, TableSet,
};
use crate::traits::{AffectedRows, Connection, Driver, ExecResult, Rows};
use crate::value::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;
use tiberius::{ColumnData, Config, FromSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

type TdsClient = tiberius::Client<Compat<TcpStream>>;

impl tiberius::ToSql for Value {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Value::Null => ColumnData::String(None),
            Value::Bool(b) => ColumnData::Bit(Some(*b)),
            Value::Int(i) => ColumnData::I64(Some(*i)),
            Value::Float(f) => ColumnData::F64(Some(*f)),
            Value::Text(s) | Value::DateTime(s) => ColumnData::String(Some(Cow::Borrowed(s))),
            Value::Bytes(b) => ColumnData::Binary(Some(Cow::Borrowed(b))),
        }
    }
}

fn value_from_column_data(data: ColumnData<'static>) -> Result<Value, DatabaseError> {
    Ok(match data {
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::U8(v) => v.map(|n| Value::Int(n as i64)).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(|n| Value::Int(n as i64)).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(|n| Value::Int(n as i64)).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::Int).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|n| Value::Float(n as f64)).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(Value::Float).unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v.map(|n| Value::Float(f64::from(n))).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .map(|s| Value::Text(s.into_owned()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v
            .map(|u| Value::Text(u.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .map(|b| Value::Bytes(b.into_owned()))
            .unwrap_or(Value::Null),
        ColumnData::Xml(v) => v
            .map(|x| Value::Text(x.into_owned().into_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(&data)?
                .map(|v| Value::DateTime(v.to_string()))
                .unwrap_or(Value::Null)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(&data)?
            .map(|v| Value::DateTime(v.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Time(_) => NaiveTime::from_sql(&data)?
            .map(|v| Value::DateTime(v.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTimeOffset(_) => DateTime::<Utc>::from_sql(&data)?
            .map(|v| Value::DateTime(v.to_rfc3339()))
            .unwrap_or(Value::Null),
    })
}

/// SQL Server connection wrapper. The TDS client requires exclusive access
/// per command, so it sits behind an async mutex.
pub struct MssqlConnection {
    client: Arc<Mutex<TdsClient>>,
}

struct MssqlRows {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
}

#[async_trait::async_trait]
impl Rows for MssqlRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next(&mut self) -> Result<Option<Vec<Value>>, DatabaseError> {
        Ok(self.rows.pop_front())
    }
}

#[async_trait::async_trait]
impl Connection for MssqlConnection {
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Box<dyn Rows>, DatabaseError> {
        let refs: Vec<&dyn tiberius::ToSql> =
            params.iter().map(|v| v as &dyn tiberius::ToSql).collect();
        let mut client = self.client.lock().await;
        let mut stream = client.query(sql, &refs).await?;
        let columns: Vec<String> = stream
            .columns()
            .await?
            .unwrap_or(&[])
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let raw = stream.into_first_result().await?;
        let mut rows = VecDeque::with_capacity(raw.len());
        for row in raw {
            let mut rec = Vec::with_capacity(columns.len());
            for data in row.into_iter() {
                rec.push(value_from_column_data(data)?);
            }
            rows.push_back(rec);
        }
        Ok(Box::new(MssqlRows { columns, rows }))
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Box<dyn ExecResult>, DatabaseError> {
        let refs: Vec<&dyn tiberius::ToSql> =
            params.iter().map(|v| v as &dyn tiberius::ToSql).collect();
        let mut client = self.client.lock().await;
        let result = client.execute(sql, &refs).await?;
        Ok(Box::new(AffectedRows(result.total() as i64)))
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut client = self.client.lock().await;
        client.simple_query("SELECT 1").await?.into_results().await?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// SQL Server driver implementation.
pub struct MssqlDriver;

impl MssqlDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MssqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Driver for MssqlDriver {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["mssql", "ms"]
    }

    async fn open(&self, dsn: &str) -> Result<Box<dyn Connection>, DatabaseError> {
        let config = Config::from_ado_string(dsn)?;
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let client = tiberius::Client::connect(config, tcp.compat_write()).await?;
        Ok(Box::new(MssqlConnection {
            client: Arc::new(Mutex::new(client)),
        }))
    }

    async fn version(&self, conn: &dyn Connection) -> Result<String, DatabaseError> {
        // SERVERPROPERTY returns sql_variant, which does not travel over TDS
        // without a cast
        let mut rows = conn
            .query(
                "SELECT CAST(SERVERPROPERTY('productversion') AS varchar(255)), \
                 CAST(SERVERPROPERTY('productlevel') AS varchar(255)), \
                 CAST(SERVERPROPERTY('edition') AS varchar(255));",
                &[],
            )
            .await?;
        let row = rows.next().await?;
        rows.finish()?;
        let Some(row) = row else {
            return Ok("<unknown>".to_string());
        };
        let part = |idx: usize| {
            row.get(idx)
                .and_then(Value::as_text)
                .unwrap_or_default()
                .to_string()
        };
        Ok(format!(
            "Microsoft SQL Server {}, {}, {}",
            part(0),
            part(1),
            part(2)
        ))
    }

    fn is_password_error(&self, err: &DatabaseError) -> bool {
        // 18456 is the login-failed error raised for bad credentials
        match err {
            DatabaseError::Mssql(tiberius::error::Error::Server(token)) => token.code() == 18456,
            _ => false,
        }
    }

    fn describe_error(&self, err: &DatabaseError) -> (String, String) {
        match err {
            DatabaseError::Mssql(tiberius::error::Error::Server(token)) => {
                (token.code().to_string(), token.message().to_string())
            }
            _ => (String::new(), err.to_string()),
        }
    }

    fn reader<'c>(&self, conn: &'c dyn Connection) -> Option<Box<dyn MetadataReader + 'c>> {
        Some(Box::new(MssqlReader { conn, limit: 0 }))
    }
}

const SYSTEM_DATABASES: &str = "d.name NOT IN ('master', 'tempdb', 'model', 'msdb')";

const SYSTEM_ROLE_SCHEMAS: &str = "s.name NOT IN ('sys', 'INFORMATION_SCHEMA', 'guest', \
     'db_owner', 'db_accessadmin', 'db_securityadmin', 'db_ddladmin', 'db_backupoperator', \
     'db_datareader', 'db_datawriter', 'db_denydatareader', 'db_denydatawriter')";

const CATALOGS: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT d.name\nFROM sys.databases d",
    fixed_cond: None,
    visible_cond: None,
    system_cond: Some(SYSTEM_DATABASES),
    schema_column: None,
    parent_column: None,
    name_column: Some("d.name"),
    order_by: "d.name",
    placeholder: Placeholder::AtP,
    limit: LimitSyntax::FetchFirst,
};

const SCHEMAS: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT DB_NAME(), s.name\nFROM sys.schemas s",
    fixed_cond: None,
    visible_cond: Some("s.schema_id = SCHEMA_ID()"),
    system_cond: Some(SYSTEM_ROLE_SCHEMAS),
    schema_column: Some("s.name"),
    parent_column: None,
    name_column: Some("s.name"),
    order_by: "s.name",
    placeholder: Placeholder::AtP,
    limit: LimitSyntax::FetchFirst,
};

const TABLES: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT DB_NAME(), SCHEMA_NAME(o.schema_id), o.name,\n  \
           CASE o.type WHEN 'U' THEN 'TABLE' WHEN 'V' THEN 'VIEW' ELSE RTRIM(o.type) END\n\
           FROM sys.objects o",
    fixed_cond: Some("o.type IN ('U', 'V')"),
    visible_cond: Some("o.schema_id = SCHEMA_ID()"),
    system_cond: Some("o.is_ms_shipped = 0 AND SCHEMA_NAME(o.schema_id) <> 'sys'"),
    schema_column: Some("SCHEMA_NAME(o.schema_id)"),
    parent_column: None,
    name_column: Some("o.name"),
    order_by: "SCHEMA_NAME(o.schema_id), o.name",
    placeholder: Placeholder::AtP,
    limit: LimitSyntax::FetchFirst,
};

const INDEXES: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT DB_NAME(), SCHEMA_NAME(t.schema_id), t.name, i.name,\n  \
           CASE WHEN i.is_unique = 1 THEN 'YES' ELSE 'NO' END,\n  \
           CASE WHEN i.is_primary_key = 1 THEN 'YES' ELSE 'NO' END,\n  \
           i.type_desc\n\
           FROM sys.indexes i\n\
           JOIN sys.tables t ON t.object_id = i.object_id",
    fixed_cond: Some("i.name IS NOT NULL"),
    visible_cond: Some("t.schema_id = SCHEMA_ID()"),
    system_cond: Some("t.is_ms_shipped = 0 AND SCHEMA_NAME(t.schema_id) <> 'sys'"),
    schema_column: Some("SCHEMA_NAME(t.schema_id)"),
    parent_column: Some("t.name"),
    name_column: Some("i.name"),
    order_by: "SCHEMA_NAME(t.schema_id), t.name, i.name",
    placeholder: Placeholder::AtP,
    limit: LimitSyntax::FetchFirst,
};

const INDEX_COLUMNS: QueryTemplate<'static> = QueryTemplate {
    base: "SELECT DB_NAME(), SCHEMA_NAME(t.schema_id), t.name, i.name, c.name, ty.name,\n  \
           ic.key_ordinal\n\
           FROM sys.index_columns ic\n\
           JOIN sys.indexes i ON i.object_id = ic.object_id AND i.index_id = ic.index_id\n\
           JOIN sys.tables t ON t.object_id = ic.object_id\n\
           JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id\n\
           JOIN sys.types ty ON ty.user_type_id = c.user_type_id",
    fixed_cond: Some("i.name IS NOT NULL AND ic.key_ordinal > 0"),
    visible_cond: Some("t.schema_id = SCHEMA_ID()"),
    system_cond: Some("t.is_ms_shipped = 0 AND SCHEMA_NAME(t.schema_id) <> 'sys'"),
    schema_column: Some("SCHEMA_NAME(t.schema_id)"),
    parent_column: Some("t.name"),
    name_column: Some("i.name"),
    order_by: "SCHEMA_NAME(t.schema_id), t.name, i.name, ic.key_ordinal",
    placeholder: Placeholder::AtP,
    limit: LimitSyntax::FetchFirst,
};

/// System-catalog reader for SQL Server.
pub struct MssqlReader<'c> {
    conn: &'c dyn Connection,
    limit: usize,
}

impl std::fmt::Debug for MssqlReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlReader")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl MetadataReader for MssqlReader<'_> {
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
