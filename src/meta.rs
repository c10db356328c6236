// Metadata Query Composition
// One parameterized builder for filterable, ordered, limit-bounded
// introspection queries; backends supply only their catalog joins, system
// exclusions, placeholder style, and row-limit syntax

use crate::error::DatabaseError;
use crate::traits::Connection;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Caller-supplied restriction on which catalog objects a metadata query
/// returns. An empty pattern places no restriction on that dimension.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Restrict to objects visible in the current schema/search path.
    pub only_visible: bool,
    /// Include system objects normally excluded.
    pub with_system: bool,
    /// Schema name pattern.
    pub schema: Option<String>,
    /// Parent object name pattern (e.g. table name when listing indexes).
    pub parent: Option<String>,
    /// Object name pattern.
    pub name: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only_visible(mut self, yes: bool) -> Self {
        self.only_visible = yes;
        self
    }

    pub fn with_system(mut self, yes: bool) -> Self {
        self.with_system = yes;
        self
    }

    pub fn schema(mut self, pattern: impl Into<String>) -> Self {
        self.schema = Some(pattern.into());
        self
    }

    pub fn parent(mut self, pattern: impl Into<String>) -> Self {
        self.parent = Some(pattern.into());
        self
    }

    pub fn name(mut self, pattern: impl Into<String>) -> Self {
        self.name = Some(pattern.into());
        self
    }
}

// ============================================================================
// Normalized metadata records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub catalog: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub catalog: String,
    pub schema: String,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub name: String,
    pub is_unique: bool,
    pub is_primary: bool,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub index: String,
    pub name: String,
    pub data_type: String,
    pub ordinal: i64,
}

/// Ordered sequence of metadata records of one kind, with a positional
/// cursor mirroring the row-iteration contract.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaSet<T> {
    records: Vec<T>,
    pos: Option<usize>,
}

impl<T> MetaSet<T> {
    pub fn new(records: Vec<T>) -> Self {
        Self { records, pos: None }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Advance the cursor. Returns false once past the last record.
    pub fn next(&mut self) -> bool {
        let next = self.pos.map_or(0, |p| p + 1);
        if next < self.records.len() {
            self.pos = Some(next);
            true
        } else {
            self.pos = Some(self.records.len());
            false
        }
    }

    /// The record under the cursor, if `next` has been called and succeeded.
    pub fn current(&self) -> Option<&T> {
        self.records.get(self.pos?)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.records.iter()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.records
    }
}

impl<T> IntoIterator for MetaSet<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

pub type CatalogSet = MetaSet<Catalog>;
pub type SchemaSet = MetaSet<Schema>;
pub type TableSet = MetaSet<Table>;
pub type IndexSet = MetaSet<Index>;
pub type IndexColumnSet = MetaSet<IndexColumn>;

// ============================================================================
// Query composition
// ============================================================================

/// Positional parameter style of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
    /// `@P1`, `@P2`, ...
    AtP,
}

impl Placeholder {
    fn push(&self, sql: &mut String, n: usize) {
        match self {
            Placeholder::Question => sql.push('?'),
            Placeholder::Dollar => {
                let _ = write!(sql, "${n}");
            }
            Placeholder::AtP => {
                let _ = write!(sql, "@P{n}");
            }
        }
    }
}

/// Native "first N rows" syntax of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSyntax {
    /// `LIMIT n`
    Limit,
    /// `OFFSET 0 ROWS FETCH FIRST n ROWS ONLY`
    FetchFirst,
}

/// Base query plus the per-backend, per-kind variation points. The
/// condition-assembly and shaping algorithm itself lives in `compose` and is
/// shared by every query kind on every backend.
#[derive(Debug, Clone)]
pub struct QueryTemplate<'a> {
    /// Base query with joins fixed for this kind and backend. No WHERE.
    pub base: &'a str,
    /// Condition applied on every composition, independent of the filter.
    pub fixed_cond: Option<&'a str>,
    /// Condition applied when the filter restricts to visible objects.
    pub visible_cond: Option<&'a str>,
    /// Condition excluding system objects, applied unless the filter asks
    /// for them. Hard-coded literal per backend module.
    pub system_cond: Option<&'a str>,
    /// Column matched against the schema pattern.
    pub schema_column: Option<&'a str>,
    /// Column matched against the parent object pattern.
    pub parent_column: Option<&'a str>,
    /// Column matched against the object name pattern.
    pub name_column: Option<&'a str>,
    /// Sort key column list, always appended as ORDER BY.
    pub order_by: &'a str,
    pub placeholder: Placeholder,
    pub limit: LimitSyntax,
}

impl QueryTemplate<'_> {
    /// Assemble the final query and bound parameter values.
    ///
    /// Active filter dimensions contribute one condition each, in a fixed
    /// left-to-right order: fixed, visibility, system-exclusion, schema
    /// pattern, parent pattern, name pattern. A limit of zero means
    /// unbounded.
    pub fn compose(&self, f: &Filter, limit: usize) -> (String, Vec<Value>) {
        let mut conds: Vec<String> = Vec::new();
        let mut vals: Vec<Value> = Vec::new();

        if let Some(c) = self.fixed_cond {
            conds.push(c.to_string());
        }
        if f.only_visible {
            if let Some(c) = self.visible_cond {
                conds.push(c.to_string());
            }
        }
        if !f.with_system {
            if let Some(c) = self.system_cond {
                conds.push(c.to_string());
            }
        }
        for (pattern, column) in [
            (&f.schema, self.schema_column),
            (&f.parent, self.parent_column),
            (&f.name, self.name_column),
        ] {
            let (Some(pattern), Some(column)) = (pattern, column) else {
                continue;
            };
            if pattern.is_empty() {
                continue;
            }
            vals.push(Value::Text(pattern.clone()));
            let mut cond = format!("{column} LIKE ");
            self.placeholder.push(&mut cond, vals.len());
            conds.push(cond);
        }

        let mut sql = self.base.trim_end().to_string();
        if !conds.is_empty() {
            sql.push_str("\nWHERE ");
            sql.push_str(&conds.join(" AND "));
        }
        sql.push_str("\nORDER BY ");
        sql.push_str(self.order_by);
        if limit > 0 {
            match self.limit {
                LimitSyntax::Limit => {
                    let _ = write!(sql, "\nLIMIT {limit}");
                }
                LimitSyntax::FetchFirst => {
                    let _ = write!(sql, "\nOFFSET 0 ROWS FETCH FIRST {limit} ROWS ONLY");
                }
            }
        }
        (sql, vals)
    }
}

/// Run a composed metadata query and decode every row in order.
///
/// The terminal cursor check runs on every successful iteration, even when
/// zero rows were produced; the result handle is scoped to this call and
/// released on all exit paths.
pub(crate) async fn fetch_all<T, F>(
    conn: &dyn Connection,
    template: &QueryTemplate<'_>,
    filter: &Filter,
    limit: usize,
    decode: F,
) -> Result<Vec<T>, DatabaseError>
where
    F: Fn(&[Value]) -> Result<T, DatabaseError> + Send,
    T: Send,
{
    let (sql, params) = template.compose(filter, limit);
    tracing::debug!(sql = %sql, params = params.len(), "running metadata query");
    let mut rows = conn.query(&sql, &params).await?;
    let mut results = Vec::new();
    while let Some(row) = rows.next().await? {
        results.push(decode(&row)?);
    }
    rows.finish()?;
    Ok(results)
}

/// System-catalog reader for one backend, scoped to one connection.
///
/// Kinds a backend cannot express return `NotSupported`.
#[async_trait::async_trait]
pub trait MetadataReader: Send + Sync + std::fmt::Debug {
    /// Bound every subsequent query to at most `limit` records; zero means
    /// unbounded.
    fn set_limit(&mut self, limit: usize);

    async fn catalogs(&self, f: &Filter) -> Result<CatalogSet, DatabaseError> {
        let _ = f;
        Err(DatabaseError::NotSupported("catalog listing".to_string()))
    }

    async fn schemas(&self, f: &Filter) -> Result<SchemaSet, DatabaseError> {
        let _ = f;
        Err(DatabaseError::NotSupported("schema listing".to_string()))
    }

    async fn tables(&self, f: &Filter) -> Result<TableSet, DatabaseError> {
        let _ = f;
        Err(DatabaseError::NotSupported("table listing".to_string()))
    }

    async fn indexes(&self, f: &Filter) -> Result<IndexSet, DatabaseError> {
        let _ = f;
        Err(DatabaseError::NotSupported("index listing".to_string()))
    }

    async fn index_columns(&self, f: &Filter) -> Result<IndexColumnSet, DatabaseError> {
        let _ = f;
        Err(DatabaseError::NotSupported("index column listing".to_string()))
    }
}

// ============================================================================
// Row decode helpers shared by the backend readers
// ============================================================================

pub(crate) fn text_at(row: &[Value], idx: usize) -> Result<String, DatabaseError> {
    match row.get(idx) {
        Some(Value::Null) => Ok(String::new()),
        Some(v) => v
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| DatabaseError::Decode(format!("expected text at column {idx}, got {v:?}"))),
        None => Err(DatabaseError::Decode(format!("missing column {idx}"))),
    }
}

pub(crate) fn i64_at(row: &[Value], idx: usize) -> Result<i64, DatabaseError> {
    match row.get(idx) {
        Some(v) => v
            .as_i64()
            .ok_or_else(|| DatabaseError::Decode(format!("expected integer at column {idx}, got {v:?}"))),
        None => Err(DatabaseError::Decode(format!("missing column {idx}"))),
    }
}

/// Decode the `'YES'`/`'NO'` convention used by the catalog queries.
pub(crate) fn yes_no_at(row: &[Value], idx: usize) -> Result<bool, DatabaseError> {
    Ok(text_at(row, idx)? == "YES")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;
    use crate::traits::{Connection, ExecResult, Rows};
    use crate::value::Value;

    const TEMPLATE: QueryTemplate<'_> = QueryTemplate {
        base: "SELECT s.name, t.name, i.name\nFROM s JOIN t ON ... JOIN i ON ...",
        fixed_cond: None,
        visible_cond: Some("s.name = current_schema()"),
        system_cond: Some("s.name NOT IN ('sys')"),
        schema_column: Some("s.name"),
        parent_column: Some("t.name"),
        name_column: Some("i.name"),
        order_by: "s.name, t.name, i.name",
        placeholder: Placeholder::Question,
        limit: LimitSyntax::Limit,
    };

    #[test]
    fn test_compose_no_filter() {
        let (sql, vals) = TEMPLATE.compose(&Filter::new().with_system(true), 0);
        assert!(!sql.contains("WHERE"));
        assert!(sql.ends_with("ORDER BY s.name, t.name, i.name"));
        assert!(vals.is_empty());
    }

    #[test]
    fn test_compose_default_excludes_system_objects() {
        let (sql, _) = TEMPLATE.compose(&Filter::new(), 0);
        assert!(sql.contains("WHERE s.name NOT IN ('sys')"));
    }

    #[test]
    fn test_compose_condition_order_is_fixed() {
        let f = Filter::new()
            .only_visible(true)
            .schema("public")
            .parent("users")
            .name("users_pkey");
        let (sql, vals) = TEMPLATE.compose(&f, 0);
        let where_clause = sql.split("\nWHERE ").nth(1).unwrap();
        assert_eq!(
            where_clause.split("\nORDER BY").next().unwrap(),
            "s.name = current_schema() AND s.name NOT IN ('sys') \
             AND s.name LIKE ? AND t.name LIKE ? AND i.name LIKE ?"
        );
        assert_eq!(
            vals,
            vec![
                Value::Text("public".to_string()),
                Value::Text("users".to_string()),
                Value::Text("users_pkey".to_string()),
            ]
        );
    }

    #[test]
    fn test_compose_empty_pattern_is_no_restriction() {
        let (sql, vals) = TEMPLATE.compose(&Filter::new().with_system(true).schema(""), 0);
        assert!(!sql.contains("LIKE"));
        assert!(vals.is_empty());
    }

    #[test]
    fn test_compose_numbered_placeholders() {
        let mut tpl = TEMPLATE.clone();
        tpl.placeholder = Placeholder::Dollar;
        let f = Filter::new().with_system(true).parent("t%").name("i%");
        let (sql, vals) = tpl.compose(&f, 0);
        assert!(sql.contains("t.name LIKE $1"));
        assert!(sql.contains("i.name LIKE $2"));
        assert_eq!(vals.len(), 2);

        tpl.placeholder = Placeholder::AtP;
        let (sql, _) = tpl.compose(&f, 0);
        assert!(sql.contains("t.name LIKE @P1"));
        assert!(sql.contains("i.name LIKE @P2"));
    }

    #[test]
    fn test_compose_limit_syntax() {
        let (sql, _) = TEMPLATE.compose(&Filter::new(), 5);
        assert!(sql.ends_with("LIMIT 5"));

        let mut tpl = TEMPLATE.clone();
        tpl.limit = LimitSyntax::FetchFirst;
        let (sql, _) = tpl.compose(&Filter::new(), 5);
        assert!(sql.ends_with("OFFSET 0 ROWS FETCH FIRST 5 ROWS ONLY"));

        let (sql, _) = tpl.compose(&Filter::new(), 0);
        assert!(!sql.contains("FETCH"));
    }

    #[test]
    fn test_meta_set_cursor() {
        let mut set = MetaSet::new(vec![Catalog { name: "a".into() }, Catalog { name: "b".into() }]);
        assert_eq!(set.len(), 2);
        assert!(set.current().is_none());
        assert!(set.next());
        assert_eq!(set.current().unwrap().name, "a");
        assert!(set.next());
        assert_eq!(set.current().unwrap().name, "b");
        assert!(!set.next());
        assert!(set.current().is_none());
    }

    // Connection stub whose cursor yields rows then fails at the terminal
    // check, like a backend that reports stream errors only at exhaustion.
    struct FailingRows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        fail_on_finish: bool,
    }

    #[async_trait::async_trait]
    impl Rows for FailingRows {
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

        fn finish(&mut self) -> Result<(), DatabaseError> {
            if self.fail_on_finish {
                Err(DatabaseError::Query("connection reset mid-stream".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct StubConnection {
        rows: Vec<Vec<Value>>,
        fail_on_finish: bool,
    }

    #[async_trait::async_trait]
    impl Connection for StubConnection {
        async fn query(
            &self,
            _sql: &str,
            _params: &[Value],
        ) -> Result<Box<dyn Rows>, DatabaseError> {
            Ok(Box::new(FailingRows {
                columns: vec!["name".to_string()],
                rows: self.rows.clone(),
                fail_on_finish: self.fail_on_finish,
            }))
        }

        async fn execute(
            &self,
            _sql: &str,
            _params: &[Value],
        ) -> Result<Box<dyn ExecResult>, DatabaseError> {
            Err(DatabaseError::NotSupported("execute".to_string()))
        }

        async fn ping(&self) -> Result<(), DatabaseError> {
            Ok(())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[tokio::test]
    async fn test_fetch_all_decodes_in_order() {
        let conn = StubConnection {
            rows: vec![vec![Value::Text("a".into())], vec![Value::Text("b".into())]],
            fail_on_finish: false,
        };
        let names = fetch_all(&conn, &TEMPLATE, &Filter::new(), 0, |row| text_at(row, 0))
            .await
            .unwrap();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fetch_all_reports_terminal_error_with_zero_rows() {
        let conn = StubConnection {
            rows: vec![],
            fail_on_finish: true,
        };
        let res = fetch_all(&conn, &TEMPLATE, &Filter::new(), 0, |row| text_at(row, 0)).await;
        assert!(matches!(res, Err(DatabaseError::Query(_))));
    }

    #[tokio::test]
    async fn test_fetch_all_reports_terminal_error_after_good_rows() {
        let conn = StubConnection {
            rows: vec![vec![Value::Text("a".into())]],
            fail_on_finish: true,
        };
        let res = fetch_all(&conn, &TEMPLATE, &Filter::new(), 0, |row| text_at(row, 0)).await;
        assert!(res.is_err());
    }

    #[test]
    fn test_decode_helpers() {
        let row = vec![Value::Text("x".into()), Value::Int(3), Value::Text("YES".into()), Value::Null];
        assert_eq!(text_at(&row, 0).unwrap(), "x");
        assert_eq!(i64_at(&row, 1).unwrap(), 3);
        assert!(yes_no_at(&row, 2).unwrap());
        assert_eq!(text_at(&row, 3).unwrap(), "");
        assert!(text_at(&row, 9).is_err());
        assert!(i64_at(&row, 0).is_err());
    }
}
