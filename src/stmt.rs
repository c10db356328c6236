// Statement Buffer Settings & Classification
// The multi-line statement buffer itself lives outside this crate; it is
// configured from here through two toggles, and its extracted keyword prefix
// feeds the shared statement classifier

/// Settings consumed by the external statement buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    allow_dollar: bool,
    allow_multiline_comments: bool,
}

impl BufferConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable dollar-quoted string recognition.
    pub fn allow_dollar(&mut self, enable: bool) {
        self.allow_dollar = enable;
    }

    /// Enable or disable multi-line comment recognition.
    pub fn allow_multiline_comments(&mut self, enable: bool) {
        self.allow_multiline_comments = enable;
    }

    pub fn dollar_allowed(&self) -> bool {
        self.allow_dollar
    }

    pub fn multiline_comments_allowed(&self) -> bool {
        self.allow_multiline_comments
    }
}

/// A classified statement, ready for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedStatement {
    /// Command word reported to the caller (e.g. `SELECT`, `INSERT`).
    pub command: String,
    /// Statement text to execute. Drivers may rewrite it.
    pub sql: String,
    /// Whether the statement returns rows.
    pub is_query: bool,
}

// Leading keywords of statements that return rows.
const QUERY_KEYWORDS: [&str; 10] = [
    "SELECT", "VALUES", "SHOW", "EXPLAIN", "DESCRIBE", "DESC", "PRAGMA", "WITH", "TABLE", "FETCH",
];

/// Classify a statement from the keyword prefix extracted by the statement
/// buffer. The statement text is returned unchanged; an empty prefix
/// classifies as a non-query `EXEC`.
pub fn classify(prefix: &str, sql: &str) -> ProcessedStatement {
    let command = prefix
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    if command.is_empty() {
        return ProcessedStatement {
            command: "EXEC".to_string(),
            sql: sql.to_string(),
            is_query: false,
        };
    }
    let is_query = QUERY_KEYWORDS.contains(&command.as_str());
    ProcessedStatement {
        command,
        sql: sql.to_string(),
        is_query,
    }
}
