//! Commands and results of the PostgreSQL driver.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::protocol::{FieldDescription, RowValues};
use crate::connection::TransactionCommand;
use crate::error::{Error, Result};

// ============================================================================
// Commands
// ============================================================================

/// A unit of work sent with the simple query protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgCommand {
    /// One or more `;`-separated statements
    SimpleQuery(String),
    Begin,
    Commit,
    Rollback,
}

impl PgCommand {
    pub fn query(sql: impl Into<String>) -> Self {
        PgCommand::SimpleQuery(sql.into())
    }

    /// The SQL text sent to the server.
    pub fn sql(&self) -> &str {
        match self {
            PgCommand::SimpleQuery(sql) => sql,
            PgCommand::Begin => "BEGIN",
            PgCommand::Commit => "COMMIT",
            PgCommand::Rollback => "ROLLBACK",
        }
    }
}

impl TransactionCommand for PgCommand {
    fn begin() -> Self {
        PgCommand::Begin
    }

    fn commit() -> Self {
        PgCommand::Commit
    }

    fn rollback() -> Self {
        PgCommand::Rollback
    }
}

// ============================================================================
// Command Tag
// ============================================================================

/// Parsed `CommandComplete` tag, e.g. `INSERT 0 3` or `CREATE TABLE`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTag {
    /// The command words, e.g. `INSERT` or `CREATE TABLE`
    pub verb: String,
    /// Rows affected, 0 when the tag carries no count
    pub rows: u64,
}

impl CommandTag {
    /// Parse a tag. The row count is the last numeric field; the OID field
    /// of `INSERT oid rows` is skipped.
    pub fn parse(tag: &str) -> Self {
        let mut verb = Vec::new();
        let mut rows = 0;
        let mut counted = false;
        for word in tag.split_whitespace() {
            match word.parse::<u64>() {
                Ok(n) => {
                    rows = n;
                    counted = true;
                }
                Err(_) if !counted => verb.push(word),
                Err(_) => {}
            }
        }
        Self {
            verb: verb.join(" "),
            rows,
        }
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.rows)
    }
}

// ============================================================================
// Results
// ============================================================================

/// One row of a result, values in text format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    values: RowValues,
}

impl Row {
    pub(crate) fn new(values: RowValues) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw bytes of column `idx`, `None` for NULL or out of range.
    pub fn get(&self, idx: usize) -> Option<&Bytes> {
        self.values.get(idx).and_then(|v| v.as_ref())
    }

    /// Column `idx` as text.
    pub fn get_str(&self, idx: usize) -> Result<Option<&str>> {
        match self.get(idx) {
            None => Ok(None),
            Some(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|e| Error::Protocol(format!("column {} is not UTF-8: {}", idx, e))),
        }
    }
}

/// Result of one statement.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Arc<[FieldDescription]>,
    pub rows: Vec<Row>,
    pub tag: CommandTag,
}

impl QueryResult {
    pub(crate) fn new(columns: Arc<[FieldDescription]>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            tag: CommandTag::default(),
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(Arc::from(Vec::new()))
    }

    pub fn rows_affected(&self) -> u64 {
        self.tag.rows
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}
