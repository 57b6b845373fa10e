//! Error and notice fields reported by a PostgreSQL backend.

use std::fmt;

/// Fields of an `ErrorResponse` or `NoticeResponse` message.
///
/// Only `severity`, `code` and `message` are always sent by the server;
/// the rest are populated when present. Unknown field codes are skipped
/// by the decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    pub internal_position: Option<String>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
}

/// Field type codes of error and notice responses.
pub mod field {
    pub const SEVERITY: u8 = b'S';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const INTERNAL_POSITION: u8 = b'p';
    pub const INTERNAL_QUERY: u8 = b'q';
    pub const WHERE: u8 = b'W';
    pub const SCHEMA: u8 = b's';
    pub const TABLE: u8 = b't';
    pub const COLUMN: u8 = b'c';
    pub const DATA_TYPE: u8 = b'd';
    pub const CONSTRAINT: u8 = b'n';
    pub const FILE: u8 = b'F';
    pub const LINE: u8 = b'L';
    pub const ROUTINE: u8 = b'R';
}

impl ServerError {
    /// Store a field value. Returns `false` for codes this client doesn't know.
    pub fn set_field(&mut self, code: u8, value: String) -> bool {
        match code {
            field::SEVERITY => self.severity = value,
            field::CODE => self.code = value,
            field::MESSAGE => self.message = value,
            field::DETAIL => self.detail = Some(value),
            field::HINT => self.hint = Some(value),
            field::POSITION => self.position = Some(value),
            field::INTERNAL_POSITION => self.internal_position = Some(value),
            field::INTERNAL_QUERY => self.internal_query = Some(value),
            field::WHERE => self.where_ = Some(value),
            field::SCHEMA => self.schema = Some(value),
            field::TABLE => self.table = Some(value),
            field::COLUMN => self.column = Some(value),
            field::DATA_TYPE => self.data_type = Some(value),
            field::CONSTRAINT => self.constraint = Some(value),
            field::FILE => self.file = Some(value),
            field::LINE => self.line = Some(value),
            field::ROUTINE => self.routine = Some(value),
            _ => return false,
        }
        true
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}
