//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 messages used by the simple
//! query protocol. Framing (splitting the byte stream into messages) lives
//! in [`super::decoder`]; this module only parses one payload at a time.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use super::command::CommandTag;
use super::error::ServerError;
use crate::error::{Error, Result};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Backend message type bytes
pub mod tag {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const DATA_ROW: u8 = b'D';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NO_DATA: u8 = b'n';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
}

/// Authentication request sub-types
pub mod auth {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
}

/// Column value encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Session state reported by every `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`: outside any transaction
    Idle,
    /// `T`: inside an open transaction
    InTransaction,
    /// `E`: inside a transaction that must be rolled back
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            _ => TransactionStatus::Failed,
        }
    }
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

// ============================================================================
// Frontend Messages
// ============================================================================

/// A message the client sends.
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Frame `payload` as `[tag][length][payload]`. A zero tag writes the
/// untagged form used by the startup packet.
fn framed(tag: u8, payload: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    let start = if tag == 0 {
        0
    } else {
        buf.put_u8(tag);
        1
    };
    buf.put_i32(0);
    payload(&mut buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    buf
}

/// First packet on a new connection: protocol version plus session
/// parameters.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        framed(0, |buf| {
            buf.put_i32(PROTOCOL_VERSION);
            let database = self.database.as_deref().map(|db| ("database", db));
            let params = std::iter::once(("user", self.user.as_str()))
                .chain(database)
                .chain(self.options.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            for (key, value) in params {
                put_cstring(buf, key);
                put_cstring(buf, value);
            }
            buf.put_u8(0);
        })
    }
}

/// `p`: answer to a cleartext or MD5 password request.
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        framed(b'p', |buf| put_cstring(buf, &self.password))
    }
}

/// `Q`: simple query, possibly several `;`-separated statements.
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self) -> BytesMut {
        framed(b'Q', |buf| put_cstring(buf, self.query))
    }
}

/// `X`: orderly shutdown.
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        framed(b'X', |_| {})
    }
}

/// MD5 password response: `"md5" + md5(md5(password + user) + salt)`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user).as_bytes());

    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);

    format!("md5{:x}", md5::compute(&outer))
}

// ============================================================================
// Backend Messages
// ============================================================================

/// One column of a `RowDescription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Values of one DataRow, `None` for SQL NULL
pub type RowValues = SmallVec<[Option<Bytes>; 16]>;

/// A decoded server message.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Startup
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },

    // Results
    RowDescription { fields: Arc<[FieldDescription]> },
    DataRow { values: RowValues },
    CommandComplete { tag: CommandTag },
    EmptyQueryResponse,

    // Extended protocol acknowledgements, parsed but never requested
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<i32> },

    // Session
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Diagnostics
    ErrorResponse(Box<ServerError>),
    NoticeResponse(Box<ServerError>),

    // Asynchronous
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Parse the payload of one message.
    ///
    /// `body` holds exactly the bytes declared by the frame length, so a
    /// parser can neither read into the next message nor leave the stream
    /// misaligned by stopping early.
    pub fn decode(msg_type: u8, body: Bytes) -> Result<Self> {
        match msg_type {
            tag::AUTHENTICATION => Self::decode_auth(body),
            tag::ROW_DESCRIPTION => Self::decode_row_description(body),
            tag::DATA_ROW => Self::decode_data_row(body),
            tag::COMMAND_COMPLETE => Self::decode_command_complete(body),
            tag::READY_FOR_QUERY => Self::decode_ready_for_query(body),
            tag::ERROR_RESPONSE => Ok(BackendMessage::ErrorResponse(Box::new(
                read_error_fields(body)?,
            ))),
            tag::NOTICE_RESPONSE => Ok(BackendMessage::NoticeResponse(Box::new(
                read_error_fields(body)?,
            ))),
            tag::PARAMETER_STATUS => Self::decode_parameter_status(body),
            tag::BACKEND_KEY_DATA => Self::decode_backend_key_data(body),
            tag::PARSE_COMPLETE => Ok(BackendMessage::ParseComplete),
            tag::BIND_COMPLETE => Ok(BackendMessage::BindComplete),
            tag::CLOSE_COMPLETE => Ok(BackendMessage::CloseComplete),
            tag::EMPTY_QUERY_RESPONSE => Ok(BackendMessage::EmptyQueryResponse),
            tag::NO_DATA => Ok(BackendMessage::NoData),
            tag::PORTAL_SUSPENDED => Ok(BackendMessage::PortalSuspended),
            tag::PARAMETER_DESCRIPTION => Self::decode_parameter_description(body),
            tag::NOTIFICATION_RESPONSE => Self::decode_notification_response(body),
            _ => Err(Error::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::AuthenticationCleartextPassword => "AuthenticationCleartextPassword",
            BackendMessage::AuthenticationMD5Password { .. } => "AuthenticationMD5Password",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ErrorResponse(_) => "ErrorResponse",
            BackendMessage::NoticeResponse(_) => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }

    fn decode_auth(mut body: Bytes) -> Result<Self> {
        let auth_type = get_i32(&mut body)?;

        match auth_type {
            auth::OK => Ok(BackendMessage::AuthenticationOk),
            auth::CLEARTEXT_PASSWORD => Ok(BackendMessage::AuthenticationCleartextPassword),
            auth::MD5_PASSWORD => {
                ensure(&body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            other => Err(Error::UnsupportedAuthentication(other)),
        }
    }

    fn decode_row_description(mut body: Bytes) -> Result<Self> {
        let num_fields = get_u16(&mut body)? as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            let table_oid = get_i32(&mut body)?;
            let column_attr = get_i16(&mut body)?;
            let type_oid = get_i32(&mut body)?;
            let type_size = get_i16(&mut body)?;
            let type_modifier = get_i32(&mut body)?;
            let format = if get_i16(&mut body)? == 0 {
                Format::Text
            } else {
                Format::Binary
            };

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription {
            fields: fields.into(),
        })
    }

    fn decode_data_row(mut body: Bytes) -> Result<Self> {
        let num_cols = get_u16(&mut body)? as usize;
        let mut values = RowValues::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = get_i32(&mut body)?;
            if len < 0 {
                values.push(None);
            } else {
                ensure(&body, len as usize)?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> Result<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete {
            tag: CommandTag::parse(&tag),
        })
    }

    fn decode_ready_for_query(mut body: Bytes) -> Result<Self> {
        ensure(&body, 1)?;
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_parameter_status(mut body: Bytes) -> Result<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> Result<Self> {
        let process_id = get_i32(&mut body)?;
        let secret_key = get_i32(&mut body)?;
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> Result<Self> {
        let num_params = get_u16(&mut body)? as usize;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(get_i32(&mut body)?);
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> Result<Self> {
        let process_id = get_i32(&mut body)?;
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;

        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn ensure(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Protocol(format!(
            "Message truncated: need {} bytes, have {}",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_i16(buf: &mut Bytes) -> Result<i16> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

fn get_u16(buf: &mut Bytes) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

/// Take a NUL-terminated string off the front of `buf`. Invalid UTF-8 is
/// replaced rather than rejected.
fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let Some(nul) = buf.iter().position(|&b| b == 0) else {
        return Err(Error::Protocol("Unterminated string in message".to_string()));
    };
    let raw = buf.split_to(nul);
    buf.advance(1);
    Ok(match String::from_utf8(raw.to_vec()) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

/// Fields of an `ErrorResponse` or `NoticeResponse`: `(code, value)` pairs
/// ended by a zero byte. Codes this client doesn't know are dropped.
fn read_error_fields(mut body: Bytes) -> Result<ServerError> {
    let mut error = ServerError::default();
    loop {
        ensure(&body, 1)?;
        match body.get_u8() {
            0 => return Ok(error),
            code => {
                let value = read_cstring(&mut body)?;
                error.set_field(code, value);
            }
        }
    }
}
