//! Incremental frame decoder for the backend message stream.
//!
//! Every backend message is `[1-byte type][4-byte big-endian length][payload]`
//! where the length covers itself and the payload but not the type byte.
//! Bytes are consumed only once a whole frame has arrived; a partial frame
//! stays buffered until the next read.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::trace;

use super::protocol::{BackendMessage, FieldDescription};
use crate::error::{Error, Result};

/// Type byte plus length field
const HEADER_LEN: usize = 5;

/// Initial read buffer size (32KB)
const READ_BUFFER_CAPACITY: usize = 32 * 1024;

/// Splits buffered bytes into backend messages.
///
/// The decoder also tracks the row description of the result being
/// streamed: a `DataRow` is only accepted after a `RowDescription` and must
/// carry as many values as it declared. The description is cleared when
/// the result completes.
#[derive(Debug)]
pub struct MessageDecoder {
    buf: BytesMut,
    row_description: Option<Arc<[FieldDescription]>>,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            row_description: None,
        }
    }

    /// Append bytes received from the server.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The buffer to read into directly, with spare room reserved.
    pub fn read_buffer(&mut self) -> &mut BytesMut {
        if self.buf.capacity() - self.buf.len() < 1024 {
            self.buf.reserve(READ_BUFFER_CAPACITY);
        }
        &mut self.buf
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Columns of the result currently being streamed.
    pub fn row_description(&self) -> Option<&Arc<[FieldDescription]>> {
        self.row_description.as_ref()
    }

    /// Decode the next complete message, `None` if more bytes are needed.
    ///
    /// An error means the stream can't be trusted any more; the connection
    /// should be closed.
    pub fn decode(&mut self) -> Result<Option<BackendMessage>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if length < 4 {
            return Err(Error::Protocol(format!("Invalid message length: {}", length)));
        }

        // The buffer grows a read at a time; a declared length alone never
        // allocates
        let total = 1 + length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        // The cursor always lands on the next frame boundary, whatever the
        // payload parser consumes
        let mut frame = self.buf.split_to(total).freeze();
        let msg_type = frame.get_u8();
        frame.advance(4);

        let msg = BackendMessage::decode(msg_type, frame)?;
        trace!(message = msg.name(), "decoded backend message");
        self.track(&msg)?;
        Ok(Some(msg))
    }

    /// Decode every complete message currently buffered.
    pub fn decode_all(&mut self) -> Result<Vec<BackendMessage>> {
        let mut messages = Vec::new();
        while let Some(msg) = self.decode()? {
            messages.push(msg);
        }
        Ok(messages)
    }

    fn track(&mut self, msg: &BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::RowDescription { fields } => {
                self.row_description = Some(Arc::clone(fields));
            }
            BackendMessage::DataRow { values } => {
                let Some(desc) = &self.row_description else {
                    return Err(Error::Protocol(
                        "DataRow received without a RowDescription".to_string(),
                    ));
                };
                if desc.len() != values.len() {
                    return Err(Error::Protocol(format!(
                        "DataRow has {} values but the row description has {} columns",
                        values.len(),
                        desc.len()
                    )));
                }
            }
            BackendMessage::CommandComplete { .. }
            | BackendMessage::EmptyQueryResponse
            | BackendMessage::ErrorResponse(_)
            | BackendMessage::ReadyForQuery { .. } => {
                self.row_description = None;
            }
            _ => {}
        }
        Ok(())
    }
}
