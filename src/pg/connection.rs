//! PostgreSQL connection implementation.
//!
//! A [`PgConnection`] is a handle on a socket task. The task owns the
//! stream and the frame decoder; commands reach it over a channel, are
//! written immediately, and their responses are matched in submission
//! order, so up to `pipelining_limit` commands can be outstanding at once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, trace, warn};

use super::command::{PgCommand, QueryResult, Row};
use super::decoder::MessageDecoder;
use super::error::ServerError;
use super::factory::PgConnectOptions;
use super::protocol::*;
use crate::connection::{
    Connection, ConnectionEvent, ConnectionHolder, HolderBinding, HolderId, Notification,
};
use crate::error::{Error, Result};

type Reply = oneshot::Sender<Result<Vec<QueryResult>>>;

enum Request {
    Query { command: PgCommand, reply: Reply },
    Terminate,
}

/// State shared between the handle and its socket task.
struct Shared {
    binding: HolderBinding,
    status: AtomicU8,
    closed: AtomicBool,
    parameters: Mutex<HashMap<String, String>>,
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
pub struct PgConnection {
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
    /// Bounds outstanding commands to the pipelining limit
    permits: Semaphore,
    pipelining_limit: usize,
    /// Backend process ID
    process_id: i32,
    /// Backend secret key (for cancellation)
    secret_key: i32,
}

impl PgConnection {
    /// Run the startup handshake over `stream` and start the socket task.
    ///
    /// Supports trust, cleartext and MD5 password authentication; any
    /// other request from the server fails the handshake.
    pub async fn handshake<S>(mut stream: S, options: &PgConnectOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut decoder = MessageDecoder::new();

        let startup = StartupMessage {
            user: options.user.clone(),
            database: Some(options.database.clone()),
            options: options
                .application_name
                .as_ref()
                .map(|name| vec![("application_name".to_string(), name.clone())])
                .unwrap_or_default(),
        };
        write_message(&mut stream, &startup).await?;

        let mut parameters = HashMap::new();
        let mut process_id = 0;
        let mut secret_key = 0;

        let status = loop {
            match read_message(&mut stream, &mut decoder).await? {
                BackendMessage::AuthenticationOk => {
                    debug!(user = %options.user, "authenticated");
                }
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = options.required_password()?;
                    let msg = PasswordMessage {
                        password: password.to_string(),
                    };
                    write_message(&mut stream, &msg).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let password = options.required_password()?;
                    let msg = PasswordMessage {
                        password: md5_password(&options.user, password, &salt),
                    };
                    write_message(&mut stream, &msg).await?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id: pid,
                    secret_key: key,
                } => {
                    process_id = pid;
                    secret_key = key;
                }
                BackendMessage::ReadyForQuery { status } => break status,
                BackendMessage::ErrorResponse(e) => return Err(Error::Server(e)),
                BackendMessage::NoticeResponse(notice) => log_notice(&notice),
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected {} during startup",
                        other.name()
                    )))
                }
            }
        };

        let shared = Arc::new(Shared {
            binding: HolderBinding::new(),
            status: AtomicU8::new(status.as_byte()),
            closed: AtomicBool::new(false),
            parameters: Mutex::new(parameters),
        });
        let (requests, rx) = mpsc::unbounded_channel();
        let task = SocketTask {
            shared: Arc::clone(&shared),
            decoder,
            in_flight: VecDeque::new(),
        };
        tokio::spawn(task.run(stream, rx));

        debug!(process_id, "connection ready");
        Ok(Self {
            requests,
            shared,
            permits: Semaphore::new(options.pipelining_limit),
            pipelining_limit: options.pipelining_limit,
            process_id,
            secret_key,
        })
    }

    /// Backend process ID.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// A server parameter reported through `ParameterStatus`.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.shared.parameters.lock().get(name).cloned()
    }

    /// Transaction status as of the last `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        TransactionStatus::from(self.shared.status.load(Ordering::Acquire))
    }
}

#[async_trait]
impl Connection for PgConnection {
    type Command = PgCommand;
    type Output = Vec<QueryResult>;

    async fn schedule(&self, command: PgCommand) -> Result<Vec<QueryResult>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Query { command, reply })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    fn init(&self, id: HolderId, holder: Arc<dyn ConnectionHolder>) -> Result<()> {
        self.shared.binding.bind(id, holder)
    }

    fn close(&self, id: HolderId) -> Result<()> {
        self.shared.binding.check(id)?;
        self.shared.closed.store(true, Ordering::Release);
        // The task may already be gone; it reports the close either way
        let _ = self.requests.send(Request::Terminate);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    fn pipelining_limit(&self) -> usize {
        self.pipelining_limit
    }

    fn needs_reset(&self) -> bool {
        self.transaction_status() != TransactionStatus::Idle
    }

    async fn reset(&self) -> Result<()> {
        debug!(status = ?self.transaction_status(), "rolling back before reuse");
        self.schedule(PgCommand::Rollback).await.map(|_| ())
    }
}

// ============================================================================
// Socket Task
// ============================================================================

/// A command whose response is still being received.
struct InFlight {
    reply: Reply,
    results: Vec<QueryResult>,
    current: Option<QueryResult>,
    error: Option<Box<ServerError>>,
}

impl InFlight {
    fn new(reply: Reply) -> Self {
        Self {
            reply,
            results: Vec::new(),
            current: None,
            error: None,
        }
    }

    fn complete(self) {
        let result = match self.error {
            Some(e) => Err(Error::Server(e)),
            None => Ok(self.results),
        };
        // The caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

struct SocketTask {
    shared: Arc<Shared>,
    decoder: MessageDecoder,
    in_flight: VecDeque<InFlight>,
}

/// Why the socket task stopped.
enum Exit {
    /// The handle asked for an orderly close
    Terminated,
    /// The server hung up
    Eof,
    Failed(Error),
}

impl SocketTask {
    async fn run<S>(mut self, stream: S, mut requests: mpsc::UnboundedReceiver<Request>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        // Writes run on their own task so a full send buffer never stops
        // responses from being read
        let (outgoing, pending_writes) = mpsc::unbounded_channel();
        let mut write_task = tokio::spawn(write_loop(writer, pending_writes));

        let exit = loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Query { command, reply }) => {
                        trace!(sql = command.sql(), "sending query");
                        let msg = QueryMessage { query: command.sql() };
                        if outgoing.send(msg.encode()).is_err() {
                            let _ = reply.send(Err(Error::ConnectionClosed));
                            break Exit::Failed(Error::ConnectionClosed);
                        }
                        self.in_flight.push_back(InFlight::new(reply));
                    }
                    Some(Request::Terminate) | None => {
                        let _ = outgoing.send(TerminateMessage.encode());
                        break Exit::Terminated;
                    }
                },
                read = reader.read_buf(self.decoder.read_buffer()) => match read {
                    Ok(0) => {
                        debug!("server closed the connection");
                        break Exit::Eof;
                    }
                    Ok(_) => {
                        if let Err(e) = self.drain() {
                            break Exit::Failed(e);
                        }
                    }
                    Err(e) => break Exit::Failed(e.into()),
                },
                written = &mut write_task => {
                    break Exit::Failed(match written {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => Error::ConnectionClosed,
                        Err(e) => Error::IllegalState(format!("writer task failed: {}", e)),
                    });
                }
            }
        };

        // Closing the queue lets the writer flush and shut down
        drop(outgoing);
        let failure = match exit {
            Exit::Terminated => {
                if let Ok(Err(e)) = write_task.await {
                    debug!(error = %e, "terminate not delivered");
                }
                None
            }
            Exit::Eof => {
                write_task.abort();
                None
            }
            Exit::Failed(e) => {
                write_task.abort();
                Some(e)
            }
        };

        requests.close();
        while let Ok(request) = requests.try_recv() {
            if let Request::Query { reply, .. } = request {
                let _ = reply.send(Err(Error::ConnectionClosed));
            }
        }
        self.shutdown(failure);
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(msg) = self.decoder.decode()? {
            self.handle(msg)?;
        }
        Ok(())
    }

    fn handle(&mut self, msg: BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                self.shared
                    .binding
                    .emit(ConnectionEvent::Notification(Notification {
                        process_id,
                        channel,
                        payload,
                    }));
                return Ok(());
            }
            BackendMessage::NoticeResponse(notice) => {
                log_notice(&notice);
                return Ok(());
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.shared.parameters.lock().insert(name, value);
                return Ok(());
            }
            BackendMessage::ReadyForQuery { status } => {
                self.shared.status.store(status.as_byte(), Ordering::Release);
                let done = self.in_flight.pop_front().ok_or_else(|| {
                    Error::Protocol("ReadyForQuery with no command in flight".to_string())
                })?;
                done.complete();
                return Ok(());
            }
            _ => {}
        }

        let Some(head) = self.in_flight.front_mut() else {
            return Err(match msg {
                BackendMessage::ErrorResponse(e) => Error::Server(e),
                other => Error::Protocol(format!(
                    "Unexpected {} with no command in flight",
                    other.name()
                )),
            });
        };

        match msg {
            BackendMessage::RowDescription { fields } => {
                head.current = Some(QueryResult::new(fields));
            }
            BackendMessage::DataRow { values } => {
                head.current
                    .get_or_insert_with(QueryResult::empty)
                    .rows
                    .push(Row::new(values));
            }
            BackendMessage::CommandComplete { tag } => {
                let mut result = head.current.take().unwrap_or_else(QueryResult::empty);
                result.tag = tag;
                head.results.push(result);
            }
            BackendMessage::EmptyQueryResponse => {
                head.results.push(QueryResult::empty());
            }
            BackendMessage::ErrorResponse(e) => {
                head.current = None;
                head.error.get_or_insert(e);
            }
            other => {
                trace!(message = other.name(), "ignoring message");
            }
        }
        Ok(())
    }

    fn shutdown(mut self, failure: Option<Error>) {
        self.shared.closed.store(true, Ordering::Release);

        if let Some(e) = failure {
            warn!(error = %e, "connection failed");
            self.shared
                .binding
                .emit(ConnectionEvent::Exception(Arc::new(e)));
        }
        for pending in self.in_flight.drain(..) {
            let _ = pending.reply.send(Err(Error::ConnectionClosed));
        }
        self.shared.binding.notify_closed();
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Write queued messages in order, flushing once the queue runs dry.
/// Ends with a shutdown when the queue closes.
async fn write_loop<W>(mut writer: W, mut pending: mpsc::UnboundedReceiver<BytesMut>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(buf) = pending.recv().await {
        writer.write_all(&buf).await?;
        while let Ok(buf) = pending.try_recv() {
            writer.write_all(&buf).await?;
        }
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}

async fn write_message<W, M>(writer: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: FrontendMessage,
{
    writer.write_all(&msg.encode()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message<R>(reader: &mut R, decoder: &mut MessageDecoder) -> Result<BackendMessage>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(msg) = decoder.decode()? {
            return Ok(msg);
        }
        if reader.read_buf(decoder.read_buffer()).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

fn log_notice(notice: &ServerError) {
    info!(
        severity = %notice.severity,
        code = %notice.code,
        "server notice: {}",
        notice.message
    );
}
