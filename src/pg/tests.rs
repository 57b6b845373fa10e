//! Tests for the PostgreSQL driver.
//!
//! Connection tests talk to a scripted server over an in-memory duplex
//! stream; the `integration` module needs a running PostgreSQL.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use super::command::PgCommand;
use super::connection::PgConnection;
use super::decoder::MessageDecoder;
use super::factory::PgConnectOptions;
use super::protocol::*;
use crate::connection::{Connection, ConnectionEvent, ConnectionHolder, HolderId};
use crate::error::Error;

// ============================================================================
// Backend message builders
// ============================================================================

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn auth(kind: i32, extra: &[u8]) -> Vec<u8> {
    let mut body = kind.to_be_bytes().to_vec();
    body.extend_from_slice(extra);
    frame(b'R', &body)
}

fn ready(status: u8) -> Vec<u8> {
    frame(b'Z', &[status])
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    frame(b'S', format!("{}\0{}\0", name, value).as_bytes())
}

fn backend_key(pid: i32, key: i32) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(&key.to_be_bytes());
    frame(b'K', &body)
}

fn row_description(names: &[&str]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i16(names.len() as i16);
    for name in names {
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_i32(0); // table oid
        body.put_i16(0); // column attribute
        body.put_i32(25); // text
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0); // text format
    }
    frame(b'T', &body)
}

fn data_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i16(values.len() as i16);
    for value in values {
        match value {
            Some(v) => {
                body.put_i32(v.len() as i32);
                body.put_slice(v.as_bytes());
            }
            None => body.put_i32(-1),
        }
    }
    frame(b'D', &body)
}

fn command_complete(tag: &str) -> Vec<u8> {
    frame(b'C', format!("{}\0", tag).as_bytes())
}

fn error_response(fields: &[(u8, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (code, value) in fields {
        body.push(*code);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    frame(b'E', &body)
}

fn notification(pid: i32, channel: &str, payload: &str) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(format!("{}\0{}\0", channel, payload).as_bytes());
    frame(b'A', &body)
}

fn select_response(column: &str, values: &[&str]) -> Vec<u8> {
    let mut out = row_description(&[column]);
    for v in values {
        out.extend(data_row(&[Some(v)]));
    }
    out.extend(command_complete(&format!("SELECT {}", values.len())));
    out.extend(ready(b'I'));
    out
}

// ============================================================================
// Scripted server helpers
// ============================================================================

async fn read_startup(server: &mut DuplexStream) -> Vec<u8> {
    let len = server.read_i32().await.unwrap();
    let mut body = vec![0; len as usize - 4];
    server.read_exact(&mut body).await.unwrap();
    body
}

async fn read_frontend(server: &mut DuplexStream) -> (u8, Vec<u8>) {
    let tag = server.read_u8().await.unwrap();
    let len = server.read_i32().await.unwrap();
    let mut body = vec![0; len as usize - 4];
    server.read_exact(&mut body).await.unwrap();
    (tag, body)
}

async fn read_query(server: &mut DuplexStream) -> String {
    let (tag, body) = read_frontend(server).await;
    assert_eq!(tag, b'Q');
    String::from_utf8(body[..body.len() - 1].to_vec()).unwrap()
}

/// Accept a trust-authenticated startup.
async fn accept(server: &mut DuplexStream) {
    read_startup(server).await;
    let mut out = auth(0, &[]);
    out.extend(parameter_status("server_version", "16.2"));
    out.extend(backend_key(4242, 7));
    out.extend(ready(b'I'));
    server.write_all(&out).await.unwrap();
}

async fn connected() -> (PgConnection, DuplexStream) {
    let (client, mut server) = duplex(64 * 1024);
    let options = PgConnectOptions::new();
    let (conn, _) = tokio::join!(PgConnection::handshake(client, &options), accept(&mut server));
    (conn.unwrap(), server)
}

/// Records the events a connection delivers.
struct TestHolder {
    events: mpsc::UnboundedSender<String>,
}

impl ConnectionHolder for TestHolder {
    fn handle_closed(&self) {
        let _ = self.events.send("closed".to_string());
    }

    fn handle_event(&self, event: ConnectionEvent) {
        let text = match event {
            ConnectionEvent::Closed => "closed".to_string(),
            ConnectionEvent::Exception(e) => format!("exception: {}", e),
            ConnectionEvent::Notification(n) => format!("notify {} {}", n.channel, n.payload),
        };
        let _ = self.events.send(text);
    }
}

fn bind_holder(conn: &PgConnection) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    conn.init(HolderId(1), Arc::new(TestHolder { events: tx }))
        .unwrap();
    rx
}

// ============================================================================
// Frame decoder
// ============================================================================

mod framing {
    use super::*;

    #[test]
    fn test_message_split_at_every_boundary() {
        let bytes = command_complete("UPDATE 7");

        for split in 0..=bytes.len() {
            let mut decoder = MessageDecoder::new();
            decoder.feed(&bytes[..split]);
            if split < bytes.len() {
                assert!(decoder.decode().unwrap().is_none(), "split at {}", split);
            }
            decoder.feed(&bytes[split..]);
            match decoder.decode().unwrap() {
                Some(BackendMessage::CommandComplete { tag }) => {
                    assert_eq!(tag.verb, "UPDATE");
                    assert_eq!(tag.rows, 7);
                }
                other => panic!("unexpected message: {:?}", other),
            }
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_concatenated_messages_decode_in_order() {
        let mut bytes = row_description(&["id", "name"]);
        bytes.extend(data_row(&[Some("1"), Some("alice")]));
        bytes.extend(data_row(&[Some("2"), None]));
        bytes.extend(command_complete("SELECT 2"));
        bytes.extend(ready(b'I'));

        let mut decoder = MessageDecoder::new();
        decoder.feed(&bytes);
        let names: Vec<_> = decoder
            .decode_all()
            .unwrap()
            .iter()
            .map(|m| m.name())
            .collect();

        assert_eq!(
            names,
            vec![
                "RowDescription",
                "DataRow",
                "DataRow",
                "CommandComplete",
                "ReadyForQuery"
            ]
        );
    }

    #[test]
    fn test_byte_at_a_time_matches_single_feed() {
        let mut bytes = select_response("n", &["1", "2", "3"]);
        bytes.extend(notification(9, "jobs", "ready"));

        let mut whole = MessageDecoder::new();
        whole.feed(&bytes);
        let expected: Vec<_> = whole.decode_all().unwrap().iter().map(|m| m.name()).collect();

        let mut decoder = MessageDecoder::new();
        let mut seen = Vec::new();
        for b in &bytes {
            decoder.feed(&[*b]);
            while let Some(msg) = decoder.decode().unwrap() {
                seen.push(msg.name());
            }
        }
        assert_eq!(seen, expected);
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn test_unknown_error_field_is_skipped() {
        let bytes = error_response(&[
            (b'S', "ERROR"),
            (b'Z', "from a newer server"),
            (b'C', "23505"),
            (b'M', "duplicate key value violates unique constraint"),
            (b'n', "users_email_key"),
        ]);

        let mut decoder = MessageDecoder::new();
        decoder.feed(&bytes);
        match decoder.decode().unwrap() {
            Some(BackendMessage::ErrorResponse(e)) => {
                assert_eq!(e.severity, "ERROR");
                assert_eq!(e.code, "23505");
                assert_eq!(e.message, "duplicate key value violates unique constraint");
                assert_eq!(e.constraint.as_deref(), Some("users_email_key"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_resync_after_payload_with_trailing_bytes() {
        // The tag parser stops at the NUL; the rest of the frame is skipped
        let mut bytes = frame(b'C', b"DELETE 4\0junk");
        bytes.extend(ready(b'T'));

        let mut decoder = MessageDecoder::new();
        decoder.feed(&bytes);
        let messages = decoder.decode_all().unwrap();

        assert_eq!(messages.len(), 2);
        assert!(matches!(
            &messages[0],
            BackendMessage::CommandComplete { tag } if tag.rows == 4
        ));
        assert!(matches!(
            messages[1],
            BackendMessage::ReadyForQuery {
                status: TransactionStatus::InTransaction
            }
        ));
    }

    #[test]
    fn test_invalid_length_is_an_error() {
        let mut decoder = MessageDecoder::new();
        decoder.feed(&[b'Z', 0, 0, 0, 2, b'I']);
        assert!(matches!(decoder.decode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unknown_message_type_is_an_error() {
        let mut decoder = MessageDecoder::new();
        decoder.feed(&frame(b'?', b""));
        assert!(matches!(decoder.decode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_row_description_tracked_per_result() {
        let mut bytes = row_description(&["id"]);
        bytes.extend(data_row(&[Some("1")]));
        bytes.extend(command_complete("SELECT 1"));

        let mut decoder = MessageDecoder::new();
        decoder.feed(&bytes);
        decoder.decode().unwrap();
        assert_eq!(decoder.row_description().unwrap()[0].name, "id");
        decoder.decode().unwrap();
        decoder.decode().unwrap();
        assert!(decoder.row_description().is_none());

        // A new result must describe its rows again
        decoder.feed(&data_row(&[Some("2")]));
        assert!(matches!(decoder.decode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_data_row_width_must_match_description() {
        let mut bytes = row_description(&["a", "b"]);
        bytes.extend(data_row(&[Some("1")]));

        let mut decoder = MessageDecoder::new();
        decoder.feed(&bytes);
        decoder.decode().unwrap();
        assert!(matches!(decoder.decode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unsupported_authentication_is_fatal() {
        let mut decoder = MessageDecoder::new();
        decoder.feed(&auth(7, &[]));
        let err = decoder.decode().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Authentication type 7 is not supported in the client"
        );
    }
}

// ============================================================================
// Startup
// ============================================================================

mod startup {
    use super::*;

    #[tokio::test]
    async fn test_md5_authentication() {
        let (client, mut server) = duplex(64 * 1024);
        let options = PgConnectOptions::new().user("alice").password("secret");

        let server_side = async {
            let startup = read_startup(&mut server).await;
            assert!(startup.windows(6).any(|w| w == b"alice\0"));

            server.write_all(&auth(5, &[1, 2, 3, 4])).await.unwrap();
            let (tag, body) = read_frontend(&mut server).await;
            assert_eq!(tag, b'p');
            assert_eq!(body, b"md598a0412b9c31436fc53776e863350083\0");

            let mut out = auth(0, &[]);
            out.extend(parameter_status("server_version", "16.2"));
            out.extend(backend_key(99, 1234));
            out.extend(ready(b'I'));
            server.write_all(&out).await.unwrap();
        };

        let (conn, _) = tokio::join!(PgConnection::handshake(client, &options), server_side);
        let conn = conn.unwrap();
        assert_eq!(conn.process_id(), 99);
        assert_eq!(conn.secret_key(), 1234);
        assert_eq!(conn.parameter("server_version").as_deref(), Some("16.2"));
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
        assert!(conn.is_valid());
    }

    #[tokio::test]
    async fn test_cleartext_authentication() {
        let (client, mut server) = duplex(64 * 1024);
        let options = PgConnectOptions::new().password("plain");

        let server_side = async {
            read_startup(&mut server).await;
            server.write_all(&auth(3, &[])).await.unwrap();
            let (tag, body) = read_frontend(&mut server).await;
            assert_eq!(tag, b'p');
            assert_eq!(body, b"plain\0");
            let mut out = auth(0, &[]);
            out.extend(ready(b'I'));
            server.write_all(&out).await.unwrap();
        };

        let (conn, _) = tokio::join!(PgConnection::handshake(client, &options), server_side);
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_password_required() {
        let (client, mut server) = duplex(64 * 1024);
        let options = PgConnectOptions::new();

        let server_side = async {
            read_startup(&mut server).await;
            server.write_all(&auth(3, &[])).await.unwrap();
        };

        let (conn, _) = tokio::join!(PgConnection::handshake(client, &options), server_side);
        assert!(matches!(conn, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_sasl_is_unsupported() {
        let (client, mut server) = duplex(64 * 1024);
        let options = PgConnectOptions::new().password("pw");

        let server_side = async {
            read_startup(&mut server).await;
            server
                .write_all(&auth(10, b"SCRAM-SHA-256\0\0"))
                .await
                .unwrap();
        };

        let (conn, _) = tokio::join!(PgConnection::handshake(client, &options), server_side);
        assert!(matches!(conn, Err(Error::UnsupportedAuthentication(10))));
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let (client, mut server) = duplex(64 * 1024);
        let options = PgConnectOptions::new().password("wrong");

        let server_side = async {
            read_startup(&mut server).await;
            server
                .write_all(&error_response(&[
                    (b'S', "FATAL"),
                    (b'C', "28P01"),
                    (b'M', "password authentication failed for user \"postgres\""),
                ]))
                .await
                .unwrap();
        };

        let (conn, _) = tokio::join!(PgConnection::handshake(client, &options), server_side);
        let err = conn.err().unwrap();
        assert_eq!(err.as_server_error().unwrap().code, "28P01");
    }

    #[tokio::test]
    async fn test_server_hangs_up_during_startup() {
        let (client, mut server) = duplex(64 * 1024);
        let options = PgConnectOptions::new();

        let server_side = async move {
            read_startup(&mut server).await;
            drop(server);
        };

        let (conn, _) = tokio::join!(PgConnection::handshake(client, &options), server_side);
        assert!(matches!(conn, Err(Error::ConnectionClosed)));
    }
}

// ============================================================================
// Commands
// ============================================================================

mod commands {
    use super::*;

    #[tokio::test]
    async fn test_simple_query() {
        let (conn, mut server) = connected().await;

        let server_side = async {
            assert_eq!(read_query(&mut server).await, "SELECT name FROM users");
            server
                .write_all(&select_response("name", &["alice", "bob"]))
                .await
                .unwrap();
        };

        let (results, _) = tokio::join!(
            conn.schedule(PgCommand::query("SELECT name FROM users")),
            server_side
        );
        let results = results.unwrap();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.column_index("name"), Some(0));
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[1].get_str(0).unwrap(), Some("bob"));
        assert_eq!(result.tag.verb, "SELECT");
        assert_eq!(result.rows_affected(), 2);
    }

    #[tokio::test]
    async fn test_multi_statement_query() {
        let (conn, mut server) = connected().await;

        let server_side = async {
            read_query(&mut server).await;
            let mut out = command_complete("INSERT 0 3");
            out.extend(command_complete("UPDATE 7"));
            out.extend(frame(b'I', b""));
            out.extend(ready(b'I'));
            server.write_all(&out).await.unwrap();
        };

        let (results, _) = tokio::join!(
            conn.schedule(PgCommand::query("INSERT ...; UPDATE ...; ;")),
            server_side
        );
        let results = results.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].rows_affected(), 3);
        assert_eq!(results[1].rows_affected(), 7);
        assert!(results[2].rows.is_empty());
    }

    #[tokio::test]
    async fn test_pipelined_responses_match_submission_order() {
        let (conn, mut server) = connected().await;

        let server_side = async {
            assert_eq!(read_query(&mut server).await, "SELECT 'a'");
            assert_eq!(read_query(&mut server).await, "SELECT 'b'");
            let mut out = select_response("v", &["a"]);
            out.extend(select_response("v", &["b"]));
            server.write_all(&out).await.unwrap();
        };

        let (a, b, _) = tokio::join!(
            conn.schedule(PgCommand::query("SELECT 'a'")),
            conn.schedule(PgCommand::query("SELECT 'b'")),
            server_side
        );
        assert_eq!(a.unwrap()[0].rows[0].get_str(0).unwrap(), Some("a"));
        assert_eq!(b.unwrap()[0].rows[0].get_str(0).unwrap(), Some("b"));
    }

    #[tokio::test]
    async fn test_reads_continue_while_a_write_is_blocked() {
        let (client, mut server) = duplex(1024);
        let options = PgConnectOptions::new();
        let (conn, _) =
            tokio::join!(PgConnection::handshake(client, &options), accept(&mut server));
        let conn = conn.unwrap();
        let mut events = bind_holder(&conn);
        let sql = format!("SELECT '{}'", "x".repeat(16 * 1024));

        // The server writes more than the pipe holds before it reads the
        // query, which itself is larger than the pipe
        let server_side = async {
            let mut burst = Vec::new();
            for i in 0..200 {
                burst.extend(notification(1, "jobs", &format!("{:03}", i)));
            }
            server.write_all(&burst).await.unwrap();
            assert_eq!(read_query(&mut server).await, sql);
            server
                .write_all(&select_response("v", &["ok"]))
                .await
                .unwrap();
        };
        let run = async {
            tokio::join!(conn.schedule(PgCommand::query(sql.clone())), server_side).0
        };
        let results = tokio::time::timeout(std::time::Duration::from_secs(10), run)
            .await
            .expect("client and server both blocked on writes")
            .unwrap();

        assert_eq!(results[0].rows[0].get_str(0).unwrap(), Some("ok"));
        for i in 0..200 {
            assert_eq!(
                events.recv().await.unwrap(),
                format!("notify jobs {:03}", i)
            );
        }
    }

    #[tokio::test]
    async fn test_server_error_fails_only_that_command() {
        let (conn, mut server) = connected().await;

        let server_side = async {
            read_query(&mut server).await;
            let mut out = error_response(&[
                (b'S', "ERROR"),
                (b'C', "42P01"),
                (b'M', "relation \"missing\" does not exist"),
            ]);
            out.extend(ready(b'I'));
            server.write_all(&out).await.unwrap();

            read_query(&mut server).await;
            server
                .write_all(&select_response("n", &["1"]))
                .await
                .unwrap();
        };

        let run = async {
            let err = conn
                .schedule(PgCommand::query("SELECT * FROM missing"))
                .await
                .unwrap_err();
            let ok = conn.schedule(PgCommand::query("SELECT 1")).await;
            (err, ok)
        };
        let ((err, ok), _) = tokio::join!(run, server_side);

        assert_eq!(err.as_server_error().unwrap().code, "42P01");
        assert!(ok.is_ok());
        assert!(conn.is_valid());
    }

    #[tokio::test]
    async fn test_transaction_status_drives_reset() {
        let (conn, mut server) = connected().await;

        let server_side = async {
            assert_eq!(read_query(&mut server).await, "BEGIN");
            let mut out = command_complete("BEGIN");
            out.extend(ready(b'T'));
            server.write_all(&out).await.unwrap();

            assert_eq!(read_query(&mut server).await, "ROLLBACK");
            let mut out = command_complete("ROLLBACK");
            out.extend(ready(b'I'));
            server.write_all(&out).await.unwrap();
        };

        let run = async {
            conn.schedule(PgCommand::Begin).await.unwrap();
            assert!(conn.needs_reset());
            assert_eq!(conn.transaction_status(), TransactionStatus::InTransaction);
            conn.reset().await.unwrap();
        };
        tokio::join!(run, server_side);

        assert!(!conn.needs_reset());
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_notification_reaches_holder() {
        let (conn, mut server) = connected().await;
        let mut events = bind_holder(&conn);

        server
            .write_all(&notification(4242, "jobs", "ready"))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), "notify jobs ready");
    }

    #[tokio::test]
    async fn test_server_hangup_fails_in_flight_commands() {
        let (conn, mut server) = connected().await;
        let mut events = bind_holder(&conn);

        let server_side = async move {
            read_query(&mut server).await;
            drop(server);
        };
        let (result, _) = tokio::join!(conn.schedule(PgCommand::query("SELECT 1")), server_side);

        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(events.recv().await.unwrap(), "closed");
        assert!(!conn.is_valid());
        assert!(matches!(
            conn.schedule(PgCommand::query("SELECT 1")).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_protocol_error_reported_then_closed() {
        let (conn, mut server) = connected().await;
        let mut events = bind_holder(&conn);

        // A DataRow nobody described
        server.write_all(&data_row(&[Some("x")])).await.unwrap();

        let first = events.recv().await.unwrap();
        assert!(first.starts_with("exception: Protocol error"), "{}", first);
        assert_eq!(events.recv().await.unwrap(), "closed");
    }

    #[tokio::test]
    async fn test_close_sends_terminate() {
        let (conn, mut server) = connected().await;
        let mut events = bind_holder(&conn);

        assert!(matches!(conn.close(HolderId(2)), Err(Error::IllegalState(_))));
        conn.close(HolderId(1)).unwrap();
        assert!(!conn.is_valid());

        let (tag, _) = read_frontend(&mut server).await;
        assert_eq!(tag, b'X');
        assert_eq!(events.recv().await.unwrap(), "closed");
        // Only once
        drop(server);
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_double_init_fails() {
        let (conn, _server) = connected().await;
        let _events = bind_holder(&conn);

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = conn
            .init(HolderId(2), Arc::new(TestHolder { events: tx }))
            .unwrap_err();
        assert!(err.is_fatal());
    }
}

// ============================================================================
// Pool over the scripted server
// ============================================================================

mod pooled {
    use super::*;
    use async_trait::async_trait;

    use crate::config::PoolOptions;
    use crate::connection::ConnectionFactory;
    use crate::pool::Pool;

    /// Serves every query; `BEGIN` opens a transaction until `COMMIT` or
    /// `ROLLBACK`, and any query containing `fail` errors.
    async fn serve(mut server: DuplexStream, log: Arc<Mutex<Vec<String>>>) {
        accept(&mut server).await;
        let mut in_transaction = false;
        loop {
            let Ok(tag) = server.read_u8().await else {
                return;
            };
            let len = server.read_i32().await.unwrap();
            let mut body = vec![0; len as usize - 4];
            server.read_exact(&mut body).await.unwrap();
            if tag == b'X' {
                return;
            }
            let sql = String::from_utf8(body[..body.len() - 1].to_vec()).unwrap();
            log.lock().push(sql.clone());

            let mut out = match sql.as_str() {
                "BEGIN" => {
                    in_transaction = true;
                    command_complete("BEGIN")
                }
                "COMMIT" | "ROLLBACK" => {
                    in_transaction = false;
                    command_complete(&sql)
                }
                s if s.contains("fail") => {
                    error_response(&[(b'S', "ERROR"), (b'C', "P0001"), (b'M', "failed")])
                }
                _ => {
                    let mut out = row_description(&["n"]);
                    out.extend(data_row(&[Some("1")]));
                    out.extend(command_complete("SELECT 1"));
                    out
                }
            };
            out.extend(ready(if in_transaction { b'T' } else { b'I' }));
            server.write_all(&out).await.unwrap();
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ConnectionFactory for ScriptedFactory {
        type Connection = PgConnection;

        async fn connect(&self) -> crate::Result<PgConnection> {
            let (client, server) = duplex(64 * 1024);
            tokio::spawn(serve(server, Arc::clone(&self.log)));
            PgConnection::handshake(client, &PgConnectOptions::new()).await
        }
    }

    fn pool_with(options: PoolOptions) -> (Pool<ScriptedFactory>, Arc<Mutex<Vec<String>>>) {
        let factory = ScriptedFactory::default();
        let log = Arc::clone(&factory.log);
        (Pool::new(factory, options).unwrap(), log)
    }

    fn pool() -> (Pool<ScriptedFactory>, Arc<Mutex<Vec<String>>>) {
        pool_with(PoolOptions::new())
    }

    #[tokio::test]
    async fn test_execute() {
        let (pool, log) = pool();

        let results = pool.execute(PgCommand::query("SELECT 1")).await.unwrap();
        assert_eq!(results[0].rows[0].get_str(0).unwrap(), Some("1"));
        assert_eq!(pool.available(), 1);
        assert_eq!(*log.lock(), vec!["SELECT 1"]);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let (pool, log) = pool();

        pool.with_transaction(|conn| {
            Box::pin(async move { conn.schedule(PgCommand::query("SELECT 1")).await })
        })
        .await
        .unwrap();

        let err = pool
            .with_transaction(|conn| {
                Box::pin(async move { conn.schedule(PgCommand::query("SELECT fail")).await })
            })
            .await
            .unwrap_err();
        assert_eq!(err.as_server_error().unwrap().code, "P0001");

        assert_eq!(
            *log.lock(),
            vec!["BEGIN", "SELECT 1", "COMMIT", "BEGIN", "SELECT fail", "ROLLBACK"]
        );
    }

    #[tokio::test]
    async fn test_abandoned_transaction_rolled_back_before_reuse() {
        let (pool, log) = pool_with(PoolOptions::new().max_size(1));

        let conn = pool.acquire().await.unwrap();
        conn.schedule(PgCommand::Begin).await.unwrap();
        drop(conn);

        let conn = pool.acquire().await.unwrap();
        conn.schedule(PgCommand::query("SELECT 1")).await.unwrap();
        assert_eq!(*log.lock(), vec!["BEGIN", "ROLLBACK", "SELECT 1"]);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_pool_close_terminates_connections() {
        let (pool, _log) = pool();
        pool.execute(PgCommand::query("SELECT 1")).await.unwrap();

        pool.close().unwrap();
        for _ in 0..100 {
            if pool.size() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.size(), 0);
    }
}

// ============================================================================
// Integration Tests (require running PostgreSQL)
// ============================================================================

#[cfg(feature = "postgres-integration-tests")]
mod integration {
    use super::*;
    use crate::config::PoolOptions;
    use crate::pg::{PgConnectionFactory, PgPool};

    fn options() -> PgConnectOptions {
        PgConnectOptions::new()
            .host("localhost")
            .user("postgres")
            .password("test")
    }

    #[tokio::test]
    async fn test_connect_and_simple_query() {
        let factory = PgConnectionFactory::new(options()).unwrap();
        let pool = PgPool::new(factory, PoolOptions::new().max_size(2)).unwrap();

        let results = pool
            .execute(PgCommand::query("SELECT 1 AS num"))
            .await
            .unwrap();
        assert_eq!(results[0].columns[0].name, "num");
        assert_eq!(results[0].rows[0].get_str(0).unwrap(), Some("1"));
    }

    #[tokio::test]
    async fn test_transaction() {
        let factory = PgConnectionFactory::new(options()).unwrap();
        let pool = PgPool::new(factory, PoolOptions::new()).unwrap();

        pool.execute(PgCommand::query(
            "DROP TABLE IF EXISTS sqlwire_tx; CREATE TABLE sqlwire_tx (id INT)",
        ))
        .await
        .unwrap();

        let err = pool
            .with_transaction(|conn| {
                Box::pin(async move {
                    conn.schedule(PgCommand::query("INSERT INTO sqlwire_tx VALUES (1)"))
                        .await?;
                    conn.schedule(PgCommand::query("SELECT * FROM no_such_table"))
                        .await
                })
            })
            .await;
        assert!(err.is_err());

        let results = pool
            .execute(PgCommand::query("SELECT count(*) FROM sqlwire_tx"))
            .await
            .unwrap();
        assert_eq!(results[0].rows[0].get_str(0).unwrap(), Some("0"));
    }
}
