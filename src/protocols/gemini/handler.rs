//! Gemini connection handler.
//!
//! One connection carries one request:
//!
//! ```text
//! AwaitingRequest -> Parsing -> Dispatching -> Streaming -> Closed
//! ```
//!
//! A malformed request line is answered with `59 Malformed request` and the
//! connection is dropped without an access log entry. Any failure after
//! that point (context, application call, chunk production, socket write)
//! is caught once here, turned into a `42` status if nothing has been sent
//! yet, and followed by the normal flush / log / close sequence.

use bytes::{Bytes, BytesMut};
use chrono::Local;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace, warn};

use super::access_log::{log_request, AccessEntry};
use super::context::{RequestContext, ServerInfo};
use super::parser::{self, FrameResult, ProtocolError};
use super::response::ResponseWriter;
use crate::app::{AppError, Application, StatusSender};
use crate::status::Status;
use crate::tls::TlsSession;

pub const MALFORMED_REQUEST: &str = "Malformed request";
pub const UNEXPECTED_ERROR: &str = "An unexpected error occurred";

/// Read buffer size
const BUFFER_SIZE: usize = 2 * 1024;

/// How a connection ended.
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// The peer closed (or timed out) before sending a full request line.
    Closed,
    /// The request line was rejected.
    Malformed(ProtocolError),
    /// The response was streamed to completion.
    Completed { access: Option<String> },
    /// The application or transport failed after the request was parsed.
    Failed {
        access: Option<String>,
        error: String,
    },
}

/// Drives a single connection from request line to close.
#[derive(Clone)]
pub struct ConnectionHandler {
    app: Arc<dyn Application>,
    server: Arc<ServerInfo>,
    request_timeout: Option<Duration>,
}

impl ConnectionHandler {
    pub fn new(app: Arc<dyn Application>, server: Arc<ServerInfo>) -> Self {
        Self {
            app,
            server,
            request_timeout: None,
        }
    }

    /// Bound the wait for the request line.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn handle<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
        tls: TlsSession,
    ) -> ConnectionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connected_at = Local::now().fixed_offset();

        let line = match self.await_request(&mut stream).await {
            Some(line) => line,
            None => {
                let _ = stream.shutdown().await;
                return ConnectionOutcome::Closed;
            }
        };

        let mut writer = ResponseWriter::new(stream);

        let url = match parser::parse(&line) {
            Ok(url) => url,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Malformed request");
                writer.write_status(Status::BAD_REQUEST, MALFORMED_REQUEST);
                if let Err(e) = writer.flush().await {
                    debug!(peer = %peer, error = %e, "Failed to send status");
                }
                let _ = writer.close().await;
                return ConnectionOutcome::Malformed(e);
            }
        };
        trace!(peer = %peer, url = %url, "Request received");

        let failure = match self.dispatch(&url, peer, &tls, &mut writer).await {
            Ok(()) => None,
            Err(e) => {
                error!(peer = %peer, url = %url, error = ?e, "Application error");
                writer.write_status(Status::CGI_ERROR, UNEXPECTED_ERROR);
                Some(e.to_string())
            }
        };

        if let Err(e) = writer.flush().await {
            debug!(peer = %peer, error = %e, "Failed to send status");
        }

        let access = log_request(&AccessEntry {
            host: peer.ip(),
            connected_at,
            url: Some(url),
            status: writer.status(),
            meta: writer.meta().map(str::to_owned),
            bytes_sent: writer.bytes_sent(),
        });

        if let Err(e) = writer.close().await {
            debug!(peer = %peer, error = %e, "Failed to close connection");
        }

        match failure {
            None => ConnectionOutcome::Completed { access },
            Some(error) => ConnectionOutcome::Failed { access, error },
        }
    }

    async fn await_request<S>(&self, stream: &mut S) -> Option<Bytes>
    where
        S: AsyncRead + Unpin,
    {
        let result = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, read_request_line(stream)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(timeout = ?limit, "Timed out waiting for request");
                    return None;
                }
            },
            None => read_request_line(stream).await,
        };

        result.unwrap_or_else(|e| {
            debug!(error = %e, "Connection error before request");
            None
        })
    }

    /// Build the context, call the application and stream its chunks.
    async fn dispatch<W>(
        &self,
        url: &str,
        peer: SocketAddr,
        tls: &TlsSession,
        writer: &mut ResponseWriter<W>,
    ) -> Result<(), AppError>
    where
        W: AsyncWrite + Unpin,
    {
        let context = RequestContext::build(url, peer, Arc::clone(&self.server), tls)?;

        let sender = StatusSender::new();
        let app = Arc::clone(&self.app);
        let app_sender = sender.clone();
        let mut producer = offload(move || app.call(context, app_sender)).await?;
        apply_status(&sender, writer);

        loop {
            let (returned, next) = offload(move || {
                let next = producer.next_chunk();
                Ok((producer, next))
            })
            .await?;
            producer = returned;
            apply_status(&sender, writer);

            match next? {
                Some(chunk) => writer.write_body(chunk.into_bytes()).await?,
                None => break,
            }
        }

        Ok(())
    }
}

/// Run application code on the blocking pool. A panic surfaces as an error.
async fn offload<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn apply_status<W: AsyncWrite + Unpin>(sender: &StatusSender, writer: &mut ResponseWriter<W>) {
    if let Some((status, meta)) = sender.take() {
        writer.write_status(status, meta);
    }
}

/// Read until the first CRLF. Returns the line without its delimiter, or
/// `None` if the peer closed first or sent an unterminated line that
/// outgrew the buffer.
async fn read_request_line<S>(stream: &mut S) -> std::io::Result<Option<Bytes>>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        match parser::frame(&buffer) {
            FrameResult::Complete { line_len } => {
                return Ok(Some(buffer.split_to(line_len).freeze()));
            }
            FrameResult::Overflow => {
                debug!(len = buffer.len(), "Request line exceeds buffer limit");
                return Ok(None);
            }
            FrameResult::Incomplete => {}
        }

        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{producer, Chunk, Producer, Response};
    use std::sync::mpsc;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "198.51.100.4:40000".parse().unwrap()
    }

    fn handler<A: Application>(app: A) -> ConnectionHandler {
        ConnectionHandler::new(Arc::new(app), Arc::new(ServerInfo::new("example.org", 1965)))
    }

    fn hello(_: RequestContext, status: StatusSender) -> Result<Box<dyn Producer>, AppError> {
        Ok(Response::new(Status::SUCCESS, "text/gemini")
            .with_body("# Hello\n")
            .into_producer(status))
    }

    /// Send `request`, close the client's write side if `eof`, and collect
    /// everything the server wrote.
    async fn exchange(
        handler: &ConnectionHandler,
        request: &[u8],
        eof: bool,
    ) -> (Vec<u8>, ConnectionOutcome) {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(request).await.unwrap();
        if eof {
            client.shutdown().await.unwrap();
        }

        let outcome = handler.handle(server, peer(), TlsSession::default()).await;

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        (response, outcome)
    }

    #[tokio::test]
    async fn test_hello_world() {
        let (response, outcome) =
            exchange(&handler(hello), b"gemini://example.org/\r\n", false).await;

        assert_eq!(response, b"20\ttext/gemini\r\n# Hello\n");
        match outcome {
            ConnectionOutcome::Completed { access: Some(line) } => {
                assert!(line.starts_with("198.51.100.4 ["));
                assert!(line.ends_with("] \"gemini://example.org/\" 20 text/gemini 8"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hello_world_scripted_io() {
        let mock = tokio_test::io::Builder::new()
            .read(b"gemini://example.org/\r\n")
            .write(b"20\ttext/gemini\r\n")
            .write(b"# Hello\n")
            .build();

        let outcome = handler(hello)
            .handle(mock, peer(), TlsSession::default())
            .await;
        assert!(matches!(outcome, ConnectionOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_context_reaches_application() {
        let app = |ctx: RequestContext, status: StatusSender| -> Result<Box<dyn Producer>, AppError> {
            let body = format!("{}|{}", ctx.path(), ctx.query());
            Ok(Response::new(Status::SUCCESS, "text/plain")
                .with_body(body)
                .into_producer(status))
        };

        let (response, _) =
            exchange(&handler(app), b"gemini://example.org/\r\n", false).await;
        assert_eq!(response, b"20\ttext/plain\r\n/|");

        let (response, _) =
            exchange(&handler(app), b"gemini://example.org/find?rust\r\n", false).await;
        assert_eq!(response, b"20\ttext/plain\r\n/find|rust");
    }

    #[tokio::test]
    async fn test_request_line_too_long() {
        let mut request = vec![b'a'; 1025];
        request.extend_from_slice(b"\r\n");

        let (response, outcome) = exchange(&handler(hello), &request, false).await;

        assert_eq!(response, b"59\tMalformed request\r\n");
        assert!(matches!(
            outcome,
            ConnectionOutcome::Malformed(ProtocolError::TooLong(1025))
        ));
    }

    #[tokio::test]
    async fn test_request_line_at_limit() {
        let mut request = b"gemini://example.org/".to_vec();
        request.resize(1024, b'a');
        request.extend_from_slice(b"\r\n");

        let (response, outcome) = exchange(&handler(hello), &request, false).await;
        assert!(response.starts_with(b"20\t"));
        assert!(matches!(outcome, ConnectionOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let (response, outcome) =
            exchange(&handler(hello), b"gemini://example.org/\xc3\x28\r\n", false).await;

        assert_eq!(response, b"59\tMalformed request\r\n");
        assert!(matches!(
            outcome,
            ConnectionOutcome::Malformed(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[tokio::test]
    async fn test_error_after_first_chunk() {
        let app = |_: RequestContext, status: StatusSender| -> Result<Box<dyn Producer>, AppError> {
            status.send(Status::SUCCESS, "text/plain");
            let chunks: Vec<Result<Chunk, AppError>> =
                vec![Ok(Chunk::from("first")), Err("database went away".into())];
            Ok(producer::from_try_iter(chunks))
        };

        let (response, outcome) =
            exchange(&handler(app), b"gemini://example.org/\r\n", false).await;

        assert_eq!(response, b"20\ttext/plain\r\nfirst");
        match outcome {
            ConnectionOutcome::Failed { access, error } => {
                assert_eq!(error, "database went away");
                let line = access.unwrap();
                assert!(line.ends_with("42 An unexpected error occurred 5"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_before_first_chunk() {
        let app = |_: RequestContext, _: StatusSender| -> Result<Box<dyn Producer>, AppError> {
            Err("no route".into())
        };

        let (response, outcome) =
            exchange(&handler(app), b"gemini://example.org/\r\n", false).await;

        assert_eq!(response, b"42\tAn unexpected error occurred\r\n");
        assert!(matches!(outcome, ConnectionOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_application_panic() {
        let app = |_: RequestContext, _: StatusSender| -> Result<Box<dyn Producer>, AppError> {
            panic!("handler bug");
        };

        let (response, outcome) =
            exchange(&handler(app), b"gemini://example.org/\r\n", false).await;

        assert_eq!(response, b"42\tAn unexpected error occurred\r\n");
        assert!(matches!(outcome, ConnectionOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_status_changed_inside_producer() {
        let app = |_: RequestContext, status: StatusSender| -> Result<Box<dyn Producer>, AppError> {
            status.send(Status::SUCCESS, "text/gemini");
            let mut first = true;
            let chunks = std::iter::from_fn(move || {
                if first {
                    first = false;
                    status.send(Status::NOT_FOUND, "Not found");
                    Some(Chunk::from(""))
                } else {
                    status.send(Status::SUCCESS, "text/gemini");
                    None
                }
            });
            Ok(producer::from_iter(chunks))
        };

        let (response, outcome) =
            exchange(&handler(app), b"gemini://example.org/\r\n", false).await;

        assert_eq!(response, b"51\tNot found\r\n");
        assert!(matches!(outcome, ConnectionOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_no_status_no_body() {
        let app = |_: RequestContext, _: StatusSender| -> Result<Box<dyn Producer>, AppError> {
            Ok(producer::empty())
        };

        let (response, outcome) =
            exchange(&handler(app), b"gemini://example.org/\r\n", false).await;

        assert!(response.is_empty());
        assert!(matches!(
            outcome,
            ConnectionOutcome::Completed { access: None }
        ));
    }

    #[tokio::test]
    async fn test_closed_before_request() {
        let (response, outcome) = exchange(&handler(hello), b"gemini://exa", true).await;

        assert!(response.is_empty());
        assert!(matches!(outcome, ConnectionOutcome::Closed));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let handler = handler(hello).with_request_timeout(Some(Duration::from_millis(20)));
        let (mut client, server) = duplex(1024);
        client.write_all(b"gemini://").await.unwrap();

        let outcome = handler.handle(server, peer(), TlsSession::default()).await;
        assert!(matches!(outcome, ConnectionOutcome::Closed));
    }

    #[tokio::test]
    async fn test_only_first_line_is_used() {
        let (response, _) = exchange(
            &handler(hello),
            b"gemini://example.org/\r\ngemini://example.org/other\r\n",
            false,
        )
        .await;
        assert_eq!(response, b"20\ttext/gemini\r\n# Hello\n");
    }

    #[tokio::test]
    async fn test_blocking_application_does_not_stall_other_connections() {
        let (tx, rx) = mpsc::channel::<()>();
        let rx = Arc::new(std::sync::Mutex::new(rx));

        let waiting = {
            let rx = Arc::clone(&rx);
            move |_: RequestContext, status: StatusSender| -> Result<Box<dyn Producer>, AppError> {
                rx.lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5))
                    .map_err(|e| -> AppError { e.to_string().into() })?;
                Ok(Response::new(Status::SUCCESS, "text/plain")
                    .with_body("released")
                    .into_producer(status))
            }
        };
        let releasing = move |_: RequestContext, status: StatusSender| -> Result<Box<dyn Producer>, AppError> {
            tx.send(()).map_err(|e| -> AppError { e.to_string().into() })?;
            Ok(Response::new(Status::SUCCESS, "text/plain")
                .with_body("sent")
                .into_producer(status))
        };

        let first = handler(waiting);
        let second = handler(releasing);
        let ((a, _), (b, _)) = tokio::join!(
            exchange(&first, b"gemini://example.org/a\r\n", false),
            exchange(&second, b"gemini://example.org/b\r\n", false),
        );

        assert_eq!(a, b"20\ttext/plain\r\nreleased");
        assert_eq!(b, b"20\ttext/plain\r\nsent");
    }
}
