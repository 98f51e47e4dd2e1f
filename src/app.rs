//! Application interface.
//!
//! An application is invoked once per request with the request context and
//! a [`StatusSender`]. It returns a [`Producer`] that the connection task
//! pulls chunks from until it reports exhaustion. Both the call and every
//! pull run on the blocking thread pool, so applications are free to block.

use bytes::Bytes;
use std::sync::{Arc, Mutex};

use crate::protocols::gemini::RequestContext;
use crate::status::Status;

/// Error type returned by application code.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// A piece of response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text(String),
    Bytes(Bytes),
}

impl Chunk {
    /// Encoded bytes of this chunk.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Chunk::Text(text) => Bytes::from(text),
            Chunk::Bytes(bytes) => bytes,
        }
    }
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Chunk::Text(text)
    }
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Chunk::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(bytes))
    }
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Chunk::Bytes(bytes)
    }
}

/// A lazy, one-shot source of response chunks.
pub trait Producer: Send {
    /// Produce the next chunk, or `None` once the response is complete.
    fn next_chunk(&mut self) -> Result<Option<Chunk>, AppError>;
}

/// Application entry point, called once per request.
pub trait Application: Send + Sync + 'static {
    fn call(
        &self,
        context: RequestContext,
        status: StatusSender,
    ) -> Result<Box<dyn Producer>, AppError>;
}

impl<F> Application for F
where
    F: Fn(RequestContext, StatusSender) -> Result<Box<dyn Producer>, AppError>
        + Send
        + Sync
        + 'static,
{
    fn call(
        &self,
        context: RequestContext,
        status: StatusSender,
    ) -> Result<Box<dyn Producer>, AppError> {
        self(context, status)
    }
}

/// Handle used by applications to set the response status line.
///
/// Only the most recent status is kept. The connection task picks it up
/// after each application call returns and hands it to the response writer,
/// which decides whether it can still reach the client.
#[derive(Debug, Clone, Default)]
pub struct StatusSender {
    slot: Arc<Mutex<Option<(Status, String)>>>,
}

impl StatusSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status and meta string.
    pub fn send(&self, status: Status, meta: impl Into<String>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some((status, meta.into()));
    }

    /// Take the status recorded since the last call, if any.
    pub(crate) fn take(&self) -> Option<(Status, String)> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Producer adapters.
pub mod producer {
    use super::{AppError, Chunk, Producer};

    struct IterProducer<I>(I);

    impl<I> Producer for IterProducer<I>
    where
        I: Iterator + Send,
        I::Item: Into<Chunk>,
    {
        fn next_chunk(&mut self) -> Result<Option<Chunk>, AppError> {
            Ok(self.0.next().map(Into::into))
        }
    }

    struct TryIterProducer<I>(I);

    impl<I, T> Producer for TryIterProducer<I>
    where
        I: Iterator<Item = Result<T, AppError>> + Send,
        T: Into<Chunk>,
    {
        fn next_chunk(&mut self) -> Result<Option<Chunk>, AppError> {
            self.0.next().transpose().map(|chunk| chunk.map(Into::into))
        }
    }

    /// Wrap an infallible iterator.
    pub fn from_iter<I>(iter: I) -> Box<dyn Producer>
    where
        I: IntoIterator,
        I::IntoIter: Send + 'static,
        I::Item: Into<Chunk>,
    {
        Box::new(IterProducer(iter.into_iter()))
    }

    /// Wrap an iterator whose items may fail.
    pub fn from_try_iter<I, T>(iter: I) -> Box<dyn Producer>
    where
        I: IntoIterator<Item = Result<T, AppError>>,
        I::IntoIter: Send + 'static,
        T: Into<Chunk>,
    {
        Box::new(TryIterProducer(iter.into_iter()))
    }

    /// A producer with no body.
    pub fn empty() -> Box<dyn Producer> {
        from_iter(std::iter::empty::<Chunk>())
    }
}

/// A complete response: status, meta, and an optional body.
///
/// Converting it into a producer defers the status until the first pull,
/// so the status line is sent by the same offloaded call that yields the
/// first chunk.
pub struct Response {
    status: Status,
    meta: String,
    body: Option<Box<dyn Producer>>,
}

impl Response {
    pub fn new(status: Status, meta: impl Into<String>) -> Self {
        Self {
            status,
            meta: meta.into(),
            body: None,
        }
    }

    /// Attach a single-chunk body.
    pub fn with_body(self, body: impl Into<Chunk>) -> Self {
        let chunk: Chunk = body.into();
        self.with_producer(producer::from_iter(std::iter::once(chunk)))
    }

    /// Attach a streamed body.
    pub fn with_producer(mut self, body: Box<dyn Producer>) -> Self {
        self.body = Some(body);
        self
    }

    /// Turn this response into the producer returned to the server.
    pub fn into_producer(self, sender: StatusSender) -> Box<dyn Producer> {
        Box::new(ResponseProducer {
            pending: Some((self.status, self.meta)),
            sender,
            body: self.body,
        })
    }
}

struct ResponseProducer {
    pending: Option<(Status, String)>,
    sender: StatusSender,
    body: Option<Box<dyn Producer>>,
}

impl Producer for ResponseProducer {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, AppError> {
        if let Some((status, meta)) = self.pending.take() {
            self.sender.send(status, meta);
        }
        match self.body.as_mut() {
            Some(body) => body.next_chunk(),
            None => Ok(None),
        }
    }
}
