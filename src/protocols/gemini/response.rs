//! Response writer.
//!
//! The status line is buffered until the first body write (or an explicit
//! flush) so that the application can change its mind about the status up
//! to that point. Once anything has gone out, the status is frozen on the
//! wire: later status writes are still recorded for the access log but never
//! reach the client.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::status::Status;

/// Format a status line: `<code>\t<meta>\r\n`.
pub fn status_line(status: Status, meta: &str) -> String {
    format!("{status}\t{meta}\r\n")
}

/// Writes the status line and body of a single response.
#[derive(Debug)]
pub struct ResponseWriter<W> {
    stream: W,
    status: Option<Status>,
    meta: Option<String>,
    pending: Option<String>,
    status_sent: bool,
    bytes_sent: u64,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream,
            status: None,
            meta: None,
            pending: None,
            status_sent: false,
            bytes_sent: 0,
        }
    }

    /// Record the status and buffer its status line. Does not touch the
    /// socket.
    pub fn write_status(&mut self, status: Status, meta: impl Into<String>) {
        let meta = meta.into();
        self.pending = Some(status_line(status, &meta));
        self.status = Some(status);
        self.meta = Some(meta);
    }

    /// Write body bytes, sending the buffered status line first if nothing
    /// has been sent yet.
    pub async fn write_body(&mut self, data: impl Into<Bytes>) -> std::io::Result<()> {
        let data = data.into();
        self.flush().await?;

        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        self.bytes_sent += data.len() as u64;
        trace!(len = data.len(), total = self.bytes_sent, "Wrote body chunk");
        Ok(())
    }

    /// Send the buffered status line, but only if nothing has been sent on
    /// this connection yet. The buffer is cleared either way.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        let Some(line) = self.pending.take() else {
            return Ok(());
        };

        if self.bytes_sent == 0 && !self.status_sent {
            self.status_sent = true;
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }

    /// Shut down the write side of the transport.
    pub async fn close(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }

    /// Last status recorded, whether or not it reached the client.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn meta(&self) -> Option<&str> {
        self.meta.as_deref()
    }

    /// Body bytes written so far, excluding the status line.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn into_inner(self) -> W {
        self.stream
    }
}
