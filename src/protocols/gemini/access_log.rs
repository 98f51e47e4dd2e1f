//! Access log in a layout derived from the Common Log Format:
//!
//! ```text
//! <host> [<timestamp>] "<url>" <status> <meta> <bytes>
//! ```

use chrono::{DateTime, FixedOffset};
use std::net::IpAddr;
use tracing::info;

use crate::status::Status;

pub const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Everything the access log needs about one connection.
#[derive(Debug, Clone)]
pub struct AccessEntry {
    pub host: IpAddr,
    pub connected_at: DateTime<FixedOffset>,
    pub url: Option<String>,
    pub status: Option<Status>,
    pub meta: Option<String>,
    pub bytes_sent: u64,
}

impl AccessEntry {
    /// Render the log line. Returns `None` if the connection never got far
    /// enough to have a URL and a status.
    pub fn format(&self) -> Option<String> {
        let (url, status, meta) = match (&self.url, self.status, &self.meta) {
            (Some(url), Some(status), Some(meta)) => (url, status, meta),
            _ => return None,
        };

        Some(format!(
            "{} [{}] \"{}\" {} {} {}",
            self.host,
            self.connected_at.format(TIMESTAMP_FORMAT),
            url,
            status,
            meta,
            self.bytes_sent,
        ))
    }
}

/// Emit the access log line for a connection, if there is one to emit.
pub fn log_request(entry: &AccessEntry) -> Option<String> {
    let line = entry.format()?;
    info!(target: "gemini::access", "{line}");
    Some(line)
}
