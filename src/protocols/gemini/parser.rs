//! Gemini request parser.
//!
//! A request is a single line: `<absolute-URL>\r\n`. Framing (finding the
//! CRLF) and decoding are separate steps: the transport hands exactly one
//! delimiter-free line to [`parse`].

use thiserror::Error;

/// Maximum length of the request line, excluding the CRLF delimiter.
pub const MAX_REQUEST_LENGTH: usize = 1024;

/// Upper bound on bytes buffered while waiting for the first CRLF.
pub const MAX_LINE_BUFFER: usize = 16 * 1024;

/// Malformed request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("URL exceeds max length of 1024 bytes (got {0})")]
    TooLong(usize),
    #[error("request line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Result of scanning the receive buffer for the request line.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameResult {
    /// A full line is available. `line_len` excludes the CRLF.
    Complete { line_len: usize },
    /// No delimiter yet.
    Incomplete,
    /// The buffer exceeded [`MAX_LINE_BUFFER`] without a delimiter.
    Overflow,
}

/// Locate the request line in `input`.
pub fn frame(input: &[u8]) -> FrameResult {
    match find_crlf(input) {
        Some(pos) => FrameResult::Complete { line_len: pos },
        None if input.len() > MAX_LINE_BUFFER => FrameResult::Overflow,
        None => FrameResult::Incomplete,
    }
}

/// Decode the raw request line into the request URL.
///
/// No structural validation of the URL happens here.
pub fn parse(line: &[u8]) -> Result<String, ProtocolError> {
    if line.len() > MAX_REQUEST_LENGTH {
        return Err(ProtocolError::TooLong(line.len()));
    }

    let url = std::str::from_utf8(line)?;
    Ok(url.to_owned())
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
