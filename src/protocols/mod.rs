//! Protocol implementations.
//!
//! - `gemini`: one TLS connection, one request line, one streamed response

pub mod gemini;
