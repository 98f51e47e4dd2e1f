//! Gemini protocol implementation.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  <absolute-URL>\r\n                (at most 1024 bytes of URL)
//! Response: <code>\t<meta>\r\n<body bytes...>  (body ends when the server closes)
//!
//! Example:
//! Request:  gemini://example.org/\r\n
//! Response: 20\ttext/gemini\r\n# Hello\n
//! ```
//!
//! Each connection carries exactly one request. There is no length framing
//! on the body, so a client cannot tell a truncated response from a
//! complete one.

pub mod access_log;
pub mod context;
pub mod handler;
pub mod parser;
pub mod response;

pub use context::{ClientIdentity, RequestContext, ServerInfo};
pub use handler::{ConnectionHandler, ConnectionOutcome};
pub use parser::ProtocolError;
pub use response::ResponseWriter;
