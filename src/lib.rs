//! gemini-server: a Gemini protocol server core.
//!
//! The library exposes the per-connection protocol machinery
//! ([`protocols::gemini`]), the application interface ([`app`]) and the
//! TLS and accept-loop plumbing used by the `gemini-server` binary, and the
//! static directory application it serves by default ([`static_dir`]).

pub mod app;
pub mod config;
pub mod protocols;
pub mod server;
pub mod static_dir;
pub mod status;
pub mod tls;

pub use app::{AppError, Application, Chunk, Producer, Response, StatusSender};
pub use protocols::gemini::{ConnectionHandler, ConnectionOutcome, RequestContext, ServerInfo};
pub use server::Server;
pub use static_dir::StaticDirectoryApp;
pub use status::Status;
