//! gemini-server: a Gemini protocol server
//!
//! Serves files from a root directory, with directory listings and CGI
//! scripts under the CGI directory.
//!
//! Features:
//! - TLS with optional client certificates
//! - Ad-hoc self-signed certificate when none is configured
//! - Streaming responses from blocking application code
//! - Access log in a Common Log Format layout
//! - Configuration via CLI arguments or TOML file

use std::sync::Arc;

use gemini_server::config::Config;
use gemini_server::{Server, StaticDirectoryApp};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        hostname = %config.hostname,
        address = %config.listen_addr(),
        root = %config.root_directory.display(),
        certfile = ?config.tls.certfile,
        client_ca = config.tls.cafile.is_some() || config.tls.capath.is_some(),
        max_connections = config.max_connections,
        "Starting gemini-server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder
        .max_blocking_threads(config.blocking_threads)
        .enable_all()
        .build()?;

    let app = StaticDirectoryApp::new(
        &config.root_directory,
        config.index_file.clone(),
        &config.cgi_directory,
    )
    .map_err(|e| format!("invalid root directory '{}': {e}", config.root_directory.display()))?;

    let server = Server::new(config, Arc::new(app))?;
    runtime.block_on(server.run())
}

