//! TCP + TLS server for Gemini connections.
//!
//! Accepts connections, performs the TLS handshake, and hands each
//! connection to the [`ConnectionHandler`].

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::app::Application;
use crate::config::Config;
use crate::protocols::gemini::{ConnectionHandler, ServerInfo};
use crate::tls::{GeminiTls, TlsError};

/// Server instance
pub struct Server {
    config: Config,
    tls: GeminiTls,
    handler: ConnectionHandler,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, app: Arc<dyn Application>) -> Result<Self, TlsError> {
        let tls = GeminiTls::new(&config.tls, &config.hostname)?;
        let info = Arc::new(ServerInfo::new(config.hostname.clone(), config.port));
        let handler =
            ConnectionHandler::new(app, info).with_request_timeout(config.request_timeout);

        Ok(Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            tls,
            handler,
        })
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(address = %listener.local_addr()?, "Listening");

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let tls = self.tls.clone();
                    let handler = self.handler.clone();

                    tokio::spawn(async move {
                        handle_connection(stream, addr, tls, handler).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: GeminiTls,
    handler: ConnectionHandler,
) {
    let stream = match tls.accept(stream).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let session = tls.session(stream.get_ref().1);
    let outcome = handler.handle(stream, peer, session).await;
    debug!(peer = %peer, ?outcome, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{producer, AppError, Producer, StatusSender};
    use crate::protocols::gemini::RequestContext;
    use crate::tls::TlsSettings;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config() -> Config {
        let data = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data");
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            hostname: "localhost".to_string(),
            max_connections: 16,
            workers: None,
            blocking_threads: 4,
            request_timeout: None,
            tls: TlsSettings {
                certfile: Some(data.join("server.pem")),
                keyfile: Some(data.join("server.key")),
                ..TlsSettings::default()
            },
            root_directory: data.clone(),
            cgi_directory: "cgi-bin".to_string(),
            index_file: "index.gmi".to_string(),
            log_level: "info".to_string(),
        }
    }

    fn empty_app(_: RequestContext, _: StatusSender) -> Result<Box<dyn Producer>, AppError> {
        Ok(producer::empty())
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(config(), Arc::new(empty_app)).unwrap();
        assert_eq!(server.connection_limit.available_permits(), 16);
    }

    #[tokio::test]
    async fn test_server_rejects_missing_certificate() {
        let mut config = config();
        config.tls.certfile = Some(config.root_directory.join("absent.pem"));
        assert!(Server::new(config, Arc::new(empty_app)).is_err());
    }

    #[tokio::test]
    async fn test_plaintext_client_is_dropped() {
        let server = Arc::new(Server::new(config(), Arc::new(empty_app)).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = Arc::clone(&server);
        let task = tokio::spawn(async move { serving.serve(listener).await.is_ok() });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"gemini://localhost/\r\n").await.unwrap();

        // The handshake fails, so no Gemini response is ever written.
        let mut buf = Vec::new();
        let read =
            tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf)).await;
        assert!(!buf.starts_with(b"20"));
        assert!(read.is_ok());

        task.abort();
    }
}
