//! Wisp server
//!
//! Accepts WebSocket connections and demultiplexes Wisp streams onto TCP and
//! UDP peers resolved through a [`Dialer`](crate::dialer::Dialer). Each
//! connection advertises its per-stream TCP credit up front and then runs
//! the packet dispatch loop in [`connection`].

mod connection;

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dialer::Dialer;

/// Default per-stream TCP credit advertised to clients.
pub const DEFAULT_WRITE_QUEUE_LEN: u32 = 64;

/// Peer socket read buffer size.
pub const READ_BUFFER_LEN: usize = 32 * 1024;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Per-stream TCP credit advertised to clients.
    pub write_queue_len: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            write_queue_len: DEFAULT_WRITE_QUEUE_LEN,
        }
    }
}

/// The Wisp server.
pub struct WispServer {
    dialer: Arc<dyn Dialer>,
    config: ServerConfig,
}

impl WispServer {
    /// Create a server with the default configuration.
    pub fn new(dialer: impl Dialer + 'static) -> Self {
        Self::with_config(dialer, ServerConfig::default())
    }

    pub fn with_config(dialer: impl Dialer + 'static, config: ServerConfig) -> Self {
        Self {
            dialer: Arc::new(dialer),
            config,
        }
    }

    /// Accept and serve connections until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        info!("wisp server listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("wisp server shutting down");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            debug!("accept error: {e}");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    let shutdown = cancel.clone();
                    tokio::spawn(async move {
                        let ws = match accept_async(stream).await {
                            Ok(ws) => ws,
                            Err(e) => {
                                debug!(%peer_addr, "websocket upgrade failed: {e}");
                                return;
                            }
                        };
                        debug!(%peer_addr, "wisp connection established");
                        server.serve_socket(ws, shutdown).await;
                        debug!(%peer_addr, "wisp connection finished");
                    });
                }
            }
        }
    }

    /// Run the protocol loop on an already-upgraded WebSocket.
    pub async fn serve_socket<S>(&self, ws: WebSocketStream<S>, shutdown: CancellationToken)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        connection::serve(
            Arc::clone(&self.dialer),
            self.config.write_queue_len,
            ws,
            shutdown,
        )
        .await;
    }
}
