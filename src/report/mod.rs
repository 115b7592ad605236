//! Encrypted bug-report ingest
//!
//! A WebSocket endpoint that receives a client-side encrypted payload,
//! wraps it in a metadata-prefixed, re-encrypted object and streams it into
//! an [`ObjectStore`](crate::store::ObjectStore). The peer address is masked
//! to a subnet before anything is recorded; no other identifying data leaves
//! the encrypted payload.

mod object;

pub use object::{
    read_report, report_object, report_object_size, ReportContents, ReportMetadata,
    ReportObjectError, DATA_HEADER, FILE_HEADER, FOOTER,
};

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::crypto::PublicKey;
use crate::store::ObjectStore;

/// Read limit for the metadata control message.
pub const MAX_MESSAGE_LENGTH: usize = 1 << 14;

/// Upper bound on a report payload. Reports can contain sizeable files
/// (broken media being debugged), so this is generous.
pub const MAX_CONTENT_LENGTH: i64 = 1 << 28;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Report endpoint errors
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("websocket handshake timed out")]
    HandshakeTimeout,
}

#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "contentLength", default)]
    content_length: i64,
}

#[derive(Debug, Serialize)]
struct ErrorMessage {
    error: String,
}

#[derive(Debug, Serialize)]
struct SuccessMessage {
    success: bool,
}

/// Report endpoint configuration.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Object store bucket reports are written to.
    pub bucket: String,
    /// Object key prefix.
    pub prefix: String,
}

/// The report ingest server.
pub struct ReportServer {
    store: Arc<dyn ObjectStore>,
    recipient: PublicKey,
    config: ReportConfig,
}

impl ReportServer {
    pub fn new(store: Arc<dyn ObjectStore>, recipient: PublicKey, config: ReportConfig) -> Self {
        Self {
            store,
            recipient,
            config,
        }
    }

    /// Accept and serve report uploads until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ReportError> {
        info!("report endpoint listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("report endpoint shutting down");
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
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer_addr).await;
                    });
                }
            }
        }
    }

    /// Serve one report upload, bounded by the connection ceiling.
    pub async fn handle_connection<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        match timeout(CONNECTION_TIMEOUT, self.serve(stream, peer_addr)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(%peer_addr, "report connection failed: {e}"),
            Err(_) => debug!(%peer_addr, "report connection exceeded the time ceiling"),
        }
    }

    async fn serve<S>(&self, stream: S, peer_addr: SocketAddr) -> Result<(), ReportError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let subnet = subnet_for(peer_addr.ip());

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_MESSAGE_LENGTH);
        ws_config.max_frame_size = Some(MAX_MESSAGE_LENGTH);
        let ws = timeout(
            HANDSHAKE_TIMEOUT,
            accept_async_with_config(stream, Some(ws_config)),
        )
        .await
        .map_err(|_| ReportError::HandshakeTimeout)??;
        let (mut sink, mut messages) = ws.split();

        let control = match timeout(METADATA_TIMEOUT, next_data_message(&mut messages)).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!(%peer_addr, "connection ended before the control message");
                send_error(&mut sink, "Invalid metadata.").await;
                return Ok(());
            }
            Err(_) => {
                send_error(&mut sink, "Timed out waiting for metadata.").await;
                return Ok(());
            }
        };
        let control: ControlMessage = match serde_json::from_slice(&control) {
            Ok(control) => control,
            Err(e) => {
                debug!(%peer_addr, "bad control message: {e}");
                send_error(&mut sink, "Invalid metadata.").await;
                return Ok(());
            }
        };

        let content_length = control.content_length;
        if content_length <= 0 {
            send_error(&mut sink, "Invalid payload size.").await;
            return Ok(());
        }
        if content_length > MAX_CONTENT_LENGTH {
            send_error(&mut sink, "Payload too large.").await;
            return Ok(());
        }

        let metadata = match serde_json::to_vec(&ReportMetadata {
            subnet,
            content_length,
        }) {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(%peer_addr, "failed to encode embedded metadata: {e}");
                send_error(&mut sink, "Internal error.").await;
                return Ok(());
            }
        };

        // The WebSocket message stream doubles as the payload byte stream;
        // frames are pulled on demand, so store backpressure propagates all
        // the way to the socket.
        let size = report_object_size(metadata.len() as u64, content_length as u64);
        let payload = message_reader(messages).take(content_length as u64);
        let object = report_object(metadata, payload, &self.recipient);

        let key = format!(
            "{}-{}-{:08x}.bin",
            self.config.prefix,
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            rand::random::<u32>(),
        );

        if let Err(e) = self
            .store
            .put(&self.config.bucket, &key, Box::new(object), size)
            .await
        {
            error!(%peer_addr, key, "failed to store report object: {e}");
            send_error(&mut sink, "Internal error.").await;
            return Ok(());
        }

        debug!(%peer_addr, key, "stored report object");
        let body = serde_json::to_string(&SuccessMessage { success: true })
            .expect("success message serializes");
        sink.send(Message::Text(body.into())).await?;
        sink.send(Message::Close(None)).await?;
        Ok(())
    }
}

/// Mask a peer address for anti-abuse bookkeeping: IPv4 keeps its /24,
/// IPv6 its /64, rendered as a textual CIDR.
fn subnet_for(ip: IpAddr) -> String {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.0/24", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let mut o = v6.octets();
            for b in &mut o[8..] {
                *b = 0;
            }
            format!("{}/64", Ipv6Addr::from(o))
        }
    }
}

/// Wait for the next text or binary message; `None` means the peer is gone.
async fn next_data_message<S>(messages: &mut SplitStream<WebSocketStream<S>>) -> Option<Bytes>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match messages.next().await? {
            Ok(Message::Binary(data)) => return Some(data),
            Ok(Message::Text(text)) => return Some(Bytes::from(text)),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Present the WebSocket message stream as a contiguous byte stream.
///
/// Whenever the current frame is drained the next one is requested with a
/// per-message deadline; a close frame maps to end-of-stream and an abrupt
/// disconnect to an error, so a truncated upload can never be mistaken for a
/// complete one.
fn message_reader<S>(messages: SplitStream<WebSocketStream<S>>) -> impl AsyncRead + Send + Unpin
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let frames = futures_util::stream::try_unfold(messages, |mut messages| async move {
        loop {
            let message = match timeout(MESSAGE_TIMEOUT, messages.next()).await {
                Err(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "timed out waiting for a payload frame",
                    ))
                }
                Ok(None) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection dropped mid-payload",
                    ))
                }
                Ok(Some(Err(e))) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                }
                Ok(Some(Ok(message))) => message,
            };
            match message {
                Message::Binary(data) => return Ok(Some((data, messages))),
                Message::Text(text) => return Ok(Some((Bytes::from(text), messages))),
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
    });
    StreamReader::new(Box::pin(frames))
}

async fn send_error<S>(sink: &mut S, message: &str)
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let body = serde_json::to_string(&ErrorMessage {
        error: message.to_string(),
    })
    .expect("error message serializes");
    if let Err(e) = sink.send(Message::Text(body.into())).await {
        debug!("sending error message failed: {e}");
        return;
    }
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "Error receiving report.".into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!("sending close frame failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_subnet_for_ipv4() {
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 77));
        assert_eq!(subnet_for(ip), "203.0.113.0/24");
    }

    #[test]
    fn test_subnet_for_loopback() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(subnet_for(ip), "127.0.0.0/24");
    }

    #[test]
    fn test_subnet_for_ipv6() {
        let ip: IpAddr = "2001:db8:1:2:3:4:5:6".parse().unwrap();
        assert_eq!(subnet_for(ip), "2001:db8:1:2::/64");
    }

    #[test]
    fn test_subnet_for_mapped_ipv4() {
        let ip: IpAddr = "::ffff:192.0.2.9".parse().unwrap();
        assert_eq!(subnet_for(ip), "192.0.2.0/24");
    }
}
