//! Wisp client
//!
//! Multiplexes caller dials into streams over one WebSocket. `connect` waits
//! for the server's initial credit advertisement before returning;
//! [`WispClient::dial`] then hands out [`WispStream`] handles that behave
//! like duplex byte streams with per-operation deadlines.

mod stream;

pub use stream::{StreamError, WispStream};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dialer::{split_host_port, DialError, Network};
use crate::protocol::{
    CloseReason, ClosePayload, ConnectPayload, ContinuePayload, Packet, PacketType, StreamType,
};
use crate::pump;

/// Overall bound on `connect`, including the initial CONTINUE.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound packet queue depth.
const PACKET_QUEUE_LEN: usize = 64;

/// Per-stream inbound data queue depth, in DATA packets.
const READ_QUEUE_LEN: usize = 100;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out waiting for the server's initial CONTINUE")]
    ConnectTimeout,

    #[error("connection closed before the initial CONTINUE")]
    ConnectionClosed,

    #[error("client is closed")]
    Closed,

    #[error(transparent)]
    Addr(#[from] DialError),
}

/// A connected Wisp client.
pub struct WispClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) packet_tx: mpsc::Sender<Packet>,
    pub(crate) streams: RwLock<HashMap<u32, StreamEntry>>,
    next_id: AtomicU32,
    init_credit: AtomicU32,
    pub(crate) cancel: CancellationToken,
    closed: AtomicBool,
}

pub(crate) struct StreamEntry {
    read_tx: mpsc::Sender<Bytes>,
    shared: Arc<stream::StreamShared>,
}

impl ClientInner {
    pub(crate) fn remove_stream(&self, stream_id: u32) {
        self.streams.write().unwrap().remove(&stream_id);
    }
}

impl WispClient {
    /// Open the WebSocket, start the read loop, and wait for the server's
    /// initial CONTINUE. The whole operation is bounded by 10 seconds.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;

        let (ws, _) = tokio::time::timeout_at(deadline, connect_async(url))
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;
        let (sink, messages) = ws.split();

        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_LEN);
        let cancel = CancellationToken::new();
        let inner = Arc::new(ClientInner {
            packet_tx,
            streams: RwLock::new(HashMap::new()),
            // Stream id 0 is reserved; the counter increments before use.
            next_id: AtomicU32::new(1),
            init_credit: AtomicU32::new(0),
            cancel: cancel.clone(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(pump::write_pump(sink, packet_rx, cancel));
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(read_loop(Arc::clone(&inner), messages, ready_tx));

        let client = WispClient { inner };
        match tokio::time::timeout_at(deadline, ready_rx).await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(_)) => {
                client.close();
                Err(ClientError::ConnectionClosed)
            }
            Err(_) => {
                client.close();
                Err(ClientError::ConnectTimeout)
            }
        }
    }

    /// Open a new stream to `addr` (`"host:port"`).
    ///
    /// A dial that fails at the far end is observed on the first read of the
    /// returned stream, not here.
    pub async fn dial(&self, network: Network, addr: &str) -> Result<WispStream, ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let (host, port) = split_host_port(addr)?;
        let stream_type = match network {
            Network::Tcp => StreamType::Tcp,
            Network::Udp => StreamType::Udp,
        };

        let stream_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_LEN);
        let shared = Arc::new(stream::StreamShared::new(
            stream_id,
            stream_type,
            self.inner.init_credit.load(Ordering::SeqCst),
        ));
        self.inner.streams.write().unwrap().insert(
            stream_id,
            StreamEntry {
                read_tx,
                shared: Arc::clone(&shared),
            },
        );

        let payload = ConnectPayload {
            stream_type,
            port,
            hostname: host.to_string(),
        };
        if self
            .inner
            .packet_tx
            .send(Packet::connect(stream_id, &payload))
            .await
            .is_err()
        {
            self.inner.remove_stream(stream_id);
            return Err(ClientError::Closed);
        }

        Ok(WispStream::new(Arc::clone(&self.inner), shared, read_rx))
    }

    /// Close the client and fail every open stream.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let mut streams = self.inner.streams.write().unwrap();
        for (_, entry) in streams.drain() {
            entry.shared.mark_closed();
        }
    }
}

impl Drop for WispClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dispatches inbound packets to streams until the WebSocket ends.
async fn read_loop(
    inner: Arc<ClientInner>,
    mut messages: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready = Some(ready_tx);

    loop {
        let message = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            message = messages.next() => message,
        };
        let data = match message {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("websocket read error: {e}");
                break;
            }
        };

        let Ok(packet) = Packet::parse(data) else {
            debug!("malformed packet from server");
            break;
        };

        if packet.stream_id == 0 {
            // Connection-level signalling: the credit advertisement.
            if packet.packet_type == PacketType::Continue {
                if let Ok(payload) = ContinuePayload::parse(&packet.payload) {
                    inner
                        .init_credit
                        .store(payload.buffer_remaining, Ordering::SeqCst);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                }
            }
            continue;
        }

        let entry = {
            let streams = inner.streams.read().unwrap();
            streams
                .get(&packet.stream_id)
                .map(|e| (e.read_tx.clone(), Arc::clone(&e.shared)))
        };
        let Some((read_tx, shared)) = entry else {
            // Late packet for a stream we no longer know; a CLOSE is fine to
            // ignore, anything else gets pushed back.
            if packet.packet_type != PacketType::Close {
                let _ = inner
                    .packet_tx
                    .send(Packet::close(
                        packet.stream_id,
                        CloseReason::ClientUnexpected,
                    ))
                    .await;
            }
            continue;
        };

        match packet.packet_type {
            PacketType::Data => {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    result = read_tx.send(packet.payload) => {
                        let _ = result;
                    }
                }
            }
            PacketType::Continue => {
                if let Ok(payload) = ContinuePayload::parse(&packet.payload) {
                    shared.refill_credit(payload.buffer_remaining);
                }
            }
            PacketType::Close => {
                let reason = ClosePayload::parse(&packet.payload)
                    .map(|p| p.reason)
                    .unwrap_or(CloseReason::Other(0));
                shared.remote_close(reason);
                inner.remove_stream(packet.stream_id);
            }
            PacketType::Connect => {} // servers do not originate streams
        }
    }

    // WebSocket gone: every blocked read and write fails from here on.
    inner.cancel.cancel();
}
