//! Per-connection protocol loop
//!
//! One task owns the WebSocket read side and the stream table; outbound
//! packets from every task funnel through the write pump. Each accepted
//! CONNECT spawns three cooperating tasks:
//!
//! - peer-read: peer socket -> read queue
//! - client-read: read queue -> DATA packets
//! - peer-write: write queue -> peer socket, emitting credit refills
//!
//! Workers never touch the stream table. A stream that wants to die flips
//! its set-once `closed` flag and pushes its id onto the pending-close
//! channel; the dispatch loop drains that channel between packets and drops
//! the table entry, which closes the write queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::READ_BUFFER_LEN;
use crate::dialer::{DialError, Dialer, Network, PeerReader, PeerWriter};
use crate::protocol::{CloseReason, ConnectPayload, Packet, PacketType, StreamType};
use crate::pump;

/// Outbound packet queue depth per connection.
const PACKET_QUEUE_LEN: usize = 64;

/// Serve one upgraded WebSocket until it closes or a protocol violation.
pub(crate) async fn serve<S>(
    dialer: Arc<dyn Dialer>,
    write_queue_len: u32,
    ws: WebSocketStream<S>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, messages) = ws.split();
    let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_LEN);
    let (close_tx, close_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    tokio::spawn(pump::write_pump(sink, packet_rx, cancel.clone()));

    let mut conn = Connection {
        dialer,
        write_queue_len,
        packet_tx,
        close_tx,
        cancel,
        streams: HashMap::new(),
    };
    conn.run(messages, close_rx, shutdown).await;
}

struct Connection {
    dialer: Arc<dyn Dialer>,
    write_queue_len: u32,

    /// Outbound packets, consumed by the write pump.
    packet_tx: mpsc::Sender<Packet>,

    /// Pending-close channel: workers push ids, the dispatch loop drains.
    close_tx: mpsc::UnboundedSender<u32>,

    /// Connection-level cancellation; stream tokens are children of it.
    cancel: CancellationToken,

    /// Stream table, touched only by the dispatch loop.
    streams: HashMap<u32, StreamEntry>,
}

struct StreamEntry {
    write_tx: mpsc::Sender<Bytes>,
    shared: Arc<ServerStream>,
}

impl Connection {
    async fn run<S>(
        &mut self,
        mut messages: SplitStream<WebSocketStream<S>>,
        mut close_rx: mpsc::UnboundedReceiver<u32>,
        shutdown: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Advertise the per-stream TCP credit before anything else.
        if self
            .packet_tx
            .send(Packet::continue_packet(0, self.write_queue_len))
            .await
            .is_err()
        {
            self.teardown();
            return;
        }

        loop {
            // Drop table entries for streams that finished since the last
            // packet; dropping the entry closes the stream's write queue.
            while let Ok(stream_id) = close_rx.try_recv() {
                self.streams.remove(&stream_id);
            }

            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
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

            let packet = match Packet::parse(data) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("dropping connection, malformed packet: {e}");
                    let _ = self
                        .packet_tx
                        .send(Packet::close(0, CloseReason::InvalidInfo))
                        .await;
                    break;
                }
            };

            match packet.packet_type {
                PacketType::Connect => self.handle_connect(packet).await,
                PacketType::Data => self.handle_data(packet).await,
                PacketType::Close => self.handle_close(packet),
                PacketType::Continue => {
                    // Only the server advertises credit.
                    debug!("dropping connection, unexpected CONTINUE from client");
                    let _ = self
                        .packet_tx
                        .send(Packet::close(0, CloseReason::InvalidInfo))
                        .await;
                    break;
                }
            }
        }

        while let Ok(stream_id) = close_rx.try_recv() {
            self.streams.remove(&stream_id);
        }
        self.teardown();
    }

    /// Mark every remaining stream closed without emitting CLOSE packets
    /// (the socket is already gone) and cancel all workers.
    fn teardown(&mut self) {
        for (_, entry) in self.streams.drain() {
            entry.shared.closed.store(true, Ordering::SeqCst);
            entry.shared.cancel.cancel();
        }
        self.cancel.cancel();
    }

    async fn handle_connect(&mut self, packet: Packet) {
        let stream_id = packet.stream_id;

        let payload = match ConnectPayload::parse(&packet.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(stream_id, "bad CONNECT payload: {e}");
                self.reply_close(stream_id, CloseReason::InvalidInfo).await;
                return;
            }
        };

        if self.streams.contains_key(&stream_id) {
            debug!(stream_id, "CONNECT for an id already in use");
            self.reply_close(stream_id, CloseReason::InvalidInfo).await;
            return;
        }

        let network = match payload.stream_type {
            StreamType::Tcp => Network::Tcp,
            StreamType::Udp => Network::Udp,
        };
        let addr = format!("{}:{}", payload.hostname, payload.port);

        let peer = match self.dialer.dial(network, &addr).await {
            Ok(peer) => peer,
            Err(e) => {
                let reason = match e {
                    DialError::HostNotAllowed(_) => CloseReason::Blocked,
                    _ => CloseReason::Unreachable,
                };
                debug!(stream_id, remote = %addr, "dial failed: {e}");
                self.reply_close(stream_id, reason).await;
                return;
            }
        };

        debug!(stream_id, remote = %addr, "stream opened");

        let shared = Arc::new(ServerStream {
            stream_id,
            stream_type: payload.stream_type,
            write_queue_len: self.write_queue_len,
            closed: AtomicBool::new(false),
            cancel: self.cancel.child_token(),
            packet_tx: self.packet_tx.clone(),
            close_tx: self.close_tx.clone(),
        });

        let (read_tx, read_rx) = mpsc::channel(1);
        let (write_tx, write_rx) = mpsc::channel(1);
        let (peer_rd, peer_wr) = peer.split();

        tokio::spawn(peer_read_loop(shared.clone(), peer_rd, read_tx));
        tokio::spawn(client_read_loop(shared.clone(), read_rx));
        tokio::spawn(peer_write_loop(shared.clone(), peer_wr, write_rx));

        self.streams.insert(stream_id, StreamEntry { write_tx, shared });
    }

    async fn handle_data(&mut self, packet: Packet) {
        if let Some(entry) = self.streams.get(&packet.stream_id) {
            // An error only means the stream's writer already exited; the
            // entry is reaped on the next pass over the close channel.
            let _ = entry.write_tx.send(packet.payload).await;
        }
    }

    fn handle_close(&mut self, packet: Packet) {
        // Tear down locally without replying.
        if let Some(entry) = self.streams.remove(&packet.stream_id) {
            debug!(stream_id = packet.stream_id, "stream closed by client");
            entry.shared.closed.store(true, Ordering::SeqCst);
            entry.shared.cancel.cancel();
        }
    }

    async fn reply_close(&self, stream_id: u32, reason: CloseReason) {
        let _ = self.packet_tx.send(Packet::close(stream_id, reason)).await;
    }
}

/// Shared per-stream state, owned jointly by the three worker tasks.
struct ServerStream {
    stream_id: u32,
    stream_type: StreamType,
    write_queue_len: u32,

    /// Set-once close flag; the first setter runs the close protocol.
    closed: AtomicBool,
    cancel: CancellationToken,

    packet_tx: mpsc::Sender<Packet>,
    close_tx: mpsc::UnboundedSender<u32>,
}

impl ServerStream {
    /// Run the close protocol exactly once: emit CLOSE when a reason is
    /// given, stop the workers, and queue the id for table removal.
    async fn begin_close(&self, reason: Option<CloseReason>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reason) = reason {
            let _ = self
                .packet_tx
                .send(Packet::close(self.stream_id, reason))
                .await;
        }
        self.cancel.cancel();
        let _ = self.close_tx.send(self.stream_id);
    }
}

/// Reads from the peer socket into the read queue.
async fn peer_read_loop(
    stream: Arc<ServerStream>,
    mut peer: PeerReader,
    read_tx: mpsc::Sender<Bytes>,
) {
    let mut buf = vec![0u8; READ_BUFFER_LEN];
    loop {
        let n = tokio::select! {
            _ = stream.cancel.cancelled() => break,
            result = peer.read(&mut buf) => match result {
                Ok(n) => n,
                Err(_) => break,
            },
        };
        if n == 0 {
            if stream.stream_type == StreamType::Tcp {
                break; // peer EOF
            }
            continue; // empty datagram
        }
        if read_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            break;
        }
    }
    // Close the queue before initiating teardown so the drain below can end.
    drop(read_tx);
    stream.begin_close(Some(CloseReason::Voluntary)).await;
}

/// Drains the read queue into DATA packets for the client.
async fn client_read_loop(stream: Arc<ServerStream>, mut read_rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = read_rx.recv().await {
        if stream
            .packet_tx
            .send(Packet::data(stream.stream_id, data))
            .await
            .is_err()
        {
            stream.begin_close(Some(CloseReason::NetworkError)).await;
            // Keep draining so the peer-read task is never left blocked on
            // a full queue.
        }
    }
}

/// Writes queued client payloads to the peer, refilling credit as it goes.
async fn peer_write_loop(
    stream: Arc<ServerStream>,
    mut peer: PeerWriter,
    mut write_rx: mpsc::Receiver<Bytes>,
) {
    let mut counter: u32 = 0;
    loop {
        let data = tokio::select! {
            _ = stream.cancel.cancelled() => return,
            data = write_rx.recv() => match data {
                Some(data) => data,
                None => return,
            },
        };
        if peer.write(&data).await.is_err() {
            stream.begin_close(Some(CloseReason::NetworkError)).await;
            return;
        }
        if stream.stream_type == StreamType::Tcp {
            counter += 1;
            if counter > stream.write_queue_len / 2 {
                let _ = stream
                    .packet_tx
                    .send(Packet::continue_packet(
                        stream.stream_id,
                        stream.write_queue_len,
                    ))
                    .await;
                counter = 0;
            }
        }
    }
}
