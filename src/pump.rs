//! WebSocket write pump — serializes outbound packets.
//!
//! Packets from any number of tasks funnel through one mpsc channel into a
//! single writer, which keeps WebSocket writes serialized and ordered.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::protocol::Packet;

/// Serializes and writes packets until the channel closes or `cancel` fires.
///
/// Queued packets are drained before a cancellation is honoured, so a final
/// CLOSE enqueued right before shutdown still reaches the wire.
pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut packet_rx: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
) where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            packet = packet_rx.recv() => {
                match packet {
                    Some(packet) => {
                        if let Err(e) = sink.send(Message::Binary(packet.serialize())).await {
                            tracing::debug!("websocket write failed: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}
