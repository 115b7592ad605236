//! Client stream handle
//!
//! A [`WispStream`] mimics a duplex byte stream. Reads drain DATA packets
//! delivered by the client read loop; TCP writes gate on the credit counter
//! and block until a CONTINUE refill arrives. Read and write deadlines are
//! independent and elapsing one does not destroy the stream.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::ClientInner;
use crate::protocol::{CloseReason, Packet, StreamType};

/// Stream errors
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream or its client has been closed locally.
    #[error("stream is closed")]
    Closed,

    /// A read or write deadline elapsed; the stream remains usable.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The remote side closed the stream for a non-voluntary reason.
    #[error("remote closed the stream: {0}")]
    RemoteClosed(CloseReason),
}

/// State shared between a stream handle and the client read loop.
pub(crate) struct StreamShared {
    pub(crate) stream_id: u32,
    pub(crate) stream_type: StreamType,

    /// TCP flow-control credit; CONTINUE stores an absolute value.
    credit: AtomicI32,
    credit_notify: Notify,

    /// Local close flag (set once, also set when the client closes).
    closed: AtomicBool,
    /// Remote close reason, set at most once.
    close_reason: OnceLock<CloseReason>,

    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
}

impl StreamShared {
    pub(crate) fn new(stream_id: u32, stream_type: StreamType, initial_credit: u32) -> Self {
        Self {
            stream_id,
            stream_type,
            credit: AtomicI32::new(initial_credit as i32),
            credit_notify: Notify::new(),
            closed: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
        }
    }

    /// Store a credit refill and wake blocked writers.
    pub(crate) fn refill_credit(&self, credit: u32) {
        self.credit.store(credit as i32, Ordering::SeqCst);
        self.credit_notify.notify_waiters();
    }

    /// Record a remote close and wake blocked writers.
    pub(crate) fn remote_close(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.credit_notify.notify_waiters();
    }

    /// Mark locally closed and wake blocked writers.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.credit_notify.notify_waiters();
    }
}

/// A dialed stream.
pub struct WispStream {
    client: Arc<ClientInner>,
    shared: Arc<StreamShared>,
    read_rx: mpsc::Receiver<Bytes>,
    read_buf: Bytes,
}

impl WispStream {
    pub(crate) fn new(
        client: Arc<ClientInner>,
        shared: Arc<StreamShared>,
        read_rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            client,
            shared,
            read_rx,
            read_buf: Bytes::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.stream_id
    }

    pub fn stream_type(&self) -> StreamType {
        self.shared.stream_type
    }

    /// Set or clear the read deadline. Takes effect on the next read.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.shared.read_deadline.lock().unwrap() = deadline;
    }

    /// Set or clear the write deadline. Takes effect on the next write.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.shared.write_deadline.lock().unwrap() = deadline;
    }

    /// Read bytes sent by the peer.
    ///
    /// Blocks until data arrives, the remote closes (`Ok(0)` on a voluntary
    /// close, [`StreamError::RemoteClosed`] otherwise), the read deadline
    /// elapses, or the client shuts down.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.read_buf.has_remaining() {
            return Ok(self.fill_from_buffer(buf));
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }

        let deadline = *self.shared.read_deadline.lock().unwrap();
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Err(StreamError::DeadlineExceeded);
            }
        }

        tokio::select! {
            data = self.read_rx.recv() => match data {
                Some(data) => {
                    self.read_buf = data;
                    Ok(self.fill_from_buffer(buf))
                }
                None => match self.shared.close_reason.get() {
                    Some(reason) if !reason.is_voluntary() => {
                        Err(StreamError::RemoteClosed(*reason))
                    }
                    _ => Ok(0), // EOF
                },
            },
            _ = self.client.cancel.cancelled() => Err(StreamError::Closed),
            _ = wait_deadline(deadline) => Err(StreamError::DeadlineExceeded),
        }
    }

    /// Write `buf` as a single DATA packet.
    ///
    /// TCP streams block until at least one credit is available; UDP sends
    /// immediately. Returns the full length on success.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        if self.shared.closed.load(Ordering::SeqCst) || self.shared.close_reason.get().is_some() {
            return Err(StreamError::Closed);
        }

        if self.shared.stream_type == StreamType::Udp {
            return self.send_data(buf).await;
        }

        loop {
            if self.shared.closed.load(Ordering::SeqCst)
                || self.shared.close_reason.get().is_some()
            {
                return Err(StreamError::Closed);
            }
            let deadline = *self.shared.write_deadline.lock().unwrap();
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(StreamError::DeadlineExceeded);
                }
            }

            let credit = self.shared.credit.load(Ordering::SeqCst);
            if credit > 0 {
                if self
                    .shared
                    .credit
                    .compare_exchange(credit, credit - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
                continue;
            }

            // Register the waiter before re-checking so a refill landing in
            // between cannot be missed.
            let refilled = self.shared.credit_notify.notified();
            if self.shared.credit.load(Ordering::SeqCst) > 0 {
                continue;
            }
            tokio::select! {
                _ = refilled => {}
                _ = self.client.cancel.cancelled() => return Err(StreamError::Closed),
                _ = wait_deadline(deadline) => return Err(StreamError::DeadlineExceeded),
            }
        }

        self.send_data(buf).await
    }

    /// Close the stream, notifying the server.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self
            .client
            .packet_tx
            .send(Packet::close(self.shared.stream_id, CloseReason::Voluntary))
            .await;
        self.client.remove_stream(self.shared.stream_id);
        self.shared.credit_notify.notify_waiters();
        Ok(())
    }

    async fn send_data(&self, buf: &[u8]) -> Result<usize, StreamError> {
        self.client
            .packet_tx
            .send(Packet::data(
                self.shared.stream_id,
                Bytes::copy_from_slice(buf),
            ))
            .await
            .map_err(|_| StreamError::Closed)?;
        Ok(buf.len())
    }

    fn fill_from_buffer(&mut self, buf: &mut [u8]) -> usize {
        let n = self.read_buf.remaining().min(buf.len());
        self.read_buf.copy_to_slice(&mut buf[..n]);
        n
    }
}

impl Drop for WispStream {
    fn drop(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Best effort: the pump may already be gone.
        let _ = self.client.packet_tx.try_send(Packet::close(
            self.shared.stream_id,
            CloseReason::Voluntary,
        ));
        self.client.remove_stream(self.shared.stream_id);
        self.shared.credit_notify.notify_waiters();
    }
}

/// Pending forever when no deadline is set.
async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
