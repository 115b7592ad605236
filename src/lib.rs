//! # Wisp Relay
//!
//! A multiplexed stream proxy over WebSockets, together with the encrypted
//! bug-report transport built on the same crypto stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Wisp Client                        │
//! │     (dial API, stream handles, credit gating)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Wisp Protocol                       │
//! │       (packet codec, close reasons, credits)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Wisp Server                        │
//! │   (dispatch loop, per-stream tasks, dial policy)     │
//! ├─────────────────────────────────────────────────────┤
//! │               Report Transport                       │
//! │  (sealed-box streaming codec, ingest, object store)  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Every Wisp connection is one WebSocket carrying many concurrent TCP/UDP
//! byte streams with per-stream credit-based flow control. The report
//! transport reuses the WebSocket plumbing to ingest client-encrypted
//! payloads, wrap them in a second anonymous encryption layer and persist
//! them whole into an object store.

pub mod client;
pub mod crypto;
pub mod dialer;
pub mod protocol;
pub mod report;
pub mod server;
pub mod store;

mod pump;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Dial error: {0}")]
    Dial(#[from] dialer::DialError),

    #[error("Server error: {0}")]
    Server(#[from] server::ServerError),

    #[error("Client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("Stream error: {0}")]
    Stream(#[from] client::StreamError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Report error: {0}")]
    Report(#[from] report::ReportError),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),
}
