//! Outbound dialing with host filtering
//!
//! The Wisp server resolves every CONNECT through a [`Dialer`]. The built-in
//! [`PolicyDialer`] checks the target host against an allow predicate before
//! touching the network; when no predicate is configured every host is
//! denied.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};

/// Dialing errors
#[derive(Debug, Error)]
pub enum DialError {
    #[error("host {0:?} is not allowed")]
    HostNotAllowed(String),

    #[error("invalid address {addr:?}: {reason}")]
    Addr { addr: String, reason: &'static str },

    #[error("dial failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Peer network selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

/// A dialed peer connection: a TCP byte stream or a connected UDP socket.
#[derive(Debug)]
pub enum Peer {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Peer {
    /// Split into independently usable read and write halves.
    pub fn split(self) -> (PeerReader, PeerWriter) {
        match self {
            Peer::Tcp(stream) => {
                let (rd, wr) = stream.into_split();
                (PeerReader::Tcp(rd), PeerWriter::Tcp(wr))
            }
            Peer::Udp(socket) => {
                let socket = Arc::new(socket);
                (PeerReader::Udp(socket.clone()), PeerWriter::Udp(socket))
            }
        }
    }
}

/// Read half of a [`Peer`].
pub enum PeerReader {
    Tcp(OwnedReadHalf),
    Udp(Arc<UdpSocket>),
}

impl PeerReader {
    /// Read bytes (TCP) or one datagram (UDP) into `buf`.
    ///
    /// For TCP a return of 0 means end-of-stream; UDP datagrams may be
    /// legitimately empty.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            PeerReader::Tcp(rd) => rd.read(buf).await,
            PeerReader::Udp(socket) => socket.recv(buf).await,
        }
    }
}

/// Write half of a [`Peer`].
pub enum PeerWriter {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
}

impl PeerWriter {
    /// Write all of `buf` (TCP) or send it as one datagram (UDP).
    pub async fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            PeerWriter::Tcp(wr) => wr.write_all(buf).await,
            PeerWriter::Udp(socket) => socket.send(buf).await.map(|_| ()),
        }
    }
}

/// Resolves a `(network, "host:port")` pair to a peer connection.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: Network, addr: &str) -> Result<Peer, DialError>;
}

/// Host allow predicate shared by dialers.
pub type AllowFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Allow every host.
pub fn allow_all() -> AllowFn {
    Arc::new(|_| true)
}

/// Deny every host.
pub fn allow_none() -> AllowFn {
    Arc::new(|_| false)
}

/// Build an allow predicate from a pattern list.
///
/// A pattern is an exact hostname, a wildcard suffix like `*.example.com`
/// (matches any proper subdomain but not the bare apex), or `*` which
/// matches everything.
pub fn allow_patterns<I, S>(patterns: I) -> AllowFn
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
    Arc::new(move |host| patterns.iter().any(|p| pattern_matches(p, host)))
}

fn pattern_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern == host {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        // "*.example.com" keeps the leading dot, so the apex never matches.
        if suffix.starts_with('.') && host.ends_with(suffix) {
            return true;
        }
    }
    false
}

/// Split a `host:port` address.
///
/// IPv6 addresses must be bracketed (`[::1]:80`); a bare address with more
/// than one colon is rejected, matching the usual host/port conventions.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), DialError> {
    let addr_err = |reason| DialError::Addr {
        addr: addr.to_string(),
        reason,
    };

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or(addr_err("missing ']' in address"))?;
        let port = rest
            .strip_prefix(':')
            .ok_or(addr_err("missing port in address"))?;
        (host, port)
    } else {
        if addr.matches(':').count() > 1 {
            return Err(addr_err("too many colons in address"));
        }
        addr.split_once(':')
            .ok_or(addr_err("missing port in address"))?
    };

    let port: u16 = port.parse().map_err(|_| addr_err("invalid port"))?;
    Ok((host, port))
}

/// The default dialer: an allow predicate in front of the platform dial.
pub struct PolicyDialer {
    allow: AllowFn,
}

impl PolicyDialer {
    pub fn new(allow: AllowFn) -> Self {
        Self { allow }
    }
}

impl Default for PolicyDialer {
    /// The unconfigured dialer denies all hosts.
    fn default() -> Self {
        Self::new(allow_none())
    }
}

#[async_trait]
impl Dialer for PolicyDialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<Peer, DialError> {
        let (host, _port) = split_host_port(addr)?;

        if !(self.allow)(host) {
            return Err(DialError::HostNotAllowed(host.to_string()));
        }

        match network {
            Network::Tcp => Ok(Peer::Tcp(TcpStream::connect(addr).await?)),
            Network::Udp => {
                let target = tokio::net::lookup_host(addr)
                    .await?
                    .next()
                    .ok_or_else(|| DialError::Addr {
                        addr: addr.to_string(),
                        reason: "hostname did not resolve",
                    })?;
                let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind_addr).await?;
                socket.connect(target).await?;
                Ok(Peer::Udp(socket))
            }
        }
    }
}
