//! # Transport Abstraction
//!
//! A minimal, async interface for moving exchanges between a peer and a host.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: the transport never parses packets. It moves an
//!   [`Envelope`] (headers plus opaque body) one way and raw bytes back.
//! - **Request-Response**: every exchange is "send, await answer". Host-initiated
//!   traffic rides on the next answer or on the push channel, not here.

use std::fmt;

use duorpc::Envelope;

use crate::runtime::Host;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The operation timed out before a response was received.
    Timeout,
    /// The host refused the exchange outright (bootstrap or install failure).
    Rejected(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Rejected(msg) => write!(f, "Rejected by host: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Carries the three kinds of exchange a peer starts.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// First exchange; `body` is an encoded bootstrap request, the answer an
    /// encoded install payload.
    async fn bootstrap(&self, session_id: &str, body: Vec<u8>) -> Result<Vec<u8>>;

    /// One packet exchange. The answer is an encoded packet.
    async fn deliver(&self, session_id: &str, envelope: Envelope) -> Result<Vec<u8>>;

    /// A lazy install request. The answer is an encoded install payload.
    async fn install(&self, session_id: &str, envelope: Envelope) -> Result<Vec<u8>>;
}

/// Calls a [`Host`] in the same process.
#[derive(Clone)]
pub struct Loopback {
    host: Host,
}

impl Loopback {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }
}

#[async_trait::async_trait]
impl Transport for Loopback {
    async fn bootstrap(&self, session_id: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        self.host.bootstrap_bytes(session_id, &body).await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    async fn deliver(&self, session_id: &str, envelope: Envelope) -> Result<Vec<u8>> {
        Ok(self.host.deliver(session_id, envelope).await)
    }

    async fn install(&self, session_id: &str, envelope: Envelope) -> Result<Vec<u8>> {
        let payload = self.host.install_request(session_id, envelope).await
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        duorpc::encode_install(&payload).map_err(|e| TransportError::Io(e.to_string()))
    }
}
