//! # Envelope checks
//!
//! The two integrity checks every inbound exchange passes before a single
//! command runs, and the canned answers for exchanges that fail them.
//!
//! ## Philosophy
//!
//! - **Pure validation**: a failed check changes nothing; the peer recovers by
//!   reloading or resending.
//! - **Sanitized answers**: the peer learns which marker applies, nothing more.

use duorpc::Headers;
use duorpc::Packet;
use duorpc::RpcError;
use duorpc::markers;

use crate::session::SessionShared;

#[derive(Debug)]
pub enum ProtocolError {
    /// The body is not a packet.
    Malformed(RpcError),
    /// The peer runs a different protocol version and must reload.
    VersionMismatch { expected: String, presented: Option<String> },
    /// The identity token does not match the one issued to this session.
    IdentityMismatch,
    /// No cached session and nothing to rebuild it from.
    UnknownSession(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed request: {}", e),
            Self::VersionMismatch { expected, presented } => {
                write!(f, "Version mismatch: expected {}, got {}", expected, presented.as_deref().unwrap_or("nothing"))
            }
            Self::IdentityMismatch => write!(f, "Identity token mismatch"),
            Self::UnknownSession(id) => write!(f, "Unknown session '{}'", id),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RpcError> for ProtocolError {
    fn from(e: RpcError) -> Self {
        Self::Malformed(e)
    }
}

impl ProtocolError {
    /// What the peer receives instead of results.
    pub fn response(&self) -> Packet {
        match self {
            Self::Malformed(_) => Packet::failure(markers::PROTOCOL),
            Self::VersionMismatch { .. } | Self::UnknownSession(_) => Packet::refresh(),
            Self::IdentityMismatch => Packet::failure(markers::IDENTITY),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

pub fn check_version(headers: &Headers, expected: &str) -> Result<()> {
    match headers.version.as_deref() {
        Some(version) if version == expected => Ok(()),
        presented => Err(ProtocolError::VersionMismatch {
            expected: expected.to_string(),
            presented: presented.map(str::to_string),
        }),
    }
}

pub fn check_identity(session: &SessionShared, headers: &Headers) -> Result<()> {
    match headers.identity.as_deref() {
        Some(token) if session.identity_matches(token) => Ok(()),
        _ => Err(ProtocolError::IdentityMismatch),
    }
}
