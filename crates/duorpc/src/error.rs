//! # Error Definitions
//!
//! Failures of the wire layer itself. These never describe a component failing;
//! a component failure is an [`ExecResult`](crate::ExecResult) carrying a marker.

/// Operational failures while reading or writing a frame.
#[derive(Debug)]
pub enum RpcError {
    /// The payload was not JSON, or not shaped like the expected frame.
    Malformed(serde_json::Error),
    /// An outbound frame could not be serialized.
    Serialization(serde_json::Error),
    /// A reply command did not carry `[replyId, value, err]`.
    BadReply(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed frame: {}", e),
            Self::Serialization(e) => write!(f, "failed to serialize frame: {}", e),
            Self::BadReply(msg) => write!(f, "bad reply command: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) | Self::Serialization(e) => Some(e),
            Self::BadReply(_) => None,
        }
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, RpcError>;
