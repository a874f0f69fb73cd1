//! # DuoRPC
//!
//! The wire vocabulary spoken between a host and its session peers.
//!
//! ## Architecture
//!
//! Every exchange is a [`Packet`]: an ordered batch of [`Command`]s and, on the
//! way back, one [`ExecResult`] slot per inbound command. Packets travel inside an
//! [`Envelope`] which carries the out-of-band [`Headers`] (identity token,
//! protocol version, installed component ids). Installing new components is
//! described by data only ([`InstallPayload`]); no code crosses the boundary.
//!
//! The crate has no runtime and performs no I/O. It is shared verbatim by the
//! host runtime and by any peer endpoint written in Rust.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod install;

#[cfg(test)]
mod tests;

pub use codec::decode_bootstrap;
pub use codec::decode_install;
pub use codec::decode_install_request;
pub use codec::decode_packet;
pub use codec::encode_bootstrap;
pub use codec::encode_install;
pub use codec::encode_install_request;
pub use codec::encode_packet;
pub use envelope::Envelope;
pub use envelope::Headers;
pub use error::Result;
pub use error::RpcError;
pub use frame::Command;
pub use frame::ExecResult;
pub use frame::Packet;
pub use install::BootstrapRequest;
pub use install::ComponentKind;
pub use install::InstallPayload;
pub use install::InstallRequest;
pub use install::WireDefinition;

/// Built-in component both sides reserve for protocol housekeeping.
pub const COMMUNICATIONS: &str = "ComponentCommunications";

/// Host to peer: discard local state and reload.
pub const REQUEST_REFRESH: &str = "requestRefresh";

/// Host to peer: install the definitions carried in the first argument.
pub const INSTALL_COMPONENTS: &str = "installComponents";

/// Peer to host: `[replyId, value, err]` answering a command that asked for a reply.
pub const REPLY: &str = "reply";

/// Sanitized error markers. Nothing richer is ever sent to a peer.
pub mod markers {
    pub const INTERNAL: &str = "error.internal";
    pub const PROTOCOL: &str = "error.protocol";
    pub const IDENTITY: &str = "error.identity";
    pub const UNKNOWN_COMPONENT: &str = "error.unknownComponent";
    pub const UNKNOWN_COMMAND: &str = "error.unknownCommand";
    pub const NOT_READY: &str = "error.notReady";
    pub const INSTALL: &str = "error.install";
}
