//! # DuoRun
//!
//! Session-scoped RPC between one host and many peers.
//!
//! ## Architecture
//!
//! Components are registered once as [`Definition`]s. Every session owns its
//! own instances of them, and every session has one [`queue::OrderedQueue`]
//! that runs its work strictly in submission order: inbound batches, lazy
//! installs, host-initiated calls. Calls towards the peer are buffered through
//! [`PeerProxy`] stubs and leave with the response to the request that caused
//! them.
//!
//! - [`HostBuilder`] / [`Host`]: registration, validation, the request path.
//! - [`Client`] + [`Transport`]: the peer side, and a [`Loopback`] to connect
//!   both in one process.
//! - Wire types live in [`duorpc`].

pub mod buffer;
pub mod builder;
pub mod client;
pub mod config;
pub mod context;
pub mod definition;
pub mod dispatch;
pub mod envelope;
pub mod install;
pub mod instance;
pub mod ledger;
pub mod logging;
pub mod proxy;
pub mod queue;
pub mod runtime;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
mod tests;

pub use builder::HostBuilder;
pub use client::Client;
pub use config::HostConfig;
pub use context::Context;
pub use context::Extensions;
pub use definition::Construct;
pub use definition::Definition;
pub use definition::DefinitionBuilder;
pub use definition::GateInput;
pub use definition::HookFuture;
pub use definition::MethodFuture;
pub use envelope::ProtocolError;
pub use ledger::Registry;
pub use ledger::Side;
pub use ledger::resolve_exposed_methods;
pub use proxy::PeerProxy;
pub use proxy::PendingReply;
pub use runtime::Error;
pub use runtime::Host;
pub use runtime::Result;
pub use session::InitError;
pub use session::Phase;
pub use session::Session;
pub use store::MemoryStore;
pub use store::SessionStore;
pub use transport::Loopback;
pub use transport::Transport;
pub use transport::TransportError;

pub use duorpc;
