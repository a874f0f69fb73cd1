//! # Peer Proxies
//!
//! A [`PeerProxy`] stands in for the peer-side half of one component. Invoking
//! a stub never executes anything locally: it serializes the call into the
//! session's outbound buffer. Calls that need an answer carry a reply id and
//! resolve when the peer sends `ComponentCommunications.reply` back.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use duorpc::Command;
use duorpc::ExecResult;

use crate::session::SessionShared;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer has no such method on this component.
    UnknownCommand { component: String, method: String },
    /// The session went away before the reply arrived.
    ChannelClosed,
    /// The peer answered with an error marker.
    Remote(String),
    Timeout,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownCommand { component, method } => write!(f, "peer does not expose '{}.{}'", component, method),
            Self::ChannelClosed => write!(f, "Reply channel closed"),
            Self::Remote(marker) => write!(f, "Remote failure: {}", marker),
            Self::Timeout => write!(f, "Reply timed out"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

type ReplySender = oneshot::Sender<std::result::Result<Value, String>>;

/// Pending reply slots of one session, keyed by reply id.
pub(crate) struct Replies {
    pending: DashMap<u64, ReplySender>,
    seq_gen: AtomicU64,
}

impl Replies {
    pub(crate) fn new() -> Self {
        Self {
            pending: DashMap::new(),
            seq_gen: AtomicU64::new(1),
        }
    }

    fn prepare(&self) -> (u64, oneshot::Receiver<std::result::Result<Value, String>>) {
        let id = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Routes one reply. Returns `false` for ids nobody is waiting on.
    pub(crate) fn resolve(&self, id: u64, result: ExecResult) -> bool {
        let Some((_, tx)) = self.pending.remove(&id) else {
            // Duplicate, late, or forged; nothing to wake.
            return false;
        };
        let _ = tx.send(result.into_result());
        true
    }

    /// Drops every pending slot; their waiters see [`Error::ChannelClosed`].
    pub(crate) fn fail_all(&self) {
        self.pending.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Handle to a peer answer that has not arrived yet.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<std::result::Result<Value, String>>,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(marker)) => Err(Error::Remote(marker)),
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    pub async fn wait_for(self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }
}

/// Stubs for the peer-side methods of one component in one session.
#[derive(Clone)]
pub struct PeerProxy {
    component: String,
    methods: Arc<BTreeSet<String>>,
    session: Arc<SessionShared>,
}

impl PeerProxy {
    pub(crate) fn new(component: impl Into<String>, methods: Arc<BTreeSet<String>>, session: Arc<SessionShared>) -> Self {
        Self {
            component: component.into(),
            methods,
            session,
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn methods(&self) -> &BTreeSet<String> {
        &self.methods
    }

    fn check(&self, method: &str) -> Result<()> {
        if self.methods.contains(method) {
            Ok(())
        } else {
            Err(Error::UnknownCommand {
                component: self.component.clone(),
                method: method.to_string(),
            })
        }
    }

    /// Buffers a fire-and-forget call and returns its index in the pending batch.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<usize> {
        self.check(method)?;
        let command = Command::new(self.component.as_str(), method, args);
        Ok(self.session.buffer_command(command))
    }

    /// Buffers a call the peer must answer.
    ///
    /// The reply can only arrive after the buffer reaches the peer, so a method
    /// awaiting it must flush first (see [`crate::Context::flush`]).
    pub fn request(&self, method: &str, args: Vec<Value>) -> Result<PendingReply> {
        self.check(method)?;
        let (id, rx) = self.session.replies.prepare();
        let command = Command::new(self.component.as_str(), method, args).with_reply(id);
        self.session.buffer_command(command);
        tracing::trace!(session = %self.session.id, component = %self.component, method, reply = id, "awaiting peer reply");
        Ok(PendingReply { id, rx })
    }
}

impl std::fmt::Debug for PeerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerProxy")
            .field("component", &self.component)
            .field("methods", &self.methods)
            .finish()
    }
}
