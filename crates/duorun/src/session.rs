//! # Sessions
//!
//! One [`Session`] per logical peer. It pairs the state only the session's
//! ordered queue may touch ([`SessionState`], owned by the queue worker) with
//! the small set of handles other tasks need without queueing
//! ([`SessionShared`]: identity, phase, outbound buffer, reply slots).
//!
//! ## Lifecycle
//!
//! `Uninitialized → Bootstrapping → Ready`, with `InstallingComponents`
//! entered from `Ready` for the duration of a lazy install.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use duorpc::Command;
use duorpc::ComponentKind;
use duorpc::ExecResult;
use duorpc::Packet;

use crate::buffer::PacketBuffer;
use crate::context::Context;
use crate::context::Environment;
use crate::definition::Definition;
use crate::definition::Hook;
use crate::instance::ComponentInstance;
use crate::proxy::Replies;
use crate::queue::OrderedQueue;

/// A constructor hook failed; nothing was cached.
#[derive(Debug)]
pub struct InitError {
    pub component: String,
    pub source: anyhow::Error,
}

impl std::fmt::Display for InitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "constructor of '{}' failed: {:#}", self.component, self.source)
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Bootstrapping,
    Ready,
    InstallingComponents,
}

impl Phase {
    /// Whether peer commands may execute.
    pub fn accepts_commands(self) -> bool {
        matches!(self, Self::Ready | Self::InstallingComponents)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::Ready => write!(f, "ready"),
            Self::InstallingComponents => write!(f, "installing components"),
        }
    }
}

pub(crate) fn issue_token(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The response of a batch that may be released before the batch finishes.
struct EarlyFlush {
    tx: oneshot::Sender<Packet>,
    results: Vec<Option<ExecResult>>,
}

/// Session handles usable outside the ordered queue.
pub struct SessionShared {
    pub(crate) id: String,
    identity: Mutex<String>,
    phase: Mutex<Phase>,
    buffer: Mutex<PacketBuffer>,
    pub(crate) replies: Replies,
    early: Mutex<Option<EarlyFlush>>,
    push: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    installed: Mutex<Vec<String>>,
    bootstrap_claimed: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl SessionShared {
    fn new(id: String, identity: String) -> Self {
        Self {
            id,
            identity: Mutex::new(identity),
            phase: Mutex::new(Phase::Uninitialized),
            buffer: Mutex::new(PacketBuffer::new()),
            replies: Replies::new(),
            early: Mutex::new(None),
            push: Mutex::new(None),
            installed: Mutex::new(Vec::new()),
            bootstrap_claimed: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> String {
        lock(&self.identity).clone()
    }

    pub(crate) fn set_identity(&self, identity: String) {
        *lock(&self.identity) = identity;
    }

    pub(crate) fn identity_matches(&self, presented: &str) -> bool {
        *lock(&self.identity) == presented
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let mut current = lock(&self.phase);
        if *current != phase {
            tracing::debug!(session = %self.id, from = %*current, to = %phase, "phase change");
            *current = phase;
        }
    }

    /// First caller wins; every later caller gets `false`.
    pub(crate) fn claim_bootstrap(&self) -> bool {
        !self.bootstrap_claimed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    pub fn installed(&self) -> Vec<String> {
        lock(&self.installed).clone()
    }

    pub fn is_installed(&self, component: &str) -> bool {
        lock(&self.installed).iter().any(|name| name == component)
    }

    fn mark_installed(&self, component: &str) {
        lock(&self.installed).push(component.to_string());
    }

    pub(crate) fn buffer_command(&self, command: Command) -> usize {
        lock(&self.buffer).buffer_command(command)
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub(crate) fn compile(&self, results: Option<Vec<Option<ExecResult>>>) -> Packet {
        lock(&self.buffer).compile(results)
    }

    /// Arms the early-release slot for a batch of `expected` commands. The
    /// slot is disarmed again when the returned guard drops, however the batch
    /// ends.
    pub(crate) fn arm_early(self: &Arc<Self>, tx: oneshot::Sender<Packet>, expected: usize) -> EarlyGuard {
        *lock(&self.early) = Some(EarlyFlush {
            tx,
            results: vec![None; expected],
        });
        EarlyGuard(self.clone())
    }

    pub(crate) fn record_result(&self, index: usize, result: &ExecResult) {
        if let Some(early) = lock(&self.early).as_mut() {
            if let Some(slot) = early.results.get_mut(index) {
                *slot = Some(result.clone());
            }
        }
    }

    /// Disarms the slot. Returns `false` if the response already went out early.
    pub(crate) fn close_early(&self) -> bool {
        lock(&self.early).take().is_some()
    }

    pub(crate) fn flush_early(&self) -> bool {
        let Some(early) = lock(&self.early).take() else {
            return false;
        };
        let packet = self.compile(Some(early.results));
        tracing::debug!(session = %self.id, commands = packet.commands.len(), "early flush");
        match early.tx.send(packet) {
            Ok(()) => true,
            Err(returned) => {
                tracing::debug!(session = %self.id, "early flush has no receiver");
                let mut buffer = lock(&self.buffer);
                let later = buffer.compile(None).commands;
                buffer.buffer_many(returned.commands);
                buffer.buffer_many(later);
                false
            }
        }
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.push) = Some(tx);
        rx
    }

    /// Hands whatever is buffered to the push subscriber, if there is one.
    /// Without a subscriber the commands wait for the next response.
    pub(crate) fn drain_to_push(&self) {
        let mut push = lock(&self.push);
        let Some(tx) = push.as_ref() else {
            return;
        };

        let packet = {
            let mut buffer = lock(&self.buffer);
            if buffer.is_empty() {
                return;
            }
            buffer.compile(None)
        };

        if let Err(returned) = tx.send(packet) {
            tracing::debug!(session = %self.id, "push subscriber gone");
            *push = None;
            lock(&self.buffer).buffer_many(returned.0.commands);
        }
    }

    pub(crate) fn close(&self) {
        self.replies.fail_all();
        *lock(&self.push) = None;
        lock(&self.early).take();
    }
}

/// Disarms the early-release slot of the batch that armed it.
pub(crate) struct EarlyGuard(Arc<SessionShared>);

impl Drop for EarlyGuard {
    fn drop(&mut self) {
        self.0.close_early();
    }
}

/// Everything the queue worker owns for one session.
pub(crate) struct SessionState {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) env: Arc<Environment>,
    pub(crate) instances: HashMap<String, ComponentInstance>,
    pub(crate) library: Vec<String>,
    pub(crate) features: Vec<String>,
}

impl SessionState {
    /// Puts a constructed instance into the session.
    pub(crate) fn adopt(&mut self, instance: ComponentInstance) {
        let name = instance.name().to_string();
        match instance.definition().kind() {
            ComponentKind::Library => self.library.push(name.clone()),
            ComponentKind::Feature => self.features.push(name.clone()),
        }
        self.shared.mark_installed(&name);
        self.instances.insert(name, instance);
    }

    /// Takes a feature back out, e.g. when its install did not complete.
    pub(crate) fn discard(&mut self, component: &str) -> Option<ComponentInstance> {
        let instance = self.instances.remove(component)?;
        self.library.retain(|name| name != component);
        self.features.retain(|name| name != component);
        lock(&self.shared.installed).retain(|name| name != component);
        Some(instance)
    }

    pub(crate) fn instantiate(&mut self, def: &Arc<Definition>) -> Result<(), InitError> {
        if self.instances.contains_key(def.name()) {
            return Ok(());
        }
        let instance = ComponentInstance::create(def.clone(), &self.shared, &self.env)?;
        self.adopt(instance);
        Ok(())
    }

    pub(crate) fn is_installed(&self, component: &str) -> bool {
        self.instances.contains_key(component)
    }

    /// Installed names, libraries first, each group in install order.
    pub(crate) fn installed(&self) -> Vec<String> {
        self.library.iter().chain(self.features.iter()).cloned().collect()
    }

    /// Runs `hook` on one component; components without the hook are skipped.
    pub(crate) async fn run_hook(&mut self, component: &str, hook: Hook) -> anyhow::Result<()> {
        let Some(instance) = self.instances.get_mut(component) else {
            return Ok(());
        };
        if !instance.definition().has_hook(hook) {
            return Ok(());
        }

        let mut ctx = Context::new(
            self.env.clone(),
            self.shared.clone(),
            instance.definition().clone(),
            instance.proxy().clone(),
        );
        tracing::trace!(session = %self.shared.id, component, %hook, "running hook");
        let outcome = instance.run_hook(hook, &mut ctx).await;

        let requested = ctx.take_install_requests();
        if !requested.is_empty() {
            anyhow::bail!("{} asked to install {}; only methods can install", hook, requested.join(", "));
        }
        outcome
    }
}

/// A cached session: shared handles plus the queue that owns its state.
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) queue: OrderedQueue<SessionState>,
}

impl Session {
    /// Builds a session with every library component plus `features`.
    ///
    /// Constructor hooks run here, in order. If one fails the partially built
    /// state is dropped and nothing reaches the store.
    pub(crate) fn create(id: &str, env: &Arc<Environment>, features: &[Arc<Definition>], identity: Option<String>) -> Result<Self, InitError> {
        let identity = identity.unwrap_or_else(|| issue_token(env.config.token_length));
        let shared = Arc::new(SessionShared::new(id.to_string(), identity));

        let mut state = SessionState {
            shared: shared.clone(),
            env: env.clone(),
            instances: HashMap::new(),
            library: Vec::new(),
            features: Vec::new(),
        };

        for def in env.registry.libraries() {
            state.instantiate(def)?;
        }
        for def in features {
            state.instantiate(def)?;
        }

        tracing::info!(session = id, components = state.instances.len(), "session created");
        let queue = OrderedQueue::spawn(state, env.config.task_timeout());
        Ok(Self { shared, queue })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    pub fn installed(&self) -> Vec<String> {
        self.shared.installed()
    }

    pub fn idle_for(&self) -> Duration {
        self.shared.idle_for()
    }

    /// Tasks queued or running.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("phase", &self.shared.phase())
            .field("pending", &self.queue.pending())
            .finish()
    }
}
