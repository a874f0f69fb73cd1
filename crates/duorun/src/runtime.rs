//! # Host Runtime
//!
//! The authority side of the protocol. A [`Host`] owns the component registry,
//! the per-process extensions and the session store, and turns inbound
//! exchanges into ordered work on the right session.
//!
//! ## Request path
//!
//! 1. Version check; a stale peer gets a single `requestRefresh`.
//! 2. Session lookup. A miss with an installed list rebuilds the session
//!    (resync) if every listed component is known and admitted by its gate;
//!    any other miss also gets `requestRefresh`.
//! 3. Identity check.
//! 4. Replies are routed to their waiters right away, outside the queue, so a
//!    task suspended on one can finish.
//! 5. The batch is queued. The response is whichever comes first: the finished
//!    batch, or an early flush from inside it.

use std::any::Any;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use duorpc::BootstrapRequest;
use duorpc::Envelope;
use duorpc::Headers;
use duorpc::InstallPayload;
use duorpc::Packet;
use duorpc::RpcError;
use duorpc::markers;

use crate::builder::HostBuilder;
use crate::config;
use crate::config::HostConfig;
use crate::context::Environment;
use crate::dispatch;
use crate::dispatch::Caller;
use crate::envelope;
use crate::envelope::ProtocolError;
use crate::install;
use crate::ledger;
use crate::queue;
use crate::session::InitError;
use crate::session::Phase;
use crate::session::Session;
use crate::session::SessionState;
use crate::session::issue_token;
use crate::store::SessionStore;

#[derive(Debug)]
pub enum Error {
    Config(config::Error),
    Ledger(ledger::Error),
    Init(InitError),
    Install(install::Error),
    Dispatch(dispatch::Error),
    Queue(queue::Error),
    Protocol(ProtocolError),
    Rpc(RpcError),
    UnknownSession(String),
    /// `inspect` asked for a state type the component does not have.
    StateType(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Config error: {}", e),
            Self::Ledger(e) => write!(f, "Registry error: {}", e),
            Self::Init(e) => write!(f, "Session init error: {}", e),
            Self::Install(e) => write!(f, "Install error: {}", e),
            Self::Dispatch(e) => write!(f, "Dispatch error: {}", e),
            Self::Queue(e) => write!(f, "Queue error: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Rpc(e) => write!(f, "Codec error: {}", e),
            Self::UnknownSession(id) => write!(f, "Session not found: {}", id),
            Self::StateType(component) => write!(f, "Unexpected state type for '{}'", component),
        }
    }
}

impl std::error::Error for Error {}

impl From<config::Error> for Error {
    fn from(e: config::Error) -> Self {
        Self::Config(e)
    }
}

impl From<ledger::Error> for Error {
    fn from(e: ledger::Error) -> Self {
        Self::Ledger(e)
    }
}

impl From<InitError> for Error {
    fn from(e: InitError) -> Self {
        Self::Init(e)
    }
}

impl From<install::Error> for Error {
    fn from(e: install::Error) -> Self {
        Self::Install(e)
    }
}

impl From<dispatch::Error> for Error {
    fn from(e: dispatch::Error) -> Self {
        Self::Dispatch(e)
    }
}

impl From<queue::Error> for Error {
    fn from(e: queue::Error) -> Self {
        Self::Queue(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

impl Error {
    /// The packet a peer receives when its exchange fails with this error.
    pub fn response(&self) -> Packet {
        match self {
            Self::Protocol(e) => e.response(),
            Self::UnknownSession(_) => Packet::refresh(),
            Self::Rpc(_) => Packet::failure(markers::PROTOCOL),
            Self::Dispatch(e) => Packet::failure(e.marker()),
            _ => Packet::failure(markers::INTERNAL),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) struct HostInner {
    pub(crate) env: Arc<Environment>,
    pub(crate) store: Arc<dyn SessionStore>,
}

/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub(crate) fn from_parts(env: Environment, store: Arc<dyn SessionStore>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                env: Arc::new(env),
                store,
            }),
        }
    }

    pub fn builder(config: HostConfig) -> HostBuilder {
        HostBuilder::new(config)
    }

    pub fn version(&self) -> &str {
        &self.inner.env.config.version
    }

    pub fn session_count(&self) -> usize {
        self.inner.store.len()
    }

    pub fn phase(&self, session_id: &str) -> Option<Phase> {
        self.inner.store.get(session_id).map(|s| s.phase())
    }

    pub fn installed(&self, session_id: &str) -> Option<Vec<String>> {
        self.inner.store.get(session_id).map(|s| s.installed())
    }

    /// Issued identity of a session, for transports that hand it out themselves.
    pub fn identity(&self, session_id: &str) -> Option<String> {
        self.inner.store.get(session_id).map(|s| s.shared.identity())
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>> {
        self.inner.store.get(session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))
    }

    /// Returns the cached session, building one (library components only, no
    /// bootstrap) when `force_create` is set.
    pub fn get_or_create(&self, session_id: &str, force_create: bool) -> Result<Option<Arc<Session>>> {
        if !force_create {
            return Ok(self.inner.store.get(session_id));
        }
        let env = self.inner.env.clone();
        let (session, _) = self.inner.store.get_or_try_create(
            session_id,
            Box::new(move || Session::create(session_id, &env, &[], None)),
        )?;
        Ok(Some(session))
    }

    /// First exchange of a session: builds it, bootstraps it, and returns the
    /// install payload for the peer.
    ///
    /// A session that is already `Ready` is reactivated instead. A bootstrap
    /// racing one still in flight is rejected.
    pub async fn bootstrap(&self, session_id: &str, request: BootstrapRequest) -> Result<InstallPayload> {
        let session = self.get_or_create(session_id, true)?
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;

        if !session.shared.claim_bootstrap() {
            return self.reactivate(session_id, &session, request.features).await;
        }

        let features = request.features;
        let outcome = session.queue
            .submit(move |state: &mut SessionState| async move { install::bootstrap(state, &features).await }.boxed())
            .wait()
            .await;

        match outcome {
            Ok(Ok(payload)) => {
                session.shared.touch();
                Ok(payload)
            }
            Ok(Err(e)) => {
                tracing::error!(session = session_id, error = %e, "bootstrap failed");
                self.drop_session(session_id);
                Err(e.into())
            }
            Err(e) => {
                tracing::error!(session = session_id, error = %e, "bootstrap task failed");
                self.drop_session(session_id);
                Err(e.into())
            }
        }
    }

    async fn reactivate(&self, session_id: &str, session: &Session, features: Vec<String>) -> Result<InstallPayload> {
        let phase = session.phase();
        if matches!(phase, Phase::Uninitialized | Phase::Bootstrapping) {
            tracing::warn!(session = session_id, %phase, "concurrent bootstrap rejected");
            return Err(install::Error::AlreadyBootstrapped.into());
        }

        let payload = session.queue
            .submit(move |state: &mut SessionState| async move { install::reactivate(state, &features).await }.boxed())
            .wait()
            .await??;
        session.shared.touch();
        Ok(payload)
    }

    /// [`Host::bootstrap`] over raw bytes.
    pub async fn bootstrap_bytes(&self, session_id: &str, body: &[u8]) -> Result<Vec<u8>> {
        let request = duorpc::decode_bootstrap(body)?;
        let payload = self.bootstrap(session_id, request).await?;
        Ok(duorpc::encode_install(&payload)?)
    }

    /// Bytes in, bytes out. Every failure becomes a response the peer understands.
    pub async fn deliver(&self, session_id: &str, envelope: Envelope) -> Vec<u8> {
        let response = match envelope.packet() {
            Ok(packet) => match self.handle(session_id, &envelope.headers, packet).await {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!(session = session_id, error = %e, "request rejected");
                    e.response()
                }
            },
            Err(e) => {
                tracing::warn!(session = session_id, error = %e, "malformed request");
                ProtocolError::Malformed(e).response()
            }
        };

        encode_response(&response)
    }

    /// Checks, routes and executes one inbound packet.
    pub async fn handle(&self, session_id: &str, headers: &Headers, packet: Packet) -> Result<Packet> {
        envelope::check_version(headers, &self.inner.env.config.version)?;
        let session = self.lookup_or_resync(session_id, headers)?;
        envelope::check_identity(&session.shared, headers)?;
        session.shared.touch();

        for command in packet.commands.iter().filter(|c| c.is_reply()) {
            match command.parse_reply() {
                Ok((id, result)) => {
                    if !session.shared.replies.resolve(id, result) {
                        tracing::debug!(session = session_id, reply = id, "reply nobody waits for");
                    }
                }
                Err(e) => tracing::warn!(session = session_id, error = %e, "unreadable reply"),
            }
        }

        let commands = packet.commands;
        let expected = commands.len();
        let (early_tx, mut early_rx) = oneshot::channel();

        let ticket = session.queue.submit(move |state: &mut SessionState| {
            async move {
                let _armed = state.shared.arm_early(early_tx, expected);
                let results = dispatch::run_batch(state, commands).await;
                if state.shared.close_early() {
                    Some(state.shared.compile(Some(results)))
                } else {
                    state.shared.drain_to_push();
                    None
                }
            }
            .boxed()
        });

        let finished = ticket.wait();
        tokio::pin!(finished);

        tokio::select! {
            biased;
            outcome = &mut finished => match outcome? {
                Some(packet) => Ok(packet),
                // The early packet was sent before the task finished.
                None => early_rx.try_recv().map_err(|_| Error::Queue(queue::Error::Closed)),
            },
            Ok(packet) = &mut early_rx => Ok(packet),
        }
    }

    fn lookup_or_resync(&self, session_id: &str, headers: &Headers) -> Result<Arc<Session>> {
        if let Some(session) = self.inner.store.get(session_id) {
            return Ok(session);
        }

        let (Some(installed), Some(identity)) = (&headers.installed, &headers.identity) else {
            return Err(ProtocolError::UnknownSession(session_id.to_string()).into());
        };

        let env = self.inner.env.clone();
        let features = match install::resync_plan(&env, session_id, installed) {
            Ok(features) => features,
            Err(e) => {
                tracing::warn!(session = session_id, error = %e, "peer state cannot be rebuilt");
                return Err(ProtocolError::UnknownSession(session_id.to_string()).into());
            }
        };

        let identity = identity.clone();
        let replay = env.config.replay_new_client_on_resync;
        let create_env = env.clone();
        let (session, created) = self.inner.store.get_or_try_create(
            session_id,
            Box::new(move || {
                let session = Session::create(session_id, &create_env, &features, Some(identity))?;
                // Queued before the session is visible, so it runs ahead of any batch.
                let _ = session.queue.submit(move |state: &mut SessionState| {
                    async move {
                        if let Err(e) = install::resync(state, replay).await {
                            tracing::warn!(session = %state.shared.id, error = %e, "resync skipped");
                        }
                    }
                    .boxed()
                });
                Ok(session)
            }),
        )?;

        if created {
            tracing::info!(session = session_id, "session rebuilt from peer state");
        }
        Ok(session)
    }

    /// Installs feature components into a running session on the host's initiative.
    pub async fn install(&self, session_id: &str, components: Vec<String>) -> Result<InstallPayload> {
        let session = self.session(session_id)?;
        let payload = session.queue
            .submit(move |state: &mut SessionState| async move { install::install(state, &components).await }.boxed())
            .wait()
            .await??;
        Ok(payload)
    }

    /// A peer asking for feature components. Headers are checked like any request.
    pub async fn install_request(&self, session_id: &str, envelope: Envelope) -> Result<InstallPayload> {
        envelope::check_version(&envelope.headers, &self.inner.env.config.version)?;
        let session = self.session(session_id)?;
        envelope::check_identity(&session.shared, &envelope.headers)?;
        session.shared.touch();

        let request = duorpc::decode_install_request(&envelope.body)?;
        self.install(session_id, request.components).await
    }

    /// Calls any method of an installed component, in order with peer traffic.
    /// Commands it buffers go to the push subscriber, if any.
    pub async fn invoke(&self, session_id: &str, component: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let session = self.session(session_id)?;
        let component = component.to_string();
        let method = method.to_string();

        let value = session.queue
            .submit(move |state: &mut SessionState| {
                async move {
                    let outcome = dispatch::execute(state, Caller::Host, &component, &method, args).await;
                    state.shared.drain_to_push();
                    outcome
                }
                .boxed()
            })
            .wait()
            .await??;
        Ok(value)
    }

    /// Reads a component's state from inside the session's queue.
    pub async fn inspect<S, R, F>(&self, session_id: &str, component: &str, f: F) -> Result<R>
    where
        S: Any,
        R: Send + 'static,
        F: FnOnce(&S) -> R + Send + 'static,
    {
        let session = self.session(session_id)?;
        let component = component.to_string();

        session.queue
            .submit(move |state: &mut SessionState| {
                async move {
                    let instance = state.instances.get(&component)
                        .ok_or_else(|| Error::Dispatch(dispatch::Error::UnknownComponent(component.clone())))?;
                    let typed = instance.state::<S>()
                        .ok_or_else(|| Error::StateType(component.clone()))?;
                    Ok::<R, Error>(f(typed))
                }
                .boxed()
            })
            .wait()
            .await?
    }

    /// Receiver for commands produced outside a request/response exchange.
    /// A new subscription replaces the previous one.
    pub fn subscribe(&self, session_id: &str) -> Result<mpsc::UnboundedReceiver<Packet>> {
        Ok(self.session(session_id)?.shared.subscribe())
    }

    /// Issues a fresh identity token, e.g. after a privilege change.
    pub fn rotate_identity(&self, session_id: &str) -> Result<String> {
        let session = self.session(session_id)?;
        let token = issue_token(self.inner.env.config.token_length);
        session.shared.set_identity(token.clone());
        tracing::info!(session = session_id, "identity rotated");
        Ok(token)
    }

    /// Tears a session down. Pending peer replies fail; queued work still drains.
    pub fn destroy(&self, session_id: &str) -> bool {
        let removed = self.drop_session(session_id);
        if removed {
            tracing::info!(session = session_id, "session destroyed");
        }
        removed
    }

    fn drop_session(&self, session_id: &str) -> bool {
        match self.inner.store.remove(session_id) {
            Some(session) => {
                session.shared.close();
                true
            }
            None => false,
        }
    }

    /// Evicts sessions idle longer than the configured timeout. Returns how many.
    pub fn evict_idle(&self) -> usize {
        let Some(idle) = self.inner.env.config.idle_timeout() else {
            return 0;
        };
        evict(&self.inner, idle)
    }

    /// Runs [`Host::evict_idle`] every `period` until the host is dropped.
    pub fn spawn_reaper(&self, period: Duration) -> Option<JoinHandle<()>> {
        let idle = self.inner.env.config.idle_timeout()?;
        let weak: Weak<HostInner> = Arc::downgrade(&self.inner);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                evict(&inner, idle);
            }
        }))
    }
}

fn evict(inner: &HostInner, idle: Duration) -> usize {
    let evicted = inner.store.evict_idle(idle);
    for session in &evicted {
        session.shared.close();
        tracing::info!(session = session.id(), idle = ?session.idle_for(), "session evicted");
    }
    evicted.len()
}

fn encode_response(packet: &Packet) -> Vec<u8> {
    match duorpc::encode_packet(packet) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "cannot encode response");
            let fallback = Packet::failure(markers::INTERNAL);
            duorpc::encode_packet(&fallback).unwrap_or_default()
        }
    }
}
