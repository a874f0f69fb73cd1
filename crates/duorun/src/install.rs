//! # Bootstrap and Lazy Install
//!
//! Computes which components a session still needs, instantiates them, runs
//! their lifecycle hooks and describes them to the peer as data.
//!
//! Everything here runs inside the session's ordered queue, so a session never
//! sees two installs interleave with each other or with command dispatch.
//!
//! ## Protocol
//!
//! - **Bootstrap**: every library gets `on_new_client` then
//!   `on_bootstrap_ready`, in registration order. Requested features (and their
//!   includes) are installed after that. The payload lists all of them.
//! - **Install**: only from `Ready`. Names and gates are checked before any
//!   instance is built; if a constructor or ready hook fails, the whole batch is
//!   taken back out.
//! - **Reactivation**: a bootstrap for a session that is already `Ready` gets
//!   the current payload back, plus any requested features it still lacks.
//!   Constructors and `on_new_client` do not run again.
//! - **Resync**: a session rebuilt from the peer's installed list only replays
//!   `on_bootstrap_ready` (and `on_new_client` when configured). Nothing is
//!   sent back; the peer already has the definitions. The list passes the same
//!   name and gate checks as an install.

use std::sync::Arc;

use serde_json::json;

use duorpc::Command;
use duorpc::ComponentKind;
use duorpc::InstallPayload;

use crate::context::Environment;
use crate::context::Extensions;
use crate::definition::Definition;
use crate::definition::GateInput;
use crate::definition::Hook;
use crate::instance::ComponentInstance;
use crate::ledger;
use crate::session::InitError;
use crate::session::Phase;
use crate::session::SessionState;

#[derive(Debug)]
pub enum Error {
    UnknownComponent(String),
    /// The component's gate refused this session.
    Gated(String),
    NotReady(Phase),
    AlreadyBootstrapped,
    Init(InitError),
    Hook { component: String, hook: Hook, message: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownComponent(name) => write!(f, "Cannot install unknown component '{}'", name),
            Self::Gated(name) => write!(f, "Component '{}' is not available to this session", name),
            Self::NotReady(phase) => write!(f, "Cannot install while session is {}", phase),
            Self::AlreadyBootstrapped => write!(f, "Session was already bootstrapped"),
            Self::Init(e) => write!(f, "{}", e),
            Self::Hook { component, hook, message } => write!(f, "{} of '{}' failed: {}", hook, component, message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Init(e) => Some(e),
            _ => None,
        }
    }
}

impl From<InitError> for Error {
    fn from(e: InitError) -> Self {
        Self::Init(e)
    }
}

impl From<ledger::Error> for Error {
    fn from(e: ledger::Error) -> Self {
        match e {
            ledger::Error::UnknownComponent(name) => Self::UnknownComponent(name),
            ledger::Error::UnknownInclude { include, .. } => Self::UnknownComponent(include),
            other => Self::UnknownComponent(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

async fn run_hook(state: &mut SessionState, component: &str, hook: Hook) -> Result<()> {
    state.run_hook(component, hook).await.map_err(|e| {
        tracing::error!(session = %state.shared.id, component, %hook, error = ?e, "hook failed");
        Error::Hook {
            component: component.to_string(),
            hook,
            message: format!("{:#}", e),
        }
    })
}

/// New components needed for `names`, includes first. Fails before anything
/// is built if a name is unknown or a gate says no.
fn plan(state: &SessionState, names: &[String]) -> Result<Vec<Arc<Definition>>> {
    for name in names {
        if !state.env.registry.contains(name) {
            return Err(Error::UnknownComponent(name.clone()));
        }
    }

    let ordered = state.env.registry.dependency_order(names.iter().map(String::as_str))?;
    let fresh: Vec<_> = ordered.into_iter()
        .filter(|def| !state.is_installed(def.name()))
        .collect();

    check_gates(&state.shared.id, &state.installed(), &state.env.extensions, &fresh)?;
    Ok(fresh)
}

fn check_gates(session_id: &str, installed: &[String], extensions: &Extensions, defs: &[Arc<Definition>]) -> Result<()> {
    let input = GateInput {
        session_id,
        installed,
        extensions,
    };
    match defs.iter().find(|def| !def.admits(&input)) {
        Some(def) => {
            tracing::warn!(session = session_id, component = def.name(), "install refused by gate");
            Err(Error::Gated(def.name().to_string()))
        }
        None => Ok(()),
    }
}

/// Feature definitions for a session rebuilt from the peer's installed list,
/// includes first. Library names are skipped; every session has those.
pub(crate) fn resync_plan(env: &Environment, session_id: &str, installed: &[String]) -> Result<Vec<Arc<Definition>>> {
    let mut wanted = Vec::new();
    for name in installed {
        match env.registry.get(name) {
            Some(def) if def.kind() == ComponentKind::Feature => wanted.push(name.as_str()),
            Some(_) => {}
            None => return Err(Error::UnknownComponent(name.clone())),
        }
    }

    let features = env.registry.dependency_order(wanted)?;
    let libraries: Vec<String> = env.registry.libraries().map(|def| def.name().to_string()).collect();
    check_gates(session_id, &libraries, &env.extensions, &features)?;
    Ok(features)
}

/// Builds every planned instance, or none of them.
fn build(state: &SessionState, defs: &[Arc<Definition>]) -> Result<Vec<ComponentInstance>> {
    defs.iter()
        .map(|def| ComponentInstance::create(def.clone(), &state.shared, &state.env).map_err(Error::from))
        .collect()
}

fn payload<'a>(state: &SessionState, defs: impl IntoIterator<Item = &'a Arc<Definition>>) -> InstallPayload {
    InstallPayload {
        defs: defs.into_iter().map(|def| def.to_wire()).collect(),
        ctor_arguments: vec![json!({
            "sessionId": state.shared.id,
            "identity": state.shared.identity(),
            "version": state.env.config.version,
        })],
    }
}

fn definitions(state: &SessionState, names: &[String]) -> Vec<Arc<Definition>> {
    names.iter()
        .filter_map(|name| state.env.registry.get(name).cloned())
        .collect()
}

/// `Uninitialized → Bootstrapping → Ready`.
pub(crate) async fn bootstrap(state: &mut SessionState, features: &[String]) -> Result<InstallPayload> {
    let phase = state.shared.phase();
    if phase != Phase::Uninitialized {
        return Err(Error::AlreadyBootstrapped);
    }

    state.shared.set_phase(Phase::Bootstrapping);
    match run_bootstrap(state, features).await {
        Ok(payload) => {
            state.shared.set_phase(Phase::Ready);
            tracing::info!(session = %state.shared.id, components = payload.defs.len(), "bootstrapped");
            Ok(payload)
        }
        Err(e) => {
            state.shared.set_phase(Phase::Uninitialized);
            Err(e)
        }
    }
}

async fn run_bootstrap(state: &mut SessionState, features: &[String]) -> Result<InstallPayload> {
    let libraries = state.library.clone();
    for name in &libraries {
        run_hook(state, name, Hook::NewClient).await?;
        run_hook(state, name, Hook::BootstrapReady).await?;
    }

    let fresh = plan(state, features)?;
    for instance in build(state, &fresh)? {
        state.adopt(instance);
    }
    for def in &fresh {
        run_hook(state, def.name(), Hook::Ready).await?;
    }

    let libraries = definitions(state, &libraries);
    Ok(payload(state, libraries.iter().chain(fresh.iter())))
}

/// A repeated bootstrap of a `Ready` session: installs what `features` adds
/// and describes everything installed.
pub(crate) async fn reactivate(state: &mut SessionState, features: &[String]) -> Result<InstallPayload> {
    if state.shared.phase() != Phase::Ready {
        return Err(Error::AlreadyBootstrapped);
    }
    if !features.is_empty() {
        install(state, features).await?;
    }

    let installed = state.installed();
    tracing::info!(session = %state.shared.id, components = installed.len(), "reactivated");
    let defs = definitions(state, &installed);
    Ok(payload(state, defs.iter()))
}

/// `Ready → InstallingComponents → Ready`.
pub(crate) async fn install(state: &mut SessionState, names: &[String]) -> Result<InstallPayload> {
    let phase = state.shared.phase();
    if phase != Phase::Ready {
        return Err(Error::NotReady(phase));
    }

    state.shared.set_phase(Phase::InstallingComponents);
    let result = run_install(state, names).await;
    state.shared.set_phase(Phase::Ready);
    result
}

async fn run_install(state: &mut SessionState, names: &[String]) -> Result<InstallPayload> {
    let fresh = plan(state, names)?;
    if fresh.is_empty() {
        return Ok(payload(state, std::iter::empty()));
    }

    for instance in build(state, &fresh)? {
        state.adopt(instance);
    }

    for def in &fresh {
        if let Err(e) = run_hook(state, def.name(), Hook::Ready).await {
            for def in &fresh {
                state.discard(def.name());
            }
            return Err(e);
        }
    }

    tracing::info!(
        session = %state.shared.id,
        components = ?fresh.iter().map(|d| d.name()).collect::<Vec<_>>(),
        "installed"
    );
    Ok(payload(state, fresh.iter()))
}

/// Installs on behalf of a running method and queues the payload for the peer.
pub(crate) async fn install_and_announce(state: &mut SessionState, names: &[String]) -> Result<()> {
    let payload = install(state, names).await.inspect_err(|e| {
        tracing::warn!(session = %state.shared.id, error = %e, "requested install failed");
    })?;
    if payload.is_empty() {
        return Ok(());
    }

    match Command::install(&payload) {
        Ok(command) => {
            state.shared.buffer_command(command);
        }
        Err(e) => tracing::error!(session = %state.shared.id, error = %e, "cannot encode install payload"),
    }
    Ok(())
}

/// Brings a session rebuilt from the peer's installed list back to `Ready`.
///
/// Hook failures are logged and skipped; the peer is already running and a
/// half-replayed session is more useful to it than a refresh loop.
pub(crate) async fn resync(state: &mut SessionState, replay_new_client: bool) -> Result<()> {
    let phase = state.shared.phase();
    if phase != Phase::Uninitialized || !state.shared.claim_bootstrap() {
        return Err(Error::AlreadyBootstrapped);
    }

    state.shared.set_phase(Phase::Bootstrapping);
    for name in state.installed() {
        if replay_new_client {
            if let Err(e) = run_hook(state, &name, Hook::NewClient).await {
                tracing::warn!(error = %e, "resync continues");
            }
        }
        if let Err(e) = run_hook(state, &name, Hook::BootstrapReady).await {
            tracing::warn!(error = %e, "resync continues");
        }
    }
    state.shared.set_phase(Phase::Ready);

    tracing::info!(session = %state.shared.id, installed = state.instances.len(), "resynchronized");
    Ok(())
}
