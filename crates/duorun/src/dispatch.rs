//! # Command Dispatch
//!
//! Executes one inbound batch against a session's instances, inside that
//! session's ordered queue.
//!
//! ## Failure semantics
//!
//! Every command gets its own result slot. An unknown component or method, a
//! session that is not ready, an error returned by the method or a panic inside
//! it: each is logged in full, reported to the peer as a sanitized marker, and
//! the rest of the batch keeps going.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;

use duorpc::Command;
use duorpc::ExecResult;
use duorpc::markers;

use crate::context::Context;
use crate::install;
use crate::session::Phase;
use crate::session::SessionState;

#[derive(Debug)]
pub enum Error {
    UnknownComponent(String),
    UnknownCommand { component: String, method: String },
    NotReady(Phase),
    /// The method itself failed or panicked.
    Execution { component: String, method: String, message: String },
    /// The method ran, but an install it asked for was rejected.
    Install { component: String, method: String, source: install::Error },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownComponent(name) => write!(f, "Unknown component '{}'", name),
            Self::UnknownCommand { component, method } => write!(f, "Unknown command '{}.{}'", component, method),
            Self::NotReady(phase) => write!(f, "Session is {}", phase),
            Self::Execution { component, method, message } => write!(f, "'{}.{}' failed: {}", component, method, message),
            Self::Install { component, method, source } => write!(f, "Install requested by '{}.{}' failed: {}", component, method, source),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Install { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl Error {
    /// The only thing about this error the peer ever sees.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::UnknownComponent(_) => markers::UNKNOWN_COMPONENT,
            Self::UnknownCommand { .. } => markers::UNKNOWN_COMMAND,
            Self::NotReady(_) => markers::NOT_READY,
            Self::Execution { .. } => markers::INTERNAL,
            Self::Install { .. } => markers::INSTALL,
        }
    }

    pub fn to_result(&self) -> ExecResult {
        ExecResult::err(self.marker())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Who is calling. The peer only reaches exposed methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Caller {
    Peer,
    Host,
}

/// Runs a peer batch in order and returns one result slot per command.
///
/// Results are mirrored into the session's early-release slot as they are
/// produced, so a method that flushes early sends everything finished so far.
pub(crate) async fn run_batch(state: &mut SessionState, commands: Vec<Command>) -> Vec<Option<ExecResult>> {
    let mut results = Vec::with_capacity(commands.len());

    for (index, command) in commands.into_iter().enumerate() {
        let result = if command.is_communication() {
            // Replies were routed before the batch was queued.
            if command.is_reply() {
                ExecResult::ok(Value::Null)
            } else {
                tracing::warn!(session = %state.shared.id, cmd = %command.cmd, "unsupported communication command");
                ExecResult::err(markers::UNKNOWN_COMMAND)
            }
        } else {
            match execute(state, Caller::Peer, &command.comp, &command.cmd, command.args).await {
                Ok(value) => ExecResult::ok(value),
                Err(e) => e.to_result(),
            }
        };

        state.shared.record_result(index, &result);
        results.push(Some(result));
    }

    results
}

/// Executes one method call and then any installs the method asked for.
pub(crate) async fn execute(state: &mut SessionState, caller: Caller, component: &str, method: &str, args: Vec<Value>) -> Result<Value> {
    let phase = state.shared.phase();
    if caller == Caller::Peer && !phase.accepts_commands() {
        tracing::warn!(session = %state.shared.id, component, method, %phase, "command before bootstrap");
        return Err(Error::NotReady(phase));
    }

    let Some(instance) = state.instances.get_mut(component) else {
        tracing::warn!(session = %state.shared.id, component, method, "unknown component");
        return Err(Error::UnknownComponent(component.to_string()));
    };

    if caller == Caller::Peer && !instance.definition().host_exposed().contains(method) {
        tracing::warn!(session = %state.shared.id, component, method, "method not exposed");
        return Err(Error::UnknownCommand {
            component: component.to_string(),
            method: method.to_string(),
        });
    }

    let mut ctx = Context::new(
        state.env.clone(),
        state.shared.clone(),
        instance.definition().clone(),
        instance.proxy().clone(),
    );

    let Some(call) = instance.invoke(&mut ctx, method, args) else {
        tracing::warn!(session = %state.shared.id, component, method, "unknown method");
        return Err(Error::UnknownCommand {
            component: component.to_string(),
            method: method.to_string(),
        });
    };

    let outcome = match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::error!(session = %state.shared.id, component, method, error = ?e, "method failed");
            Err(Error::Execution {
                component: component.to_string(),
                method: method.to_string(),
                message: format!("{:#}", e),
            })
        }
        Err(_) => {
            tracing::error!(session = %state.shared.id, component, method, "method panicked");
            Err(Error::Execution {
                component: component.to_string(),
                method: method.to_string(),
                message: "panicked".into(),
            })
        }
    };

    let requested = ctx.take_install_requests();
    if requested.is_empty() {
        return outcome;
    }

    let installed = install::install_and_announce(state, &requested).await;
    match (outcome, installed) {
        (Ok(_), Err(source)) => Err(Error::Install {
            component: component.to_string(),
            method: method.to_string(),
            source,
        }),
        (outcome, _) => outcome,
    }
}
