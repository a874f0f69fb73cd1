//! One component living inside one session.

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;

use crate::context::Context;
use crate::context::Environment;
use crate::definition::Construct;
use crate::definition::Definition;
use crate::definition::Hook;
use crate::definition::HookFuture;
use crate::definition::MethodFuture;
use crate::proxy::PeerProxy;
use crate::session::InitError;
use crate::session::SessionShared;

/// Private state plus the handles wired in at creation.
///
/// Instances are never shared across sessions; their state is only reached
/// through dispatch into their own methods.
pub struct ComponentInstance {
    definition: Arc<Definition>,
    state: Box<dyn Any + Send>,
    proxy: PeerProxy,
}

impl ComponentInstance {
    /// Builds the state, runs the one-time constructor and attaches the proxy.
    pub(crate) fn create(definition: Arc<Definition>, session: &Arc<SessionShared>, env: &Environment) -> Result<Self, InitError> {
        let mut state = definition.instantiate();
        let input = Construct {
            session_id: &session.id,
            extensions: &env.extensions,
        };

        definition.construct(state.as_mut(), &input).map_err(|source| InitError {
            component: definition.name().to_string(),
            source,
        })?;

        let proxy = PeerProxy::new(definition.name(), definition.client_exposed().clone(), session.clone());
        tracing::debug!(session = %session.id, component = definition.name(), "component constructed");

        Ok(Self { definition, state, proxy })
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.definition
    }

    pub fn proxy(&self) -> &PeerProxy {
        &self.proxy
    }

    pub fn state<S: Any>(&self) -> Option<&S> {
        self.state.downcast_ref::<S>()
    }

    pub fn state_mut<S: Any>(&mut self) -> Option<&mut S> {
        self.state.downcast_mut::<S>()
    }

    /// Starts `method`, or `None` if the component has no such method.
    pub(crate) fn invoke<'a>(&'a mut self, ctx: &'a mut Context, method: &str, args: Vec<Value>) -> Option<MethodFuture<'a>> {
        let method = self.definition.method(method)?;
        Some(method.call(self.state.as_mut(), ctx, args))
    }

    pub(crate) fn run_hook<'a>(&'a mut self, hook: Hook, ctx: &'a mut Context) -> HookFuture<'a> {
        self.definition.run_hook(hook, self.state.as_mut(), ctx)
    }
}

impl std::fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentInstance")
            .field("component", &self.definition.name())
            .finish_non_exhaustive()
    }
}
