//! Handles injected into every component method and hook

use std::sync::Arc;

use crate::config::HostConfig;
use crate::definition::Definition;
use crate::ledger::Registry;
use crate::proxy::PeerProxy;
use crate::session::SessionShared;

/// Per-process values shared by every session, keyed by type.
///
/// Registered on the [`crate::HostBuilder`] before startup; read-only afterwards.
pub struct Extensions {
    map: anymap::Map<dyn anymap::any::Any + Send + Sync>,
}

impl Extensions {
    pub fn new() -> Self {
        Self { map: anymap::Map::new() }
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map.get::<T>()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for Extensions {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything that is fixed once the host is built.
pub(crate) struct Environment {
    pub(crate) registry: Registry,
    pub(crate) extensions: Extensions,
    pub(crate) config: HostConfig,
}

/// The view a component gets of its surroundings while it runs.
///
/// A `Context` lives for one method call or hook. Its handles point at the
/// owning session, never at another one.
pub struct Context {
    env: Arc<Environment>,
    session: Arc<SessionShared>,
    definition: Arc<Definition>,
    proxy: PeerProxy,
    install_requests: Vec<String>,
}

impl Context {
    pub(crate) fn new(env: Arc<Environment>, session: Arc<SessionShared>, definition: Arc<Definition>, proxy: PeerProxy) -> Self {
        Self {
            env,
            session,
            definition,
            proxy,
            install_requests: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn component(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn config(&self) -> &HostConfig {
        &self.env.config
    }

    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.env.extensions.get::<T>()
    }

    /// Stubs for this component's peer-side methods.
    pub fn peer(&self) -> &PeerProxy {
        &self.proxy
    }

    /// Stubs for another component installed in the same session.
    pub fn peer_of(&self, component: &str) -> Option<PeerProxy> {
        if !self.session.is_installed(component) {
            return None;
        }
        let def = self.env.registry.get(component)?;
        Some(PeerProxy::new(component, def.client_exposed().clone(), self.session.clone()))
    }

    /// Components currently installed in this session, in install order.
    pub fn installed(&self) -> Vec<String> {
        self.session.installed()
    }

    /// Sends what is buffered so far right away, together with the results of
    /// the commands already executed in the current batch. Anything buffered
    /// afterwards goes out through the push channel or with the next response.
    ///
    /// Returns `false` when there is no response left to release early, e.g.
    /// outside of a peer request or after an earlier flush.
    pub fn flush(&mut self) -> bool {
        self.session.flush_early()
    }

    /// Asks for feature components to be installed in this session once the
    /// current method returns. The install payload is buffered to the peer.
    ///
    /// If the install is rejected the method's result becomes the install
    /// error. Hooks cannot install; a hook that asks fails.
    pub fn install<I, T>(&mut self, components: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for name in components {
            let name = name.into();
            if !self.install_requests.contains(&name) {
                self.install_requests.push(name);
            }
        }
    }

    pub(crate) fn take_install_requests(&mut self) -> Vec<String> {
        std::mem::take(&mut self.install_requests)
    }
}
