//! # Ledger of component definitions and exposed methods
//!
//! The [`Registry`] is the source of truth for which components exist and which
//! of their methods each side may call. It is filled once at startup and read
//! concurrently by every session afterwards.
//!
//! ## Philosophy
//!
//! - **Startup Safety**: a name marked exposed without a handler, a duplicate
//!   registration, or a dangling include is a startup error, never a runtime one.
//! - **Static Table**: dispatch consults precomputed sets; nothing is inspected
//!   per call.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use duorpc::ComponentKind;

use crate::definition::Definition;

/// Ledger errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A definition with this name was already registered.
    Duplicate(String),
    /// A name was marked exposed but has no callable behind it.
    NotCallable { component: String, method: String },
    /// A definition includes a component nobody registered.
    UnknownInclude { component: String, include: String },
    /// Lookup of a component nobody registered.
    UnknownComponent(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Duplicate(name) => write!(f, "component '{}' is registered twice", name),
            Error::NotCallable { component, method } => write!(f, "'{}.{}' is marked exposed but is not a method", component, method),
            Error::UnknownInclude { component, include } => write!(f, "component '{}' includes unknown component '{}'", component, include),
            Error::UnknownComponent(name) => write!(f, "unknown component '{}'", name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The two ends of the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Host,
    Client,
}

/// Names on `side` of `def` that the opposite side may call.
///
/// For the host side this checks every marked name against the registered
/// handlers and fails on the first one that is not callable.
pub fn resolve_exposed_methods(def: &Definition, side: Side) -> Result<BTreeSet<String>> {
    match side {
        Side::Client => Ok((**def.client_exposed()).clone()),
        Side::Host => {
            for method in &def.marked_exposed {
                if !def.has_method(method) {
                    return Err(Error::NotCallable {
                        component: def.name().to_string(),
                        method: method.clone(),
                    });
                }
            }
            Ok(def.marked_exposed.clone())
        }
    }
}

#[derive(Default)]
pub struct Registry {
    order: Vec<Arc<Definition>>,
    by_name: HashMap<String, Arc<Definition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a definition and freezes its exposed-method table.
    pub fn register(&mut self, mut def: Definition) -> Result<()> {
        if self.by_name.contains_key(def.name()) {
            return Err(Error::Duplicate(def.name().to_string()));
        }

        def.host_exposed = resolve_exposed_methods(&def, Side::Host)?;
        tracing::debug!(
            component = def.name(),
            host = def.host_exposed.len(),
            client = def.client_exposed().len(),
            "registered component"
        );

        let def = Arc::new(def);
        self.by_name.insert(def.name().to_string(), def.clone());
        self.order.push(def);
        Ok(())
    }

    /// Checks cross-definition references once everything is registered.
    pub fn validate(&self) -> Result<()> {
        for def in &self.order {
            for include in def.includes() {
                if !self.by_name.contains_key(include) {
                    return Err(Error::UnknownInclude {
                        component: def.name().to_string(),
                        include: include.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Definition>> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All definitions in registration order.
    pub fn definitions(&self) -> impl Iterator<Item = &Arc<Definition>> {
        self.order.iter()
    }

    /// Library definitions in registration order.
    pub fn libraries(&self) -> impl Iterator<Item = &Arc<Definition>> {
        self.order.iter().filter(|def| def.kind() == ComponentKind::Library)
    }

    pub fn exposed(&self, component: &str, side: Side) -> Result<BTreeSet<String>> {
        let def = self.get(component)
            .ok_or_else(|| Error::UnknownComponent(component.to_string()))?;
        match side {
            Side::Host => Ok(def.host_exposed().clone()),
            Side::Client => resolve_exposed_methods(def, side),
        }
    }

    /// The requested components plus their transitive includes, each listed
    /// once and after everything it includes.
    ///
    /// Discovery is breadth-first with a visited set, so include cycles
    /// terminate.
    pub fn dependency_order<'a, I>(&self, requested: I) -> Result<Vec<Arc<Definition>>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut discovered: Vec<Arc<Definition>> = Vec::new();
        let mut visited = HashSet::new();
        let mut frontier = VecDeque::new();

        for name in requested {
            if visited.insert(name.to_string()) {
                frontier.push_back(name.to_string());
            }
        }

        while let Some(name) = frontier.pop_front() {
            let def = self.get(&name)
                .ok_or_else(|| Error::UnknownComponent(name.clone()))?;
            for include in def.includes() {
                if visited.insert(include.clone()) {
                    frontier.push_back(include.clone());
                }
            }
            discovered.push(def.clone());
        }

        // Emit a component once all of its includes have been emitted.
        let mut placed: HashSet<String> = HashSet::new();
        let mut remaining: Vec<Arc<Definition>> = discovered.into_iter().rev().collect();
        let mut ordered = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let before = remaining.len();
            let mut index = 0;
            while index < remaining.len() {
                let ready = remaining[index].includes().iter().all(|inc| placed.contains(inc));
                if ready {
                    let def = remaining.remove(index);
                    placed.insert(def.name().to_string());
                    ordered.push(def);
                    index = 0;
                } else {
                    index += 1;
                }
            }

            if remaining.len() == before {
                // Cycle: break it at the most deeply discovered member.
                let def = remaining.remove(0);
                tracing::warn!(component = def.name(), "include cycle");
                placed.insert(def.name().to_string());
                ordered.push(def);
            }
        }

        Ok(ordered)
    }
}
