//! # Component Definitions
//!
//! A [`Definition`] is the static, process-wide description of one component:
//! its name, its kind, the three method bundles and the names each side may
//! call across the boundary. Definitions are built once with a typed
//! [`DefinitionBuilder`] and are immutable after registration.
//!
//! ## Type erasure
//!
//! The builder is generic over the component's private state `S`. Handlers are
//! erased to operate on `dyn Any + Send` and downcast on entry, so a session
//! can hold instances of many different components in one map.

use std::any::Any;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use duorpc::ComponentKind;
use duorpc::WireDefinition;

use crate::context::Context;
use crate::context::Extensions;

pub type MethodFuture<'a> = BoxFuture<'a, anyhow::Result<Value>>;
pub type HookFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;

type State = dyn Any + Send;

type ErasedMethod = Box<dyn for<'a> Fn(&'a mut State, &'a mut Context, Vec<Value>) -> MethodFuture<'a> + Send + Sync>;
type ErasedHook = Box<dyn for<'a> Fn(&'a mut State, &'a mut Context) -> HookFuture<'a> + Send + Sync>;
type ErasedConstruct = Box<dyn Fn(&mut State, &Construct<'_>) -> anyhow::Result<()> + Send + Sync>;
type Factory = Box<dyn Fn() -> Box<State> + Send + Sync>;
type Gate = Box<dyn Fn(&GateInput<'_>) -> bool + Send + Sync>;

fn method_fn<F>(f: F) -> F
where
    F: for<'a> Fn(&'a mut State, &'a mut Context, Vec<Value>) -> MethodFuture<'a>,
{
    f
}

fn hook_fn<F>(f: F) -> F
where
    F: for<'a> Fn(&'a mut State, &'a mut Context) -> HookFuture<'a>,
{
    f
}

fn construct_fn<F>(f: F) -> F
where
    F: for<'a, 'b, 'c> Fn(&'a mut State, &'b Construct<'c>) -> anyhow::Result<()>,
{
    f
}

fn mismatch<'a, T: Send + 'a>(component: &str) -> BoxFuture<'a, anyhow::Result<T>> {
    let message = format!("state of '{}' has an unexpected type", component);
    async move { Err(anyhow::anyhow!(message)) }.boxed()
}

/// What a one-time constructor hook gets to see.
pub struct Construct<'a> {
    pub session_id: &'a str,
    pub extensions: &'a Extensions,
}

/// What a gate predicate gets to see when deciding on a lazy install.
pub struct GateInput<'a> {
    pub session_id: &'a str,
    pub installed: &'a [String],
    pub extensions: &'a Extensions,
}

/// Which bundle a method came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bundle {
    /// Shared base, present on both sides; always callable by the peer.
    Shared,
    /// Host side.
    Host,
}

pub(crate) struct Method {
    pub(crate) bundle: Bundle,
    handler: ErasedMethod,
}

impl Method {
    pub(crate) fn call<'a>(&self, state: &'a mut State, ctx: &'a mut Context, args: Vec<Value>) -> MethodFuture<'a> {
        (self.handler)(state, ctx, args)
    }
}

/// The lifecycle hooks a component may define.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    /// Once per session, when the peer first bootstraps.
    NewClient,
    /// After bootstrap, and again whenever a session is resynchronized.
    BootstrapReady,
    /// After a lazy install, once the instance is in place.
    Ready,
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewClient => write!(f, "on_new_client"),
            Self::BootstrapReady => write!(f, "on_bootstrap_ready"),
            Self::Ready => write!(f, "on_ready"),
        }
    }
}

#[derive(Default)]
struct Hooks {
    construct: Option<ErasedConstruct>,
    new_client: Option<ErasedHook>,
    bootstrap_ready: Option<ErasedHook>,
    ready: Option<ErasedHook>,
}

pub struct Definition {
    name: String,
    kind: ComponentKind,
    includes: Vec<String>,
    resources: Vec<String>,
    methods: HashMap<String, Method>,
    /// Names the builder flagged as callable by the peer. Checked at registration.
    pub(crate) marked_exposed: BTreeSet<String>,
    /// Filled by the ledger once the marks are known to be sound.
    pub(crate) host_exposed: BTreeSet<String>,
    client_exposed: Arc<BTreeSet<String>>,
    factory: Factory,
    hooks: Hooks,
    gate: Option<Gate>,
}

impl std::fmt::Debug for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("includes", &self.includes)
            .field("host_exposed", &self.host_exposed)
            .field("client_exposed", &self.client_exposed)
            .finish_non_exhaustive()
    }
}

impl Definition {
    /// A component installed eagerly in every session.
    pub fn library<S, F>(name: impl Into<String>, factory: F) -> DefinitionBuilder<S>
    where
        S: Any + Send,
        F: Fn() -> S + Send + Sync + 'static,
    {
        DefinitionBuilder::new(name.into(), ComponentKind::Library, factory)
    }

    /// A component installed on demand.
    pub fn feature<S, F>(name: impl Into<String>, factory: F) -> DefinitionBuilder<S>
    where
        S: Any + Send,
        F: Fn() -> S + Send + Sync + 'static,
    {
        DefinitionBuilder::new(name.into(), ComponentKind::Feature, factory)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub(crate) fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Methods the peer may invoke on the host side.
    pub fn host_exposed(&self) -> &BTreeSet<String> {
        &self.host_exposed
    }

    /// Methods the host may invoke on the peer side.
    pub fn client_exposed(&self) -> &Arc<BTreeSet<String>> {
        &self.client_exposed
    }

    pub fn has_hook(&self, hook: Hook) -> bool {
        self.hook(hook).is_some()
    }

    fn hook(&self, hook: Hook) -> Option<&ErasedHook> {
        match hook {
            Hook::NewClient => self.hooks.new_client.as_ref(),
            Hook::BootstrapReady => self.hooks.bootstrap_ready.as_ref(),
            Hook::Ready => self.hooks.ready.as_ref(),
        }
    }

    pub(crate) fn instantiate(&self) -> Box<State> {
        (self.factory)()
    }

    pub(crate) fn construct(&self, state: &mut State, input: &Construct<'_>) -> anyhow::Result<()> {
        match &self.hooks.construct {
            Some(construct) => construct(state, input),
            None => Ok(()),
        }
    }

    /// Runs `hook` if the component defines it.
    pub(crate) fn run_hook<'a>(&self, hook: Hook, state: &'a mut State, ctx: &'a mut Context) -> HookFuture<'a> {
        match self.hook(hook) {
            Some(run) => run(state, ctx),
            None => async { Ok(()) }.boxed(),
        }
    }

    /// Whether the gate (if any) lets this component into the session.
    pub fn admits(&self, input: &GateInput<'_>) -> bool {
        self.gate.as_ref().is_none_or(|gate| gate(input))
    }

    /// The data-only half of the definition, as sent to the peer.
    pub fn to_wire(&self) -> WireDefinition {
        let shared_methods = self.methods.iter()
            .filter(|(_, m)| m.bundle == Bundle::Shared)
            .map(|(name, _)| name.clone())
            .collect::<BTreeSet<_>>();

        WireDefinition {
            name: self.name.clone(),
            kind: self.kind,
            includes: self.includes.clone(),
            shared_methods: shared_methods.into_iter().collect(),
            host_methods: self.host_exposed.iter().cloned().collect(),
            client_methods: self.client_exposed.iter().cloned().collect(),
            resources: self.resources.clone(),
        }
    }
}

/// Typed construction of a [`Definition`].
///
/// ```ignore
/// let counter = Definition::library("Counter", || 0i64)
///     .expose("increment", |n: &mut i64, _ctx, args| async move {
///         *n += args.first().and_then(|v| v.as_i64()).unwrap_or(1);
///         Ok(json!(*n))
///     }.boxed())
///     .client_methods(["render"])
///     .build();
/// ```
pub struct DefinitionBuilder<S> {
    def: Definition,
    _state: PhantomData<fn() -> S>,
}

impl<S: Any + Send> DefinitionBuilder<S> {
    fn new<F>(name: String, kind: ComponentKind, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        let def = Definition {
            name,
            kind,
            includes: Vec::new(),
            resources: Vec::new(),
            methods: HashMap::new(),
            marked_exposed: BTreeSet::new(),
            host_exposed: BTreeSet::new(),
            client_exposed: Arc::new(BTreeSet::new()),
            factory: Box::new(move || Box::new(factory()) as Box<State>),
            hooks: Hooks::default(),
            gate: None,
        };
        Self { def, _state: PhantomData }
    }

    fn add<F>(mut self, name: &str, bundle: Bundle, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a mut Context, Vec<Value>) -> MethodFuture<'a> + Send + Sync + 'static,
    {
        let component = self.def.name.clone();
        let handler = method_fn(move |state, ctx, args| match state.downcast_mut::<S>() {
            Some(state) => f(state, ctx, args),
            None => mismatch(&component),
        });
        self.def.methods.insert(name.to_string(), Method { bundle, handler: Box::new(handler) });
        self
    }

    fn erase_hook<F>(&self, f: F) -> ErasedHook
    where
        F: for<'a> Fn(&'a mut S, &'a mut Context) -> HookFuture<'a> + Send + Sync + 'static,
    {
        let component = self.def.name.clone();
        Box::new(hook_fn(move |state, ctx| match state.downcast_mut::<S>() {
            Some(state) => f(state, ctx),
            None => mismatch(&component),
        }))
    }

    /// Adds a method to the shared-base bundle. Shared methods are exposed.
    pub fn shared<F>(mut self, name: &str, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a mut Context, Vec<Value>) -> MethodFuture<'a> + Send + Sync + 'static,
    {
        self.def.marked_exposed.insert(name.to_string());
        self.add(name, Bundle::Shared, f)
    }

    /// Adds a host-side method only the host itself may call.
    pub fn method<F>(self, name: &str, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a mut Context, Vec<Value>) -> MethodFuture<'a> + Send + Sync + 'static,
    {
        self.add(name, Bundle::Host, f)
    }

    /// Adds a host-side method and marks it callable by the peer.
    pub fn expose<F>(mut self, name: &str, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a mut Context, Vec<Value>) -> MethodFuture<'a> + Send + Sync + 'static,
    {
        self.def.marked_exposed.insert(name.to_string());
        self.add(name, Bundle::Host, f)
    }

    /// Marks already-added (or later-added) methods as callable by the peer.
    pub fn mark_exposed<I, T>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.def.marked_exposed.extend(names.into_iter().map(Into::into));
        self
    }

    /// Peer-side methods the host may call through the proxy.
    pub fn client_methods<I, T>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut set = (*self.def.client_exposed).clone();
        set.extend(names.into_iter().map(Into::into));
        self.def.client_exposed = Arc::new(set);
        self
    }

    /// Components that must be installed before this one.
    pub fn includes<I, T>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.def.includes.contains(&name) {
                self.def.includes.push(name);
            }
        }
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.def.resources.push(resource.into());
        self
    }

    /// Restricts lazy installation to sessions the predicate admits.
    pub fn gate<F>(mut self, f: F) -> Self
    where
        F: Fn(&GateInput<'_>) -> bool + Send + Sync + 'static,
    {
        self.def.gate = Some(Box::new(f));
        self
    }

    /// One-time constructor, run when the instance is created.
    pub fn on_construct<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &Construct<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let component = self.def.name.clone();
        self.def.hooks.construct = Some(Box::new(construct_fn(move |state, input| {
            match state.downcast_mut::<S>() {
                Some(state) => f(state, input),
                None => Err(anyhow::anyhow!("state of '{}' has an unexpected type", component)),
            }
        })));
        self
    }

    pub fn on_new_client<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a mut Context) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.def.hooks.new_client = Some(self.erase_hook(f));
        self
    }

    pub fn on_bootstrap_ready<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a mut Context) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.def.hooks.bootstrap_ready = Some(self.erase_hook(f));
        self
    }

    pub fn on_ready<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a mut Context) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.def.hooks.ready = Some(self.erase_hook(f));
        self
    }

    pub fn build(self) -> Definition {
        self.def
    }
}
