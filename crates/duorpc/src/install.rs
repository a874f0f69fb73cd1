//! # Installation Payloads
//!
//! Data-only descriptions of components. A peer receives these and wires up its
//! own pre-compiled counterparts; nothing executable is transmitted.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// When a component is installed into a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Installed eagerly for every session at bootstrap.
    Library,
    /// Installed lazily, on request.
    Feature,
}

/// The wire-transmissible half of a component definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDefinition {
    pub name: String,
    pub kind: ComponentKind,
    #[serde(default)]
    pub includes: Vec<String>,
    /// Methods of the shared-base bundle, present on both sides.
    #[serde(default)]
    pub shared_methods: Vec<String>,
    /// Host methods the peer may call.
    #[serde(default)]
    pub host_methods: Vec<String>,
    /// Peer methods the host may call.
    #[serde(default)]
    pub client_methods: Vec<String>,
    /// External resources (stylesheets, assets) the peer should load.
    #[serde(default)]
    pub resources: Vec<String>,
}

/// What the host hands the peer after bootstrap or a lazy install.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallPayload {
    pub defs: Vec<WireDefinition>,
    #[serde(default)]
    pub ctor_arguments: Vec<Value>,
}

impl InstallPayload {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.defs.iter().map(|def| def.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

/// First request of a session: which feature components to install up front.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    #[serde(default)]
    pub features: Vec<String>,
}

/// A peer asking for feature components after bootstrap.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub components: Vec<String>,
}
