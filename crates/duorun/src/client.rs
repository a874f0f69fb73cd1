//! # Peer Endpoint
//!
//! A Rust implementation of the session-scoped side of the protocol: it batches
//! calls to the host, sends them with the right headers, runs whatever the host
//! sends back on locally registered handlers and answers reply-tagged commands
//! on the next flush.
//!
//! The peer never receives code. `installComponents` only tells it which of its
//! own pre-registered handlers are now live.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use duorpc::BootstrapRequest;
use duorpc::Command;
use duorpc::Envelope;
use duorpc::ExecResult;
use duorpc::Headers;
use duorpc::InstallPayload;
use duorpc::InstallRequest;
use duorpc::Packet;
use duorpc::RpcError;
use duorpc::WireDefinition;
use duorpc::markers;

use crate::buffer::PacketBuffer;
use crate::transport::Transport;
use crate::transport::TransportError;

#[derive(Debug)]
pub enum Error {
    Transport(TransportError),
    Rpc(RpcError),
    /// No identity yet; bootstrap first.
    NotBootstrapped,
    /// The host told this peer to reload.
    RefreshRequested,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Rpc(e) => write!(f, "RPC error: {}", e),
            Self::NotBootstrapped => write!(f, "Client has not bootstrapped"),
            Self::RefreshRequested => write!(f, "Host requested a refresh"),
        }
    }
}

impl std::error::Error for Error {}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type Handler = Box<dyn FnMut(Vec<Value>) -> anyhow::Result<Value> + Send>;

pub struct Client {
    session_id: String,
    version: String,
    transport: Arc<dyn Transport>,
    identity: Option<String>,
    definitions: Vec<WireDefinition>,
    handlers: HashMap<(String, String), Handler>,
    outbound: PacketBuffer,
    /// Send the installed list with the next exchange.
    resuming: bool,
    refresh_requested: bool,
}

impl Client {
    pub fn new(session_id: impl Into<String>, version: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            session_id: session_id.into(),
            version: version.into(),
            transport,
            identity: None,
            definitions: Vec::new(),
            handlers: HashMap::new(),
            outbound: PacketBuffer::new(),
            resuming: false,
            refresh_requested: false,
        }
    }

    /// Registers the local implementation of a peer-side method.
    pub fn on<F>(&mut self, component: &str, method: &str, handler: F) -> &mut Self
    where
        F: FnMut(Vec<Value>) -> anyhow::Result<Value> + Send + 'static,
    {
        self.handlers.insert((component.to_string(), method.to_string()), Box::new(handler));
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Adopts a token obtained out of band, e.g. after a host rotation.
    pub fn set_identity(&mut self, identity: impl Into<String>) {
        self.identity = Some(identity.into());
    }

    pub fn installed(&self) -> Vec<String> {
        self.definitions.iter().map(|def| def.name.clone()).collect()
    }

    pub fn definition(&self, component: &str) -> Option<&WireDefinition> {
        self.definitions.iter().find(|def| def.name == component)
    }

    pub fn refresh_requested(&self) -> bool {
        self.refresh_requested
    }

    pub fn pending(&self) -> &[Command] {
        self.outbound.pending()
    }

    pub async fn bootstrap(&mut self, features: &[&str]) -> Result<InstallPayload> {
        let request = BootstrapRequest {
            features: features.iter().map(|f| f.to_string()).collect(),
        };
        let body = duorpc::encode_bootstrap(&request)?;
        let bytes = self.transport.bootstrap(&self.session_id, body).await?;
        let payload = duorpc::decode_install(&bytes)?;
        self.apply_install(&payload);
        Ok(payload)
    }

    /// Starts over against a host that lost this session. The next exchange
    /// carries the installed list so the host can rebuild instead of refreshing.
    pub fn resume(&mut self) {
        self.resuming = true;
        self.refresh_requested = false;
    }

    /// Buffers a call to a host method and returns its index in the next batch.
    pub fn call(&mut self, component: &str, method: &str, args: Vec<Value>) -> usize {
        self.outbound.buffer_command(Command::new(component, method, args))
    }

    /// Sends the buffered batch and runs the host's commands from the answer.
    /// Returns the results for the commands that were sent, in order.
    ///
    /// If the batch never reaches the host it stays buffered for the next flush.
    pub async fn flush(&mut self) -> Result<Vec<Option<ExecResult>>> {
        let headers = self.headers()?;
        let packet = Packet::new(self.outbound.pending().to_vec(), None);
        let envelope = Envelope::wrap(headers, &packet)?;

        let bytes = self.transport.deliver(&self.session_id, envelope).await?;
        self.outbound.reset();
        let response = duorpc::decode_packet(&bytes)?;
        self.resuming = false;

        let results = response.command_execution_results.clone().unwrap_or_default();
        self.run_inbound(response);

        if self.refresh_requested {
            return Err(Error::RefreshRequested);
        }
        Ok(results)
    }

    /// Asks the host for feature components.
    pub async fn request_install(&mut self, components: &[&str]) -> Result<InstallPayload> {
        let request = InstallRequest {
            components: components.iter().map(|c| c.to_string()).collect(),
        };
        let envelope = Envelope::new(self.headers()?, duorpc::encode_install_request(&request)?);
        let bytes = self.transport.install(&self.session_id, envelope).await?;
        let payload = duorpc::decode_install(&bytes)?;
        self.apply_install(&payload);
        Ok(payload)
    }

    /// Runs host commands that arrived on a push channel.
    pub fn receive(&mut self, packet: Packet) {
        self.run_inbound(packet);
    }

    fn headers(&self) -> Result<Headers> {
        let identity = self.identity.clone().ok_or(Error::NotBootstrapped)?;
        let headers = Headers::new(identity, self.version.as_str());
        if self.resuming {
            Ok(headers.with_installed(self.installed()))
        } else {
            Ok(headers)
        }
    }

    fn apply_install(&mut self, payload: &InstallPayload) {
        if let Some(identity) = payload.ctor_arguments.first()
            .and_then(|args| args.get("identity"))
            .and_then(Value::as_str)
        {
            self.identity = Some(identity.to_string());
        }

        for def in &payload.defs {
            if self.definition(&def.name).is_none() {
                tracing::debug!(session = %self.session_id, component = %def.name, "peer installed component");
                self.definitions.push(def.clone());
            }
        }
    }

    fn run_inbound(&mut self, packet: Packet) {
        for command in packet.commands {
            let result = self.run_command(&command);
            if let Some(reply_id) = command.reply_id {
                self.outbound.buffer_command(Command::reply(reply_id, result));
            }
        }
    }

    fn run_command(&mut self, command: &Command) -> ExecResult {
        if command.is_refresh() {
            tracing::info!(session = %self.session_id, "host requested refresh");
            self.refresh_requested = true;
            return ExecResult::ok(Value::Null);
        }

        if command.is_communication() {
            if command.cmd == duorpc::INSTALL_COMPONENTS {
                let parsed = command.args.first()
                    .cloned()
                    .map(serde_json::from_value::<InstallPayload>);
                return match parsed {
                    Some(Ok(payload)) => {
                        self.apply_install(&payload);
                        ExecResult::ok(Value::Null)
                    }
                    _ => ExecResult::err(markers::PROTOCOL),
                };
            }
            return ExecResult::err(markers::UNKNOWN_COMMAND);
        }

        let key = (command.comp.clone(), command.cmd.clone());
        let Some(handler) = self.handlers.get_mut(&key) else {
            tracing::warn!(session = %self.session_id, component = %command.comp, method = %command.cmd, "no handler");
            return ExecResult::err(markers::UNKNOWN_COMMAND);
        };

        match handler(command.args.clone()) {
            Ok(value) => ExecResult::ok(value),
            Err(e) => {
                tracing::warn!(session = %self.session_id, error = %e, "handler failed");
                ExecResult::err(markers::INTERNAL)
            }
        }
    }
}
