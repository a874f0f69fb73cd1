//! # Frames
//!
//! The three shapes that make up a wire exchange.
//!
//! ## Invariants
//!
//! - A [`Packet`] never reorders its commands; index `i` on the wire is the
//!   `i`-th command buffered.
//! - An [`ExecResult`] holds a value or an error, never both. Decoding rejects
//!   slots that violate this.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::COMMUNICATIONS;
use crate::INSTALL_COMPONENTS;
use crate::REPLY;
use crate::REQUEST_REFRESH;
use crate::error::Result;
use crate::error::RpcError;
use crate::install::InstallPayload;

/// One cross-boundary method invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub comp: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(rename = "replyId", default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<u64>,
}

impl Command {
    pub fn new(comp: impl Into<String>, cmd: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            comp: comp.into(),
            cmd: cmd.into(),
            args,
            reply_id: None,
        }
    }

    /// Asks the receiving side to answer with a `reply` carrying `id`.
    pub fn with_reply(mut self, id: u64) -> Self {
        self.reply_id = Some(id);
        self
    }

    /// The synthetic command a host sends when the peer must reload.
    pub fn refresh() -> Self {
        Self::new(COMMUNICATIONS, REQUEST_REFRESH, Vec::new())
    }

    /// Carries an install payload to the peer.
    pub fn install(payload: &InstallPayload) -> Result<Self> {
        let payload = serde_json::to_value(payload).map_err(RpcError::Serialization)?;
        Ok(Self::new(COMMUNICATIONS, INSTALL_COMPONENTS, vec![payload]))
    }

    /// Answers the command that was tagged with `reply_id`.
    pub fn reply(reply_id: u64, result: ExecResult) -> Self {
        let ExecResult { value, err } = result;
        let err = err.map(Value::String).unwrap_or(Value::Null);
        Self::new(COMMUNICATIONS, REPLY, vec![Value::from(reply_id), value, err])
    }

    pub fn is_communication(&self) -> bool {
        self.comp == COMMUNICATIONS
    }

    pub fn is_reply(&self) -> bool {
        self.is_communication() && self.cmd == REPLY
    }

    pub fn is_refresh(&self) -> bool {
        self.is_communication() && self.cmd == REQUEST_REFRESH
    }

    /// Splits a `reply` command back into its correlation id and outcome.
    pub fn parse_reply(&self) -> Result<(u64, ExecResult)> {
        if !self.is_reply() {
            return Err(RpcError::BadReply(format!("{}.{} is not a reply", self.comp, self.cmd)));
        }

        let id = self.args.first()
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::BadReply("missing reply id".into()))?;
        let value = self.args.get(1).cloned().unwrap_or(Value::Null);
        let result = match self.args.get(2) {
            None | Some(Value::Null) => ExecResult::ok(value),
            Some(Value::String(err)) => ExecResult::err(err.clone()),
            Some(other) => ExecResult::err(other.to_string()),
        };

        Ok((id, result))
    }
}

/// Outcome of executing one command: a value, or a sanitized error marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResult", into = "RawResult")]
pub struct ExecResult {
    value: Value,
    err: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RawResult {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    err: Option<String>,
}

impl TryFrom<RawResult> for ExecResult {
    type Error = String;

    fn try_from(raw: RawResult) -> std::result::Result<Self, Self::Error> {
        if raw.err.is_some() && !raw.value.is_null() {
            return Err("result carries both a value and an error".into());
        }
        Ok(Self { value: raw.value, err: raw.err })
    }
}

impl From<ExecResult> for RawResult {
    fn from(result: ExecResult) -> Self {
        Self { value: result.value, err: result.err }
    }
}

impl ExecResult {
    pub fn ok(value: Value) -> Self {
        Self { value, err: None }
    }

    pub fn err(marker: impl Into<String>) -> Self {
        Self { value: Value::Null, err: Some(marker.into()) }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn error(&self) -> Option<&str> {
        self.err.as_deref()
    }

    pub fn into_result(self) -> std::result::Result<Value, String> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.value),
        }
    }
}

/// One batch of commands, plus results aligned with the inbound batch it answers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(rename = "commandExecutionResults", default)]
    pub command_execution_results: Option<Vec<Option<ExecResult>>>,
}

impl Packet {
    pub fn new(commands: Vec<Command>, results: Option<Vec<Option<ExecResult>>>) -> Self {
        Self { commands, command_execution_results: results }
    }

    /// A packet whose only content is the forced-reload command.
    pub fn refresh() -> Self {
        Self::new(vec![Command::refresh()], None)
    }

    /// A packet whose only content is one synthetic error result.
    pub fn failure(marker: &str) -> Self {
        Self::new(Vec::new(), Some(vec![Some(ExecResult::err(marker))]))
    }

    pub fn results(&self) -> &[Option<ExecResult>] {
        self.command_execution_results.as_deref().unwrap_or(&[])
    }

    pub fn is_refresh(&self) -> bool {
        self.commands.len() == 1 && self.commands[0].is_refresh()
    }
}
