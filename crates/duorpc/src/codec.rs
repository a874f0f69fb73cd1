//! # Codec
//!
//! JSON encoding for every frame. Decoding is strict about shape and lenient
//! about omitted optional fields.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::error::RpcError;
use crate::frame::Packet;
use crate::install::BootstrapRequest;
use crate::install::InstallPayload;
use crate::install::InstallRequest;

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(RpcError::Serialization)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(RpcError::Malformed)
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>> {
    encode(packet)
}

pub fn decode_packet(bytes: &[u8]) -> Result<Packet> {
    decode(bytes)
}

pub fn encode_install(payload: &InstallPayload) -> Result<Vec<u8>> {
    encode(payload)
}

pub fn decode_install(bytes: &[u8]) -> Result<InstallPayload> {
    decode(bytes)
}

pub fn encode_bootstrap(request: &BootstrapRequest) -> Result<Vec<u8>> {
    encode(request)
}

/// An empty body is a bootstrap without initial features.
pub fn decode_bootstrap(bytes: &[u8]) -> Result<BootstrapRequest> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(BootstrapRequest::default());
    }
    decode(bytes)
}

pub fn encode_install_request(request: &InstallRequest) -> Result<Vec<u8>> {
    encode(request)
}

pub fn decode_install_request(bytes: &[u8]) -> Result<InstallRequest> {
    decode(bytes)
}
