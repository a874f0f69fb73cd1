//! # Envelope
//!
//! Out-of-band metadata riding next to a packet body. Transports map these onto
//! whatever they have (HTTP headers, a frame prefix); the core only sees
//! [`Headers`].

use crate::codec;
use crate::error::Result;
use crate::frame::Packet;

pub const IDENTITY_HEADER: &str = "x-duo-identity";
pub const VERSION_HEADER: &str = "x-duo-version";
pub const INSTALLED_HEADER: &str = "x-duo-installed";

/// Metadata checked before any command executes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    /// Session-bound identity token issued at bootstrap.
    pub identity: Option<String>,
    /// Protocol version the peer was loaded with.
    pub version: Option<String>,
    /// Component ids the peer already has. Only sent when resuming a session.
    pub installed: Option<Vec<String>>,
}

impl Headers {
    pub fn new(identity: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            version: Some(version.into()),
            installed: None,
        }
    }

    pub fn with_installed(mut self, installed: Vec<String>) -> Self {
        self.installed = Some(installed);
        self
    }

    /// Reads headers from name/value pairs. Names match case-insensitively,
    /// unknown names are ignored.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut headers = Self::default();
        for (name, value) in pairs {
            if name.eq_ignore_ascii_case(IDENTITY_HEADER) {
                headers.identity = Some(value.to_string());
            } else if name.eq_ignore_ascii_case(VERSION_HEADER) {
                headers.version = Some(value.to_string());
            } else if name.eq_ignore_ascii_case(INSTALLED_HEADER) {
                let ids = value.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect();
                headers.installed = Some(ids);
            }
        }
        headers
    }

    /// The inverse of [`Headers::from_pairs`].
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(identity) = &self.identity {
            pairs.push((IDENTITY_HEADER, identity.clone()));
        }
        if let Some(version) = &self.version {
            pairs.push((VERSION_HEADER, version.clone()));
        }
        if let Some(installed) = &self.installed {
            pairs.push((INSTALLED_HEADER, installed.join(",")));
        }
        pairs
    }
}

/// One inbound exchange as handed over by a transport.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(headers: Headers, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// Wraps a packet for sending.
    pub fn wrap(headers: Headers, packet: &Packet) -> Result<Self> {
        Ok(Self::new(headers, codec::encode_packet(packet)?))
    }

    /// Unwraps the body as a packet.
    pub fn packet(&self) -> Result<Packet> {
        codec::decode_packet(&self.body)
    }
}
