//! Session identifiers: the 16-byte client ID and the short protocol-native
//! header ID derived from it.

use crate::error::{Error, Result};
use crate::template::TemplateId;
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const CLIENT_ID_LEN: usize = 16;
pub const MIN_HEADER_ID_LEN: usize = 4;
pub const MAX_HEADER_ID_LEN: usize = 8;

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

// ── ClientId ─────────────────────────────────────────────────────────

/// Random per-identity session key; regenerated on every rotation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub [u8; CLIENT_ID_LEN]);

impl ClientId {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; CLIENT_ID_LEN];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; CLIENT_ID_LEN] = bytes.try_into().map_err(|_| Error::InvalidLength {
            expected: CLIENT_ID_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        Base64.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = Base64
            .decode(s.trim())
            .map_err(|e| Error::Handshake(format!("clientID is not base64: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Prefix of the client ID that `template` embeds in its header.
    pub fn header_id(&self, template: TemplateId) -> HeaderId {
        HeaderId::from_prefix(&self.0, template.header_id_len())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ClientId::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

// ── HeaderId ─────────────────────────────────────────────────────────

/// 4-8 byte routing key read straight out of a template header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderId {
    len: u8,
    bytes: [u8; MAX_HEADER_ID_LEN],
}

impl HeaderId {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if !(MIN_HEADER_ID_LEN..=MAX_HEADER_ID_LEN).contains(&bytes.len()) {
            return None;
        }
        Some(Self::from_prefix(bytes, bytes.len()))
    }

    fn from_prefix(bytes: &[u8], len: usize) -> Self {
        let mut buf = [0u8; MAX_HEADER_ID_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self { len: len as u8, bytes: buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Display for HeaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, self.as_bytes())
    }
}

impl fmt::Debug for HeaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeaderId(")?;
        write_hex(f, self.as_bytes())?;
        write!(f, ")")
    }
}
