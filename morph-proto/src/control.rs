/// Control channel: encrypted handshake, response and teardown strings
/// exchanged on the relay's rendezvous port.
///
/// Every control datagram is `seal(plaintext)`, where the plaintext is
/// either one of the bare strings `close`, `inactivity`, `server_full`, or a
/// JSON handshake request/response.
use crate::error::{Error, Result};
use crate::ids::ClientId;
use crate::obfuscator::{FunctionInitializer, ObfuscationParams};
use crate::security::SALT_LEN;
use crate::template::{TemplateId, TemplateParams, WireTemplateParams};
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

pub const CONTROL_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

const CLOSE: &str = "close";
const INACTIVITY: &str = "inactivity";
const SERVER_FULL: &str = "server_full";

// ── Cipher ───────────────────────────────────────────────────────────

/// Symmetric protection for control strings.
pub trait ControlCipher: Send + Sync {
    fn seal(&self, plaintext: &str) -> String;
    fn open(&self, sealed: &str) -> Result<String>;
}

/// ChaCha20-Poly1305 with a random nonce; output is
/// `base64(nonce || ciphertext || tag)`.
pub struct SealedControlCipher {
    cipher: ChaCha20Poly1305,
}

impl SealedControlCipher {
    pub fn new(key: &[u8; CONTROL_KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn from_base64(key: &str) -> Result<Self> {
        let bytes = Base64
            .decode(key.trim())
            .map_err(|e| Error::Config(format!("control key is not base64: {}", e)))?;
        let key: [u8; CONTROL_KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            Error::Config(format!(
                "control key must be {} bytes, got {}",
                CONTROL_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self::new(&key))
    }
}

impl ControlCipher for SealedControlCipher {
    fn seal(&self, plaintext: &str) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        // Encryption only fails for inputs past the cipher's length limit
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Base64.encode(out)
    }

    fn open(&self, sealed: &str) -> Result<String> {
        let raw = Base64.decode(sealed.trim()).map_err(|_| Error::ControlDecrypt)?;
        if raw.len() < NONCE_LEN {
            return Err(Error::ControlDecrypt);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::ControlDecrypt)?;
        String::from_utf8(plaintext).map_err(|_| Error::ControlDecrypt)
    }
}

// ── Handshake ────────────────────────────────────────────────────────

/// Client → relay session request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    pub key: u8,
    pub obfuscation_layer: u8,
    pub random_padding: u8,
    pub fn_initor: FunctionInitializer,
    pub template_id: u8,
    #[serde(default)]
    pub template_params: WireTemplateParams,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub public_key: String,
}

impl HandshakeRequest {
    pub fn new(
        client_id: ClientId,
        obfuscation: &ObfuscationParams,
        template: TemplateParams,
        user_id: &str,
    ) -> Self {
        Self {
            client_id,
            key: obfuscation.key,
            obfuscation_layer: obfuscation.layer,
            random_padding: obfuscation.max_padding,
            fn_initor: obfuscation.initializer.clone(),
            template_id: template.id().as_u8(),
            template_params: template.to_wire(),
            user_id: user_id.to_string(),
            public_key: String::new(),
        }
    }

    pub fn obfuscation_params(&self) -> ObfuscationParams {
        ObfuscationParams {
            key: self.key,
            layer: self.obfuscation_layer,
            max_padding: self.random_padding,
            initializer: self.fn_initor.clone(),
        }
    }

    /// Check everything a session needs before anything is allocated.
    pub fn validate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<(ObfuscationParams, TemplateParams)> {
        let obfuscation = self.obfuscation_params();
        obfuscation.validate()?;
        let id = TemplateId::from_u8(self.template_id)?;
        let template = TemplateParams::from_wire(id, &self.template_params, rng)?;
        Ok((obfuscation, template))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeStatus {
    Connected,
    Reconnected,
}

/// Relay → client answer naming the session's dedicated port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub port: u16,
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    pub status: HandshakeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_nonce: Option<u32>,
}

impl HandshakeResponse {
    pub fn with_security(mut self, salt: &[u8; SALT_LEN], nonce: u32) -> Self {
        self.session_salt = Some(Base64.encode(salt));
        self.server_nonce = Some(nonce);
        self
    }

    /// Decoded `(salt, nonce)` when the relay enabled packet security.
    pub fn security(&self) -> Result<Option<([u8; SALT_LEN], u32)>> {
        let (Some(salt), Some(nonce)) = (&self.session_salt, self.server_nonce) else {
            return Ok(None);
        };
        let bytes = Base64
            .decode(salt)
            .map_err(|e| Error::Handshake(format!("sessionSalt is not base64: {}", e)))?;
        let salt: [u8; SALT_LEN] = bytes.as_slice().try_into().map_err(|_| Error::InvalidLength {
            expected: SALT_LEN,
            actual: bytes.len(),
        })?;
        Ok(Some((salt, nonce)))
    }
}

// ── Messages ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Close,
    Inactivity,
    ServerFull,
    Handshake(Box<HandshakeRequest>),
    Response(HandshakeResponse),
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            Self::Close => CLOSE.to_string(),
            Self::Inactivity => INACTIVITY.to_string(),
            Self::ServerFull => SERVER_FULL.to_string(),
            Self::Handshake(req) => serde_json::to_string(req)
                .map_err(|e| Error::Handshake(e.to_string()))?,
            Self::Response(resp) => serde_json::to_string(resp)
                .map_err(|e| Error::Handshake(e.to_string()))?,
        })
    }

    pub fn decode(plaintext: &str) -> Result<Self> {
        match plaintext {
            CLOSE => return Ok(Self::Close),
            INACTIVITY => return Ok(Self::Inactivity),
            SERVER_FULL => return Ok(Self::ServerFull),
            _ => {}
        }
        let value: serde_json::Value =
            serde_json::from_str(plaintext).map_err(|e| Error::Handshake(e.to_string()))?;
        // Responses are the only messages carrying a status
        if value.get("status").is_some() {
            serde_json::from_value(value)
                .map(Self::Response)
                .map_err(|e| Error::Handshake(e.to_string()))
        } else {
            serde_json::from_value(value)
                .map(|req| Self::Handshake(Box::new(req)))
                .map_err(|e| Error::Handshake(e.to_string()))
        }
    }

    pub fn seal(&self, cipher: &dyn ControlCipher) -> Result<Vec<u8>> {
        Ok(cipher.seal(&self.encode()?).into_bytes())
    }

    /// Decrypt and parse a datagram. Any failure means "not a control
    /// message"; the caller may still treat it as data.
    pub fn open(cipher: &dyn ControlCipher, datagram: &[u8]) -> Result<Self> {
        let sealed = std::str::from_utf8(datagram).map_err(|_| Error::ControlDecrypt)?;
        Self::decode(&cipher.open(sealed)?)
    }
}
