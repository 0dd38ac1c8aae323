//! Error type shared by the protocol library and both binaries.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The function registry already holds the maximum number of pairs.
    #[error("function registry is full ({max} pairs)")]
    CapacityExceeded { max: usize },

    #[error("obfuscation layer {0} out of range 1-4")]
    InvalidLayer(u8),

    #[error("padding length {0} out of range 1-8")]
    InvalidPadding(u8),

    #[error("packet too short: need {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unknown template id {0}")]
    UnknownTemplateId(u8),

    /// Datagram does not carry the session template's header.
    #[error("packet does not match the {0} template")]
    TemplateMismatch(crate::template::TemplateId),

    /// Secure packet timestamp is outside the accepted age window.
    #[error("stale timestamp: {age}s old (max {max_age}s)")]
    StaleTimestamp { age: u64, max_age: u64 },

    #[error("replayed sequence {sequence} (last accepted {last})")]
    ReplayedSequence { sequence: u32, last: u32 },

    #[error("packet authentication failed")]
    AuthenticationFailed,

    #[error("control message could not be decrypted")]
    ControlDecrypt,

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
