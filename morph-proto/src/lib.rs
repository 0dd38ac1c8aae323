//! Core of the morph UDP tunnel: layered obfuscation, protocol camouflage
//! templates, packet security, admission control and the control channel.
//!
//! Everything here is sans-I/O except [`net`]; the `morph-server` and
//! `morph-client` binaries drive it from tokio sockets.

pub mod config;
pub mod control;
pub mod error;
pub mod functions;
pub mod ids;
pub mod net;
pub mod obfuscator;
pub mod rate_limit;
pub mod registry;
pub mod security;
pub mod selector;
pub mod template;

pub use error::{Error, Result};
pub use ids::{ClientId, HeaderId};
pub use obfuscator::{FunctionInitializer, ObfuscationParams, Obfuscator};
pub use template::{ProtocolTemplate, TemplateId, TemplateParams};
