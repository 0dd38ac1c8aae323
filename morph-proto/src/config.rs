/// Configuration parsing for client and server.
use serde::Deserialize;
use std::path::Path;

// ── Client config ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub server: ServerAddress,
    #[serde(default)]
    pub user: UserConfig,
    #[serde(default)]
    pub wireguard: WireGuardConfig,
    pub control: ControlConfig,
    #[serde(default)]
    pub obfuscation: ObfuscationConfig,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerAddress {
    pub address: String,
    #[serde(default = "default_handshake_port")]
    pub port: u16,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ObfuscationConfig {
    #[serde(default = "default_layer")]
    pub layer: u8,
    #[serde(default = "default_padding_length")]
    pub padding_length: u8,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            layer: default_layer(),
            padding_length: default_padding_length(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ClientSettings {
    /// Local UDP port WireGuard sends to; 0 picks an ephemeral one.
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_handshake_interval_ms")]
    pub handshake_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_sec: u64,
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_sec: u64,
    #[serde(default = "default_inactivity_check")]
    pub inactivity_check_sec: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            listen_port: 0,
            max_retries: default_max_retries(),
            handshake_interval_ms: default_handshake_interval_ms(),
            heartbeat_interval_sec: default_heartbeat_interval(),
            inactivity_timeout_sec: default_inactivity_timeout(),
            inactivity_check_sec: default_inactivity_check(),
            log_level: default_log_level(),
        }
    }
}

// ── Server config ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerListenConfig,
    #[serde(default)]
    pub wireguard: WireGuardConfig,
    pub control: ControlConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerListenConfig {
    #[serde(default = "default_listen_addr")]
    pub listen: String,
    #[serde(default = "default_handshake_port")]
    pub port: u16,
    /// Reported alongside usage so multi-relay deployments can be told apart.
    #[serde(default = "default_host_name")]
    pub host_name: String,
    /// TCP port of the HTTP health endpoint; off when unset.
    #[serde(default)]
    pub health_port: Option<u16>,
}

impl Default for ServerListenConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            port: default_handshake_port(),
            host_name: default_host_name(),
            health_port: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_sec: u64,
    #[serde(default = "default_traffic_flush")]
    pub traffic_flush_sec: u64,
    #[serde(default = "default_handshake_limit")]
    pub handshake_limit: usize,
    #[serde(default = "default_handshake_window_ms")]
    pub handshake_window_ms: u64,
    #[serde(default = "default_packet_limit")]
    pub packet_limit: usize,
    #[serde(default = "default_packet_window_ms")]
    pub packet_window_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            session_timeout_sec: default_session_timeout(),
            traffic_flush_sec: default_traffic_flush(),
            handshake_limit: default_handshake_limit(),
            handshake_window_ms: default_handshake_window_ms(),
            packet_limit: default_packet_limit(),
            packet_window_ms: default_packet_window_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Shared sections ──────────────────────────────────────────────────

/// Local WireGuard-compatible endpoint.
#[derive(Debug, Deserialize)]
pub struct WireGuardConfig {
    #[serde(default = "default_wg_address")]
    pub address: String,
    #[serde(default = "default_wg_port")]
    pub port: u16,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            address: default_wg_address(),
            port: default_wg_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ControlConfig {
    /// Base64 32-byte key shared by client and relay.
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Base64 32-byte pre-shared secret mixed into per-session key derivation.
    #[serde(default)]
    pub psk: String,
    #[serde(default = "default_max_age")]
    pub max_age_sec: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            psk: String::new(),
            max_age_sec: default_max_age(),
        }
    }
}

// ── Defaults ─────────────────────────────────────────────────────────

fn default_handshake_port() -> u16 {
    12301
}
fn default_listen_addr() -> String {
    "0.0.0.0".into()
}
fn default_host_name() -> String {
    "relay".into()
}
fn default_wg_address() -> String {
    "127.0.0.1".into()
}
fn default_wg_port() -> u16 {
    51820
}
fn default_layer() -> u8 {
    3
}
fn default_padding_length() -> u8 {
    8
}
fn default_max_retries() -> u32 {
    5
}
fn default_handshake_interval_ms() -> u64 {
    5000
}
fn default_heartbeat_interval() -> u64 {
    120
}
fn default_inactivity_timeout() -> u64 {
    30
}
fn default_inactivity_check() -> u64 {
    10
}
fn default_max_sessions() -> usize {
    256
}
fn default_session_timeout() -> u64 {
    1200
}
fn default_traffic_flush() -> u64 {
    600
}
fn default_handshake_limit() -> usize {
    10
}
fn default_handshake_window_ms() -> u64 {
    60_000
}
fn default_packet_limit() -> usize {
    1000
}
fn default_packet_window_ms() -> u64 {
    1000
}
fn default_max_age() -> u64 {
    crate::security::DEFAULT_MAX_AGE_SECS
}
fn default_log_level() -> String {
    "warn".into()
}

// ── Loaders ──────────────────────────────────────────────────────────

pub fn load_client_config(path: &Path) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let config: ClientConfig = toml::from_str(&content)?;
    Ok(config)
}

pub fn load_server_config(path: &Path) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let config: ServerConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Length every base64 key in the config files must decode to.
pub const KEY_LEN: usize = 32;

/// Decode base64 key from config string into raw bytes.
pub fn decode_key(key_str: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD.decode(key_str.trim())?;
    if bytes.len() != KEY_LEN {
        return Err(format!("key must be {} bytes, got {}", KEY_LEN, bytes.len()).into());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_server_config_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [control]
            key = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 12301);
        assert_eq!(config.server.listen, "0.0.0.0");
        assert_eq!(config.wireguard.address, "127.0.0.1");
        assert_eq!(config.wireguard.port, 51820);
        assert_eq!(config.limits.max_sessions, 256);
        assert_eq!(config.limits.session_timeout_sec, 1200);
        assert_eq!(config.limits.traffic_flush_sec, 600);
        assert_eq!(config.limits.handshake_limit, 10);
        assert_eq!(config.limits.packet_window_ms, 1000);
        assert!(!config.security.enabled);
        assert_eq!(config.security.max_age_sec, 300);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.server.health_port, None);
    }

    #[test]
    fn test_health_port() {
        let config: ServerConfig = toml::from_str(
            r#"
            [server]
            health_port = 8080

            [control]
            key = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
            "#,
        )
        .unwrap();
        assert_eq!(config.server.health_port, Some(8080));
        assert_eq!(config.server.port, 12301);
    }

    #[test]
    fn test_client_config_overrides() {
        let config: ClientConfig = toml::from_str(
            r#"
            [server]
            address = "203.0.113.7"

            [user]
            id = "alice"

            [control]
            key = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="

            [obfuscation]
            layer = 4
            padding_length = 2

            [client]
            heartbeat_interval_sec = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 12301);
        assert_eq!(config.user.id, "alice");
        assert_eq!(config.obfuscation.layer, 4);
        assert_eq!(config.obfuscation.padding_length, 2);
        assert_eq!(config.client.heartbeat_interval_sec, 15);
        assert_eq!(config.client.max_retries, 5);
        assert_eq!(config.client.handshake_interval_ms, 5000);
        assert_eq!(config.client.inactivity_timeout_sec, 30);
    }

    #[test]
    fn test_missing_control_key_is_an_error() {
        assert!(toml::from_str::<ServerConfig>("[server]\nport = 1\n").is_err());
    }

    #[test]
    fn test_decode_key() {
        let key = decode_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap();
        assert_eq!(key, vec![0u8; KEY_LEN]);
        assert!(decode_key(" AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=\n").is_ok());
        // Valid base64, wrong length
        assert!(decode_key("AQID").is_err());
        assert!(decode_key("").is_err());
        assert!(decode_key("!!").is_err());
    }
}
