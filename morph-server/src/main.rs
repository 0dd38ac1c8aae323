mod accounting;
mod health;
mod index;
mod relay;
mod session;

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use morph_proto::config::{decode_key, load_server_config, ServerConfig};
use morph_proto::control::SealedControlCipher;
use morph_proto::net::resolve;

use accounting::LogReporter;
use health::HealthState;
use relay::{Relay, RelaySettings, SecuritySettings};

#[derive(Parser)]
#[command(name = "morph-server", about = "Morph relay: obfuscated UDP front for a WireGuard endpoint")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/morph/server.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load config
    let config = load_server_config(&cli.config)?;

    // Setup logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    tracing::info!("Morph relay starting");

    let settings = relay_settings(&config).await?;
    let cipher = Arc::new(SealedControlCipher::from_base64(&config.control.key)?);
    let reporter = Arc::new(LogReporter::new(config.server.host_name.clone()));

    tracing::info!(
        "Forwarding to WireGuard at {}, up to {} sessions, packet security {}",
        settings.wireguard,
        settings.max_sessions,
        if settings.security.is_some() { "on" } else { "off" }
    );

    let health_addr = config
        .server
        .health_port
        .map(|port| SocketAddr::new(settings.listen.ip(), port));
    let max_sessions = settings.max_sessions;

    let relay = Relay::bind(settings, cipher, reporter)?;
    let health = match health_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let state = Arc::new(HealthState::new(relay.session_gauge(), max_sessions));
            Some(tokio::spawn(async move {
                if let Err(e) = health::serve(listener, state).await {
                    tracing::error!("Health endpoint failed: {}", e);
                }
            }))
        }
        None => None,
    };

    relay.run(shutdown_signal()).await?;
    if let Some(task) = health {
        task.abort();
    }

    tracing::info!("Morph relay stopped");
    Ok(())
}

async fn relay_settings(config: &ServerConfig) -> Result<RelaySettings, Box<dyn std::error::Error>> {
    let listen_ip: IpAddr = config
        .server
        .listen
        .parse()
        .map_err(|e| format!("invalid listen address {:?}: {}", config.server.listen, e))?;
    let wireguard = resolve(&config.wireguard.address, config.wireguard.port).await?;

    let security = if config.security.enabled {
        Some(SecuritySettings {
            psk: decode_key(&config.security.psk)?,
            max_age: config.security.max_age_sec,
        })
    } else {
        None
    };

    let limits = &config.limits;
    if limits.session_timeout_sec == 0 || limits.traffic_flush_sec == 0 {
        return Err("limits.session_timeout_sec and limits.traffic_flush_sec must be positive".into());
    }
    // A zero limit or window would drop every datagram without a trace
    if limits.handshake_limit == 0 || limits.handshake_window_ms == 0 {
        return Err("limits.handshake_limit and limits.handshake_window_ms must be positive".into());
    }
    if limits.packet_limit == 0 || limits.packet_window_ms == 0 {
        return Err("limits.packet_limit and limits.packet_window_ms must be positive".into());
    }
    Ok(RelaySettings {
        listen: SocketAddr::new(listen_ip, config.server.port),
        wireguard,
        max_sessions: limits.max_sessions,
        session_timeout: Duration::from_secs(limits.session_timeout_sec),
        traffic_flush: Duration::from_secs(limits.traffic_flush_sec),
        handshake_limit: limits.handshake_limit,
        handshake_window: Duration::from_millis(limits.handshake_window_ms),
        packet_limit: limits.packet_limit,
        packet_window: Duration::from_millis(limits.packet_window_ms),
        security,
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to setup SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm.recv() => {},
    }
}
