mod driver;
mod tunnel;

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use morph_proto::config::{decode_key, load_client_config};
use morph_proto::control::SealedControlCipher;
use morph_proto::net::{bind_udp, resolve};
use rand::rngs::StdRng;
use rand::SeedableRng;

use driver::{Endpoints, Timers};
use tunnel::{StopReason, TunnelClient, TunnelConfig, TunnelSecurity};

#[derive(Parser)]
#[command(name = "morph-client", about = "Morph client: disguises local WireGuard traffic on its way to a relay")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/morph/client.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load config
    let config = load_client_config(&cli.config)?;

    // Setup logging
    let log_level = cli.log_level.as_deref()
        .unwrap_or(&config.client.log_level);
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    tracing::info!("Morph client starting");

    let settings = &config.client;
    if settings.handshake_interval_ms == 0
        || settings.heartbeat_interval_sec == 0
        || settings.inactivity_check_sec == 0
    {
        return Err("client timer intervals must be positive".into());
    }

    let security = if config.security.enabled {
        Some(TunnelSecurity {
            psk: decode_key(&config.security.psk)?,
            max_age: config.security.max_age_sec,
        })
    } else {
        None
    };
    let tunnel_config = TunnelConfig {
        user_id: config.user.id.clone(),
        layer: config.obfuscation.layer,
        max_padding: config.obfuscation.padding_length,
        max_retries: settings.max_retries,
        inactivity_timeout: Duration::from_secs(settings.inactivity_timeout_sec),
        security,
    };
    let timers = Timers {
        handshake: Duration::from_millis(settings.handshake_interval_ms),
        heartbeat: Duration::from_secs(settings.heartbeat_interval_sec),
        inactivity_check: Duration::from_secs(settings.inactivity_check_sec),
    };

    let endpoints = Endpoints {
        relay: resolve(&config.server.address, config.server.port).await?,
        wireguard: resolve(&config.wireguard.address, config.wireguard.port).await?,
    };

    let cipher = Arc::new(SealedControlCipher::from_base64(&config.control.key)?);
    let client = TunnelClient::new(tunnel_config, cipher, StdRng::from_entropy())?;

    // WireGuard's peer endpoint must point at this socket
    let unspecified: IpAddr = if endpoints.relay.is_ipv6() {
        Ipv6Addr::UNSPECIFIED.into()
    } else {
        Ipv4Addr::UNSPECIFIED.into()
    };
    let bind_addr = SocketAddr::new(unspecified, settings.listen_port);
    let socket = bind_udp(bind_addr)?;
    tracing::info!("Point the WireGuard peer endpoint at 127.0.0.1:{}", socket.local_addr()?.port());

    let reason = driver::run_tunnel(socket, client, endpoints, timers, shutdown_signal()).await?;

    match reason {
        StopReason::Requested => {
            tracing::info!("Morph client stopped");
            Ok(())
        }
        other => Err(format!("tunnel stopped: {}", other).into()),
    }
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
