/// Socket and timer loop around [`TunnelClient`].
///
/// One UDP socket talks to the local WireGuard endpoint, the relay's
/// rendezvous port and the relay's session port; the source address says
/// which handler a datagram goes to.
use crate::tunnel::{Outbound, StopReason, Target, TunnelClient};
use morph_proto::net::MAX_DATAGRAM;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    /// Relay rendezvous address; session ports share its IP.
    pub relay: SocketAddr,
    pub wireguard: SocketAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct Timers {
    pub handshake: Duration,
    pub heartbeat: Duration,
    pub inactivity_check: Duration,
}

/// Drive `client` until it stops on its own or `shutdown` resolves.
pub async fn run_tunnel<F: Future<Output = ()>>(
    socket: UdpSocket,
    mut client: TunnelClient,
    endpoints: Endpoints,
    timers: Timers,
    shutdown: F,
) -> io::Result<StopReason> {
    tokio::pin!(shutdown);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut handshake = every(timers.handshake);
    let mut heartbeat = every(timers.heartbeat);
    let mut inactivity = every(timers.inactivity_check);

    tracing::info!(
        "Tunnel on {} -> relay {}, WireGuard {}",
        socket.local_addr()?,
        endpoints.relay,
        endpoints.wireguard
    );

    let mut pending = client.start(Instant::now());
    loop {
        for out in pending.drain(..) {
            send(&socket, &endpoints, out).await;
        }
        if let Some(reason) = client.stop_reason() {
            tracing::info!("Client {} stopped: {}", client.client_id(), reason);
            return Ok(reason);
        }

        pending = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, from)) => dispatch(&mut client, &endpoints, &buf[..n], from),
                Err(e) => {
                    tracing::debug!("Recv error: {}", e);
                    Vec::new()
                }
            },
            _ = handshake.tick() => client.on_handshake_timer(Instant::now()),
            _ = heartbeat.tick() => client.on_heartbeat_timer(Instant::now()),
            _ = inactivity.tick() => client.on_inactivity_check(Instant::now()),
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                client.stop(Instant::now())
            }
        };
    }
}

fn every(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn dispatch(
    client: &mut TunnelClient,
    endpoints: &Endpoints,
    data: &[u8],
    from: SocketAddr,
) -> Vec<Outbound> {
    let now = Instant::now();
    if from == endpoints.wireguard {
        return client.on_wireguard(data, now);
    }
    if from.ip() == endpoints.relay.ip() {
        if from.port() == endpoints.relay.port() {
            return client.on_control(data, now);
        }
        if client.session_port() == Some(from.port()) {
            return client.on_relay_data(data, now);
        }
    }
    tracing::debug!("Ignoring {} bytes from unknown peer {}", data.len(), from);
    Vec::new()
}

async fn send(socket: &UdpSocket, endpoints: &Endpoints, out: Outbound) {
    let to = match out.target {
        Target::Rendezvous => endpoints.relay,
        Target::Session(port) => SocketAddr::new(endpoints.relay.ip(), port),
        Target::WireGuard => endpoints.wireguard,
    };
    if let Err(e) = socket.send_to(&out.data, to).await {
        tracing::debug!("Send to {} failed: {}", to, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelConfig;
    use morph_proto::control::{
        ControlMessage, HandshakeResponse, HandshakeStatus, SealedControlCipher,
    };
    use morph_proto::net::bind_udp;
    use morph_proto::{Obfuscator, ProtocolTemplate};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    const KEY: [u8; 32] = [0x33; 32];
    const WAIT: Duration = Duration::from_secs(5);

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Minimal relay: answers the handshake, then echoes every data packet
    /// back from the session socket. Control messages after the handshake
    /// are reported on `seen`.
    async fn fake_relay(rendezvous: UdpSocket, seen: mpsc::UnboundedSender<ControlMessage>) {
        let cipher = SealedControlCipher::new(&KEY);
        let session = bind_udp(loopback()).unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        let (request, client) = loop {
            let (n, from) = rendezvous.recv_from(&mut buf).await.unwrap();
            if let Ok(ControlMessage::Handshake(req)) = ControlMessage::open(&cipher, &buf[..n]) {
                break (req, from);
            }
        };
        let (params, template) = request.validate(&mut StdRng::seed_from_u64(1)).unwrap();
        let mut obfuscator = Obfuscator::new(&params).unwrap();
        let mut template = ProtocolTemplate::from_params(template);

        let response = HandshakeResponse {
            port: session.local_addr().unwrap().port(),
            client_id: request.client_id,
            status: HandshakeStatus::Connected,
            session_salt: None,
            server_nonce: None,
        };
        let sealed = ControlMessage::Response(response).seal(&cipher).unwrap();
        rendezvous.send_to(&sealed, client).await.unwrap();

        let mut control_buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                Ok((n, from)) = session.recv_from(&mut buf) => {
                    let Some(inner) = template.decapsulate(&buf[..n]) else { continue };
                    if inner == [morph_proto::template::HEARTBEAT] {
                        continue;
                    }
                    let payload = obfuscator.deobfuscate(inner).unwrap();
                    let packet = template.encapsulate(&obfuscator.obfuscate(&payload), &request.client_id);
                    template.update_state();
                    session.send_to(&packet, from).await.unwrap();
                }
                Ok((n, _)) = rendezvous.recv_from(&mut control_buf) => {
                    match ControlMessage::open(&cipher, &control_buf[..n]) {
                        // Late handshake retransmissions
                        Ok(ControlMessage::Handshake(_)) | Err(_) => {}
                        Ok(message) => {
                            let _ = seen.send(message);
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_wireguard_roundtrip_and_close_on_shutdown() {
        let rendezvous = bind_udp(loopback()).unwrap();
        let relay = rendezvous.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(fake_relay(rendezvous, seen_tx));

        let wireguard = bind_udp(loopback()).unwrap();
        let endpoints = Endpoints {
            relay,
            wireguard: wireguard.local_addr().unwrap(),
        };
        let socket = bind_udp(loopback()).unwrap();
        let tunnel_addr = socket.local_addr().unwrap();

        let config = TunnelConfig {
            user_id: "driver-test".into(),
            layer: 2,
            max_padding: 4,
            max_retries: 5,
            inactivity_timeout: Duration::from_secs(30),
            security: None,
        };
        let client = TunnelClient::new(
            config,
            Arc::new(SealedControlCipher::new(&KEY)),
            StdRng::seed_from_u64(2),
        )
        .unwrap();
        let timers = Timers {
            handshake: Duration::from_millis(200),
            heartbeat: Duration::from_secs(60),
            inactivity_check: Duration::from_secs(10),
        };
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let tunnel = tokio::spawn(run_tunnel(socket, client, endpoints, timers, async {
            let _ = stop_rx.await;
        }));

        // Packets sent before the handshake completes are dropped, so keep
        // sending until the echo comes back
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let echoed = timeout(WAIT, async {
            loop {
                wireguard.send_to(b"handshake-initiation", tunnel_addr).await.unwrap();
                if let Ok(Ok((n, _))) =
                    timeout(Duration::from_millis(100), wireguard.recv_from(&mut buf)).await
                {
                    break buf[..n].to_vec();
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(echoed, b"handshake-initiation");

        stop_tx.send(()).unwrap();
        let reason = timeout(WAIT, tunnel).await.unwrap().unwrap().unwrap();
        assert_eq!(reason, StopReason::Requested);

        let message = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(message, ControlMessage::Close);
    }

    #[tokio::test]
    async fn test_gives_up_without_relay() {
        // Nobody answers on this port
        let silent = bind_udp(loopback()).unwrap();
        let endpoints = Endpoints {
            relay: silent.local_addr().unwrap(),
            wireguard: "127.0.0.1:9".parse().unwrap(),
        };
        let config = TunnelConfig {
            user_id: String::new(),
            layer: 1,
            max_padding: 1,
            max_retries: 2,
            inactivity_timeout: Duration::from_secs(30),
            security: None,
        };
        let client = TunnelClient::new(
            config,
            Arc::new(SealedControlCipher::new(&KEY)),
            StdRng::seed_from_u64(3),
        )
        .unwrap();
        let timers = Timers {
            handshake: Duration::from_millis(50),
            heartbeat: Duration::from_secs(60),
            inactivity_check: Duration::from_secs(10),
        };
        let socket = bind_udp(loopback()).unwrap();
        let reason = timeout(
            WAIT,
            run_tunnel(socket, client, endpoints, timers, std::future::pending()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reason, StopReason::MaxRetries);
    }
}
