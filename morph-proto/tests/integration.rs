/// Integration test: full datagram pipeline on a single machine.
///
/// 1. Start a fake WireGuard endpoint (UDP echo)
/// 2. Start a minimal relay: one rendezvous socket, one dedicated session socket
/// 3. Handshake as a client over the encrypted control channel
/// 4. Push datagrams through obfuscate → encapsulate → relay → WireGuard and back
///
/// Run: cargo test -p morph-proto --test integration -- --nocapture
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use morph_proto::control::{
    ControlMessage, HandshakeRequest, HandshakeResponse, HandshakeStatus, SealedControlCipher,
};
use morph_proto::net::{bind_udp, MAX_DATAGRAM};
use morph_proto::security::{SecureChannel, SessionKeys, DEFAULT_MAX_AGE_SECS};
use morph_proto::selector::TemplateFactory;
use morph_proto::template::{ProtocolTemplate, TemplateId, TemplateParams, HEARTBEAT};
use morph_proto::{ClientId, ObfuscationParams, Obfuscator};
use rand::rngs::StdRng;
use rand::SeedableRng;

const TEST_KEY: [u8; 32] = *b"integration-control-key-32bytes!";
const TIMEOUT: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Fake WireGuard: sends every datagram straight back.
async fn run_echo_wireguard(socket: UdpSocket) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        socket.send_to(&buf[..n], from).await.unwrap();
    }
}

/// Simplified relay: accept one handshake, then shuttle between the client
/// and WireGuard on a dedicated socket.
async fn run_test_relay(rendezvous: UdpSocket, wg_addr: SocketAddr) {
    let cipher = SealedControlCipher::new(&TEST_KEY);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    let (request, client_addr) = loop {
        let (n, from) = rendezvous.recv_from(&mut buf).await.unwrap();
        if let Ok(ControlMessage::Handshake(req)) = ControlMessage::open(&cipher, &buf[..n]) {
            break (req, from);
        }
    };

    let mut rng = StdRng::seed_from_u64(99);
    let (obfs_params, template_params) = request.validate(&mut rng).unwrap();
    let mut obfuscator = Obfuscator::new(&obfs_params).unwrap();
    let mut template = ProtocolTemplate::from_params(template_params);
    let header_id = request.client_id.header_id(template.id());

    let session = bind_udp(loopback()).unwrap();
    let response = HandshakeResponse {
        port: session.local_addr().unwrap().port(),
        client_id: request.client_id,
        status: HandshakeStatus::Connected,
        session_salt: None,
        server_nonce: None,
    };
    let sealed = ControlMessage::Response(response).seal(&cipher).unwrap();
    rendezvous.send_to(&sealed, client_addr).await.unwrap();

    let mut client_addr = client_addr;
    loop {
        let (n, from) = session.recv_from(&mut buf).await.unwrap();
        if from == wg_addr {
            let packet = template.encapsulate(&obfuscator.obfuscate(&buf[..n]), &request.client_id);
            template.update_state();
            session.send_to(&packet, client_addr).await.unwrap();
            continue;
        }
        if template.extract_header_id(&buf[..n]) != Some(header_id) {
            continue;
        }
        client_addr = from;
        let Some(inner) = template.decapsulate(&buf[..n]) else { continue };
        if inner == [HEARTBEAT] {
            continue;
        }
        let payload = obfuscator.deobfuscate(inner).unwrap();
        session.send_to(&payload, wg_addr).await.unwrap();
    }
}

struct TestClient {
    socket: UdpSocket,
    client_id: ClientId,
    obfuscator: Obfuscator,
    template: ProtocolTemplate,
    session_addr: SocketAddr,
}

async fn handshake(relay: SocketAddr, template_id: TemplateId) -> TestClient {
    let cipher = SealedControlCipher::new(&TEST_KEY);
    let mut rng = StdRng::seed_from_u64(template_id.as_u8() as u64);
    let socket = bind_udp(loopback()).unwrap();

    let client_id = ClientId::generate(&mut rng);
    let obfs_params = ObfuscationParams::generate(&mut rng, 3, 8);
    let template_params = TemplateParams::random(template_id, &mut rng);
    let request = HandshakeRequest::new(client_id, &obfs_params, template_params, "integration");
    let sealed = ControlMessage::Handshake(Box::new(request)).seal(&cipher).unwrap();
    socket.send_to(&sealed, relay).await.unwrap();

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let (n, _) = timeout(TIMEOUT, socket.recv_from(&mut buf)).await.unwrap().unwrap();
    let response = match ControlMessage::open(&cipher, &buf[..n]).unwrap() {
        ControlMessage::Response(r) => r,
        other => panic!("expected response, got {:?}", other),
    };
    assert_eq!(response.status, HandshakeStatus::Connected);
    assert_eq!(response.client_id, client_id);

    TestClient {
        socket,
        client_id,
        obfuscator: Obfuscator::new(&obfs_params).unwrap(),
        template: ProtocolTemplate::from_params(template_params),
        session_addr: SocketAddr::new(relay.ip(), response.port),
    }
}

async fn start_pair() -> SocketAddr {
    let wg = bind_udp(loopback()).unwrap();
    let wg_addr = wg.local_addr().unwrap();
    tokio::spawn(run_echo_wireguard(wg));

    let rendezvous = bind_udp(loopback()).unwrap();
    let relay_addr = rendezvous.local_addr().unwrap();
    tokio::spawn(run_test_relay(rendezvous, wg_addr));
    relay_addr
}

#[tokio::test]
async fn test_full_tunnel_roundtrip_every_template() {
    for template_id in TemplateId::ALL {
        let relay_addr = start_pair().await;
        let mut client = handshake(relay_addr, template_id).await;

        let messages = [
            b"Hello, relay!".to_vec(),
            vec![0u8; 1],
            vec![0xA5; 1400],
            b"Final message".to_vec(),
        ];
        let mut buf = vec![0u8; MAX_DATAGRAM];

        // Heartbeats are swallowed by the relay
        let hb = client.template.encapsulate(&[HEARTBEAT], &client.client_id);
        client.template.update_state();
        client.socket.send_to(&hb, client.session_addr).await.unwrap();

        for (i, msg) in messages.iter().enumerate() {
            let packet = client
                .template
                .encapsulate(&client.obfuscator.obfuscate(msg), &client.client_id);
            client.template.update_state();
            client.socket.send_to(&packet, client.session_addr).await.unwrap();

            let (n, from) = timeout(TIMEOUT, client.socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(from, client.session_addr);
            let inner = client.template.decapsulate(&buf[..n]).expect("template mismatch");
            let echoed = client.obfuscator.deobfuscate(inner).unwrap();
            assert_eq!(&echoed, msg, "{} echo mismatch on message {}", template_id, i);
        }
        println!("✅ {} tunnel roundtrip passed", template_id);
    }
}

#[tokio::test]
async fn test_wrong_control_key_gets_no_session() {
    let relay_addr = start_pair().await;

    let wrong = SealedControlCipher::new(&[0u8; 32]);
    let mut rng = StdRng::seed_from_u64(1);
    let socket = bind_udp(loopback()).unwrap();
    let request = HandshakeRequest::new(
        ClientId::generate(&mut rng),
        &ObfuscationParams::generate(&mut rng, 2, 4),
        TemplateParams::random(TemplateId::Quic, &mut rng),
        "intruder",
    );
    let sealed = ControlMessage::Handshake(Box::new(request)).seal(&wrong).unwrap();
    socket.send_to(&sealed, relay_addr).await.unwrap();

    let mut buf = [0u8; 1024];
    let result = timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await;
    assert!(result.is_err(), "relay must stay silent for undecryptable handshakes");
}

#[tokio::test]
async fn test_secure_frames_inside_templates() {
    // Security framing sits between the obfuscator and the template
    let mut rng = StdRng::seed_from_u64(42);
    let factory = TemplateFactory::default();
    let client_id = ClientId::generate(&mut rng);
    let salt = SessionKeys::generate_salt(&mut rng);
    let keys = SessionKeys::derive(b"shared-psk", &client_id, &salt).unwrap();
    let nonce = 1234;

    let mut client_chan = SecureChannel::new(client_id, keys.clone(), nonce, DEFAULT_MAX_AGE_SECS);
    let mut relay_chan = SecureChannel::new(client_id, keys, nonce, DEFAULT_MAX_AGE_SECS);
    let obfs_params = ObfuscationParams::generate(&mut rng, 4, 8);
    let mut client_obfs = Obfuscator::new(&obfs_params).unwrap();
    let relay_obfs = Obfuscator::new(&obfs_params).unwrap();

    let a = Arc::new(bind_udp(loopback()).unwrap());
    let b = Arc::new(bind_udp(loopback()).unwrap());
    let b_addr = b.local_addr().unwrap();

    for _ in 0..8 {
        let id = factory.select_random(&mut rng);
        let mut template = factory.create(id.as_u8(), None, &mut rng).unwrap();
        let sealed = client_chan.seal(&client_obfs.obfuscate(b"wg-handshake-initiation")).unwrap();
        a.send_to(&template.encapsulate(&sealed, &client_id), b_addr).await.unwrap();
        template.update_state();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, _) = timeout(TIMEOUT, b.recv_from(&mut buf)).await.unwrap().unwrap();
        let inner = template.decapsulate(&buf[..n]).unwrap();
        let opened = relay_chan.open(inner).unwrap();
        assert_eq!(relay_obfs.deobfuscate(opened).unwrap(), b"wg-handshake-initiation");

        // Replaying the same datagram is rejected
        assert!(relay_chan.open(inner).is_err());
    }
}
