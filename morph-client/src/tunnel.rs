/// Client tunnel state machine, free of sockets and clocks.
///
/// The driver feeds it datagrams and timer ticks with the current instant
/// and sends whatever [`Outbound`] datagrams it returns.
use morph_proto::control::{ControlCipher, ControlMessage, HandshakeRequest, HandshakeResponse};
use morph_proto::registry::{PermutationTables, STANDARD_FUNCTIONS};
use morph_proto::security::{SecureChannel, SessionKeys};
use morph_proto::selector::TemplateFactory;
use morph_proto::template::HEARTBEAT;
use morph_proto::{ClientId, ObfuscationParams, Obfuscator, ProtocolTemplate, TemplateParams};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub user_id: String,
    pub layer: u8,
    pub max_padding: u8,
    /// Handshake retransmissions before giving up.
    pub max_retries: u32,
    pub inactivity_timeout: Duration,
    pub security: Option<TunnelSecurity>,
}

#[derive(Debug, Clone)]
pub struct TunnelSecurity {
    pub psk: Vec<u8>,
    pub max_age: u64,
}

/// Where an outbound datagram goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Relay rendezvous port: control traffic.
    Rendezvous,
    /// Relay session port from the handshake response.
    Session(u16),
    /// Local WireGuard endpoint.
    WireGuard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub target: Target,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    MaxRetries,
    ServerFull,
    Inactivity,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requested => "stopped",
            Self::MaxRetries => "no handshake response",
            Self::ServerFull => "relay is full",
            Self::Inactivity => "relay closed the session for inactivity",
        })
    }
}

#[derive(Debug)]
pub struct ActiveSession {
    pub port: u16,
    secure: Option<SecureChannel>,
    last_received: Instant,
}

#[derive(Debug)]
pub enum State {
    Idle,
    Handshaking { attempts: u32 },
    Active(ActiveSession),
    Stopped(StopReason),
}

/// Everything that rotates together: the client ID and the packet shape.
struct Identity {
    client_id: ClientId,
    params: ObfuscationParams,
    obfuscator: Obfuscator,
    template: ProtocolTemplate,
}

impl Identity {
    fn generate(
        config: &TunnelConfig,
        factory: &TemplateFactory,
        tables: &Arc<PermutationTables>,
        rng: &mut StdRng,
    ) -> morph_proto::Result<Self> {
        let client_id = ClientId::generate(rng);
        let params = ObfuscationParams::generate(rng, config.layer, config.max_padding);
        let obfuscator = Obfuscator::with_tables(&params, tables.clone())?
            .with_rng(StdRng::seed_from_u64(rng.gen()));
        let template_id = factory.select_random(rng);
        let template = ProtocolTemplate::from_params(TemplateParams::random(template_id, rng));
        Ok(Self {
            client_id,
            params,
            obfuscator,
            template,
        })
    }
}

pub struct TunnelClient {
    config: TunnelConfig,
    cipher: Arc<dyn ControlCipher>,
    factory: TemplateFactory,
    tables: Arc<PermutationTables>,
    rng: StdRng,
    identity: Identity,
    state: State,
}

impl TunnelClient {
    pub fn new(
        config: TunnelConfig,
        cipher: Arc<dyn ControlCipher>,
        mut rng: StdRng,
    ) -> morph_proto::Result<Self> {
        let factory = TemplateFactory::default();
        let tables = Arc::new(PermutationTables::build(STANDARD_FUNCTIONS));
        let identity = Identity::generate(&config, &factory, &tables, &mut rng)?;
        tracing::info!(
            "Client {} using {} template",
            identity.client_id,
            identity.template.id()
        );
        Ok(Self {
            config,
            cipher,
            factory,
            tables,
            rng,
            identity,
            state: State::Idle,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn client_id(&self) -> ClientId {
        self.identity.client_id
    }

    pub fn session_port(&self) -> Option<u16> {
        match &self.state {
            State::Active(session) => Some(session.port),
            _ => None,
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            State::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn start(&mut self, _now: Instant) -> Vec<Outbound> {
        if !matches!(self.state, State::Idle) {
            return Vec::new();
        }
        self.state = State::Handshaking { attempts: 0 };
        self.handshake().into_iter().collect()
    }

    /// Retransmit the handshake, or give up once the retries are spent.
    pub fn on_handshake_timer(&mut self, _now: Instant) -> Vec<Outbound> {
        let State::Handshaking { attempts } = &mut self.state else {
            return Vec::new();
        };
        *attempts += 1;
        if *attempts > self.config.max_retries {
            tracing::warn!("No handshake response after {} retries", self.config.max_retries);
            return self.finish(StopReason::MaxRetries);
        }
        tracing::debug!("Handshake retry {}", attempts);
        self.handshake().into_iter().collect()
    }

    /// A datagram from the relay's rendezvous port.
    pub fn on_control(&mut self, datagram: &[u8], now: Instant) -> Vec<Outbound> {
        let message = match ControlMessage::open(self.cipher.as_ref(), datagram) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("Unreadable control message: {}", e);
                return Vec::new();
            }
        };
        if matches!(self.state, State::Stopped(_) | State::Idle) {
            return Vec::new();
        }
        match message {
            ControlMessage::Response(response) => {
                self.on_response(response, now);
                Vec::new()
            }
            ControlMessage::ServerFull => {
                tracing::warn!("Relay refused the session: server full");
                self.finish(StopReason::ServerFull)
            }
            ControlMessage::Inactivity => {
                tracing::warn!("Relay closed the session for inactivity");
                self.finish(StopReason::Inactivity)
            }
            other => {
                tracing::debug!("Ignoring control message {:?}", other);
                Vec::new()
            }
        }
    }

    fn on_response(&mut self, response: HandshakeResponse, now: Instant) {
        if response.client_id != self.identity.client_id {
            tracing::warn!(
                "Handshake response for {} does not match client {}",
                response.client_id,
                self.identity.client_id
            );
            return;
        }
        let secure = match self.secure_channel(&response) {
            Ok(secure) => secure,
            Err(e) => {
                tracing::warn!("Unusable handshake response: {}", e);
                return;
            }
        };
        tracing::info!(
            "Session {} {:?} on relay port {}",
            self.identity.client_id,
            response.status,
            response.port
        );
        self.state = State::Active(ActiveSession {
            port: response.port,
            secure,
            last_received: now,
        });
    }

    fn secure_channel(&self, response: &HandshakeResponse) -> morph_proto::Result<Option<SecureChannel>> {
        match (response.security()?, &self.config.security) {
            (Some((salt, nonce)), Some(security)) => {
                let keys = SessionKeys::derive(&security.psk, &self.identity.client_id, &salt)?;
                Ok(Some(SecureChannel::new(
                    self.identity.client_id,
                    keys,
                    nonce,
                    security.max_age,
                )))
            }
            (None, None) => Ok(None),
            (Some(_), None) => Err(morph_proto::Error::Handshake(
                "relay requires packet security but no psk is configured".into(),
            )),
            (None, Some(_)) => Err(morph_proto::Error::Handshake(
                "packet security is enabled but the relay did not offer it".into(),
            )),
        }
    }

    /// A datagram from the relay's session port.
    pub fn on_relay_data(&mut self, packet: &[u8], now: Instant) -> Vec<Outbound> {
        let State::Active(session) = &mut self.state else {
            return Vec::new();
        };
        session.last_received = now;

        let Some(inner) = self.identity.template.decapsulate(packet) else {
            tracing::debug!("Relay packet does not match the {} template", self.identity.template.id());
            return Vec::new();
        };
        let body = match session.secure.as_mut() {
            Some(channel) => match channel.open(inner) {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!("Dropping relay packet: {}", e);
                    return Vec::new();
                }
            },
            None => inner,
        };
        match self.identity.obfuscator.deobfuscate(body) {
            Ok(data) => vec![Outbound {
                target: Target::WireGuard,
                data,
            }],
            Err(e) => {
                tracing::debug!("Dropping relay packet: {}", e);
                Vec::new()
            }
        }
    }

    /// A datagram from the local WireGuard endpoint.
    pub fn on_wireguard(&mut self, data: &[u8], _now: Instant) -> Vec<Outbound> {
        if !matches!(self.state, State::Active(_)) {
            tracing::trace!("No session yet, dropping {} bytes from WireGuard", data.len());
            return Vec::new();
        }
        let obfuscated = self.identity.obfuscator.obfuscate(data);
        self.session_packet(&obfuscated).into_iter().collect()
    }

    pub fn on_heartbeat_timer(&mut self, _now: Instant) -> Vec<Outbound> {
        if !matches!(self.state, State::Active(_)) {
            return Vec::new();
        }
        tracing::trace!("Heartbeat");
        self.session_packet(&[HEARTBEAT]).into_iter().collect()
    }

    /// Rotate to a fresh identity when the relay has been silent too long.
    pub fn on_inactivity_check(&mut self, now: Instant) -> Vec<Outbound> {
        let State::Active(session) = &self.state else {
            return Vec::new();
        };
        let silent = now.saturating_duration_since(session.last_received);
        if silent <= self.config.inactivity_timeout {
            return Vec::new();
        }
        tracing::warn!("Nothing from the relay for {:?}, rotating identity", silent);
        self.rotate();
        self.state = State::Handshaking { attempts: 0 };
        self.handshake().into_iter().collect()
    }

    /// Stop on request; tells the relay when a session may exist.
    pub fn stop(&mut self, _now: Instant) -> Vec<Outbound> {
        match self.state {
            State::Handshaking { .. } | State::Active(_) => self.finish(StopReason::Requested),
            State::Idle => {
                self.state = State::Stopped(StopReason::Requested);
                Vec::new()
            }
            State::Stopped(_) => Vec::new(),
        }
    }

    fn rotate(&mut self) {
        match Identity::generate(&self.config, &self.factory, &self.tables, &mut self.rng) {
            Ok(identity) => {
                tracing::info!(
                    "Rotated client {} -> {} ({} -> {})",
                    self.identity.client_id,
                    identity.client_id,
                    self.identity.template.id(),
                    identity.template.id()
                );
                self.identity = identity;
            }
            Err(e) => tracing::error!("Identity rotation failed, keeping current one: {}", e),
        }
    }

    fn finish(&mut self, reason: StopReason) -> Vec<Outbound> {
        self.state = State::Stopped(reason);
        self.control(&ControlMessage::Close).into_iter().collect()
    }

    fn handshake(&mut self) -> Option<Outbound> {
        let request = HandshakeRequest::new(
            self.identity.client_id,
            &self.identity.params,
            self.identity.template.params(),
            &self.config.user_id,
        );
        self.control(&ControlMessage::Handshake(Box::new(request)))
    }

    fn control(&self, message: &ControlMessage) -> Option<Outbound> {
        match message.seal(self.cipher.as_ref()) {
            Ok(data) => Some(Outbound {
                target: Target::Rendezvous,
                data,
            }),
            Err(e) => {
                tracing::error!("Failed to seal control message: {}", e);
                None
            }
        }
    }

    /// Secure frame (when negotiated) then template, for the session port.
    fn session_packet(&mut self, body: &[u8]) -> Option<Outbound> {
        let State::Active(session) = &mut self.state else {
            return None;
        };
        let inner = match session.secure.as_mut() {
            Some(channel) => match channel.seal(body) {
                Ok(sealed) => sealed,
                Err(e) => {
                    tracing::debug!("Failed to seal packet: {}", e);
                    return None;
                }
            },
            None => body.to_vec(),
        };
        let packet = self
            .identity
            .template
            .encapsulate(&inner, &self.identity.client_id);
        self.identity.template.update_state();
        Some(Outbound {
            target: Target::Session(session.port),
            data: packet,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_proto::control::{HandshakeStatus, SealedControlCipher};

    const KEY: [u8; 32] = [9; 32];
    const PORT: u16 = 40_000;

    fn config() -> TunnelConfig {
        TunnelConfig {
            user_id: "alice".into(),
            layer: 3,
            max_padding: 8,
            max_retries: 2,
            inactivity_timeout: Duration::from_secs(30),
            security: None,
        }
    }

    fn cipher() -> Arc<SealedControlCipher> {
        Arc::new(SealedControlCipher::new(&KEY))
    }

    fn client(config: TunnelConfig) -> TunnelClient {
        TunnelClient::new(config, cipher(), StdRng::seed_from_u64(11)).unwrap()
    }

    fn open_control(out: &Outbound) -> ControlMessage {
        assert_eq!(out.target, Target::Rendezvous);
        ControlMessage::open(&*cipher(), &out.data).unwrap()
    }

    fn handshake_request(out: &Outbound) -> HandshakeRequest {
        match open_control(out) {
            ControlMessage::Handshake(req) => *req,
            other => panic!("expected handshake, got {:?}", other),
        }
    }

    fn response_for(client_id: ClientId) -> Vec<u8> {
        let response = HandshakeResponse {
            port: PORT,
            client_id,
            status: HandshakeStatus::Connected,
            session_salt: None,
            server_nonce: None,
        };
        ControlMessage::Response(response).seal(&*cipher()).unwrap()
    }

    /// The relay's view of a session built from a handshake request.
    struct RelaySide {
        request: HandshakeRequest,
        obfuscator: Obfuscator,
        template: ProtocolTemplate,
    }

    impl RelaySide {
        fn from(request: HandshakeRequest) -> Self {
            let mut rng = StdRng::seed_from_u64(0);
            let (params, template) = request.validate(&mut rng).unwrap();
            Self {
                obfuscator: Obfuscator::new(&params).unwrap(),
                template: ProtocolTemplate::from_params(template),
                request,
            }
        }
    }

    fn active(now: Instant) -> (TunnelClient, RelaySide) {
        let mut c = client(config());
        let out = c.start(now);
        let relay = RelaySide::from(handshake_request(&out[0]));
        assert!(c.on_control(&response_for(c.client_id()), now).is_empty());
        assert_eq!(c.session_port(), Some(PORT));
        (c, relay)
    }

    #[test]
    fn test_start_sends_handshake() {
        let now = Instant::now();
        let mut c = client(config());
        let out = c.start(now);
        assert_eq!(out.len(), 1);
        let request = handshake_request(&out[0]);
        assert_eq!(request.client_id, c.client_id());
        assert_eq!(request.user_id, "alice");
        assert_eq!(request.obfuscation_layer, 3);
        assert!(matches!(c.state(), State::Handshaking { attempts: 0 }));

        // A second start is a no-op
        assert!(c.start(now).is_empty());
    }

    #[test]
    fn test_retries_then_gives_up() {
        let now = Instant::now();
        let mut c = client(config());
        c.start(now);
        assert_eq!(c.on_handshake_timer(now).len(), 1);
        assert_eq!(c.on_handshake_timer(now).len(), 1);

        let out = c.on_handshake_timer(now);
        assert_eq!(c.stop_reason(), Some(StopReason::MaxRetries));
        assert_eq!(open_control(&out[0]), ControlMessage::Close);
        assert!(c.on_handshake_timer(now).is_empty());
    }

    #[test]
    fn test_mismatched_response_is_ignored() {
        let now = Instant::now();
        let mut c = client(config());
        c.start(now);
        c.on_control(&response_for(ClientId([0xEE; 16])), now);
        assert!(matches!(c.state(), State::Handshaking { .. }));
    }

    #[test]
    fn test_active_data_path() {
        let now = Instant::now();
        let (mut c, mut relay) = active(now);

        // No more retransmissions once active
        assert!(c.on_handshake_timer(now).is_empty());

        let out = c.on_wireguard(b"wg-packet", now);
        assert_eq!(out[0].target, Target::Session(PORT));
        let inner = relay.template.decapsulate(&out[0].data).unwrap();
        assert_eq!(relay.obfuscator.deobfuscate(inner).unwrap(), b"wg-packet");

        let reply = relay
            .template
            .encapsulate(&relay.obfuscator.obfuscate(b"wg-reply"), &relay.request.client_id);
        relay.template.update_state();
        let out = c.on_relay_data(&reply, now);
        assert_eq!(
            out,
            vec![Outbound {
                target: Target::WireGuard,
                data: b"wg-reply".to_vec()
            }]
        );

        let hb = c.on_heartbeat_timer(now);
        assert_eq!(relay.template.decapsulate(&hb[0].data).unwrap(), [HEARTBEAT]);
    }

    #[test]
    fn test_wireguard_before_session_is_dropped() {
        let now = Instant::now();
        let mut c = client(config());
        c.start(now);
        assert!(c.on_wireguard(b"early", now).is_empty());
        assert!(c.on_heartbeat_timer(now).is_empty());
    }

    #[test]
    fn test_inactivity_rotates_identity() {
        let now = Instant::now();
        let (mut c, relay) = active(now);
        let old_id = c.client_id();

        assert!(c.on_inactivity_check(now + Duration::from_secs(30)).is_empty());
        let out = c.on_inactivity_check(now + Duration::from_secs(31));
        assert_eq!(out.len(), 1);
        let request = handshake_request(&out[0]);

        assert_ne!(c.client_id(), old_id);
        assert_eq!(request.client_id, c.client_id());
        assert_ne!(request.fn_initor, relay.request.fn_initor);
        assert!(matches!(c.state(), State::Handshaking { attempts: 0 }));
        assert_eq!(c.session_port(), None);
    }

    #[test]
    fn test_relay_traffic_defers_rotation() {
        let now = Instant::now();
        let (mut c, _) = active(now);
        c.on_relay_data(b"garbage", now + Duration::from_secs(20));
        assert!(c.on_inactivity_check(now + Duration::from_secs(40)).is_empty());
        assert_eq!(c.session_port(), Some(PORT));
    }

    #[test]
    fn test_relay_notices_stop_with_close() {
        for (message, reason) in [
            (ControlMessage::ServerFull, StopReason::ServerFull),
            (ControlMessage::Inactivity, StopReason::Inactivity),
        ] {
            let now = Instant::now();
            let (mut c, _) = active(now);
            let sealed = message.seal(&*cipher()).unwrap();
            let out = c.on_control(&sealed, now);
            assert_eq!(c.stop_reason(), Some(reason));
            assert_eq!(open_control(&out[0]), ControlMessage::Close);
        }
    }

    #[test]
    fn test_stop() {
        let now = Instant::now();
        let mut idle = client(config());
        assert!(idle.stop(now).is_empty());
        assert_eq!(idle.stop_reason(), Some(StopReason::Requested));

        let (mut c, _) = active(now);
        let out = c.stop(now);
        assert_eq!(open_control(&out[0]), ControlMessage::Close);
        assert!(c.stop(now).is_empty());
        assert!(c.on_wireguard(b"late", now).is_empty());
    }

    #[test]
    fn test_secure_session() {
        let now = Instant::now();
        let mut cfg = config();
        cfg.security = Some(TunnelSecurity {
            psk: b"psk".to_vec(),
            max_age: 300,
        });
        let mut c = client(cfg);
        let out = c.start(now);
        let mut relay = RelaySide::from(handshake_request(&out[0]));

        let salt = [3u8; 32];
        let keys = SessionKeys::derive(b"psk", &c.client_id(), &salt).unwrap();
        let mut relay_chan = SecureChannel::new(c.client_id(), keys, 77, 300);
        let response = HandshakeResponse {
            port: PORT,
            client_id: c.client_id(),
            status: HandshakeStatus::Connected,
            session_salt: None,
            server_nonce: None,
        }
        .with_security(&salt, 77);
        let sealed = ControlMessage::Response(response).seal(&*cipher()).unwrap();
        c.on_control(&sealed, now);
        assert_eq!(c.session_port(), Some(PORT));

        let out = c.on_wireguard(b"protected", now);
        let inner = relay.template.decapsulate(&out[0].data).unwrap();
        let body = relay_chan.open(inner).unwrap();
        assert_eq!(relay.obfuscator.deobfuscate(body).unwrap(), b"protected");

        let reply = relay_chan.seal(&relay.obfuscator.obfuscate(b"back")).unwrap();
        let packet = relay.template.encapsulate(&reply, &relay.request.client_id);
        relay.template.update_state();
        assert_eq!(c.on_relay_data(&packet, now)[0].data, b"back");
    }

    #[test]
    fn test_security_mismatch_keeps_handshaking() {
        let now = Instant::now();
        let mut cfg = config();
        cfg.security = Some(TunnelSecurity {
            psk: b"psk".to_vec(),
            max_age: 300,
        });
        let mut c = client(cfg);
        c.start(now);
        c.on_control(&response_for(c.client_id()), now);
        assert!(matches!(c.state(), State::Handshaking { .. }));
    }
}
