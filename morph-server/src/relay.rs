/// The relay event loop.
///
/// One rendezvous socket takes handshakes, close messages and data from
/// clients that have not yet switched to their session port. Each admitted
/// session binds a dedicated socket that talks to both the client and the
/// local WireGuard endpoint. All session state lives in this task; the
/// per-session receive loops only forward what they read over a channel.
use crate::accounting::UsageReporter;
use crate::index::{DualIndex, RouteKey};
use crate::session::{Inbound, Session};
use morph_proto::control::{
    ControlCipher, ControlMessage, HandshakeRequest, HandshakeResponse, HandshakeStatus,
};
use morph_proto::net::{bind_udp, MAX_DATAGRAM};
use morph_proto::rate_limit::RateLimiter;
use morph_proto::registry::{PermutationTables, STANDARD_FUNCTIONS};
use morph_proto::security::{peek_client_id, SecureChannel, SessionKeys};
use morph_proto::template::header_id_candidates;
use morph_proto::{ClientId, Obfuscator, ProtocolTemplate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const EVENT_QUEUE: usize = 4096;

/// Runtime settings resolved from the server config.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub listen: SocketAddr,
    pub wireguard: SocketAddr,
    pub max_sessions: usize,
    /// Inactivity timeout, also the period of each session's check.
    pub session_timeout: Duration,
    pub traffic_flush: Duration,
    pub handshake_limit: usize,
    pub handshake_window: Duration,
    pub packet_limit: usize,
    pub packet_window: Duration,
    pub security: Option<SecuritySettings>,
}

#[derive(Debug, Clone)]
pub struct SecuritySettings {
    pub psk: Vec<u8>,
    pub max_age: u64,
}

/// What a session's receive loop hands back to the relay.
#[derive(Debug)]
pub enum SessionEvent {
    Datagram {
        client_id: ClientId,
        from: SocketAddr,
        data: Vec<u8>,
    },
    InactivityCheck {
        client_id: ClientId,
    },
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Close,
    Inactivity,
    Shutdown,
}

impl Teardown {
    fn as_str(self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::Inactivity => "inactivity",
            Self::Shutdown => "shutdown",
        }
    }
}

pub struct Relay {
    settings: RelaySettings,
    rendezvous: Arc<UdpSocket>,
    cipher: Arc<dyn ControlCipher>,
    reporter: Arc<dyn UsageReporter>,
    tables: Arc<PermutationTables>,
    index: DualIndex<Session>,
    /// Mirrors `index.len()` for readers outside the relay task.
    sessions: Arc<AtomicUsize>,
    handshake_limiter: RateLimiter<IpAddr>,
    packet_limiter: RateLimiter<IpAddr>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    rng: StdRng,
}

impl Relay {
    /// Bind the rendezvous socket. Failure here is fatal to the process.
    pub fn bind(
        settings: RelaySettings,
        cipher: Arc<dyn ControlCipher>,
        reporter: Arc<dyn UsageReporter>,
    ) -> io::Result<Self> {
        let rendezvous = Arc::new(bind_udp(settings.listen)?);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        Ok(Self {
            handshake_limiter: RateLimiter::new(settings.handshake_limit, settings.handshake_window),
            packet_limiter: RateLimiter::new(settings.packet_limit, settings.packet_window),
            settings,
            rendezvous,
            cipher,
            reporter,
            tables: Arc::new(PermutationTables::build(STANDARD_FUNCTIONS)),
            index: DualIndex::new(),
            sessions: Arc::new(AtomicUsize::new(0)),
            events_tx,
            events_rx,
            rng: StdRng::from_entropy(),
        })
    }

    #[cfg(test)]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.rendezvous.local_addr()
    }

    /// Live session count, updated on every admission and teardown.
    pub fn session_gauge(&self) -> Arc<AtomicUsize> {
        self.sessions.clone()
    }

    /// Serve until `shutdown` resolves, then tear every session down.
    pub async fn run<F: Future<Output = ()>>(mut self, shutdown: F) -> io::Result<()> {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let flush_every = self.settings.traffic_flush;
        let mut flush = tokio::time::interval_at(tokio::time::Instant::now() + flush_every, flush_every);

        tracing::info!("Relay listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                result = self.rendezvous.recv_from(&mut buf) => match result {
                    Ok((n, from)) => self.on_rendezvous(&buf[..n], from).await,
                    Err(e) => tracing::debug!("Rendezvous recv error: {}", e),
                },
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
                _ = flush.tick() => self.flush_traffic(),
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        if !self.index.is_empty() {
            tracing::info!("Closing {} sessions", self.index.len());
        }
        for client_id in self.index.client_ids() {
            self.teardown(&client_id, Teardown::Shutdown);
        }
        Ok(())
    }

    // ── Rendezvous socket ────────────────────────────────────────────

    async fn on_rendezvous(&mut self, data: &[u8], from: SocketAddr) {
        if !self.packet_limiter.is_allowed(&from.ip()) {
            tracing::debug!("Packet rate limit exceeded for {}", from.ip());
            return;
        }

        match ControlMessage::open(self.cipher.as_ref(), data) {
            Ok(ControlMessage::Handshake(request)) => self.on_handshake(*request, from).await,
            Ok(ControlMessage::Close) => self.on_close(from),
            Ok(other) => tracing::debug!("Ignoring {:?} from {}", other, from),
            // Anything that does not decrypt is treated as session data
            Err(_) => self.on_rendezvous_data(data, from).await,
        }
    }

    fn on_close(&mut self, from: SocketAddr) {
        match self.index.find_by_addr(from) {
            Some(client_id) => self.teardown(&client_id, Teardown::Close),
            None => tracing::debug!("Close from {} matches no session", from),
        }
    }

    async fn on_handshake(&mut self, request: HandshakeRequest, from: SocketAddr) {
        if !self.handshake_limiter.is_allowed(&from.ip()) {
            tracing::warn!("Handshake rate limit exceeded for {}", from.ip());
            return;
        }

        let client_id = request.client_id;
        if self.index.contains(&client_id) {
            self.on_reconnect(client_id, from).await;
            return;
        }

        if self.index.len() >= self.settings.max_sessions {
            tracing::warn!("Session limit reached, refusing {} from {}", client_id, from);
            self.send_control(&ControlMessage::ServerFull, from).await;
            return;
        }

        let (obfuscation, template_params) = match request.validate(&mut self.rng) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Invalid handshake from {}: {}", from, e);
                return;
            }
        };
        let obfuscator = match Obfuscator::with_tables(&obfuscation, self.tables.clone()) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("Invalid obfuscation parameters from {}: {}", from, e);
                return;
            }
        };
        let template = ProtocolTemplate::from_params(template_params);

        let mut bind_addr = self.settings.listen;
        bind_addr.set_port(0);
        let socket = match bind_udp(bind_addr) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                tracing::error!("Failed to bind session socket for {}: {}", client_id, e);
                return;
            }
        };

        let (secure, salt, nonce) = match &self.settings.security {
            Some(security) => {
                let salt = SessionKeys::generate_salt(&mut self.rng);
                let nonce: u32 = self.rng.gen();
                let keys = match SessionKeys::derive(&security.psk, &client_id, &salt) {
                    Ok(k) => k,
                    Err(e) => {
                        tracing::error!("Key derivation failed for {}: {}", client_id, e);
                        return;
                    }
                };
                let channel = SecureChannel::new(client_id, keys, nonce, security.max_age);
                (Some(channel), Some(salt), nonce)
            }
            None => (None, None, 0),
        };

        let pump = tokio::spawn(pump(
            client_id,
            socket.clone(),
            self.events_tx.clone(),
            self.settings.session_timeout,
        ));
        let session = Session {
            client_id,
            header_id: client_id.header_id(template.id()),
            addr: from,
            socket,
            obfuscator,
            template,
            secure,
            salt,
            user_id: request.user_id,
            traffic: 0,
            last_seen: Instant::now(),
            pump,
        };
        let port = session.local_port();
        tracing::info!(
            "Session {} created for {} ({}, port {})",
            client_id,
            from,
            session.template.id(),
            port
        );
        self.index.insert(client_id, session);
        self.sessions.store(self.index.len(), Ordering::Relaxed);

        let mut response = HandshakeResponse {
            port,
            client_id,
            status: HandshakeStatus::Connected,
            session_salt: None,
            server_nonce: None,
        };
        if let Some(salt) = &salt {
            response = response.with_security(salt, nonce);
        }
        self.send_control(&ControlMessage::Response(response), from).await;
    }

    /// Known client ID: same session, possibly a new address.
    async fn on_reconnect(&mut self, client_id: ClientId, from: SocketAddr) {
        let nonce: u32 = self.rng.gen();
        if let Some(old) = self.index.rebind(&client_id, from) {
            tracing::info!("Session {} migrated {} -> {}", client_id, old, from);
        }
        let Some(session) = self.index.get_mut(&client_id) else {
            return;
        };
        session.last_seen = Instant::now();

        let mut response = HandshakeResponse {
            port: session.local_port(),
            client_id,
            status: HandshakeStatus::Reconnected,
            session_salt: None,
            server_nonce: None,
        };
        if let (Some(channel), Some(salt)) = (session.secure.as_mut(), &session.salt) {
            channel.reset(nonce);
            response = response.with_security(salt, nonce);
        }
        tracing::info!("Session {} reconnected from {}", client_id, from);
        self.send_control(&ControlMessage::Response(response), from).await;
    }

    async fn on_rendezvous_data(&mut self, data: &[u8], from: SocketAddr) {
        match self.route(data, from) {
            Some(client_id) => self.deliver(client_id, data, from).await,
            None => tracing::trace!("Dropping {} bytes from {}: no session", data.len(), from),
        }
    }

    /// Resolve the session a data packet belongs to.
    fn route(&self, data: &[u8], from: SocketAddr) -> Option<ClientId> {
        let candidates = header_id_candidates(data);
        for (_, header_id) in &candidates {
            let key = RouteKey {
                addr: from,
                header_id: *header_id,
            };
            if let Some(client_id) = self.index.lookup(&key) {
                return Some(client_id);
            }
        }

        // Secure frames carry the full client ID in the clear
        if self.settings.security.is_some() {
            for (template_id, _) in &candidates {
                let found = template_id
                    .decapsulate(data)
                    .and_then(peek_client_id)
                    .filter(|id| self.index.contains(id));
                if found.is_some() {
                    return found;
                }
            }
        }

        // The address changed: fall back to a scan by header ID
        candidates
            .iter()
            .find_map(|(_, header_id)| self.index.find_by_header_id(header_id))
    }

    // ── Session sockets ──────────────────────────────────────────────

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Datagram {
                client_id,
                from,
                data,
            } if from == self.settings.wireguard => self.on_wireguard(client_id, &data).await,
            SessionEvent::Datagram {
                client_id,
                from,
                data,
            } => self.on_session_data(client_id, &data, from).await,
            SessionEvent::InactivityCheck { client_id } => self.on_inactivity_check(client_id).await,
        }
    }

    async fn on_session_data(&mut self, client_id: ClientId, data: &[u8], from: SocketAddr) {
        let Some(session) = self.index.get(&client_id) else {
            return;
        };
        if session.template.extract_header_id(data) != Some(session.header_id) {
            tracing::trace!("Dropping foreign packet on session {} from {}", client_id, from);
            return;
        }
        self.deliver(client_id, data, from).await;
    }

    /// Decode a client datagram for `client_id` and forward it to WireGuard.
    async fn deliver(&mut self, client_id: ClientId, data: &[u8], from: SocketAddr) {
        let Some(session) = self.index.get_mut(&client_id) else {
            return;
        };
        let inbound = match session.open_inbound(data) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!("Dropping packet for {} from {}: {}", client_id, from, e);
                return;
            }
        };
        session.last_seen = Instant::now();
        session.traffic += data.len() as u64;
        let socket = session.socket.clone();

        if let Some(old) = self.index.rebind(&client_id, from) {
            tracing::info!("Session {} migrated {} -> {}", client_id, old, from);
        }

        match inbound {
            Inbound::Heartbeat => tracing::trace!("Heartbeat from {}", client_id),
            Inbound::Data(payload) => {
                if let Err(e) = socket.send_to(&payload, self.settings.wireguard).await {
                    tracing::debug!("WireGuard send failed for {}: {}", client_id, e);
                }
            }
        }
    }

    async fn on_wireguard(&mut self, client_id: ClientId, data: &[u8]) {
        let Some(session) = self.index.get_mut(&client_id) else {
            return;
        };
        let packet = match session.seal_outbound(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Failed to wrap packet for {}: {}", client_id, e);
                return;
            }
        };
        session.traffic += packet.len() as u64;
        let socket = session.socket.clone();
        let to = session.addr;

        if let Err(e) = socket.send_to(&packet, to).await {
            tracing::debug!("Send to {} ({}) failed: {}", client_id, to, e);
        }
    }

    async fn on_inactivity_check(&mut self, client_id: ClientId) {
        let timeout = self.settings.session_timeout;
        let Some(session) = self.index.get(&client_id) else {
            return;
        };
        if !session.is_inactive(Instant::now(), timeout) {
            return;
        }
        let to = session.addr;
        self.send_control(&ControlMessage::Inactivity, to).await;
        self.teardown(&client_id, Teardown::Inactivity);
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    fn teardown(&mut self, client_id: &ClientId, reason: Teardown) {
        let Some(mut session) = self.index.remove(client_id) else {
            return;
        };
        self.sessions.store(self.index.len(), Ordering::Relaxed);
        let traffic = session.take_traffic();
        if traffic > 0 {
            self.reporter.report(&session.user_id, traffic);
        }
        tracing::info!(
            "Session {} closed ({}), {} sessions remain",
            client_id,
            reason.as_str(),
            self.index.len()
        );
        // Dropping the session aborts its receive loop and frees the socket
    }

    fn flush_traffic(&mut self) {
        for (_, session) in self.index.iter_mut() {
            let traffic = session.take_traffic();
            if traffic > 0 {
                self.reporter.report(&session.user_id, traffic);
            }
        }
        tracing::debug!(
            "Traffic flushed for {} sessions; rate limiter tracks {} handshake and {} packet sources",
            self.index.len(),
            self.handshake_limiter.tracked_keys(),
            self.packet_limiter.tracked_keys()
        );
    }

    async fn send_control(&mut self, message: &ControlMessage, to: SocketAddr) {
        let sealed = match message.seal(self.cipher.as_ref()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to seal control message: {}", e);
                return;
            }
        };
        if let Err(e) = self.rendezvous.send_to(&sealed, to).await {
            tracing::debug!("Control send to {} failed: {}", to, e);
        }
    }
}

/// Receive loop of one session's dedicated socket, plus its inactivity tick.
async fn pump(
    client_id: ClientId,
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<SessionEvent>,
    check_every: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut check = tokio::time::interval_at(tokio::time::Instant::now() + check_every, check_every);
    loop {
        let event = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, from)) => SessionEvent::Datagram {
                    client_id,
                    from,
                    data: buf[..n].to_vec(),
                },
                Err(e) => {
                    tracing::debug!("Session {} recv error: {}", client_id, e);
                    continue;
                }
            },
            _ = check.tick() => SessionEvent::InactivityCheck { client_id },
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}
