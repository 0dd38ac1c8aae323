/// Relay-side per-client state: the dedicated forwarding socket plus this
/// client's obfuscator, template and optional secure channel.
use crate::index::Routable;
use morph_proto::security::{SecureChannel, SALT_LEN};
use morph_proto::template::HEARTBEAT;
use morph_proto::{ClientId, Error, HeaderId, Obfuscator, ProtocolTemplate};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// A decoded client datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Data(Vec<u8>),
}

pub struct Session {
    pub client_id: ClientId,
    pub header_id: HeaderId,
    pub addr: SocketAddr,
    pub socket: Arc<UdpSocket>,
    pub obfuscator: Obfuscator,
    pub template: ProtocolTemplate,
    pub secure: Option<SecureChannel>,
    pub salt: Option<[u8; SALT_LEN]>,
    pub user_id: String,
    pub traffic: u64,
    pub last_seen: Instant,
    /// Receive loop of the dedicated socket; aborted on teardown.
    pub pump: JoinHandle<()>,
}

impl Session {
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Template → secure frame → obfuscation, in that order.
    pub fn open_inbound(&mut self, packet: &[u8]) -> morph_proto::Result<Inbound> {
        let inner = self
            .template
            .decapsulate(packet)
            .ok_or(Error::TemplateMismatch(self.template.id()))?;
        let payload = match self.secure.as_mut() {
            Some(channel) => channel.open(inner)?,
            None => inner,
        };
        if payload == [HEARTBEAT] {
            return Ok(Inbound::Heartbeat);
        }
        Ok(Inbound::Data(self.obfuscator.deobfuscate(payload)?))
    }

    /// Wrap a WireGuard datagram for the client and advance template state.
    pub fn seal_outbound(&mut self, data: &[u8]) -> morph_proto::Result<Vec<u8>> {
        let obfuscated = self.obfuscator.obfuscate(data);
        let inner = match self.secure.as_mut() {
            Some(channel) => channel.seal(&obfuscated)?,
            None => obfuscated,
        };
        let packet = self.template.encapsulate(&inner, &self.client_id);
        self.template.update_state();
        Ok(packet)
    }

    pub fn is_inactive(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= timeout
    }

    pub fn take_traffic(&mut self) -> u64 {
        std::mem::take(&mut self.traffic)
    }
}

impl Routable for Session {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn set_addr(&mut self, addr: SocketAddr) {
        self.addr = addr;
    }

    fn header_id(&self) -> HeaderId {
        self.header_id
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
