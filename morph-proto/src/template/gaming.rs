/// Generic game-server datagram disguise.
///
/// ```text
/// [magic: 4 = "GAME"] [session: 4 = client_id[0..4]] [seq: 2 BE] [type: 1 = 1..=5] [flags: 1] [payload]
/// ```
use crate::ids::{ClientId, HeaderId};
use crate::template::TemplateParams;
use rand::Rng;

pub(crate) const HEADER_LEN: usize = 12;
const MAGIC: &[u8; 4] = b"GAME";
const SESSION: std::ops::Range<usize> = 4..8;
const PACKET_TYPES: std::ops::RangeInclusive<u8> = 0x01..=0x05;

#[derive(Debug, Clone)]
pub struct GamingTemplate {
    sequence: u16,
}

impl GamingTemplate {
    pub fn new(sequence: u16) -> Self {
        Self { sequence }
    }

    fn has_signature(packet: &[u8]) -> bool {
        packet.len() >= HEADER_LEN && packet.starts_with(MAGIC)
    }

    pub fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(MAGIC);
        packet.extend_from_slice(&client_id.as_bytes()[..SESSION.len()]);
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.push(rng.gen_range(PACKET_TYPES));
        packet.push(rng.gen());
        packet.extend_from_slice(payload);
        packet
    }

    pub fn decapsulate(packet: &[u8]) -> Option<&[u8]> {
        if !Self::has_signature(packet) || !PACKET_TYPES.contains(&packet[10]) {
            return None;
        }
        Some(&packet[HEADER_LEN..])
    }

    pub fn extract_header_id(packet: &[u8]) -> Option<HeaderId> {
        if !Self::has_signature(packet) {
            return None;
        }
        HeaderId::from_slice(&packet[SESSION])
    }

    pub fn update_state(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
    }

    pub fn params(&self) -> TemplateParams {
        TemplateParams::GenericGaming { sequence: self.sequence }
    }
}
