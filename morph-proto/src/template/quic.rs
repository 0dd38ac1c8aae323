/// QUIC short-header disguise.
///
/// ```text
/// [flags: 1 = 0x40..=0x4F] [conn_id: 8 = client_id[0..8]] [packet_number: 2 BE] [payload]
/// ```
use crate::ids::{ClientId, HeaderId};
use crate::template::TemplateParams;
use rand::Rng;

pub(crate) const HEADER_LEN: usize = 11;
const CONN_ID: std::ops::Range<usize> = 1..9;
const FLAGS_MASK: u8 = 0xF0;
const FLAGS_FIXED: u8 = 0x40;

#[derive(Debug, Clone)]
pub struct QuicTemplate {
    packet_number: u16,
}

impl QuicTemplate {
    pub fn new(packet_number: u16) -> Self {
        Self { packet_number }
    }

    fn has_signature(packet: &[u8]) -> bool {
        packet.len() >= HEADER_LEN && packet[0] & FLAGS_MASK == FLAGS_FIXED
    }

    pub fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        // Fixed bit set, low nibble varies like real key-phase/pn-length bits
        packet.push(FLAGS_FIXED | rand::thread_rng().gen_range(0..16u8));
        packet.extend_from_slice(&client_id.as_bytes()[..CONN_ID.len()]);
        packet.extend_from_slice(&self.packet_number.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    pub fn decapsulate(packet: &[u8]) -> Option<&[u8]> {
        Self::has_signature(packet).then(|| &packet[HEADER_LEN..])
    }

    pub fn extract_header_id(packet: &[u8]) -> Option<HeaderId> {
        if !Self::has_signature(packet) {
            return None;
        }
        HeaderId::from_slice(&packet[CONN_ID])
    }

    pub fn update_state(&mut self) {
        self.packet_number = self.packet_number.wrapping_add(1);
    }

    pub fn params(&self) -> TemplateParams {
        TemplateParams::Quic { packet_number: self.packet_number }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_and_corrupted_flags() {
        let cid = ClientId([0xAA; 16]);
        let t = QuicTemplate::new(0);
        let mut packet = t.encapsulate(&[], &cid);
        assert_eq!(packet.len(), 11);
        assert_eq!(QuicTemplate::decapsulate(&packet), Some(&[][..]));

        packet[0] = 0x00;
        assert_eq!(QuicTemplate::decapsulate(&packet), None);
        assert_eq!(QuicTemplate::extract_header_id(&packet), None);
    }

    #[test]
    fn test_flags_and_packet_number() {
        let cid = ClientId([1; 16]);
        let mut t = QuicTemplate::new(0xFFFF);
        for _ in 0..64 {
            let packet = t.encapsulate(b"x", &cid);
            assert_eq!(packet[0] & 0xF0, 0x40);
        }
        let packet = t.encapsulate(b"x", &cid);
        assert_eq!(&packet[9..11], &[0xFF, 0xFF]);

        t.update_state();
        assert_eq!(t.params(), TemplateParams::Quic { packet_number: 0 });
        let packet = t.encapsulate(b"x", &cid);
        assert_eq!(&packet[9..11], &[0x00, 0x00]);
    }

    #[test]
    fn test_short_packet_rejected() {
        assert_eq!(QuicTemplate::decapsulate(&[0x41; 10]), None);
    }
}
