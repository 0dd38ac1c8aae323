/// DTLS 1.2 application-data record disguise (WebRTC data channels).
///
/// ```text
/// [content_type: 1 = 0x17] [version: 2 = 0xFEFF] [epoch: 2] [seq: 6] [len: 2]
/// [client_id: 16] [payload]
/// ```
/// `len` covers the inline client ID plus payload. The header ID is the
/// first 8 bytes of the inline client ID.
use crate::ids::{ClientId, HeaderId, CLIENT_ID_LEN};
use crate::template::TemplateParams;

const RECORD_HEADER_LEN: usize = 13;
pub(crate) const OVERHEAD: usize = RECORD_HEADER_LEN + CLIENT_ID_LEN;
pub(crate) const SEQUENCE_MODULUS: u64 = 1 << 48;
const CONTENT_APPLICATION_DATA: u8 = 0x17;
const VERSION_DTLS_1_2: [u8; 2] = [0xFE, 0xFF];
const HEADER_ID_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct WebRtcTemplate {
    epoch: u16,
    sequence: u64,
}

impl WebRtcTemplate {
    pub fn new(epoch: u16, sequence: u64) -> Self {
        Self {
            epoch,
            sequence: sequence % SEQUENCE_MODULUS,
        }
    }

    fn has_signature(packet: &[u8]) -> bool {
        packet.len() >= OVERHEAD
            && packet[0] == CONTENT_APPLICATION_DATA
            && packet[1..3] == VERSION_DTLS_1_2
    }

    pub fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let record_len = u16::try_from(CLIENT_ID_LEN + payload.len()).unwrap_or(u16::MAX);
        let mut packet = Vec::with_capacity(OVERHEAD + payload.len());
        packet.push(CONTENT_APPLICATION_DATA);
        packet.extend_from_slice(&VERSION_DTLS_1_2);
        packet.extend_from_slice(&self.epoch.to_be_bytes());
        packet.extend_from_slice(&self.sequence.to_be_bytes()[2..]);
        packet.extend_from_slice(&record_len.to_be_bytes());
        packet.extend_from_slice(client_id.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    pub fn decapsulate(packet: &[u8]) -> Option<&[u8]> {
        if !Self::has_signature(packet) {
            return None;
        }
        let record_len = u16::from_be_bytes([packet[11], packet[12]]) as usize;
        (record_len == packet.len() - RECORD_HEADER_LEN).then(|| &packet[OVERHEAD..])
    }

    pub fn extract_header_id(packet: &[u8]) -> Option<HeaderId> {
        if !Self::has_signature(packet) {
            return None;
        }
        HeaderId::from_slice(&packet[RECORD_HEADER_LEN..RECORD_HEADER_LEN + HEADER_ID_LEN])
    }

    pub fn update_state(&mut self) {
        self.sequence = (self.sequence + 1) % SEQUENCE_MODULUS;
    }

    pub fn params(&self) -> TemplateParams {
        TemplateParams::WebRtc {
            epoch: self.epoch,
            sequence: self.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline_client_id(packet: &[u8]) -> ClientId {
        ClientId::from_slice(&packet[RECORD_HEADER_LEN..OVERHEAD]).unwrap()
    }

    #[test]
    fn test_record_layout() {
        let cid = ClientId(*b"0123456789ABCDEF");
        let t = WebRtcTemplate::new(2, 0x0000_0102_0304_0506);
        let packet = t.encapsulate(b"abc", &cid);

        assert_eq!(packet.len(), 13 + 16 + 3);
        assert_eq!(&packet[..3], &[0x17, 0xFE, 0xFF]);
        assert_eq!(&packet[3..5], &[0, 2]);
        assert_eq!(&packet[5..11], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&packet[11..13], &19u16.to_be_bytes());
        assert_eq!(inline_client_id(&packet), cid);
        assert_eq!(WebRtcTemplate::decapsulate(&packet), Some(&b"abc"[..]));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let t = WebRtcTemplate::new(0, 0);
        let packet = t.encapsulate(b"abcdef", &ClientId([5; 16]));
        assert_eq!(WebRtcTemplate::decapsulate(&packet[..packet.len() - 1]), None);
        assert_eq!(WebRtcTemplate::decapsulate(&packet[..28]), None);
    }

    #[test]
    fn test_sequence_wraps_at_48_bits() {
        let mut t = WebRtcTemplate::new(0, SEQUENCE_MODULUS - 1);
        t.update_state();
        assert_eq!(t.params(), TemplateParams::WebRtc { epoch: 0, sequence: 0 });
        let packet = t.encapsulate(&[], &ClientId([0; 16]));
        assert_eq!(&packet[5..11], &[0; 6]);
    }
}
