/// KCP data-segment disguise, as used by many mobile game transports.
///
/// ```text
/// [conv: 4 = client_id[0..4]] [cmd: 1 = 0x51] [frg: 1 = 0] [wnd: 2]
/// [ts: 4] [sn: 4] [una: 4 = sn - 1] [len: 4] [payload]
/// ```
/// All fields big-endian.
use crate::ids::{ClientId, HeaderId};
use crate::template::TemplateParams;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const HEADER_LEN: usize = 24;
pub(crate) const CONV_LEN: usize = 4;
const CMD_PUSH: u8 = 0x51;
const WINDOW: u16 = 256;

/// Wall clock in milliseconds, truncated to the 32-bit `ts` field.
pub(crate) fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct KcpTemplate {
    sequence: u32,
    timestamp: u32,
}

impl KcpTemplate {
    pub fn new(sequence: u32, timestamp: u32) -> Self {
        Self { sequence, timestamp }
    }

    fn has_signature(packet: &[u8]) -> bool {
        packet.len() >= HEADER_LEN && packet[4] == CMD_PUSH
    }

    pub fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&client_id.as_bytes()[..CONV_LEN]);
        packet.push(CMD_PUSH);
        packet.push(0); // frg
        packet.extend_from_slice(&WINDOW.to_be_bytes());
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.sequence.wrapping_sub(1).to_be_bytes());
        packet.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Requires the push command, no fragmentation, and a `len` field that
    /// matches what actually follows the header.
    pub fn decapsulate(packet: &[u8]) -> Option<&[u8]> {
        if !Self::has_signature(packet) || packet[5] != 0 {
            return None;
        }
        let len = u32::from_be_bytes([packet[20], packet[21], packet[22], packet[23]]) as usize;
        let payload = &packet[HEADER_LEN..];
        (payload.len() == len).then_some(payload)
    }

    pub fn extract_header_id(packet: &[u8]) -> Option<HeaderId> {
        if !Self::has_signature(packet) {
            return None;
        }
        HeaderId::from_slice(&packet[..CONV_LEN])
    }

    pub fn update_state(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = now_millis();
    }

    pub fn params(&self) -> TemplateParams {
        TemplateParams::Kcp {
            sequence: self.sequence,
            timestamp: self.timestamp,
        }
    }
}
