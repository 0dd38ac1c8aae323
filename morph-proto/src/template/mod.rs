/// Protocol camouflage: wrap obfuscated payloads in headers that look like
/// QUIC, a KCP game transport, a generic game protocol or DTLS (WebRTC).
///
/// Every variant embeds a prefix of the 16-byte client ID in a
/// protocol-native header field. That prefix (the header ID) is readable
/// from the wire alone, so the relay routes a packet before it knows which
/// session, and therefore which template instance, it belongs to.
mod gaming;
mod kcp;
mod quic;
mod webrtc;

pub use gaming::GamingTemplate;
pub use kcp::KcpTemplate;
pub use quic::QuicTemplate;
pub use webrtc::WebRtcTemplate;

use crate::error::{Error, Result};
use crate::ids::{ClientId, HeaderId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Single-byte liveness marker; never forwarded to WireGuard.
pub const HEARTBEAT: u8 = 0x01;

// ── Template IDs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TemplateId {
    Quic = 1,
    Kcp = 2,
    GenericGaming = 3,
    WebRtc = 4,
}

impl TemplateId {
    pub const ALL: [TemplateId; 4] = [
        TemplateId::Quic,
        TemplateId::Kcp,
        TemplateId::GenericGaming,
        TemplateId::WebRtc,
    ];

    pub fn from_u8(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Self::Quic),
            2 => Ok(Self::Kcp),
            3 => Ok(Self::GenericGaming),
            4 => Ok(Self::WebRtc),
            other => Err(Error::UnknownTemplateId(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Quic => "quic",
            Self::Kcp => "kcp",
            Self::GenericGaming => "gaming",
            Self::WebRtc => "webrtc",
        }
    }

    /// Width of the client-ID prefix this variant carries in its header.
    pub fn header_id_len(self) -> usize {
        match self {
            Self::Quic | Self::WebRtc => 8,
            Self::Kcp | Self::GenericGaming => 4,
        }
    }

    /// Variant-specific header ID extraction; `None` when the packet does
    /// not carry this variant's signature.
    pub fn extract_header_id(self, packet: &[u8]) -> Option<HeaderId> {
        match self {
            Self::Quic => QuicTemplate::extract_header_id(packet),
            Self::Kcp => KcpTemplate::extract_header_id(packet),
            Self::GenericGaming => GamingTemplate::extract_header_id(packet),
            Self::WebRtc => WebRtcTemplate::extract_header_id(packet),
        }
    }

    /// Strip this variant's header from the wire bytes alone.
    pub fn decapsulate(self, packet: &[u8]) -> Option<&[u8]> {
        match self {
            Self::Quic => QuicTemplate::decapsulate(packet),
            Self::Kcp => KcpTemplate::decapsulate(packet),
            Self::GenericGaming => GamingTemplate::decapsulate(packet),
            Self::WebRtc => WebRtcTemplate::decapsulate(packet),
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Parameters ───────────────────────────────────────────────────────

/// Minimal per-variant state a peer needs to build a compatible instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateParams {
    Quic { packet_number: u16 },
    Kcp { sequence: u32, timestamp: u32 },
    GenericGaming { sequence: u16 },
    WebRtc { epoch: u16, sequence: u64 },
}

/// Handshake encoding of [`TemplateParams`]; which fields apply depends on
/// the accompanying template ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTemplateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_ts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

fn narrow<T: TryFrom<u64>>(value: u64, field: &str, id: TemplateId) -> Result<T> {
    T::try_from(value)
        .map_err(|_| Error::InvalidParameter(format!("{} {} out of range for {}", field, value, id)))
}

impl TemplateParams {
    pub fn id(&self) -> TemplateId {
        match self {
            Self::Quic { .. } => TemplateId::Quic,
            Self::Kcp { .. } => TemplateId::Kcp,
            Self::GenericGaming { .. } => TemplateId::GenericGaming,
            Self::WebRtc { .. } => TemplateId::WebRtc,
        }
    }

    /// Fresh random starting state for `id`.
    pub fn random<R: Rng + ?Sized>(id: TemplateId, rng: &mut R) -> Self {
        match id {
            TemplateId::Quic => Self::Quic { packet_number: rng.gen() },
            TemplateId::Kcp => Self::Kcp {
                sequence: rng.gen::<u16>() as u32,
                timestamp: kcp::now_millis(),
            },
            TemplateId::GenericGaming => Self::GenericGaming { sequence: rng.gen() },
            TemplateId::WebRtc => Self::WebRtc {
                epoch: 0,
                sequence: rng.gen_range(0..webrtc::SEQUENCE_MODULUS),
            },
        }
    }

    pub fn to_wire(&self) -> WireTemplateParams {
        match *self {
            Self::Quic { packet_number } => WireTemplateParams {
                initial_seq: Some(packet_number as u64),
                ..Default::default()
            },
            Self::Kcp { sequence, timestamp } => WireTemplateParams {
                initial_seq: Some(sequence as u64),
                initial_ts: Some(timestamp as u64),
                ..Default::default()
            },
            Self::GenericGaming { sequence } => WireTemplateParams {
                initial_seq: Some(sequence as u64),
                ..Default::default()
            },
            Self::WebRtc { epoch, sequence } => WireTemplateParams {
                initial_seq: Some(sequence),
                epoch: Some(epoch as u64),
                ..Default::default()
            },
        }
    }

    /// Decode handshake parameters for `id`. Absent fields start from a
    /// random (or zero epoch) state; present fields must fit the variant's
    /// field width. KCP timestamps keep their low 32 bits.
    pub fn from_wire<R: Rng + ?Sized>(
        id: TemplateId,
        wire: &WireTemplateParams,
        rng: &mut R,
    ) -> Result<Self> {
        let mut params = Self::random(id, rng);
        match &mut params {
            Self::Quic { packet_number } => {
                if let Some(seq) = wire.initial_seq {
                    *packet_number = narrow(seq, "initialSeq", id)?;
                }
            }
            Self::Kcp { sequence, timestamp } => {
                if let Some(seq) = wire.initial_seq {
                    *sequence = narrow(seq, "initialSeq", id)?;
                }
                if let Some(ts) = wire.initial_ts {
                    *timestamp = ts as u32;
                }
            }
            Self::GenericGaming { sequence } => {
                if let Some(seq) = wire.initial_seq {
                    *sequence = narrow(seq, "initialSeq", id)?;
                }
            }
            Self::WebRtc { epoch, sequence } => {
                if let Some(seq) = wire.initial_seq {
                    if seq >= webrtc::SEQUENCE_MODULUS {
                        return Err(Error::InvalidParameter(format!(
                            "initialSeq {} out of range for {}",
                            seq, id
                        )));
                    }
                    *sequence = seq;
                }
                if let Some(e) = wire.epoch {
                    *epoch = narrow(e, "epoch", id)?;
                }
            }
        }
        Ok(params)
    }
}

// ── Template instances ───────────────────────────────────────────────

/// One side's camouflage codec with its own mutable header state.
#[derive(Debug, Clone)]
pub enum ProtocolTemplate {
    Quic(QuicTemplate),
    Kcp(KcpTemplate),
    GenericGaming(GamingTemplate),
    WebRtc(WebRtcTemplate),
}

impl ProtocolTemplate {
    pub fn from_params(params: TemplateParams) -> Self {
        match params {
            TemplateParams::Quic { packet_number } => Self::Quic(QuicTemplate::new(packet_number)),
            TemplateParams::Kcp { sequence, timestamp } => {
                Self::Kcp(KcpTemplate::new(sequence, timestamp))
            }
            TemplateParams::GenericGaming { sequence } => {
                Self::GenericGaming(GamingTemplate::new(sequence))
            }
            TemplateParams::WebRtc { epoch, sequence } => {
                Self::WebRtc(WebRtcTemplate::new(epoch, sequence))
            }
        }
    }

    pub fn id(&self) -> TemplateId {
        match self {
            Self::Quic(_) => TemplateId::Quic,
            Self::Kcp(_) => TemplateId::Kcp,
            Self::GenericGaming(_) => TemplateId::GenericGaming,
            Self::WebRtc(_) => TemplateId::WebRtc,
        }
    }

    /// Bytes added in front of the payload.
    pub fn overhead(&self) -> usize {
        match self {
            Self::Quic(_) => quic::HEADER_LEN,
            Self::Kcp(_) => kcp::HEADER_LEN,
            Self::GenericGaming(_) => gaming::HEADER_LEN,
            Self::WebRtc(_) => webrtc::OVERHEAD,
        }
    }

    pub fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        match self {
            Self::Quic(t) => t.encapsulate(payload, client_id),
            Self::Kcp(t) => t.encapsulate(payload, client_id),
            Self::GenericGaming(t) => t.encapsulate(payload, client_id),
            Self::WebRtc(t) => t.encapsulate(payload, client_id),
        }
    }

    /// Strip this variant's header; `None` if the signature doesn't match.
    pub fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        self.id().decapsulate(packet)
    }

    pub fn extract_header_id(&self, packet: &[u8]) -> Option<HeaderId> {
        self.id().extract_header_id(packet)
    }

    /// Advance the per-packet counters; call once per packet sent.
    pub fn update_state(&mut self) {
        match self {
            Self::Quic(t) => t.update_state(),
            Self::Kcp(t) => t.update_state(),
            Self::GenericGaming(t) => t.update_state(),
            Self::WebRtc(t) => t.update_state(),
        }
    }

    pub fn params(&self) -> TemplateParams {
        match self {
            Self::Quic(t) => t.params(),
            Self::Kcp(t) => t.params(),
            Self::GenericGaming(t) => t.params(),
            Self::WebRtc(t) => t.params(),
        }
    }
}

// ── Variant-agnostic extraction ──────────────────────────────────────

/// Every plausible (variant, header ID) reading of `packet`, strongest
/// signature first: "GAME" magic, DTLS record prefix, QUIC short-header
/// flags, KCP data command, then the bare KCP conv field.
///
/// Several readings can be valid at once (a KCP conv whose first byte is
/// 0x4X also parses as QUIC), so routing should try each in turn.
pub fn header_id_candidates(packet: &[u8]) -> Vec<(TemplateId, HeaderId)> {
    let mut out = Vec::with_capacity(3);
    for id in [TemplateId::GenericGaming, TemplateId::WebRtc, TemplateId::Quic, TemplateId::Kcp] {
        if let Some(header_id) = id.extract_header_id(packet) {
            out.push((id, header_id));
        }
    }
    if packet.len() >= kcp::CONV_LEN && !out.iter().any(|(id, _)| *id == TemplateId::Kcp) {
        if let Some(header_id) = HeaderId::from_slice(&packet[..kcp::CONV_LEN]) {
            out.push((TemplateId::Kcp, header_id));
        }
    }
    out
}

/// Highest-priority reading of `packet`.
pub fn extract_header_id(packet: &[u8]) -> Option<(TemplateId, HeaderId)> {
    header_id_candidates(packet).into_iter().next()
}
