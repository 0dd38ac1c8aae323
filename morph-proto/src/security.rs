/// Packet authentication with replay protection.
///
/// Frame layout (big-endian):
/// ```text
/// [client_id: 16] [sequence: 4] [timestamp: 4] [hmac: 32] [data]
/// ```
///
/// The client ID stays in plaintext so the relay can find the session in
/// O(1). Observers see a stable identifier for the session's lifetime; the
/// HMAC (over id, sequence, timestamp and data) stops forgery and the
/// sequence/timestamp checks stop replay.
use crate::error::{Error, Result};
use crate::ids::{ClientId, CLIENT_ID_LEN};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const SEQUENCE_LEN: usize = 4;
const TIMESTAMP_LEN: usize = 4;
const HMAC_LEN: usize = 32;
pub const SECURE_HEADER_LEN: usize = CLIENT_ID_LEN + SEQUENCE_LEN + TIMESTAMP_LEN + HMAC_LEN;
pub const SALT_LEN: usize = 32;
pub const DEFAULT_MAX_AGE_SECS: u64 = 300;
const WRAP_THRESHOLD: u32 = 0x8000_0000;

const SESSION_KEY_INFO: &[u8] = b"morph-session-key";
const HMAC_KEY_INFO: &[u8] = b"morph-hmac-key";

/// Seconds since the Unix epoch, truncated to the 32-bit wire field.
pub fn unix_time_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// ── Keys ─────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub session_key: [u8; 16],
    pub hmac_key: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

impl SessionKeys {
    /// HKDF-SHA256 over `psk || client_id`, salted per session.
    pub fn derive(psk: &[u8], client_id: &ClientId, salt: &[u8]) -> Result<Self> {
        let mut ikm = Vec::with_capacity(psk.len() + CLIENT_ID_LEN);
        ikm.extend_from_slice(psk);
        ikm.extend_from_slice(client_id.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
        let mut keys = Self {
            session_key: [0u8; 16],
            hmac_key: [0u8; 32],
        };
        hk.expand(SESSION_KEY_INFO, &mut keys.session_key)
            .map_err(|_| Error::InvalidParameter("HKDF expansion failed".into()))?;
        hk.expand(HMAC_KEY_INFO, &mut keys.hmac_key)
            .map_err(|_| Error::InvalidParameter("HKDF expansion failed".into()))?;
        Ok(keys)
    }

    pub fn generate_salt<R: Rng + ?Sized>(rng: &mut R) -> [u8; SALT_LEN] {
        let mut salt = [0u8; SALT_LEN];
        rng.fill(&mut salt[..]);
        salt
    }
}

// ── Checks ───────────────────────────────────────────────────────────

pub fn compute_hmac(
    hmac_key: &[u8],
    client_id: &ClientId,
    sequence: u32,
    timestamp: u32,
    data: &[u8],
) -> Result<[u8; HMAC_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(hmac_key)
        .map_err(|_| Error::InvalidParameter("invalid HMAC key".into()))?;
    mac.update(client_id.as_bytes());
    mac.update(&sequence.to_be_bytes());
    mac.update(&timestamp.to_be_bytes());
    mac.update(data);
    let mut tag = [0u8; HMAC_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/// `|now - timestamp| <= max_age`, in both directions to tolerate skew.
pub fn validate_timestamp(timestamp: u32, now: u32, max_age: u64) -> Result<()> {
    let age = (now as i64 - timestamp as i64).unsigned_abs();
    if age > max_age {
        return Err(Error::StaleTimestamp { age, max_age });
    }
    Ok(())
}

/// Strictly increasing, except that a small value after one past 2^31 is
/// taken as a wrap of the 32-bit counter.
pub fn validate_sequence(sequence: u32, last: u32) -> Result<()> {
    let ok = sequence != last
        && ((last > WRAP_THRESHOLD && sequence < WRAP_THRESHOLD) || sequence > last);
    if ok {
        Ok(())
    } else {
        Err(Error::ReplayedSequence { sequence, last })
    }
}

// ── Framing ──────────────────────────────────────────────────────────

/// A frame that passed every check.
#[derive(Debug, PartialEq, Eq)]
pub struct SecurePacket<'a> {
    pub client_id: ClientId,
    pub sequence: u32,
    pub timestamp: u32,
    pub data: &'a [u8],
}

/// Plaintext client ID of a frame, without verifying anything.
pub fn peek_client_id(packet: &[u8]) -> Option<ClientId> {
    if packet.len() < SECURE_HEADER_LEN {
        return None;
    }
    ClientId::from_slice(&packet[..CLIENT_ID_LEN]).ok()
}

pub fn encapsulate_secure(
    client_id: &ClientId,
    data: &[u8],
    sequence: u32,
    keys: &SessionKeys,
) -> Result<Vec<u8>> {
    encapsulate_secure_at(client_id, data, sequence, unix_time_secs(), keys)
}

pub fn encapsulate_secure_at(
    client_id: &ClientId,
    data: &[u8],
    sequence: u32,
    timestamp: u32,
    keys: &SessionKeys,
) -> Result<Vec<u8>> {
    let tag = compute_hmac(&keys.hmac_key, client_id, sequence, timestamp, data)?;
    let mut packet = Vec::with_capacity(SECURE_HEADER_LEN + data.len());
    packet.extend_from_slice(client_id.as_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(&timestamp.to_be_bytes());
    packet.extend_from_slice(&tag);
    packet.extend_from_slice(data);
    Ok(packet)
}

pub fn decapsulate_secure<'a>(
    packet: &'a [u8],
    keys: &SessionKeys,
    last_sequence: u32,
    max_age: u64,
) -> Result<SecurePacket<'a>> {
    decapsulate_secure_at(packet, keys, last_sequence, max_age, unix_time_secs())
}

/// Checks run cheapest first: length, timestamp, sequence, then HMAC.
pub fn decapsulate_secure_at<'a>(
    packet: &'a [u8],
    keys: &SessionKeys,
    last_sequence: u32,
    max_age: u64,
    now: u32,
) -> Result<SecurePacket<'a>> {
    if packet.len() < SECURE_HEADER_LEN {
        return Err(Error::InvalidLength {
            expected: SECURE_HEADER_LEN,
            actual: packet.len(),
        });
    }
    let client_id = ClientId::from_slice(&packet[..CLIENT_ID_LEN])?;
    let mut off = CLIENT_ID_LEN;
    let sequence = u32::from_be_bytes([packet[off], packet[off + 1], packet[off + 2], packet[off + 3]]);
    off += SEQUENCE_LEN;
    let timestamp = u32::from_be_bytes([packet[off], packet[off + 1], packet[off + 2], packet[off + 3]]);
    off += TIMESTAMP_LEN;
    let received = &packet[off..off + HMAC_LEN];
    let data = &packet[SECURE_HEADER_LEN..];

    validate_timestamp(timestamp, now, max_age)?;
    validate_sequence(sequence, last_sequence)?;

    let expected = compute_hmac(&keys.hmac_key, &client_id, sequence, timestamp, data)?;
    if !bool::from(expected[..].ct_eq(received)) {
        return Err(Error::AuthenticationFailed);
    }

    Ok(SecurePacket {
        client_id,
        sequence,
        timestamp,
        data,
    })
}

// ── Channel ──────────────────────────────────────────────────────────

/// One direction-pair of secure framing for a session: outbound counter
/// plus the last inbound sequence accepted. Both start from the relay's
/// handshake nonce.
#[derive(Debug, Clone)]
pub struct SecureChannel {
    client_id: ClientId,
    keys: SessionKeys,
    next_sequence: u32,
    last_accepted: u32,
    max_age: u64,
}

impl SecureChannel {
    pub fn new(client_id: ClientId, keys: SessionKeys, nonce: u32, max_age: u64) -> Self {
        Self {
            client_id,
            keys,
            next_sequence: nonce.wrapping_add(1),
            last_accepted: nonce,
            max_age,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Restart both counters from a fresh handshake nonce.
    pub fn reset(&mut self, nonce: u32) {
        self.next_sequence = nonce.wrapping_add(1);
        self.last_accepted = nonce;
    }

    pub fn seal(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.seal_at(data, unix_time_secs())
    }

    pub fn seal_at(&mut self, data: &[u8], now: u32) -> Result<Vec<u8>> {
        let packet = encapsulate_secure_at(&self.client_id, data, self.next_sequence, now, &self.keys)?;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(packet)
    }

    pub fn open<'a>(&mut self, packet: &'a [u8]) -> Result<&'a [u8]> {
        self.open_at(packet, unix_time_secs())
    }

    /// Verify a frame for this session and advance the replay window.
    pub fn open_at<'a>(&mut self, packet: &'a [u8], now: u32) -> Result<&'a [u8]> {
        let frame = decapsulate_secure_at(packet, &self.keys, self.last_accepted, self.max_age, now)?;
        if frame.client_id != self.client_id {
            return Err(Error::AuthenticationFailed);
        }
        self.last_accepted = frame.sequence;
        Ok(frame.data)
    }
}
