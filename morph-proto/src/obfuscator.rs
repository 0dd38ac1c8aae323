/// Layered obfuscator: picks an ordered combination of primitives per packet
/// from two random header bytes and frames the result with random padding.
///
/// Wire layout:
/// ```text
/// [h0: 1] [h1: 1] [padding_len: 1] [transformed payload] [padding: 1..=8]
/// ```
///
/// `combo = (h0 * h1) % permutations(layer)` selects the function list, which
/// is applied front-to-back on obfuscation and back-to-front on the way in.
/// This is a fingerprint-resistance layer only; it provides no secrecy.
use crate::error::{Error, Result};
use crate::registry::{FunctionRegistry, PermutationTables, MAX_LAYERS};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const HEADER_LEN: usize = 3;
pub const MAX_PADDING: u8 = 8;

// ── Parameters ───────────────────────────────────────────────────────

/// Configuration for the initializer-driven primitives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionInitializer {
    #[serde(with = "table_serde")]
    pub substitution_table: Box<[u8; 256]>,
    #[serde(rename = "randomValue")]
    pub random_offset: u8,
}

impl FunctionInitializer {
    /// Fresh random permutation table and offset.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut table = identity_table();
        table.shuffle(rng);
        Self {
            substitution_table: Box::new(table),
            random_offset: rng.gen(),
        }
    }

    /// Identity table and zero offset.
    pub fn identity() -> Self {
        Self {
            substitution_table: Box::new(identity_table()),
            random_offset: 0,
        }
    }
}

fn identity_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    for (i, v) in table.iter_mut().enumerate() {
        *v = i as u8;
    }
    table
}

/// Public parameters both peers use to build identical obfuscators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObfuscationParams {
    pub key: u8,
    pub layer: u8,
    pub max_padding: u8,
    pub initializer: FunctionInitializer,
}

impl ObfuscationParams {
    /// Random key and initializer with the given layer/padding settings.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, layer: u8, max_padding: u8) -> Self {
        Self {
            key: rng.gen(),
            layer,
            max_padding,
            initializer: FunctionInitializer::generate(rng),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.layer == 0 || self.layer > MAX_LAYERS {
            return Err(Error::InvalidLayer(self.layer));
        }
        if self.max_padding == 0 || self.max_padding > MAX_PADDING {
            return Err(Error::InvalidPadding(self.max_padding));
        }
        if !crate::functions::is_permutation(&self.initializer.substitution_table) {
            return Err(Error::InvalidParameter(
                "substitution table is not a permutation of 0-255".into(),
            ));
        }
        Ok(())
    }
}

// ── Obfuscator ───────────────────────────────────────────────────────

pub struct Obfuscator {
    key: u8,
    layer: u8,
    max_padding: u8,
    registry: FunctionRegistry,
    combos: usize,
    rng: Box<dyn RngCore + Send + Sync>,
}

impl fmt::Debug for Obfuscator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Obfuscator")
            .field("key", &self.key)
            .field("layer", &self.layer)
            .field("max_padding", &self.max_padding)
            .field("combos", &self.combos)
            .finish()
    }
}

impl Obfuscator {
    pub fn new(params: &ObfuscationParams) -> Result<Self> {
        params.validate()?;
        Self::from_registry(params, FunctionRegistry::standard(&params.initializer))
    }

    /// Build against selection tables shared across many obfuscators.
    pub fn with_tables(params: &ObfuscationParams, tables: Arc<PermutationTables>) -> Result<Self> {
        params.validate()?;
        let registry = FunctionRegistry::standard_with_tables(&params.initializer, tables);
        Self::from_registry(params, registry)
    }

    fn from_registry(params: &ObfuscationParams, registry: FunctionRegistry) -> Result<Self> {
        let combos = registry.permutation_table(params.layer)?.len();
        if combos == 0 {
            return Err(Error::InvalidLayer(params.layer));
        }
        Ok(Self {
            key: params.key,
            layer: params.layer,
            max_padding: params.max_padding,
            registry,
            combos,
            rng: Box::new(StdRng::from_entropy()),
        })
    }

    /// Replace the random source (header bytes, padding length and content).
    pub fn with_rng(mut self, rng: impl RngCore + Send + Sync + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    /// Swap the scalar key; layer, padding and initializer stay as they are.
    pub fn set_key(&mut self, key: u8) {
        self.key = key;
    }

    fn key_schedule(&self, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (self.key as usize + i * 37) as u8)
            .collect()
    }

    fn combination(&self, h0: u8, h1: u8) -> Vec<usize> {
        let index = (h0 as usize * h1 as usize) % self.combos;
        self.registry
            .permutation_table(self.layer)
            .ok()
            .and_then(|table| table.get(index))
            .map(|row| row.iter().map(|&i| i as usize).collect())
            .unwrap_or_default()
    }

    pub fn obfuscate(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut header = [0u8; HEADER_LEN];
        self.rng.fill_bytes(&mut header[..2]);

        let mut data = payload.to_vec();
        for index in self.combination(header[0], header[1]) {
            if let Some(pair) = self.registry.pair(index) {
                let schedule = self.key_schedule(data.len());
                data = (pair.obfuscate)(&data, &schedule, &pair.init);
            }
        }

        let padding_len = self.rng.gen_range(1..=self.max_padding);
        header[2] = padding_len;
        let mut padding = vec![0u8; padding_len as usize];
        self.rng.fill_bytes(&mut padding);

        let mut packet = Vec::with_capacity(HEADER_LEN + data.len() + padding.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&data);
        packet.extend_from_slice(&padding);
        packet
    }

    pub fn deobfuscate(&self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < HEADER_LEN {
            return Err(Error::InvalidLength {
                expected: HEADER_LEN + 1,
                actual: packet.len(),
            });
        }
        let padding_len = packet[2];
        if padding_len == 0 || padding_len > MAX_PADDING {
            return Err(Error::InvalidPadding(padding_len));
        }
        let body_end = packet
            .len()
            .checked_sub(padding_len as usize)
            .filter(|&end| end >= HEADER_LEN)
            .ok_or(Error::InvalidLength {
                expected: HEADER_LEN + padding_len as usize,
                actual: packet.len(),
            })?;

        let mut data = packet[HEADER_LEN..body_end].to_vec();
        for index in self.combination(packet[0], packet[1]).into_iter().rev() {
            if let Some(pair) = self.registry.pair(index) {
                let schedule = self.key_schedule(data.len());
                data = (pair.deobfuscate)(&data, &schedule, &pair.init);
            }
        }
        Ok(data)
    }
}

// ── Serde helpers ────────────────────────────────────────────────────

/// Substitution table as a JSON array of 256 integers in 0-255.
mod table_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(table: &[u8; 256], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(table.iter())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Box<[u8; 256]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values = Vec::<u8>::deserialize(deserializer)?;
        let table: [u8; 256] = values
            .try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::invalid_length(v.len(), &"256 entries"))?;
        Ok(Box::new(table))
    }
}
