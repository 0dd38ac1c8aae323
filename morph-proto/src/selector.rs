//! Weighted template choice and construction from handshake parameters.

use crate::error::{Error, Result};
use crate::template::{ProtocolTemplate, TemplateId, TemplateParams, WireTemplateParams};
use rand::Rng;

/// Default draw: QUIC and KCP are the most common UDP shapes on the wire.
pub const DEFAULT_WEIGHTS: [(TemplateId, u32); 4] = [
    (TemplateId::Quic, 30),
    (TemplateId::Kcp, 30),
    (TemplateId::GenericGaming, 20),
    (TemplateId::WebRtc, 20),
];

#[derive(Debug, Clone)]
pub struct TemplateFactory {
    weights: Vec<(TemplateId, u32)>,
    total: u32,
}

impl Default for TemplateFactory {
    fn default() -> Self {
        Self {
            weights: DEFAULT_WEIGHTS.to_vec(),
            total: DEFAULT_WEIGHTS.iter().map(|(_, w)| w).sum(),
        }
    }
}

impl TemplateFactory {
    /// Custom distribution; every variant must keep a non-zero weight.
    pub fn with_weights(weights: &[(TemplateId, u32)]) -> Result<Self> {
        for id in TemplateId::ALL {
            let weight: u32 = weights.iter().filter(|(t, _)| *t == id).map(|(_, w)| w).sum();
            if weight == 0 {
                return Err(Error::InvalidParameter(format!("template {} is unreachable", id)));
            }
        }
        Ok(Self {
            weights: weights.to_vec(),
            total: weights.iter().map(|(_, w)| w).sum(),
        })
    }

    pub fn select_random<R: Rng + ?Sized>(&self, rng: &mut R) -> TemplateId {
        let mut roll = rng.gen_range(0..self.total);
        for &(id, weight) in &self.weights {
            if roll < weight {
                return id;
            }
            roll -= weight;
        }
        TemplateId::Quic
    }

    /// Build a template for a wire `id`. Without `params` the instance
    /// starts from random state.
    pub fn create<R: Rng + ?Sized>(
        &self,
        id: u8,
        params: Option<&WireTemplateParams>,
        rng: &mut R,
    ) -> Result<ProtocolTemplate> {
        let id = TemplateId::from_u8(id)?;
        let params = match params {
            Some(wire) => TemplateParams::from_wire(id, wire, rng)?,
            None => TemplateParams::random(id, rng),
        };
        Ok(ProtocolTemplate::from_params(params))
    }
}
