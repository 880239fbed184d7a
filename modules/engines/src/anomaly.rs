//! Weighted payload anomalies applied on top of whatever an engine generated.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    SizeOverflow,
    BoundaryValues,
    InvalidUtf8,
    SpecialChars,
    FormatStrings,
    NullBytes,
    RandomNoise,
}

impl Anomaly {
    pub fn apply<R: Rng + ?Sized>(self, data: &[u8], rng: &mut R) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 16);
        match self {
            Anomaly::SizeOverflow => {
                out.extend(data.iter().copied().cycle().take(data.len().saturating_mul(8).min(8192)));
                out.extend(std::iter::repeat(b'A').take(1024));
            }
            Anomaly::BoundaryValues => {
                out.push(0x00);
                out.extend_from_slice(data);
                out.push(0xff);
            }
            Anomaly::InvalidUtf8 => {
                out.extend_from_slice(data);
                out.extend_from_slice(b"\xc3\x28\xed\xa0\x80");
            }
            Anomaly::SpecialChars => {
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n\r\n");
                out.extend_from_slice(&[0x7f; 8]);
            }
            Anomaly::FormatStrings => {
                out.extend_from_slice(data);
                out.extend_from_slice(b"%n%n%n%p%x%x%x");
            }
            Anomaly::NullBytes => {
                out.extend_from_slice(data);
                out.extend_from_slice(&[0u8; 256]);
            }
            Anomaly::RandomNoise => {
                out.extend_from_slice(data);
                let mut noise = [0u8; 512];
                rng.fill(&mut noise[..]);
                out.extend_from_slice(&noise);
            }
        }
        out
    }
}

/// Category weights. Zero-weight categories are never picked and an empty
/// (or all-zero) profile leaves payloads untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnomalyProfile {
    weights: BTreeMap<Anomaly, u32>,
}

impl AnomalyProfile {
    pub fn new(weights: impl IntoIterator<Item = (Anomaly, u32)>) -> Self {
        AnomalyProfile { weights: weights.into_iter().collect() }
    }

    pub fn total(&self) -> u64 {
        self.weights.values().map(|w| *w as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Anomaly> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let mut roll = rng.gen_range(1..=total);
        for (anomaly, weight) in &self.weights {
            let w = *weight as u64;
            if roll <= w {
                return Some(*anomaly);
            }
            roll -= w;
        }
        None
    }

    pub fn apply<R: Rng + ?Sized>(&self, data: Vec<u8>, rng: &mut R) -> Vec<u8> {
        match self.pick(rng) {
            Some(a) => a.apply(&data, rng),
            None => data,
        }
    }
}
