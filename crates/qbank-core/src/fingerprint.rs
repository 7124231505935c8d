use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::normalize::{checksum, NormalizedQuestion, Normalizer, NormalizerConfig};
use crate::BankError;

pub const DEFAULT_NUM_HASHES: usize = 64;
pub const DEFAULT_BANDS: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FingerprintConfig {
    pub num_hashes: usize,
    pub bands: usize,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self { num_hashes: DEFAULT_NUM_HASHES, bands: DEFAULT_BANDS }
    }
}

impl FingerprintConfig {
    /// Check that the signature splits evenly into bands.
    ///
    /// # Errors
    /// Returns [`BankError::Config`] for zero sizes, uneven banding, or too many bands.
    pub fn validate(&self) -> Result<(), BankError> {
        if self.num_hashes == 0 || self.bands == 0 {
            return Err(BankError::Config(
                "fingerprint.num_hashes and fingerprint.bands MUST be >= 1".to_string(),
            ));
        }
        if self.num_hashes % self.bands != 0 {
            return Err(BankError::Config(format!(
                "fingerprint.num_hashes ({}) MUST be divisible by fingerprint.bands ({})",
                self.num_hashes, self.bands
            )));
        }
        if u16::try_from(self.bands).is_err() {
            return Err(BankError::Config(format!(
                "fingerprint.bands MUST be <= {}",
                u16::MAX
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn rows_per_band(&self) -> usize {
        (self.num_hashes / self.bands.max(1)).max(1)
    }
}

/// Minhash signature: the minimum of each seeded hash function over a shingle set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Fingerprint(pub Vec<u64>);

impl Fingerprint {
    /// Band number and band hash for each `rows`-sized slice of the signature.
    pub fn bands(&self, rows: usize) -> impl Iterator<Item = (u16, u64)> + '_ {
        self.0
            .chunks(rows.max(1))
            .enumerate()
            .map(|(band, slice)| (u16::try_from(band).unwrap_or(u16::MAX), band_hash(slice)))
    }

    /// Fraction of agreeing signature slots, an estimate of the Jaccard index.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate_similarity(&self, other: &Self) -> f64 {
        let slots = self.0.len().min(other.0.len());
        if slots == 0 {
            return 0.0;
        }
        let agreeing = self.0.iter().zip(&other.0).filter(|(left, right)| left == right).count();
        agreeing as f64 / slots as f64
    }
}

#[derive(Debug, Clone)]
pub struct MinHasher {
    seeds: Vec<u64>,
    rows_per_band: usize,
}

impl MinHasher {
    /// Build the hash family for a validated config.
    ///
    /// # Errors
    /// Returns [`BankError::Config`] when the config fails validation.
    pub fn new(config: FingerprintConfig) -> Result<Self, BankError> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    fn with_config(config: FingerprintConfig) -> Self {
        let seeds = (0..config.num_hashes)
            .map(|slot| splitmix64(u64::try_from(slot).unwrap_or(u64::MAX)))
            .collect();
        Self { seeds, rows_per_band: config.rows_per_band() }
    }

    #[must_use]
    pub fn rows_per_band(&self) -> usize {
        self.rows_per_band
    }

    #[must_use]
    pub fn num_hashes(&self) -> usize {
        self.seeds.len()
    }

    #[must_use]
    pub fn fingerprint(&self, shingles: &BTreeSet<String>) -> Fingerprint {
        let mut minimums = vec![u64::MAX; self.seeds.len()];
        for shingle in shingles {
            let base = shingle_hash(shingle);
            for (slot, seed) in minimums.iter_mut().zip(&self.seeds) {
                let value = splitmix64(base ^ seed);
                if value < *slot {
                    *slot = value;
                }
            }
        }
        Fingerprint(minimums)
    }
}

impl Default for MinHasher {
    fn default() -> Self {
        Self::with_config(FingerprintConfig::default())
    }
}

/// Everything derived from one raw question text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub normalized: NormalizedQuestion,
    pub fingerprint: Fingerprint,
    pub checksum: String,
}

/// Normalizer and hash family bundled so every caller derives fingerprints the same way.
#[derive(Debug, Clone, Default)]
pub struct Analyzer {
    normalizer: Normalizer,
    hasher: MinHasher,
}

impl Analyzer {
    /// # Errors
    /// Returns [`BankError::Config`] when either config is invalid.
    pub fn new(
        normalizer: NormalizerConfig,
        fingerprint: FingerprintConfig,
    ) -> Result<Self, BankError> {
        Ok(Self { normalizer: Normalizer::new(normalizer)?, hasher: MinHasher::new(fingerprint)? })
    }

    /// Normalize, shingle, fingerprint and checksum `raw`.
    ///
    /// # Errors
    /// Returns [`BankError::InvalidInput`] when the text normalizes to nothing.
    pub fn analyze(&self, raw: &str) -> Result<Analysis, BankError> {
        let normalized = self.normalizer.normalize(raw)?;
        let fingerprint = self.hasher.fingerprint(&normalized.shingles);
        Ok(Analysis { normalized, fingerprint, checksum: checksum(raw) })
    }

    #[must_use]
    pub fn rows_per_band(&self) -> usize {
        self.hasher.rows_per_band()
    }

    #[must_use]
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    #[must_use]
    pub fn hasher(&self) -> &MinHasher {
        &self.hasher
    }
}

fn shingle_hash(shingle: &str) -> u64 {
    let digest = Sha256::digest(shingle.as_bytes());
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

fn band_hash(slice: &[u64]) -> u64 {
    slice.iter().fold(0xCBF2_9CE4_8422_2325, |acc, value| splitmix64(acc ^ value))
}

fn splitmix64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    value = (value ^ (value >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    value ^ (value >> 31)
}
