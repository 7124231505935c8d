use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::QuestionId;

type BandKey = (u16, u64);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    pub members: usize,
    pub subjects: usize,
    pub buckets: usize,
    pub rows_per_band: usize,
}

/// LSH band index over corpus fingerprints, partitioned by subject.
///
/// Two questions are index-adjacent when any band of their fingerprints hashes to the same
/// bucket. Entries are never removed.
#[derive(Debug, Clone)]
pub struct FingerprintIndex {
    rows_per_band: usize,
    partitions: HashMap<String, HashMap<BandKey, BTreeSet<QuestionId>>>,
    members: HashMap<QuestionId, String>,
}

impl FingerprintIndex {
    #[must_use]
    pub fn new(rows_per_band: usize) -> Self {
        Self {
            rows_per_band: rows_per_band.max(1),
            partitions: HashMap::new(),
            members: HashMap::new(),
        }
    }

    /// Insert one question's bands. Returns `false` when the id is already indexed.
    pub fn insert(&mut self, id: QuestionId, subject: &str, fingerprint: &Fingerprint) -> bool {
        if self.members.contains_key(&id) {
            return false;
        }

        let partition = self.partitions.entry(subject.to_string()).or_default();
        for band in fingerprint.bands(self.rows_per_band) {
            partition.entry(band).or_default().insert(id);
        }
        self.members.insert(id, subject.to_string());
        true
    }

    /// Union of every bucket the fingerprint's bands land in, within one subject.
    #[must_use]
    pub fn query(&self, subject: &str, fingerprint: &Fingerprint) -> BTreeSet<QuestionId> {
        let mut candidates = BTreeSet::new();
        let Some(partition) = self.partitions.get(subject) else {
            return candidates;
        };

        for band in fingerprint.bands(self.rows_per_band) {
            if let Some(bucket) = partition.get(&band) {
                candidates.extend(bucket.iter().copied());
            }
        }
        candidates
    }

    #[must_use]
    pub fn contains(&self, id: QuestionId) -> bool {
        self.members.contains_key(&id)
    }

    #[must_use]
    pub fn subject_of(&self, id: QuestionId) -> Option<&str> {
        self.members.get(&id).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn rows_per_band(&self) -> usize {
        self.rows_per_band
    }

    /// Every id referenced from any bucket.
    #[must_use]
    pub fn bucketed_ids(&self) -> BTreeSet<QuestionId> {
        self.partitions
            .values()
            .flat_map(HashMap::values)
            .flat_map(|bucket| bucket.iter().copied())
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            members: self.members.len(),
            subjects: self.partitions.len(),
            buckets: self.partitions.values().map(HashMap::len).sum(),
            rows_per_band: self.rows_per_band,
        }
    }
}
