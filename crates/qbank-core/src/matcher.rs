use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::corpus::MasterCorpus;
use crate::fingerprint::Fingerprint;
use crate::normalize::jaccard;
use crate::{BankError, PaperId, QuestionId};

pub const DEFAULT_RECALL_FLOOR: f64 = 0.15;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatcherConfig {
    pub recall_floor: f64,
    /// Per-candidate scan budget. `None` disables the deadline.
    pub deadline_ms: Option<u64>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self { recall_floor: DEFAULT_RECALL_FLOOR, deadline_ms: None }
    }
}

impl MatcherConfig {
    /// # Errors
    /// Returns [`BankError::Config`] when the floor is not a finite value in `[0, 1]`.
    pub fn validate(&self) -> Result<(), BankError> {
        if !self.recall_floor.is_finite() || !(0.0..=1.0).contains(&self.recall_floor) {
            return Err(BankError::Config(format!(
                "matcher.recall_floor MUST be within [0, 1], got {}",
                self.recall_floor
            )));
        }
        Ok(())
    }
}

/// A normalized question looking for its neighbours.
#[derive(Debug, Clone, Copy)]
pub struct Probe<'a> {
    pub subject: &'a str,
    pub shingles: &'a BTreeSet<String>,
    pub fingerprint: &'a Fingerprint,
    /// Corpus id of the probe itself, never reported as a match.
    pub exclude: Option<QuestionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredMatch {
    pub question_id: QuestionId,
    pub paper_id: PaperId,
    pub score: f64,
}

/// Score every index-adjacent corpus question against `probe`.
///
/// Results at or above the recall floor are returned highest score first, equal scores by
/// ascending question id.
///
/// # Errors
/// Returns [`BankError::MatchTimeout`] when the deadline passes before the scan completes and
/// [`BankError::IndexInconsistency`] when the index names a question the corpus lacks.
pub fn match_probe(
    corpus: &MasterCorpus,
    probe: &Probe<'_>,
    config: &MatcherConfig,
) -> Result<Vec<ScoredMatch>, BankError> {
    let started = Instant::now();
    let deadline = config.deadline_ms.map(|millis| (millis, Duration::from_millis(millis)));
    let candidates = corpus.index().query(probe.subject, probe.fingerprint);

    let mut matches = Vec::new();
    for (scored, id) in candidates.iter().enumerate() {
        if let Some((deadline_ms, limit)) = deadline {
            if started.elapsed() >= limit {
                return Err(BankError::MatchTimeout {
                    deadline_ms,
                    scored,
                    candidates: candidates.len(),
                });
            }
        }
        if Some(*id) == probe.exclude {
            continue;
        }

        let Some(question) = corpus.get(*id) else {
            return Err(BankError::IndexInconsistency(format!(
                "index references question {id} missing from corpus version {}",
                corpus.version()
            )));
        };

        let score = jaccard(probe.shingles, &question.shingles);
        if score >= config.recall_floor {
            matches.push(ScoredMatch {
                question_id: question.id,
                paper_id: question.paper_id,
                score,
            });
        }
    }

    matches.sort_by(|left, right| {
        right.score.total_cmp(&left.score).then_with(|| left.question_id.cmp(&right.question_id))
    });
    Ok(matches)
}
