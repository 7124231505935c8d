use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::index::FingerprintIndex;
use crate::{BankError, Question, QuestionId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexReport {
    pub consistent: bool,
    pub corpus_version: u64,
    pub question_count: usize,
    pub indexed_count: usize,
    pub missing_from_index: Vec<QuestionId>,
    pub dangling_in_index: Vec<QuestionId>,
    pub unreachable: Vec<QuestionId>,
}

/// Append-only in-memory view of every committed question plus its fingerprint index.
#[derive(Debug, Clone)]
pub struct MasterCorpus {
    version: u64,
    questions: BTreeMap<QuestionId, Question>,
    index: FingerprintIndex,
}

impl MasterCorpus {
    #[must_use]
    pub fn new(rows_per_band: usize) -> Self {
        Self { version: 0, questions: BTreeMap::new(), index: FingerprintIndex::new(rows_per_band) }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: QuestionId) -> Option<&Question> {
        self.questions.get(&id)
    }

    pub fn questions(&self) -> impl Iterator<Item = &Question> {
        self.questions.values()
    }

    #[must_use]
    pub fn index(&self) -> &FingerprintIndex {
        &self.index
    }

    /// Append one durable batch and advance to `version`.
    ///
    /// Either every question is added or the corpus is left untouched.
    ///
    /// # Errors
    /// Returns [`BankError::IndexInconsistency`] when `version` does not move forward or a
    /// question id is already present.
    pub fn append_batch(&mut self, version: u64, batch: Vec<Question>) -> Result<usize, BankError> {
        if version <= self.version {
            return Err(BankError::IndexInconsistency(format!(
                "batch version {version} does not advance corpus version {}",
                self.version
            )));
        }

        let mut seen = BTreeSet::new();
        for question in &batch {
            if self.questions.contains_key(&question.id) || !seen.insert(question.id) {
                return Err(BankError::IndexInconsistency(format!(
                    "question {} is already part of the corpus",
                    question.id
                )));
            }
        }

        let appended = batch.len();
        for question in batch {
            self.index.insert(question.id, &question.subject, &question.fingerprint);
            self.questions.insert(question.id, question);
        }
        self.version = version;
        Ok(appended)
    }

    /// Per-subject question counts.
    #[must_use]
    pub fn subject_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for question in self.questions.values() {
            *counts.entry(question.subject.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Check that the index is an exact projection of the corpus: every question indexed under
    /// its own subject and retrievable by its own fingerprint, and no bucket naming a stranger.
    #[must_use]
    pub fn verify(&self) -> IndexReport {
        let mut missing_from_index = Vec::new();
        let mut unreachable = Vec::new();

        for question in self.questions.values() {
            if self.index.subject_of(question.id) != Some(question.subject.as_str()) {
                missing_from_index.push(question.id);
                continue;
            }
            if !self.index.query(&question.subject, &question.fingerprint).contains(&question.id) {
                unreachable.push(question.id);
            }
        }

        let dangling_in_index = self
            .index
            .bucketed_ids()
            .into_iter()
            .filter(|id| !self.questions.contains_key(id))
            .collect::<Vec<_>>();

        IndexReport {
            consistent: missing_from_index.is_empty()
                && unreachable.is_empty()
                && dangling_in_index.is_empty()
                && self.index.len() == self.questions.len(),
            corpus_version: self.version,
            question_count: self.questions.len(),
            indexed_count: self.index.len(),
            missing_from_index,
            dangling_in_index,
            unreachable,
        }
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::fingerprint::Analyzer;
    use crate::PaperId;

    fn question(raw: &str, subject: &str) -> Question {
        let analysis = match Analyzer::default().analyze(raw) {
            Ok(value) => value,
            Err(err) => panic!("analysis failed for {raw:?}: {err}"),
        };
        Question {
            id: QuestionId::new(),
            paper_id: PaperId::new(),
            subject: subject.to_string(),
            raw_text: raw.to_string(),
            normalized_text: analysis.normalized.normalized_text,
            checksum: analysis.checksum,
            marks: None,
            imported_at: OffsetDateTime::UNIX_EPOCH,
            corpus_version: 1,
            shingles: analysis.normalized.shingles,
            fingerprint: analysis.fingerprint,
        }
    }

    #[test]
    fn append_batch_advances_version_and_indexes() -> Result<(), BankError> {
        let mut corpus = MasterCorpus::new(2);
        let first = question("Define acceleration", "physics");
        let second = question("Name the noble gases", "chemistry");
        let first_id = first.id;

        assert_eq!(corpus.append_batch(1, vec![first, second])?, 2);
        assert_eq!(corpus.version(), 1);
        assert_eq!(corpus.len(), 2);
        assert!(corpus.index().contains(first_id));
        assert_eq!(corpus.subject_counts().get("physics"), Some(&1));
        assert!(corpus.verify().consistent);
        Ok(())
    }

    #[test]
    fn stale_version_is_rejected_without_changes() -> Result<(), BankError> {
        let mut corpus = MasterCorpus::new(2);
        corpus.append_batch(2, vec![question("Define acceleration", "physics")])?;

        let result = corpus.append_batch(2, vec![question("Define velocity", "physics")]);
        assert!(matches!(result, Err(BankError::IndexInconsistency(_))));
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.version(), 2);
        Ok(())
    }

    #[test]
    fn repeated_ids_reject_the_whole_batch() -> Result<(), BankError> {
        let mut corpus = MasterCorpus::new(2);
        let existing = question("Define acceleration", "physics");
        corpus.append_batch(1, vec![existing.clone()])?;

        let fresh = question("Define velocity", "physics");
        let result = corpus.append_batch(2, vec![fresh, existing]);
        assert!(matches!(result, Err(BankError::IndexInconsistency(_))));
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.version(), 1);
        Ok(())
    }

    #[test]
    fn empty_corpus_verifies_clean() {
        let report = MasterCorpus::new(2).verify();
        assert!(report.consistent);
        assert_eq!(report.question_count, 0);
    }
}
