use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod corpus;
pub mod decision;
pub mod fingerprint;
pub mod index;
pub mod matcher;
pub mod normalize;

pub use corpus::{IndexReport, MasterCorpus};
pub use decision::{
    decide, plan_commit, BestMatch, CandidateScan, CandidateVerdict, CheckReport, Decision,
    DecisionPolicy, MatchResult, ScanOutcome, Summary, Thresholds, Verdict,
};
pub use fingerprint::{Analysis, Analyzer, Fingerprint, FingerprintConfig, MinHasher};
pub use index::{FingerprintIndex, IndexStats};
pub use matcher::{match_probe, MatcherConfig, Probe, ScoredMatch};
pub use normalize::{checksum, jaccard, NormalizedQuestion, Normalizer, NormalizerConfig};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum BankError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("match timed out after {deadline_ms}ms ({scored} of {candidates} candidates scored)")]
    MatchTimeout { deadline_ms: u64, scored: usize, candidates: usize },
    #[error("index inconsistency: {0}")]
    IndexInconsistency(String),
    #[error("threshold config error: {0}")]
    ThresholdConfig(String),
    /// `scope` names what moved: `"corpus version"` or `"check revision"`.
    #[error("concurrent commit conflict: expected {scope} {expected}, found {actual}")]
    ConcurrentCommitConflict { scope: &'static str, expected: u64, actual: u64 },
    #[error("commit rejected: {0}")]
    CommitRejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config error: {0}")]
    Config(String),
}

impl BankError {
    /// Stable machine-readable error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::MatchTimeout { .. } => "match_timeout",
            Self::IndexInconsistency(_) => "index_inconsistency",
            Self::ThresholdConfig(_) => "threshold_config",
            Self::ConcurrentCommitConflict { .. } => "concurrent_commit_conflict",
            Self::CommitRejected(_) => "commit_rejected",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config",
        }
    }
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse a ULID string.
            ///
            /// # Errors
            /// Returns [`BankError::InvalidInput`] when `raw` is not a valid ULID.
            pub fn parse(raw: &str) -> Result<Self, BankError> {
                Ulid::from_string(raw)
                    .map(Self)
                    .map_err(|err| BankError::InvalidInput(format!("invalid ULID {raw}: {err}")))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(QuestionId);
ulid_id!(PaperId);
ulid_id!(AssessmentId);

/// One-based position of a candidate inside a submitted assessment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CandidateRef(pub u32);

impl CandidateRef {
    /// Reference for the candidate at zero-based `index`.
    ///
    /// # Errors
    /// Returns [`BankError::InvalidInput`] when the position does not fit in `u32`.
    pub fn from_index(index: usize) -> Result<Self, BankError> {
        index
            .checked_add(1)
            .and_then(|position| u32::try_from(position).ok())
            .map(Self)
            .ok_or_else(|| BankError::InvalidInput(format!("candidate index {index} out of range")))
    }

    #[must_use]
    pub fn index(self) -> usize {
        usize::try_from(self.0.saturating_sub(1)).unwrap_or(usize::MAX)
    }
}

impl Display for CandidateRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaperOrigin {
    Imported,
    Committed,
}

impl PaperOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Imported => "imported",
            Self::Committed => "committed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "imported" => Some(Self::Imported),
            "committed" => Some(Self::Committed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaperMetadata {
    pub title: String,
    #[serde(default)]
    pub term: String,
    pub subject: String,
}

impl PaperMetadata {
    /// Trim fields and canonicalize the subject.
    ///
    /// # Errors
    /// Returns [`BankError::InvalidInput`] when the title or subject is blank.
    pub fn validated(&self) -> Result<Self, BankError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(BankError::InvalidInput("paper title MUST be provided".to_string()));
        }
        Ok(Self {
            title: title.to_string(),
            term: self.term.trim().to_string(),
            subject: canonical_subject(&self.subject)?,
        })
    }
}

/// Validated input row for an import or a check: one question's text plus optional metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionRecord {
    pub text: String,
    #[serde(default)]
    pub marks: Option<u32>,
    /// Overrides the paper subject for this record.
    #[serde(default)]
    pub subject: Option<String>,
}

impl QuestionRecord {
    /// Subject this record is matched under.
    ///
    /// # Errors
    /// Returns [`BankError::InvalidInput`] when the override is blank.
    pub fn subject_or(&self, paper_subject: &str) -> Result<String, BankError> {
        match &self.subject {
            Some(subject) => canonical_subject(subject),
            None => canonical_subject(paper_subject),
        }
    }
}

/// Subjects compare case-insensitively and ignore surrounding whitespace.
///
/// # Errors
/// Returns [`BankError::InvalidInput`] for a blank subject.
pub fn canonical_subject(raw: &str) -> Result<String, BankError> {
    let subject = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    if subject.is_empty() {
        return Err(BankError::InvalidInput("subject MUST be provided".to_string()));
    }
    Ok(subject)
}

/// A committed corpus question. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub id: QuestionId,
    pub paper_id: PaperId,
    pub subject: String,
    pub raw_text: String,
    pub normalized_text: String,
    pub checksum: String,
    pub marks: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub imported_at: OffsetDateTime,
    pub corpus_version: u64,
    #[serde(skip)]
    pub shingles: std::collections::BTreeSet<String>,
    #[serde(skip)]
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Paper {
    pub id: PaperId,
    #[serde(flatten)]
    pub metadata: PaperMetadata,
    pub origin: PaperOrigin,
    pub assessment_id: Option<AssessmentId>,
    #[serde(with = "time::serde::rfc3339")]
    pub imported_at: OffsetDateTime,
    pub question_ids: Vec<QuestionId>,
}

/// Outcome of checking an assessment in. Replaying the same commit returns this value unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitResult {
    pub assessment_id: AssessmentId,
    pub revision: u32,
    pub paper_id: Option<PaperId>,
    pub committed_count: usize,
    pub committed_refs: Vec<CandidateRef>,
    pub new_question_ids: Vec<QuestionId>,
    pub corpus_version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
}
