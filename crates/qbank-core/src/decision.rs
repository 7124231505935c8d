use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::matcher::ScoredMatch;
use crate::{
    canonical_subject, AssessmentId, BankError, CandidateRef, PaperId, PaperMetadata, QuestionId,
};

pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.85;
pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Duplicate,
    PossibleDuplicate,
    Unique,
    Unknown,
}

impl Verdict {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::PossibleDuplicate => "possible_duplicate",
            Self::Unique => "unique",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "duplicate" => Some(Self::Duplicate),
            "possible_duplicate" => Some(Self::PossibleDuplicate),
            "unique" => Some(Self::Unique),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub duplicate_threshold: f64,
    pub review_threshold: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
            review_threshold: DEFAULT_REVIEW_THRESHOLD,
        }
    }
}

impl Thresholds {
    /// # Errors
    /// Returns [`BankError::ThresholdConfig`] unless `0 < review <= duplicate <= 1`.
    pub fn validate(&self, scope: &str) -> Result<(), BankError> {
        let Self { duplicate_threshold, review_threshold } = *self;
        if !duplicate_threshold.is_finite() || !review_threshold.is_finite() {
            return Err(BankError::ThresholdConfig(format!("{scope}: thresholds MUST be finite")));
        }
        let ordered = review_threshold > 0.0
            && review_threshold <= duplicate_threshold
            && duplicate_threshold <= 1.0;
        if !ordered {
            return Err(BankError::ThresholdConfig(format!(
                "{scope}: expected 0 < review_threshold ({review_threshold}) <= \
                 duplicate_threshold ({duplicate_threshold}) <= 1"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn classify(&self, score: f64) -> Verdict {
        if score >= self.duplicate_threshold {
            Verdict::Duplicate
        } else if score >= self.review_threshold {
            Verdict::PossibleDuplicate
        } else {
            Verdict::Unique
        }
    }
}

/// Verdict thresholds with optional per-subject overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionPolicy {
    pub duplicate_threshold: f64,
    pub review_threshold: f64,
    pub subject_overrides: BTreeMap<String, Thresholds>,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        let defaults = Thresholds::default();
        Self {
            duplicate_threshold: defaults.duplicate_threshold,
            review_threshold: defaults.review_threshold,
            subject_overrides: BTreeMap::new(),
        }
    }
}

impl DecisionPolicy {
    /// Validate every threshold pair and canonicalize override subjects.
    ///
    /// # Errors
    /// Returns [`BankError::ThresholdConfig`] for an invalid pair, a blank subject, or two
    /// overrides naming the same subject.
    pub fn validated(&self) -> Result<Self, BankError> {
        self.defaults().validate("policy")?;

        let mut subject_overrides = BTreeMap::new();
        for (raw_subject, thresholds) in &self.subject_overrides {
            let subject = canonical_subject(raw_subject).map_err(|_| {
                BankError::ThresholdConfig("policy override subject MUST NOT be blank".to_string())
            })?;
            thresholds.validate(&format!("policy override {subject}"))?;
            if subject_overrides.insert(subject.clone(), *thresholds).is_some() {
                return Err(BankError::ThresholdConfig(format!(
                    "policy overrides subject {subject} more than once"
                )));
            }
        }

        Ok(Self {
            duplicate_threshold: self.duplicate_threshold,
            review_threshold: self.review_threshold,
            subject_overrides,
        })
    }

    #[must_use]
    pub fn defaults(&self) -> Thresholds {
        Thresholds {
            duplicate_threshold: self.duplicate_threshold,
            review_threshold: self.review_threshold,
        }
    }

    /// Thresholds for a canonical subject.
    #[must_use]
    pub fn thresholds_for(&self, subject: &str) -> Thresholds {
        self.subject_overrides.get(subject).copied().unwrap_or_else(|| self.defaults())
    }
}

/// Matcher output for one candidate of an assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScan {
    pub candidate_ref: CandidateRef,
    pub subject: String,
    /// Earlier candidate of the same assessment with identical normalized text.
    pub repeat_of: Option<CandidateRef>,
    pub outcome: ScanOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Scored(Vec<ScoredMatch>),
    Failed(BankError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub candidate_ref: CandidateRef,
    pub matched_question_id: QuestionId,
    pub matched_paper_id: PaperId,
    pub similarity_score: f64,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BestMatch {
    pub question_id: QuestionId,
    pub paper_id: PaperId,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateVerdict {
    pub candidate_ref: CandidateRef,
    pub subject: String,
    pub verdict: Verdict,
    pub best_match: Option<BestMatch>,
    pub matches: Vec<MatchResult>,
    pub repeat_of: Option<CandidateRef>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub unique_count: usize,
    pub duplicate_count: usize,
    pub review_count: usize,
    pub unknown_count: usize,
    pub total: usize,
    pub mean_best_score: f64,
    pub commit_eligible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub verdicts: Vec<CandidateVerdict>,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckReport {
    pub assessment_id: AssessmentId,
    pub revision: u32,
    pub corpus_version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub metadata: PaperMetadata,
    pub per_candidate: Vec<CandidateVerdict>,
    pub summary: Summary,
}

/// Turn matcher output into verdicts and an assessment summary.
///
/// The policy is validated before any scan is looked at. A failed scan is always
/// [`Verdict::Unknown`]; a repeat inside the assessment is always [`Verdict::Duplicate`].
///
/// # Errors
/// Returns [`BankError::ThresholdConfig`] when the policy is invalid.
#[allow(clippy::cast_precision_loss)]
pub fn decide(scans: &[CandidateScan], policy: &DecisionPolicy) -> Result<Decision, BankError> {
    let policy = policy.validated()?;

    let mut verdicts = Vec::with_capacity(scans.len());
    let mut best_scores = Vec::new();
    for scan in scans {
        let thresholds = policy.thresholds_for(&scan.subject);
        let verdict = match &scan.outcome {
            ScanOutcome::Failed(err) => CandidateVerdict {
                candidate_ref: scan.candidate_ref,
                subject: scan.subject.clone(),
                verdict: Verdict::Unknown,
                best_match: None,
                matches: Vec::new(),
                repeat_of: scan.repeat_of,
                failure: Some(err.to_string()),
            },
            ScanOutcome::Scored(matches) => {
                let results = matches
                    .iter()
                    .map(|item| MatchResult {
                        candidate_ref: scan.candidate_ref,
                        matched_question_id: item.question_id,
                        matched_paper_id: item.paper_id,
                        similarity_score: item.score,
                        verdict: thresholds.classify(item.score),
                    })
                    .collect::<Vec<_>>();
                let best_match = matches.first().map(|item| BestMatch {
                    question_id: item.question_id,
                    paper_id: item.paper_id,
                    score: item.score,
                });
                best_scores.push(best_match.as_ref().map_or(0.0, |best| best.score));

                let verdict = if scan.repeat_of.is_some() {
                    Verdict::Duplicate
                } else {
                    best_match
                        .as_ref()
                        .map_or(Verdict::Unique, |best| thresholds.classify(best.score))
                };

                CandidateVerdict {
                    candidate_ref: scan.candidate_ref,
                    subject: scan.subject.clone(),
                    verdict,
                    best_match,
                    matches: results,
                    repeat_of: scan.repeat_of,
                    failure: None,
                }
            }
        };
        verdicts.push(verdict);
    }

    let count = |wanted: Verdict| verdicts.iter().filter(|item| item.verdict == wanted).count();
    let unknown_count = count(Verdict::Unknown);
    let mean_best_score = if best_scores.is_empty() {
        0.0
    } else {
        best_scores.iter().sum::<f64>() / best_scores.len() as f64
    };
    let summary = Summary {
        unique_count: count(Verdict::Unique),
        duplicate_count: count(Verdict::Duplicate),
        review_count: count(Verdict::PossibleDuplicate),
        unknown_count,
        total: verdicts.len(),
        mean_best_score,
        commit_eligible: unknown_count == 0,
    };

    Ok(Decision { verdicts, summary })
}

/// Resolve which candidates of `report` a commit may promote.
///
/// With no explicit approval every `Unique` candidate is taken. Returned refs are ascending and
/// free of repeats.
///
/// # Errors
/// Returns [`BankError::CommitRejected`] when the report has `Unknown` verdicts, or an approved
/// ref is absent from the report or is not `Unique` there.
pub fn plan_commit(
    report: &CheckReport,
    approved: Option<&[CandidateRef]>,
) -> Result<Vec<CandidateRef>, BankError> {
    if report.summary.unknown_count > 0 {
        return Err(BankError::CommitRejected(format!(
            "check revision {} of assessment {} has {} candidate(s) with unknown verdict",
            report.revision, report.assessment_id, report.summary.unknown_count
        )));
    }

    let Some(approved) = approved else {
        return Ok(report
            .per_candidate
            .iter()
            .filter(|item| item.verdict == Verdict::Unique)
            .map(|item| item.candidate_ref)
            .collect());
    };

    let by_ref = report
        .per_candidate
        .iter()
        .map(|item| (item.candidate_ref, item.verdict))
        .collect::<BTreeMap<_, _>>();

    let mut planned = BTreeSet::new();
    for candidate_ref in approved {
        match by_ref.get(candidate_ref) {
            None => {
                return Err(BankError::CommitRejected(format!(
                    "candidate {candidate_ref} is not part of check revision {}",
                    report.revision
                )));
            }
            Some(Verdict::Unique) => {
                planned.insert(*candidate_ref);
            }
            Some(verdict) => {
                return Err(BankError::CommitRejected(format!(
                    "candidate {candidate_ref} has verdict {} and cannot be committed",
                    verdict.as_str()
                )));
            }
        }
    }

    Ok(planned.into_iter().collect())
}
