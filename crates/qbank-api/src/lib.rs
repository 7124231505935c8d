use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use qbank_core::{
    decide, match_probe, plan_commit, Analysis, Analyzer, AssessmentId, BankError, CandidateRef,
    CandidateScan, CheckReport, CommitResult, DecisionPolicy, IndexReport, IndexStats,
    MasterCorpus, PaperId, PaperMetadata, Probe, Question, QuestionId, QuestionRecord,
    ScanOutcome, Verdict,
};
use qbank_store_sqlite::{
    CommitWrite, ExportManifest, IntegrityReport, NewQuestion, PaperDetail, PaperSummary,
    PaperWrite, SchemaStatus, SqliteStore, StoredQuestion,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod config;

pub use config::{QbankConfig, ServiceConfig};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// One paper of an import batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaperImport {
    #[serde(flatten)]
    pub metadata: PaperMetadata,
    pub questions: Vec<QuestionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub paper_id: PaperId,
    pub imported_count: usize,
    pub skipped_exact_duplicates: usize,
    pub rejected_invalid: usize,
    pub question_ids: Vec<QuestionId>,
    pub corpus_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckRequest {
    /// Re-check an existing assessment instead of opening a new one.
    #[serde(default)]
    pub assessment_id: Option<AssessmentId>,
    pub metadata: PaperMetadata,
    pub candidates: Vec<QuestionRecord>,
    #[serde(default)]
    pub policy: Option<DecisionPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorpusStats {
    pub corpus_version: u64,
    pub durable_version: u64,
    pub question_count: usize,
    pub paper_count: usize,
    pub subjects: BTreeMap<String, usize>,
    pub index: IndexStats,
    pub poisoned: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarQuestion {
    pub question_id: QuestionId,
    pub paper_id: PaperId,
    pub score: f64,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarQuestions {
    pub question_id: QuestionId,
    pub subject: String,
    pub corpus_version: u64,
    pub matches: Vec<SimilarQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReindexResult {
    pub previous_version: u64,
    pub corpus_version: u64,
    pub question_count: usize,
    pub cleared_poison: Option<String>,
}

/// Entry point for every question bank operation.
///
/// Cloning is cheap and clones share one in-memory corpus, so a service can hand a clone to each
/// request. The corpus is a projection of the durable store and catches up with writes made by
/// other processes before every check and write.
#[derive(Debug, Clone)]
pub struct QbankApi {
    inner: Arc<ApiInner>,
}

#[derive(Debug)]
struct ApiInner {
    db_path: PathBuf,
    config: QbankConfig,
    analyzer: Analyzer,
    corpus: RwLock<MasterCorpus>,
    write_gate: Mutex<()>,
    poisoned: Mutex<Option<String>>,
}

impl QbankApi {
    /// Build an API over the database at `db_path`.
    ///
    /// # Errors
    /// Returns an error when `config` is invalid.
    pub fn new(db_path: PathBuf, mut config: QbankConfig) -> Result<Self> {
        config.validate()?;
        config.policy = config.policy.validated()?;
        let analyzer = Analyzer::new(config.normalizer, config.fingerprint)?;
        let corpus = MasterCorpus::new(analyzer.rows_per_band());
        Ok(Self {
            inner: Arc::new(ApiInner {
                db_path,
                config,
                analyzer,
                corpus: RwLock::new(corpus),
                write_gate: Mutex::new(()),
                poisoned: Mutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    #[must_use]
    pub fn config(&self) -> &QbankConfig {
        &self.inner.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.inner.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Import papers into the master corpus.
    ///
    /// Records that normalize to nothing are counted as rejected. Records whose raw text already
    /// exists under the same subject, in the corpus or earlier in the batch, are skipped.
    ///
    /// # Errors
    /// Returns an error for an empty batch or blank paper metadata, while writes are blocked by
    /// an index inconsistency, or when persistence fails.
    pub fn import_papers(&self, papers: Vec<PaperImport>) -> Result<Vec<ImportResult>> {
        if papers.is_empty() {
            return Err(
                BankError::InvalidInput("at least one paper MUST be provided".to_string()).into()
            );
        }

        let mut writes = Vec::with_capacity(papers.len());
        let mut rejected = Vec::with_capacity(papers.len());
        for paper in papers {
            let metadata = paper.metadata.validated()?;
            let mut questions = Vec::with_capacity(paper.questions.len());
            let mut rejected_invalid = 0_usize;
            for (index, record) in paper.questions.iter().enumerate() {
                match self.prepare_question(record, &metadata.subject, position(index)?) {
                    Ok(question) => questions.push(question),
                    Err(err) => {
                        rejected_invalid += 1;
                        tracing::debug!(
                            paper = %metadata.title,
                            position = index + 1,
                            error = %err,
                            "rejected question record"
                        );
                    }
                }
            }
            writes.push(PaperWrite { metadata, questions });
            rejected.push(rejected_invalid);
        }

        let _gate = self.inner.write_gate.lock();
        self.ensure_writable()?;
        let mut store = self.open_migrated()?;
        self.refresh(&store)?;
        let batch = store.import_papers(&writes)?;
        self.sync_after_write(&store);

        let results = batch
            .papers
            .into_iter()
            .zip(rejected)
            .map(|(paper, rejected_invalid)| ImportResult {
                paper_id: paper.paper_id,
                imported_count: paper.imported_count,
                skipped_exact_duplicates: paper.skipped_exact_duplicates,
                rejected_invalid,
                question_ids: paper.question_ids,
                corpus_version: batch.corpus_version,
            })
            .collect::<Vec<_>>();

        tracing::info!(
            papers = results.len(),
            imported = results.iter().map(|item| item.imported_count).sum::<usize>(),
            corpus_version = batch.corpus_version,
            "imported papers"
        );
        Ok(results)
    }

    /// Score every candidate of an assessment against the master corpus and persist the report
    /// as the assessment's next revision.
    ///
    /// Invalid candidates and timed-out scans become `Unknown`, never `Unique`. A candidate that
    /// repeats an earlier candidate of the same assessment is a `Duplicate`.
    ///
    /// # Errors
    /// Returns [`BankError::ThresholdConfig`] for an invalid policy (before any scoring),
    /// [`BankError::InvalidInput`] for blank metadata, no candidates, or an already committed
    /// assessment, and [`BankError::IndexInconsistency`] when the index is corrupt.
    pub fn check_assessment(&self, request: CheckRequest) -> Result<CheckReport> {
        let policy = request.policy.as_ref().unwrap_or(&self.inner.config.policy).validated()?;
        let metadata = request.metadata.validated()?;
        if request.candidates.is_empty() {
            return Err(
                BankError::InvalidInput("at least one candidate MUST be provided".to_string())
                    .into(),
            );
        }
        let assessment_id = request.assessment_id.unwrap_or_default();

        let mut store = self.open_migrated()?;
        if store.committed_result(assessment_id)?.is_some() {
            return Err(BankError::InvalidInput(format!(
                "assessment {assessment_id} is already committed"
            ))
            .into());
        }
        self.refresh(&store)?;

        let corpus = self.inner.corpus.read();
        let corpus_version = corpus.version();
        let mut first_seen = HashMap::new();
        let mut scans = Vec::with_capacity(request.candidates.len());
        for (index, record) in request.candidates.iter().enumerate() {
            let candidate_ref = CandidateRef::from_index(index)?;
            let (subject, analysis) = match self.analyze_record(record, &metadata.subject) {
                Ok(prepared) => prepared,
                Err(err) => {
                    scans.push(CandidateScan {
                        candidate_ref,
                        subject: metadata.subject.clone(),
                        repeat_of: None,
                        outcome: ScanOutcome::Failed(err),
                    });
                    continue;
                }
            };

            let key = (subject.clone(), analysis.normalized.normalized_text.clone());
            let repeat_of = match first_seen.entry(key) {
                Entry::Occupied(entry) => Some(*entry.get()),
                Entry::Vacant(entry) => {
                    entry.insert(candidate_ref);
                    None
                }
            };

            let probe = Probe {
                subject: &subject,
                shingles: &analysis.normalized.shingles,
                fingerprint: &analysis.fingerprint,
                exclude: None,
            };
            let outcome = match match_probe(&corpus, &probe, &self.inner.config.matcher) {
                Ok(matches) => ScanOutcome::Scored(matches),
                Err(err @ BankError::IndexInconsistency(_)) => {
                    self.poison(&err);
                    return Err(err.into());
                }
                Err(err) => {
                    tracing::warn!(
                        %assessment_id,
                        %candidate_ref,
                        error = %err,
                        "candidate scan failed"
                    );
                    ScanOutcome::Failed(err)
                }
            };
            scans.push(CandidateScan { candidate_ref, subject, repeat_of, outcome });
        }
        drop(corpus);

        let decision = decide(&scans, &policy)?;
        let report = store.save_check(
            CheckReport {
                assessment_id,
                revision: 0,
                corpus_version,
                generated_at: OffsetDateTime::now_utc(),
                metadata,
                per_candidate: decision.verdicts,
                summary: decision.summary,
            },
            &request.candidates,
        )?;

        tracing::info!(
            %assessment_id,
            revision = report.revision,
            corpus_version,
            unique = report.summary.unique_count,
            duplicate = report.summary.duplicate_count,
            review = report.summary.review_count,
            unknown = report.summary.unknown_count,
            "checked assessment"
        );
        Ok(report)
    }

    /// Check an assessment's approved candidates into the master corpus as a new paper.
    ///
    /// `approved` defaults to every `Unique` candidate of the latest check. Committing an
    /// assessment again returns the original result without writing.
    ///
    /// # Errors
    /// Returns [`BankError::NotFound`] when the assessment was never checked,
    /// [`BankError::CommitRejected`] for unknown verdicts or refs that are not `Unique`,
    /// [`BankError::ConcurrentCommitConflict`] when the corpus changed since the check, and
    /// [`BankError::IndexInconsistency`] while writes are blocked.
    pub fn commit_assessment(
        &self,
        assessment_id: AssessmentId,
        approved: Option<Vec<CandidateRef>>,
    ) -> Result<CommitResult> {
        let mut store = self.open_migrated()?;
        if let Some(result) = store.committed_result(assessment_id)? {
            tracing::info!(%assessment_id, revision = result.revision, "replayed commit");
            return Ok(result);
        }

        let Some(stored) = store.latest_check(assessment_id)? else {
            return Err(BankError::NotFound(format!(
                "no check report for assessment {assessment_id}"
            ))
            .into());
        };
        let refs = plan_commit(&stored.report, approved.as_deref())?;

        let mut questions = Vec::with_capacity(refs.len());
        for (offset, candidate_ref) in refs.iter().enumerate() {
            let Some(record) = stored.candidates.get(candidate_ref.index()) else {
                return Err(BankError::CommitRejected(format!(
                    "candidate {candidate_ref} has no stored record"
                ))
                .into());
            };
            questions.push(self.prepare_question(
                record,
                &stored.report.metadata.subject,
                position(offset)?,
            )?);
        }

        let _gate = self.inner.write_gate.lock();
        self.ensure_writable()?;
        self.refresh(&store)?;

        let write = CommitWrite {
            assessment_id,
            revision: stored.report.revision,
            expected_version: stored.report.corpus_version,
            metadata: stored.report.metadata.clone(),
            refs,
            questions,
        };
        let outcome = match store.commit_assessment(&write) {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Some(BankError::ConcurrentCommitConflict { scope, expected, actual }) =
                    err.downcast_ref::<BankError>()
                {
                    tracing::warn!(
                        %assessment_id,
                        scope,
                        expected,
                        actual,
                        "commit conflicts with a newer write"
                    );
                }
                return Err(err);
            }
        };
        if !outcome.replayed {
            self.sync_after_write(&store);
        }

        tracing::info!(
            %assessment_id,
            revision = outcome.result.revision,
            committed = outcome.result.committed_count,
            corpus_version = outcome.result.corpus_version,
            replayed = outcome.replayed,
            "committed assessment"
        );
        Ok(outcome.result)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_papers(&self) -> Result<Vec<PaperSummary>> {
        let store = self.open_migrated()?;
        store.list_papers()
    }

    /// # Errors
    /// Returns [`BankError::NotFound`] for an unknown paper, or an error when the store cannot
    /// be read.
    pub fn get_paper(&self, paper_id: PaperId) -> Result<PaperDetail> {
        let store = self.open_migrated()?;
        store
            .get_paper(paper_id)?
            .ok_or_else(|| BankError::NotFound(format!("paper {paper_id} not found")).into())
    }

    /// Size of the in-memory corpus and its index next to the durable version.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or the projection cannot catch up.
    pub fn corpus_stats(&self) -> Result<CorpusStats> {
        let store = self.open_migrated()?;
        self.refresh(&store)?;
        let (paper_count, _) = store.counts()?;
        let durable_version = store.corpus_version()?;

        let corpus = self.inner.corpus.read();
        Ok(CorpusStats {
            corpus_version: corpus.version(),
            durable_version,
            question_count: corpus.len(),
            paper_count,
            subjects: corpus.subject_counts(),
            index: corpus.index().stats(),
            poisoned: self.inner.poisoned.lock().clone(),
        })
    }

    /// Corpus neighbours of a stored question, classified with the configured policy.
    ///
    /// # Errors
    /// Returns [`BankError::NotFound`] for an unknown question and
    /// [`BankError::MatchTimeout`] or [`BankError::IndexInconsistency`] from the scan.
    pub fn similar_questions(&self, question_id: QuestionId) -> Result<SimilarQuestions> {
        let store = self.open_migrated()?;
        self.refresh(&store)?;

        let corpus = self.inner.corpus.read();
        let Some(question) = corpus.get(question_id) else {
            return Err(BankError::NotFound(format!("question {question_id} not found")).into());
        };
        let probe = Probe {
            subject: &question.subject,
            shingles: &question.shingles,
            fingerprint: &question.fingerprint,
            exclude: Some(question_id),
        };
        let matches = match match_probe(&corpus, &probe, &self.inner.config.matcher) {
            Ok(matches) => matches,
            Err(err) => {
                if matches!(err, BankError::IndexInconsistency(_)) {
                    self.poison(&err);
                }
                return Err(err.into());
            }
        };

        let thresholds = self.inner.config.policy.thresholds_for(&question.subject);
        Ok(SimilarQuestions {
            question_id,
            subject: question.subject.clone(),
            corpus_version: corpus.version(),
            matches: matches
                .into_iter()
                .map(|item| SimilarQuestion {
                    question_id: item.question_id,
                    paper_id: item.paper_id,
                    verdict: thresholds.classify(item.score),
                    score: item.score,
                })
                .collect(),
        })
    }

    /// Rebuild the in-memory corpus and index from the durable store and lift any write block.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or the rebuilt projection is inconsistent.
    pub fn reindex(&self) -> Result<ReindexResult> {
        let _gate = self.inner.write_gate.lock();
        let store = self.open_migrated()?;
        let durable_version = store.corpus_version()?;

        let mut rebuilt = MasterCorpus::new(self.inner.analyzer.rows_per_band());
        for (version, batch) in self.batches_by_version(store.load_questions_since(0)?)? {
            rebuilt.append_batch(version, batch)?;
        }
        if rebuilt.version() < durable_version {
            return Err(BankError::IndexInconsistency(format!(
                "durable corpus version {durable_version} has no questions past version {}",
                rebuilt.version()
            ))
            .into());
        }
        let report = rebuilt.verify();
        if !report.consistent {
            return Err(BankError::IndexInconsistency(format!(
                "rebuilt index is inconsistent at version {}",
                report.corpus_version
            ))
            .into());
        }

        let corpus_version = rebuilt.version();
        let question_count = rebuilt.len();
        let previous_version = {
            let mut corpus = self.inner.corpus.write();
            let previous = corpus.version();
            *corpus = rebuilt;
            previous
        };
        let cleared_poison = self.inner.poisoned.lock().take();

        tracing::info!(
            previous_version,
            corpus_version,
            question_count,
            cleared_poison = cleared_poison.is_some(),
            "rebuilt corpus index"
        );
        Ok(ReindexResult { previous_version, corpus_version, question_count, cleared_poison })
    }

    /// Check that the index is an exact projection of the in-memory corpus. An inconsistent
    /// result blocks writes until [`QbankApi::reindex`] runs.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn verify_index(&self) -> Result<IndexReport> {
        let store = self.open_migrated()?;
        self.refresh(&store)?;
        let report = self.inner.corpus.read().verify();
        if !report.consistent {
            self.poison(&BankError::IndexInconsistency(format!(
                "{} missing, {} dangling, {} unreachable at version {}",
                report.missing_from_index.len(),
                report.dangling_in_index.len(),
                report.unreachable.len(),
                report.corpus_version
            )));
        }
        Ok(report)
    }

    /// # Errors
    /// Returns an error when integrity probes fail to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_migrated()?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the snapshot cannot be written.
    pub fn export(&self, out_dir: &Path) -> Result<ExportManifest> {
        let store = self.open_migrated()?;
        store.export_snapshot(out_dir)
    }

    fn analyze_record(
        &self,
        record: &QuestionRecord,
        paper_subject: &str,
    ) -> Result<(String, Analysis), BankError> {
        let subject = record.subject_or(paper_subject)?;
        let analysis = self.inner.analyzer.analyze(&record.text)?;
        Ok((subject, analysis))
    }

    fn prepare_question(
        &self,
        record: &QuestionRecord,
        paper_subject: &str,
        position: u32,
    ) -> Result<NewQuestion, BankError> {
        let (subject, analysis) = self.analyze_record(record, paper_subject)?;
        Ok(NewQuestion {
            position,
            subject,
            raw_text: record.text.clone(),
            normalized_text: analysis.normalized.normalized_text,
            checksum: analysis.checksum,
            marks: record.marks,
        })
    }

    /// Apply durable batches the in-memory corpus has not seen yet.
    fn refresh(&self, store: &SqliteStore) -> Result<()> {
        let durable = store.corpus_version()?;
        let memory = self.inner.corpus.read().version();
        if memory == durable {
            return Ok(());
        }
        if durable < memory {
            let err = BankError::IndexInconsistency(format!(
                "durable corpus version {durable} is behind in-memory version {memory}"
            ));
            self.poison(&err);
            return Err(err.into());
        }

        let mut corpus = self.inner.corpus.write();
        let current = corpus.version();
        if current >= durable {
            return Ok(());
        }

        let batches = match self.batches_by_version(store.load_questions_since(current)?) {
            Ok(batches) => batches,
            Err(err) => {
                self.poison(&err);
                return Err(err.into());
            }
        };
        for (version, batch) in batches {
            if let Err(err) = corpus.append_batch(version, batch) {
                self.poison(&err);
                return Err(err.into());
            }
        }
        if corpus.version() < durable {
            let err = BankError::IndexInconsistency(format!(
                "durable corpus version {durable} has no questions past version {}",
                corpus.version()
            ));
            self.poison(&err);
            return Err(err.into());
        }

        tracing::debug!(from = current, to = corpus.version(), "applied durable corpus batches");
        Ok(())
    }

    fn sync_after_write(&self, store: &SqliteStore) {
        if let Err(err) = self.refresh(store) {
            tracing::warn!(error = %err, "in-memory corpus did not catch up after write");
        }
    }

    fn batches_by_version(
        &self,
        rows: Vec<StoredQuestion>,
    ) -> Result<BTreeMap<u64, Vec<Question>>, BankError> {
        let mut batches: BTreeMap<u64, Vec<Question>> = BTreeMap::new();
        for row in rows {
            let analysis = self.inner.analyzer.analyze(&row.raw_text).map_err(|err| {
                BankError::IndexInconsistency(format!(
                    "stored question {} cannot be analyzed: {err}",
                    row.question_id
                ))
            })?;
            batches.entry(row.corpus_version).or_default().push(Question {
                id: row.question_id,
                paper_id: row.paper_id,
                subject: row.subject,
                raw_text: row.raw_text,
                normalized_text: row.normalized_text,
                checksum: row.checksum,
                marks: row.marks,
                imported_at: row.imported_at,
                corpus_version: row.corpus_version,
                shingles: analysis.normalized.shingles,
                fingerprint: analysis.fingerprint,
            });
        }
        Ok(batches)
    }

    fn ensure_writable(&self) -> Result<()> {
        if let Some(reason) = self.inner.poisoned.lock().clone() {
            return Err(BankError::IndexInconsistency(format!(
                "writes are blocked until reindex: {reason}"
            ))
            .into());
        }
        Ok(())
    }

    fn poison(&self, err: &BankError) {
        let mut poisoned = self.inner.poisoned.lock();
        if poisoned.is_none() {
            tracing::error!(error = %err, "blocking writes until reindex");
            *poisoned = Some(err.to_string());
        }
    }
}

fn position(index: usize) -> Result<u32, BankError> {
    CandidateRef::from_index(index).map(|candidate_ref| candidate_ref.0)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use qbank_core::{MatcherConfig, Thresholds};

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("qbank-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    fn metadata(title: &str, subject: &str) -> PaperMetadata {
        PaperMetadata {
            title: title.to_string(),
            term: "2024 S1".to_string(),
            subject: subject.to_string(),
        }
    }

    fn records(texts: &[&str]) -> Vec<QuestionRecord> {
        texts
            .iter()
            .map(|text| QuestionRecord { text: (*text).to_string(), marks: Some(5), subject: None })
            .collect()
    }

    fn import(api: &QbankApi, subject: &str, texts: &[&str]) -> Result<ImportResult> {
        let mut results = api.import_papers(vec![PaperImport {
            metadata: metadata("Past paper", subject),
            questions: records(texts),
        }])?;
        results.pop().ok_or_else(|| anyhow::anyhow!("import returned no result"))
    }

    fn check(api: &QbankApi, subject: &str, texts: &[&str]) -> Result<CheckReport> {
        api.check_assessment(CheckRequest {
            assessment_id: None,
            metadata: metadata("Draft assessment", subject),
            candidates: records(texts),
            policy: None,
        })
    }

    fn bank_error(err: &anyhow::Error) -> Option<&BankError> {
        err.downcast_ref::<BankError>()
    }

    // Test IDs: TAPI-001
    #[test]
    fn capital_of_france_paraphrase_is_flagged() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;

        let imported = import(&api, "Geography", &["What is the capital of France?"])?;
        let report = check(&api, "geography", &["What is the capital city of France?"])?;

        let verdict = &report.per_candidate[0];
        assert!(matches!(verdict.verdict, Verdict::PossibleDuplicate | Verdict::Duplicate));
        let Some(best) = &verdict.best_match else {
            return Err(anyhow::anyhow!("paraphrase should have a best match"));
        };
        assert!(best.score >= 0.5);
        assert_eq!(best.question_id, imported.question_ids[0]);
        assert_eq!(best.paper_id, imported.paper_id);
        assert_eq!(report.summary.review_count + report.summary.duplicate_count, 1);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn zero_overlap_against_ten_thousand_questions_is_unique() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;

        let corpus = (0..10_000)
            .map(|index| {
                format!(
                    "Describe how the river near site {index} changed between {} and {}",
                    1800 + index % 97,
                    1900 + index % 53
                )
            })
            .collect::<Vec<_>>();
        let texts = corpus.iter().map(String::as_str).collect::<Vec<_>>();
        let imported = import(&api, "geography", &texts)?;
        assert_eq!(imported.imported_count, 10_000);

        let report = check(&api, "geography", &["Outline photosynthesis within chloroplasts"])?;
        assert_eq!(report.per_candidate[0].verdict, Verdict::Unique);
        assert!(report.per_candidate[0].best_match.is_none());
        assert_eq!(report.summary.unique_count, 1);
        assert!(report.summary.mean_best_score.abs() < f64::EPSILON);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn only_unique_candidates_are_committed() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;
        import(&api, "physics", &["Define momentum."])?;

        let report = check(
            &api,
            "physics",
            &[
                "Define momentum.",
                "State Newton's third law of motion.",
                "Explain the photoelectric effect.",
            ],
        )?;
        let verdicts = report.per_candidate.iter().map(|item| item.verdict).collect::<Vec<_>>();
        assert_eq!(verdicts, vec![Verdict::Duplicate, Verdict::Unique, Verdict::Unique]);

        let rejected = api.commit_assessment(report.assessment_id, Some(vec![CandidateRef(1)]));
        let Err(err) = rejected else {
            return Err(anyhow::anyhow!("approving a duplicate must be rejected"));
        };
        assert!(matches!(bank_error(&err), Some(BankError::CommitRejected(_))));

        let result = api.commit_assessment(report.assessment_id, None)?;
        assert_eq!(result.committed_count, 2);
        assert_eq!(result.committed_refs, vec![CandidateRef(2), CandidateRef(3)]);
        assert_eq!(result.new_question_ids.len(), 2);
        assert_eq!(api.corpus_stats()?.question_count, 3);

        let Some(paper_id) = result.paper_id else {
            return Err(anyhow::anyhow!("commit should create a paper"));
        };
        let paper = api.get_paper(paper_id)?;
        assert_eq!(paper.paper.title, "Draft assessment");
        assert_eq!(paper.questions[0].raw_text, "State Newton's third law of motion.");

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn repeated_commit_returns_identical_result() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;

        let report = check(&api, "chemistry", &["Balance the combustion of methane."])?;
        let first = api.commit_assessment(report.assessment_id, None)?;
        let version_after_first = api.corpus_stats()?.durable_version;

        let second = api.commit_assessment(report.assessment_id, None)?;
        assert_eq!(first, second);
        let stats = api.corpus_stats()?;
        assert_eq!(stats.question_count, 1);
        assert_eq!(stats.durable_version, version_after_first);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn importing_twice_skips_exact_duplicates() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;
        let texts = ["Define work.", "Define work.", "Define power.", "<p>&nbsp;</p>"];

        let first = import(&api, "physics", &texts)?;
        assert_eq!(first.imported_count, 2);
        assert_eq!(first.skipped_exact_duplicates, 1);
        assert_eq!(first.rejected_invalid, 1);

        let second = import(&api, "physics", &texts)?;
        assert_eq!(second.imported_count, 0);
        assert_eq!(second.skipped_exact_duplicates, 3);
        assert_eq!(second.corpus_version, first.corpus_version);
        assert_eq!(api.corpus_stats()?.question_count, 2);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn commit_after_intervening_write_conflicts_until_rechecked() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;

        let report = check(&api, "biology", &["Describe the structure of DNA."])?;
        import(&api, "biology", &["Explain osmosis across a membrane."])?;

        let Err(err) = api.commit_assessment(report.assessment_id, None) else {
            return Err(anyhow::anyhow!("stale commit must conflict"));
        };
        assert_eq!(
            bank_error(&err),
            Some(&BankError::ConcurrentCommitConflict {
                scope: "corpus version",
                expected: 0,
                actual: 1
            })
        );

        let rechecked = api.check_assessment(CheckRequest {
            assessment_id: Some(report.assessment_id),
            metadata: metadata("Draft assessment", "biology"),
            candidates: records(&["Describe the structure of DNA."]),
            policy: None,
        })?;
        assert_eq!(rechecked.revision, 2);
        let result = api.commit_assessment(report.assessment_id, None)?;
        assert_eq!(result.revision, 2);
        assert_eq!(result.committed_count, 1);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn invalid_candidate_is_unknown_and_blocks_commit() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;

        let report =
            check(&api, "history", &["<p></p>", "When did the Western Roman Empire fall?"])?;
        assert_eq!(report.per_candidate[0].verdict, Verdict::Unknown);
        assert!(report.per_candidate[0].failure.is_some());
        assert!(!report.summary.commit_eligible);

        let Err(err) = api.commit_assessment(report.assessment_id, None) else {
            return Err(anyhow::anyhow!("unknown verdicts must block the commit"));
        };
        assert!(matches!(bank_error(&err), Some(BankError::CommitRejected(_))));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn repeated_candidate_is_duplicate_of_first_occurrence() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;

        let report = check(&api, "physics", &["Define torque.", "  DEFINE   torque "])?;
        assert_eq!(report.per_candidate[0].verdict, Verdict::Unique);
        assert_eq!(report.per_candidate[1].verdict, Verdict::Duplicate);
        assert_eq!(report.per_candidate[1].repeat_of, Some(CandidateRef(1)));

        let result = api.commit_assessment(report.assessment_id, None)?;
        assert_eq!(result.committed_count, 1);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-009
    #[test]
    fn committed_assessment_cannot_be_rechecked() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;

        let report = check(&api, "economics", &["Define opportunity cost."])?;
        api.commit_assessment(report.assessment_id, None)?;

        let Err(err) = api.check_assessment(CheckRequest {
            assessment_id: Some(report.assessment_id),
            metadata: metadata("Draft assessment", "economics"),
            candidates: records(&["Define marginal utility."]),
            policy: None,
        }) else {
            return Err(anyhow::anyhow!("re-check of a committed assessment must fail"));
        };
        assert!(matches!(bank_error(&err), Some(BankError::InvalidInput(_))));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-010
    #[test]
    fn invalid_policy_and_missing_check_are_reported() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;

        let Err(err) = api.check_assessment(CheckRequest {
            assessment_id: None,
            metadata: metadata("Draft assessment", "physics"),
            candidates: records(&["Define inertia."]),
            policy: Some(DecisionPolicy {
                duplicate_threshold: 0.3,
                review_threshold: 0.6,
                subject_overrides: BTreeMap::new(),
            }),
        }) else {
            return Err(anyhow::anyhow!("inverted thresholds must be rejected"));
        };
        assert!(matches!(bank_error(&err), Some(BankError::ThresholdConfig(_))));

        let Err(err) = api.commit_assessment(AssessmentId::new(), None) else {
            return Err(anyhow::anyhow!("commit without a check must fail"));
        };
        assert!(matches!(bank_error(&err), Some(BankError::NotFound(_))));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-011
    #[test]
    fn separate_instances_share_durable_writes() -> Result<()> {
        let db_path = unique_temp_db_path();
        let writer = QbankApi::new(db_path.clone(), QbankConfig::default())?;
        let reader = QbankApi::new(db_path.clone(), QbankConfig::default())?;

        assert_eq!(reader.corpus_stats()?.question_count, 0);
        writer.import_papers(vec![PaperImport {
            metadata: metadata("Shared", "geography"),
            questions: records(&["Name the longest river in Africa."]),
        }])?;

        let report = check(&reader, "geography", &["Name the longest river in Africa"])?;
        assert_eq!(report.per_candidate[0].verdict, Verdict::Duplicate);
        assert_eq!(report.corpus_version, 1);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-012
    #[test]
    fn similar_questions_reindex_and_verify() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;
        let imported = import(
            &api,
            "geography",
            &["What is the capital of France?", "What is the capital city of France?"],
        )?;

        let similar = api.similar_questions(imported.question_ids[0])?;
        assert_eq!(similar.matches.len(), 1);
        assert_eq!(similar.matches[0].question_id, imported.question_ids[1]);
        assert_eq!(similar.matches[0].verdict, Verdict::PossibleDuplicate);

        let report = api.verify_index()?;
        assert!(report.consistent);
        assert_eq!(report.question_count, 2);

        let reindexed = api.reindex()?;
        assert_eq!(reindexed.corpus_version, 1);
        assert_eq!(reindexed.question_count, 2);
        assert_eq!(reindexed.cleared_poison, None);

        let Err(err) = api.similar_questions(QuestionId::new()) else {
            return Err(anyhow::anyhow!("unknown question must be reported"));
        };
        assert!(matches!(bank_error(&err), Some(BankError::NotFound(_))));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-013
    #[test]
    fn migrate_dry_run_reports_pending_versions() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-014
    #[test]
    fn concurrent_check_and_commit_never_lose_questions() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = QbankApi::new(db_path.clone(), QbankConfig::default())?;
        api.migrate(false)?;

        let workers = 4;
        let per_worker = 3;
        let mut handles = Vec::new();
        for worker in 0..workers {
            let api = api.clone();
            handles.push(thread::spawn(move || -> Result<usize> {
                let mut conflicts = 0;
                for item in 0..per_worker {
                    let text = format!("Question q{worker}x{item} asks about t{worker}y{item}");
                    let mut attempts = 0;
                    loop {
                        attempts += 1;
                        let report = check(&api, "physics", &[text.as_str()])?;
                        match api.commit_assessment(report.assessment_id, None) {
                            Ok(result) => {
                                assert_eq!(result.committed_count, 1);
                                break;
                            }
                            Err(err)
                                if matches!(
                                    bank_error(&err),
                                    Some(BankError::ConcurrentCommitConflict { .. })
                                ) && attempts < 50 =>
                            {
                                conflicts += 1;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
                Ok(conflicts)
            }));
        }

        for handle in handles {
            let Ok(result) = handle.join() else {
                return Err(anyhow::anyhow!("commit worker panicked"));
            };
            result?;
        }

        let stats = api.corpus_stats()?;
        assert_eq!(stats.question_count, workers * per_worker);
        assert_eq!(stats.durable_version, u64::try_from(workers * per_worker)?);
        assert!(api.verify_index()?.consistent);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-015
    #[test]
    fn configured_subject_override_applies_to_similar_questions() -> Result<()> {
        let db_path = unique_temp_db_path();
        let mut subject_overrides = BTreeMap::new();
        subject_overrides.insert(
            "  Physics ".to_string(),
            Thresholds { duplicate_threshold: 0.4, review_threshold: 0.3 },
        );
        let config = QbankConfig {
            policy: DecisionPolicy { subject_overrides, ..DecisionPolicy::default() },
            ..QbankConfig::default()
        };
        let api = QbankApi::new(db_path.clone(), config)?;
        assert!(api.config().policy.subject_overrides.contains_key("physics"));

        let imported = import(
            &api,
            "Physics",
            &["What is the capital of France?", "What is the capital city of France?"],
        )?;
        let similar = api.similar_questions(imported.question_ids[0])?;
        assert_eq!(similar.subject, "physics");
        assert_eq!(similar.matches.len(), 1);
        assert!((similar.matches[0].score - 0.5).abs() < f64::EPSILON);
        assert_eq!(similar.matches[0].verdict, Verdict::Duplicate);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-016
    #[test]
    fn match_deadline_yields_unknown_and_blocks_commit() -> Result<()> {
        let db_path = unique_temp_db_path();
        let config = QbankConfig {
            matcher: MatcherConfig { deadline_ms: Some(0), ..MatcherConfig::default() },
            ..QbankConfig::default()
        };
        let api = QbankApi::new(db_path.clone(), config)?;
        import(&api, "geography", &["What is the capital of France?"])?;

        let report = check(&api, "geography", &["What is the capital city of France?"])?;
        let verdict = &report.per_candidate[0];
        assert_eq!(verdict.verdict, Verdict::Unknown);
        assert!(verdict.best_match.is_none());
        assert!(verdict.failure.as_deref().is_some_and(|failure| failure.contains("timed out")));
        assert_eq!(report.summary.unknown_count, 1);
        assert!(!report.summary.commit_eligible);

        let Err(err) = api.commit_assessment(report.assessment_id, None) else {
            return Err(anyhow::anyhow!("a report with unknown verdicts must not commit"));
        };
        assert!(matches!(bank_error(&err), Some(BankError::CommitRejected(_))));
        assert_eq!(api.corpus_stats()?.question_count, 1);

        cleanup(&db_path);
        Ok(())
    }
}
