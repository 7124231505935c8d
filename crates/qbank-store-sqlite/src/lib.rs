use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use qbank_core::{
    AssessmentId, BankError, CandidateRef, CheckReport, CommitResult, PaperId, PaperMetadata,
    PaperOrigin, QuestionId, QuestionRecord,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS corpus_meta (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  corpus_version INTEGER NOT NULL CHECK (corpus_version >= 0),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS papers (
  paper_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  term TEXT NOT NULL,
  subject TEXT NOT NULL,
  origin TEXT NOT NULL CHECK (origin IN ('imported','committed')),
  assessment_id TEXT,
  imported_at TEXT NOT NULL,
  corpus_version INTEGER NOT NULL CHECK (corpus_version >= 0)
);

CREATE TABLE IF NOT EXISTS questions (
  question_id TEXT PRIMARY KEY,
  paper_id TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 1),
  subject TEXT NOT NULL,
  raw_text TEXT NOT NULL,
  normalized_text TEXT NOT NULL,
  checksum TEXT NOT NULL,
  marks INTEGER CHECK (marks IS NULL OR marks >= 0),
  imported_at TEXT NOT NULL,
  corpus_version INTEGER NOT NULL CHECK (corpus_version >= 1),
  UNIQUE(subject, checksum),
  UNIQUE(paper_id, position),
  FOREIGN KEY (paper_id) REFERENCES papers(paper_id)
);

CREATE TABLE IF NOT EXISTS check_reports (
  assessment_id TEXT NOT NULL,
  revision INTEGER NOT NULL CHECK (revision >= 1),
  corpus_version INTEGER NOT NULL CHECK (corpus_version >= 0),
  generated_at TEXT NOT NULL,
  candidates_json TEXT NOT NULL,
  report_json TEXT NOT NULL,
  PRIMARY KEY (assessment_id, revision)
);

CREATE TABLE IF NOT EXISTS commit_ledger (
  assessment_id TEXT NOT NULL,
  revision INTEGER NOT NULL,
  paper_id TEXT,
  committed_at TEXT NOT NULL,
  result_json TEXT NOT NULL,
  PRIMARY KEY (assessment_id, revision),
  FOREIGN KEY (assessment_id, revision) REFERENCES check_reports(assessment_id, revision),
  FOREIGN KEY (paper_id) REFERENCES papers(paper_id)
);

CREATE INDEX IF NOT EXISTS idx_questions_corpus_version ON questions(corpus_version);
CREATE INDEX IF NOT EXISTS idx_questions_paper ON questions(paper_id);
CREATE INDEX IF NOT EXISTS idx_papers_imported_at ON papers(imported_at);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub corpus_version: u64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Derived fields for one question about to be written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewQuestion {
    pub position: u32,
    pub subject: String,
    pub raw_text: String,
    pub normalized_text: String,
    pub checksum: String,
    pub marks: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaperWrite {
    pub metadata: PaperMetadata,
    pub questions: Vec<NewQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaperWriteResult {
    pub paper_id: PaperId,
    pub imported_count: usize,
    pub skipped_exact_duplicates: usize,
    pub question_ids: Vec<QuestionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportBatch {
    pub corpus_version: u64,
    pub papers: Vec<PaperWriteResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredQuestion {
    pub question_id: QuestionId,
    pub paper_id: PaperId,
    pub position: u32,
    pub subject: String,
    pub raw_text: String,
    pub normalized_text: String,
    pub checksum: String,
    pub marks: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub imported_at: OffsetDateTime,
    pub corpus_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaperSummary {
    pub paper_id: PaperId,
    pub title: String,
    pub term: String,
    pub subject: String,
    pub origin: PaperOrigin,
    pub assessment_id: Option<AssessmentId>,
    #[serde(with = "time::serde::rfc3339")]
    pub imported_at: OffsetDateTime,
    pub corpus_version: u64,
    pub question_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaperDetail {
    pub paper: PaperSummary,
    pub questions: Vec<StoredQuestion>,
}

/// A persisted check report together with the candidate records it scored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredCheck {
    pub report: CheckReport,
    pub candidates: Vec<QuestionRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitWrite {
    pub assessment_id: AssessmentId,
    pub revision: u32,
    pub expected_version: u64,
    pub metadata: PaperMetadata,
    pub refs: Vec<CandidateRef>,
    pub questions: Vec<NewQuestion>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub result: CommitResult,
    pub replayed: bool,
}

impl SqliteStore {
    /// Open a SQLite-backed question bank and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            self.apply_migration_1()?;
            tracing::info!(version = 1, "applied question bank schema migration");
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO corpus_meta(id, corpus_version, updated_at) VALUES (1, 0, ?1)",
            params![now],
        )
        .context("failed to seed corpus version")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now],
        )
        .context("failed to record migration version 1")?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    /// Durable corpus version: bumped once by every write that adds questions.
    ///
    /// # Errors
    /// Returns an error when the corpus metadata row cannot be read.
    pub fn corpus_version(&self) -> Result<u64> {
        read_corpus_version(&self.conn)
    }

    /// Persist a batch of imported papers in one transaction.
    ///
    /// Questions whose `(subject, checksum)` already exists in the corpus, or earlier in the same
    /// batch, are skipped. The corpus version moves forward once if anything was inserted.
    ///
    /// # Errors
    /// Returns an error when any read or write in the transaction fails.
    pub fn import_papers(&mut self, papers: &[PaperWrite]) -> Result<ImportBatch> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start import transaction")?;

        let current = read_corpus_version(&tx)?;
        let next = current + 1;
        let imported_at = OffsetDateTime::now_utc();
        let imported_at_raw = rfc3339(imported_at)?;

        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(papers.len());
        let mut inserted_total = 0_usize;

        for paper in papers {
            let paper_id = PaperId::new();
            insert_paper(
                &tx,
                paper_id,
                &paper.metadata,
                PaperOrigin::Imported,
                None,
                &imported_at_raw,
                next,
            )?;

            let mut result = PaperWriteResult {
                paper_id,
                imported_count: 0,
                skipped_exact_duplicates: 0,
                question_ids: Vec::new(),
            };
            for question in &paper.questions {
                let key = (question.subject.clone(), question.checksum.clone());
                if seen.contains(&key)
                    || checksum_exists(&tx, &question.subject, &question.checksum)?
                {
                    result.skipped_exact_duplicates += 1;
                    continue;
                }
                let question_id = QuestionId::new();
                insert_question(&tx, question_id, paper_id, question, &imported_at_raw, next)?;
                seen.insert(key);
                result.imported_count += 1;
                result.question_ids.push(question_id);
            }
            inserted_total += result.imported_count;
            results.push(result);
        }

        let corpus_version = if inserted_total > 0 {
            write_corpus_version(&tx, next)?;
            next
        } else {
            // Nothing new: the papers belong to the version the corpus already has.
            for result in &results {
                tx.execute(
                    "UPDATE papers SET corpus_version = ?1 WHERE paper_id = ?2",
                    params![to_i64(current)?, result.paper_id.to_string()],
                )
                .with_context(|| format!("failed to restamp paper {}", result.paper_id))?;
            }
            current
        };

        tx.commit().context("failed to commit import transaction")?;
        Ok(ImportBatch { corpus_version, papers: results })
    }

    /// Load questions written after `version`, oldest write first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_questions_since(&self, version: u64) -> Result<Vec<StoredQuestion>> {
        let mut stmt = self.conn.prepare(
            "SELECT question_id, paper_id, position, subject, raw_text, normalized_text,
                    checksum, marks, imported_at, corpus_version
             FROM questions
             WHERE corpus_version > ?1
             ORDER BY corpus_version ASC, question_id ASC",
        )?;
        let mut rows = stmt.query(params![to_i64(version)?])?;
        let mut questions = Vec::new();
        while let Some(row) = rows.next()? {
            questions.push(stored_question_from_row(row)?);
        }
        Ok(questions)
    }

    /// List every paper with its question count, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_papers(&self) -> Result<Vec<PaperSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.paper_id, p.title, p.term, p.subject, p.origin, p.assessment_id,
                    p.imported_at, p.corpus_version, COUNT(q.question_id)
             FROM papers p
             LEFT JOIN questions q ON q.paper_id = p.paper_id
             GROUP BY p.paper_id
             ORDER BY p.imported_at DESC, p.paper_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut papers = Vec::new();
        while let Some(row) = rows.next()? {
            papers.push(paper_summary_from_row(row)?);
        }
        Ok(papers)
    }

    /// Load one paper and its questions in position order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_paper(&self, paper_id: PaperId) -> Result<Option<PaperDetail>> {
        let paper = self
            .conn
            .query_row(
                "SELECT p.paper_id, p.title, p.term, p.subject, p.origin, p.assessment_id,
                        p.imported_at, p.corpus_version,
                        (SELECT COUNT(*) FROM questions q WHERE q.paper_id = p.paper_id)
                 FROM papers p
                 WHERE p.paper_id = ?1",
                params![paper_id.to_string()],
                |row| Ok(paper_summary_from_row(row)),
            )
            .optional()
            .context("failed to load paper")?
            .transpose()?;

        let Some(paper) = paper else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT question_id, paper_id, position, subject, raw_text, normalized_text,
                    checksum, marks, imported_at, corpus_version
             FROM questions
             WHERE paper_id = ?1
             ORDER BY position ASC",
        )?;
        let mut rows = stmt.query(params![paper_id.to_string()])?;
        let mut questions = Vec::new();
        while let Some(row) = rows.next()? {
            questions.push(stored_question_from_row(row)?);
        }

        Ok(Some(PaperDetail { paper, questions }))
    }

    /// Count papers and questions.
    ///
    /// # Errors
    /// Returns an error when the count queries fail.
    pub fn counts(&self) -> Result<(usize, usize)> {
        let papers: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM papers", [], |row| row.get(0))
            .context("failed to count papers")?;
        let questions: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM questions", [], |row| row.get(0))
            .context("failed to count questions")?;
        Ok((to_usize(papers)?, to_usize(questions)?))
    }

    /// Persist a check report under the next revision of its assessment.
    ///
    /// The revision carried by `report` is ignored and the assigned one is returned in the
    /// stored copy.
    ///
    /// # Errors
    /// Returns [`BankError::InvalidInput`] (inside `anyhow`) once the assessment is committed, or
    /// an error when serialization or the write fails.
    pub fn save_check(
        &mut self,
        mut report: CheckReport,
        candidates: &[QuestionRecord],
    ) -> Result<CheckReport> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start check report transaction")?;

        if read_ledger_entry(&tx, report.assessment_id)?.is_some() {
            return Err(BankError::InvalidInput(format!(
                "assessment {} is already committed",
                report.assessment_id
            ))
            .into());
        }

        let latest = read_latest_revision(&tx, report.assessment_id)?;
        report.revision = u32::try_from(latest + 1)
            .with_context(|| format!("check revision overflow for {}", report.assessment_id))?;

        tx.execute(
            "INSERT INTO check_reports(
                assessment_id, revision, corpus_version, generated_at, candidates_json, report_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.assessment_id.to_string(),
                report.revision,
                to_i64(report.corpus_version)?,
                rfc3339(report.generated_at)?,
                serde_json::to_string(candidates).context("failed to serialize candidates")?,
                serde_json::to_string(&report).context("failed to serialize check report")?,
            ],
        )
        .context("failed to insert check report")?;

        tx.commit().context("failed to commit check report")?;
        Ok(report)
    }

    /// Most recent check of an assessment.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn latest_check(&self, assessment_id: AssessmentId) -> Result<Option<StoredCheck>> {
        let row = self
            .conn
            .query_row(
                "SELECT candidates_json, report_json
                 FROM check_reports
                 WHERE assessment_id = ?1
                 ORDER BY revision DESC
                 LIMIT 1",
                params![assessment_id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("failed to load latest check report")?;

        let Some((candidates_json, report_json)) = row else {
            return Ok(None);
        };
        Ok(Some(StoredCheck {
            report: serde_json::from_str(&report_json)
                .context("failed to decode stored check report")?,
            candidates: serde_json::from_str(&candidates_json)
                .context("failed to decode stored candidates")?,
        }))
    }

    /// Any committed revision of an assessment.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read or decoded.
    pub fn committed_result(&self, assessment_id: AssessmentId) -> Result<Option<CommitResult>> {
        read_ledger_entry(&self.conn, assessment_id)?
            .map(|raw| serde_json::from_str(&raw).context("failed to decode commit ledger entry"))
            .transpose()
    }

    /// Check in an assessment's approved questions as a new committed paper.
    ///
    /// A replay of an already committed assessment returns the ledger entry without writing.
    /// Otherwise `revision` must still be the assessment's latest check and the durable corpus
    /// version must still equal `expected_version`.
    ///
    /// # Errors
    /// Returns [`BankError::ConcurrentCommitConflict`] (inside `anyhow`) when the assessment was
    /// re-checked or the corpus moved since the check, or an error when any write fails.
    pub fn commit_assessment(&mut self, write: &CommitWrite) -> Result<CommitOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start commit transaction")?;

        if let Some(raw) = read_ledger_entry(&tx, write.assessment_id)? {
            let result =
                serde_json::from_str(&raw).context("failed to decode commit ledger entry")?;
            return Ok(CommitOutcome { result, replayed: true });
        }

        let latest_revision = read_latest_revision(&tx, write.assessment_id)?;
        if latest_revision != i64::from(write.revision) {
            return Err(BankError::ConcurrentCommitConflict {
                scope: "check revision",
                expected: u64::from(write.revision),
                actual: u64::try_from(latest_revision).unwrap_or_default(),
            }
            .into());
        }

        let current = read_corpus_version(&tx)?;
        let committed_at = OffsetDateTime::now_utc();
        let committed_at_raw = rfc3339(committed_at)?;

        let (paper_id, new_question_ids, corpus_version) = if write.questions.is_empty() {
            (None, Vec::new(), current)
        } else {
            if current != write.expected_version {
                return Err(BankError::ConcurrentCommitConflict {
                    scope: "corpus version",
                    expected: write.expected_version,
                    actual: current,
                }
                .into());
            }

            let next = current + 1;
            let paper_id = PaperId::new();
            insert_paper(
                &tx,
                paper_id,
                &write.metadata,
                PaperOrigin::Committed,
                Some(write.assessment_id),
                &committed_at_raw,
                next,
            )?;
            let mut ids = Vec::with_capacity(write.questions.len());
            for question in &write.questions {
                if checksum_exists(&tx, &question.subject, &question.checksum)? {
                    return Err(BankError::IndexInconsistency(format!(
                        "checksum {} is already stored for subject {}",
                        question.checksum, question.subject
                    ))
                    .into());
                }
                let question_id = QuestionId::new();
                insert_question(&tx, question_id, paper_id, question, &committed_at_raw, next)?;
                ids.push(question_id);
            }
            write_corpus_version(&tx, next)?;
            (Some(paper_id), ids, next)
        };

        let result = CommitResult {
            assessment_id: write.assessment_id,
            revision: write.revision,
            paper_id,
            committed_count: new_question_ids.len(),
            committed_refs: write.refs.clone(),
            new_question_ids,
            corpus_version,
            committed_at,
        };

        tx.execute(
            "INSERT INTO commit_ledger(assessment_id, revision, paper_id, committed_at, result_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                write.assessment_id.to_string(),
                write.revision,
                paper_id.map(|id| id.to_string()),
                committed_at_raw,
                serde_json::to_string(&result).context("failed to serialize commit result")?,
            ],
        )
        .context("failed to insert commit ledger entry")?;

        tx.commit().context("failed to commit assessment transaction")?;
        Ok(CommitOutcome { result, replayed: false })
    }

    /// Export papers and questions as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let mut papers = self.list_papers()?;
        papers.sort_by(|left, right| left.paper_id.cmp(&right.paper_id));
        let questions = self.load_questions_since(0)?;

        let papers_digest = write_ndjson_file(&out_dir.join("papers.ndjson"), &papers)?;
        let questions_digest = write_ndjson_file(&out_dir.join("questions.ndjson"), &questions)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            corpus_version: self.corpus_version()?,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: "papers.ndjson".to_string(),
                    sha256: papers_digest.0,
                    records: papers_digest.1,
                },
                ExportFileDigest {
                    path: "questions.ndjson".to_string(),
                    sha256: questions_digest.0,
                    records: questions_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn insert_paper(
    conn: &Connection,
    paper_id: PaperId,
    metadata: &PaperMetadata,
    origin: PaperOrigin,
    assessment_id: Option<AssessmentId>,
    imported_at: &str,
    corpus_version: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO papers(
            paper_id, title, term, subject, origin, assessment_id, imported_at, corpus_version
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            paper_id.to_string(),
            metadata.title,
            metadata.term,
            metadata.subject,
            origin.as_str(),
            assessment_id.map(|id| id.to_string()),
            imported_at,
            to_i64(corpus_version)?,
        ],
    )
    .with_context(|| format!("failed to insert paper {paper_id}"))?;
    Ok(())
}

fn insert_question(
    conn: &Connection,
    question_id: QuestionId,
    paper_id: PaperId,
    question: &NewQuestion,
    imported_at: &str,
    corpus_version: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO questions(
            question_id, paper_id, position, subject, raw_text, normalized_text,
            checksum, marks, imported_at, corpus_version
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            question_id.to_string(),
            paper_id.to_string(),
            question.position,
            question.subject,
            question.raw_text,
            question.normalized_text,
            question.checksum,
            question.marks,
            imported_at,
            to_i64(corpus_version)?,
        ],
    )
    .with_context(|| format!("failed to insert question {question_id}"))?;
    Ok(())
}

fn checksum_exists(conn: &Connection, subject: &str, checksum: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM questions WHERE subject = ?1 AND checksum = ?2)",
            params![subject, checksum],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to check question checksum")?;
    Ok(exists == 1)
}

fn read_corpus_version(conn: &Connection) -> Result<u64> {
    let version: i64 = conn
        .query_row("SELECT corpus_version FROM corpus_meta WHERE id = 1", [], |row| row.get(0))
        .context("failed to read corpus version; run migrations first")?;
    to_u64(version)
}

fn write_corpus_version(conn: &Connection, version: u64) -> Result<()> {
    conn.execute(
        "UPDATE corpus_meta SET corpus_version = ?1, updated_at = ?2 WHERE id = 1",
        params![to_i64(version)?, now_rfc3339()?],
    )
    .context("failed to advance corpus version")?;
    Ok(())
}

fn stored_question_from_row(row: &rusqlite::Row<'_>) -> Result<StoredQuestion> {
    let question_id_raw: String = row.get(0)?;
    let paper_id_raw: String = row.get(1)?;
    let imported_at_raw: String = row.get(8)?;
    Ok(StoredQuestion {
        question_id: QuestionId::parse(&question_id_raw)?,
        paper_id: PaperId::parse(&paper_id_raw)?,
        position: row.get(2)?,
        subject: row.get(3)?,
        raw_text: row.get(4)?,
        normalized_text: row.get(5)?,
        checksum: row.get(6)?,
        marks: row.get(7)?,
        imported_at: parse_rfc3339(&imported_at_raw)?,
        corpus_version: to_u64(row.get(9)?)?,
    })
}

fn paper_summary_from_row(row: &rusqlite::Row<'_>) -> Result<PaperSummary> {
    let paper_id_raw: String = row.get(0)?;
    let origin_raw: String = row.get(4)?;
    let assessment_id_raw: Option<String> = row.get(5)?;
    let imported_at_raw: String = row.get(6)?;
    Ok(PaperSummary {
        paper_id: PaperId::parse(&paper_id_raw)?,
        title: row.get(1)?,
        term: row.get(2)?,
        subject: row.get(3)?,
        origin: PaperOrigin::parse(&origin_raw)
            .ok_or_else(|| anyhow!("unknown paper origin: {origin_raw}"))?,
        assessment_id: assessment_id_raw.as_deref().map(AssessmentId::parse).transpose()?,
        imported_at: parse_rfc3339(&imported_at_raw)?,
        corpus_version: to_u64(row.get(7)?)?,
        question_count: to_usize(row.get(8)?)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("value {value} exceeds sqlite integer range"))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative value {value} where unsigned expected"))
}

fn to_usize(value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("invalid count {value}"))
}

fn read_ledger_entry(conn: &Connection, assessment_id: AssessmentId) -> Result<Option<String>> {
    conn.query_row(
        "SELECT result_json FROM commit_ledger
         WHERE assessment_id = ?1
         ORDER BY revision DESC
         LIMIT 1",
        params![assessment_id.to_string()],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .context("failed to read commit ledger")
}

fn read_latest_revision(conn: &Connection, assessment_id: AssessmentId) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(revision), 0) FROM check_reports WHERE assessment_id = ?1",
        params![assessment_id.to_string()],
        |row| row.get(0),
    )
    .context("failed to read latest check revision")
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}
