use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use qbank_api::{CheckRequest, PaperImport, QbankApi, QbankConfig};
use qbank_core::{AssessmentId, CandidateRef, PaperId, QuestionId};
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "qbank")]
#[command(about = "Duplicate-aware exam question bank")]
struct Cli {
    #[arg(long, default_value = "./qbank.sqlite3")]
    db: PathBuf,

    /// Optional YAML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Paper {
        #[command(subcommand)]
        command: Box<PaperCommand>,
    },
    Assessment {
        #[command(subcommand)]
        command: Box<AssessmentCommand>,
    },
    Corpus {
        #[command(subcommand)]
        command: Box<CorpusCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(OutArgs),
    Export(OutArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct OutArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum PaperCommand {
    /// Import papers from a JSON file holding one paper, a list of papers, or `{"papers": [...]}`.
    Import(InputArgs),
    List,
    Show(PaperShowArgs),
}

#[derive(Debug, Args)]
struct InputArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct PaperShowArgs {
    #[arg(long)]
    paper_id: String,
}

#[derive(Debug, Subcommand)]
enum AssessmentCommand {
    /// Check a draft assessment described by a JSON file.
    Check(AssessmentCheckArgs),
    Commit(AssessmentCommitArgs),
}

#[derive(Debug, Args)]
struct AssessmentCheckArgs {
    #[arg(long = "in")]
    input: PathBuf,
    /// Re-check an existing assessment; overrides any id in the file.
    #[arg(long)]
    assessment_id: Option<String>,
}

#[derive(Debug, Args)]
struct AssessmentCommitArgs {
    #[arg(long)]
    assessment_id: String,
    /// One-based candidate ref to approve. Repeatable. Defaults to every unique candidate.
    #[arg(long = "approve")]
    approve: Vec<u32>,
}

#[derive(Debug, Subcommand)]
enum CorpusCommand {
    Stats,
    Reindex,
    Verify,
    Similar(CorpusSimilarArgs),
}

#[derive(Debug, Args)]
struct CorpusSimilarArgs {
    #[arg(long)]
    question_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImportFile {
    Wrapped { papers: Vec<PaperImport> },
    Many(Vec<PaperImport>),
    One(PaperImport),
}

impl ImportFile {
    fn into_papers(self) -> Vec<PaperImport> {
        match self {
            Self::Wrapped { papers } | Self::Many(papers) => papers,
            Self::One(paper) => vec![paper],
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn read_json_input<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read input file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse input file {}", path.display()))
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = QbankConfig::load(cli.config.as_deref())?;
    let api = QbankApi::new(cli.db, config)?;
    tracing::debug!(db = %api.db_path().display(), "opened question bank");
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Paper { command } => run_paper(*command, &api),
        Command::Assessment { command } => run_assessment(*command, &api),
        Command::Corpus { command } => run_corpus(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &QbankApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            emit_json(value)
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Export(args) => {
            let manifest = api.export(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
    }
}

fn run_paper(command: PaperCommand, api: &QbankApi) -> Result<()> {
    match command {
        PaperCommand::Import(args) => {
            let papers = read_json_input::<ImportFile>(&args.input)?.into_papers();
            let results = api.import_papers(papers)?;
            emit_json(serde_json::json!({
                "in_file": args.input,
                "imported_count": results.iter().map(|item| item.imported_count).sum::<usize>(),
                "papers": results
            }))
        }
        PaperCommand::List => {
            let papers = api.list_papers()?;
            emit_json(serde_json::json!({
                "count": papers.len(),
                "papers": papers
            }))
        }
        PaperCommand::Show(args) => {
            let paper = api.get_paper(PaperId::parse(&args.paper_id)?)?;
            emit_json(serde_json::to_value(&paper).context("failed to serialize paper")?)
        }
    }
}

fn run_assessment(command: AssessmentCommand, api: &QbankApi) -> Result<()> {
    match command {
        AssessmentCommand::Check(args) => {
            let mut request = read_json_input::<CheckRequest>(&args.input)?;
            if let Some(raw) = args.assessment_id.as_deref() {
                request.assessment_id = Some(AssessmentId::parse(raw)?);
            }
            let report = api.check_assessment(request)?;
            emit_json(serde_json::to_value(&report).context("failed to serialize check report")?)
        }
        AssessmentCommand::Commit(args) => {
            let approved = if args.approve.is_empty() {
                None
            } else {
                Some(args.approve.into_iter().map(CandidateRef).collect::<Vec<_>>())
            };
            let result =
                api.commit_assessment(AssessmentId::parse(&args.assessment_id)?, approved)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize commit result")?)
        }
    }
}

fn run_corpus(command: CorpusCommand, api: &QbankApi) -> Result<()> {
    let value = match command {
        CorpusCommand::Stats => serde_json::to_value(api.corpus_stats()?),
        CorpusCommand::Reindex => serde_json::to_value(api.reindex()?),
        CorpusCommand::Verify => serde_json::to_value(api.verify_index()?),
        CorpusCommand::Similar(args) => {
            serde_json::to_value(api.similar_questions(QuestionId::parse(&args.question_id)?)?)
        }
    }
    .context("failed to serialize corpus output")?;
    emit_json(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_version_is_added_to_objects_and_wraps_other_values() {
        let object = with_contract_version(serde_json::json!({"status": "ok"}));
        assert_eq!(object.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
        assert_eq!(object.get("status").and_then(Value::as_str), Some("ok"));

        let wrapped = with_contract_version(serde_json::json!([1, 2]));
        assert_eq!(wrapped.get("payload"), Some(&serde_json::json!([1, 2])));
    }

    #[test]
    fn import_file_accepts_every_supported_shape() {
        let paper = serde_json::json!({
            "title": "Physics 2023",
            "subject": "physics",
            "questions": [{"text": "Define momentum."}]
        });

        let shapes = [
            serde_json::json!({"papers": [paper.clone()]}),
            serde_json::json!([paper.clone(), paper.clone()]),
            paper,
        ];
        let counts = shapes
            .into_iter()
            .map(|shape| match serde_json::from_value::<ImportFile>(shape) {
                Ok(file) => file.into_papers().len(),
                Err(err) => panic!("import shape should parse: {err}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![1, 2, 1]);
    }
}
