use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use surfacer_api::{EvaluateRequest, FeedbackRequest, SurfacingApi};
use surfacer_core::{
    embed_memory_text, AccessClause, AccessEffect, AccessRule, Clearance, EngineConfig,
    Expiration, FeedbackOutcome, Memory, MemoryId, MemoryStatus, UsageStats, UserIdentity,
    WorkflowBinding,
};
use surfacer_store_sqlite::SqliteStore;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "surf")]
#[command(about = "Memory surfacing engine CLI")]
struct Cli {
    #[arg(long, default_value = "./surfacer.sqlite3")]
    db: PathBuf,

    /// Optional YAML engine configuration; defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Memory {
        #[command(subcommand)]
        command: Box<MemoryCommand>,
    },
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    Evaluate(EvaluateArgs),
    Feedback(FeedbackArgs),
    Decision {
        #[command(subcommand)]
        command: DecisionCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    Add(MemoryAddArgs),
    List,
    Show(MemoryShowArgs),
    SetStatus(MemorySetStatusArgs),
}

#[derive(Debug, Args)]
struct MemoryAddArgs {
    #[arg(long)]
    question: String,
    #[arg(long = "variant")]
    variants: Vec<String>,
    /// Answer payload as a JSON document.
    #[arg(long)]
    answer_json: Option<String>,
    /// Convenience: wrap plain text into a markdown answer payload.
    #[arg(long, conflicts_with = "answer_json")]
    answer_text: Option<String>,
    #[arg(long = "department")]
    departments: Vec<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Workflow binding as `name` or `name:step`.
    #[arg(long = "workflow")]
    workflows: Vec<String>,
    #[arg(long, default_value_t = 0.5)]
    authority_score: f32,
    #[arg(long, value_enum, default_value = "approved")]
    status: StatusArg,
    /// Absolute expiration timestamp (RFC 3339).
    #[arg(long)]
    expires_at: Option<String>,
    /// Reconfirmation interval instead of an absolute expiry.
    #[arg(long, conflicts_with = "expires_at")]
    reconfirm_days: Option<u32>,
    #[arg(long, value_enum, default_value = "internal")]
    min_clearance: ClearanceArg,
    /// Restrict access to the listed departments instead of the whole org.
    #[arg(long, default_value_t = false)]
    department_only: bool,
    #[arg(long = "deny-role")]
    deny_roles: Vec<String>,
}

#[derive(Debug, Args)]
struct MemoryShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct MemorySetStatusArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_enum)]
    status: StatusArg,
}

#[derive(Debug, Subcommand)]
enum IdentityCommand {
    Add(IdentityAddArgs),
    Show(IdentityShowArgs),
}

#[derive(Debug, Args)]
struct IdentityAddArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    role: String,
    #[arg(long)]
    department: String,
    #[arg(long, value_enum)]
    clearance: ClearanceArg,
}

#[derive(Debug, Args)]
struct IdentityShowArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Args)]
struct EvaluateArgs {
    /// Platform metadata (slack, email, form, browser).
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    input: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct FeedbackArgs {
    #[arg(long)]
    memory_id: String,
    #[arg(long)]
    fingerprint: String,
    #[arg(long, value_enum)]
    outcome: OutcomeArg,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DecisionCommand {
    Show(DecisionShowArgs),
}

#[derive(Debug, Args)]
struct DecisionShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Draft,
    PendingApproval,
    Approved,
    Expired,
    Archived,
}

impl From<StatusArg> for MemoryStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Draft => Self::Draft,
            StatusArg::PendingApproval => Self::PendingApproval,
            StatusArg::Approved => Self::Approved,
            StatusArg::Expired => Self::Expired,
            StatusArg::Archived => Self::Archived,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClearanceArg {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl From<ClearanceArg> for Clearance {
    fn from(value: ClearanceArg) -> Self {
        match value {
            ClearanceArg::Public => Self::Public,
            ClearanceArg::Internal => Self::Internal,
            ClearanceArg::Confidential => Self::Confidential,
            ClearanceArg::Restricted => Self::Restricted,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Accepted,
    Ignored,
    Rejected,
    Edited,
}

impl From<OutcomeArg> for FeedbackOutcome {
    fn from(value: OutcomeArg) -> Self {
        match value {
            OutcomeArg::Accepted => Self::Accepted,
            OutcomeArg::Ignored => Self::Ignored,
            OutcomeArg::Rejected => Self::Rejected,
            OutcomeArg::Edited => Self::Edited,
        }
    }
}

#[derive(Debug, Serialize)]
struct CliEnvelope<T>
where
    T: Serialize,
{
    cli_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Serialize)]
struct MigrateResult {
    dry_run: bool,
    current_version: i64,
    target_version: i64,
    would_apply_versions: Vec<i64>,
    after_version: Option<i64>,
    up_to_date: Option<bool>,
}

/// Listing/inspection shape: everything a human wants, minus the embedding.
#[derive(Debug, Serialize)]
struct MemoryView {
    memory_id: String,
    canonical_question: String,
    semantic_variants: Vec<String>,
    answer: serde_json::Value,
    departments: BTreeSet<String>,
    tags: BTreeSet<String>,
    workflows: Vec<WorkflowBinding>,
    access_rule: AccessRule,
    expiration: Expiration,
    authority_score: f32,
    usage_stats: UsageStats,
    status: MemoryStatus,
}

impl From<Memory> for MemoryView {
    fn from(memory: Memory) -> Self {
        Self {
            memory_id: memory.id.to_string(),
            canonical_question: memory.canonical_question,
            semantic_variants: memory.semantic_variants,
            answer: memory.answer,
            departments: memory.departments,
            tags: memory.tags,
            workflows: memory.workflows,
            access_rule: memory.access_rule,
            expiration: memory.expiration,
            authority_score: memory.authority_score,
            usage_stats: memory.usage_stats,
            status: memory.status,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_engine_config(cli.config.as_ref())?;

    match cli.command {
        Command::Db { command } => run_db(&cli.db, &command),
        Command::Memory { command } => run_memory(&cli.db, &config, &command),
        Command::Identity { command } => run_identity(&cli.db, &command),
        Command::Evaluate(args) => run_evaluate(&cli.db, config, args),
        Command::Feedback(args) => run_feedback(&cli.db, config, args),
        Command::Decision { command } => run_decision(&cli.db, config, &command),
    }
}

fn load_engine_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: EngineConfig =
        serde_yaml::from_str(&raw).context("failed to parse engine config yaml")?;
    config.validate().map_err(|err| anyhow!("engine config rejected: {err}"))?;
    Ok(config)
}

fn open_store(db_path: &Path) -> Result<SqliteStore> {
    let mut store = SqliteStore::open(db_path)?;
    store.migrate()?;
    Ok(store)
}

fn run_db(db_path: &Path, command: &DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let store = SqliteStore::open(db_path)?;
            print_json(&store.schema_status()?)
        }
        DbCommand::Migrate(args) => {
            let mut store = SqliteStore::open(db_path)?;
            let before = store.schema_status()?;
            if args.dry_run {
                return print_json(&MigrateResult {
                    dry_run: true,
                    current_version: before.current_version,
                    target_version: before.target_version,
                    would_apply_versions: before.pending_versions,
                    after_version: None,
                    up_to_date: None,
                });
            }
            let planned = before.pending_versions;
            store.migrate()?;
            let after = store.schema_status()?;
            print_json(&MigrateResult {
                dry_run: false,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: planned,
                after_version: Some(after.current_version),
                up_to_date: Some(after.pending_versions.is_empty()),
            })
        }
    }
}

fn run_memory(db_path: &Path, config: &EngineConfig, command: &MemoryCommand) -> Result<()> {
    match command {
        MemoryCommand::Add(args) => {
            let mut store = open_store(db_path)?;
            let memory = build_memory(config, args)?;
            store.write_memory(&memory)?;
            print_json(&MemoryView::from(memory))
        }
        MemoryCommand::List => {
            let store = open_store(db_path)?;
            let memories =
                store.list_memories()?.into_iter().map(MemoryView::from).collect::<Vec<_>>();
            print_json(&memories)
        }
        MemoryCommand::Show(args) => {
            let store = open_store(db_path)?;
            let memory_id = parse_memory_id(&args.id)?;
            let memory = store
                .get_memory(memory_id)?
                .ok_or_else(|| anyhow!("memory not found: {memory_id}"))?;
            print_json(&MemoryView::from(memory))
        }
        MemoryCommand::SetStatus(args) => {
            let store = open_store(db_path)?;
            let memory_id = parse_memory_id(&args.id)?;
            store.set_memory_status(
                memory_id,
                MemoryStatus::from(args.status),
                OffsetDateTime::now_utc(),
            )?;
            let memory = store
                .get_memory(memory_id)?
                .ok_or_else(|| anyhow!("memory not found: {memory_id}"))?;
            print_json(&MemoryView::from(memory))
        }
    }
}

fn run_identity(db_path: &Path, command: &IdentityCommand) -> Result<()> {
    match command {
        IdentityCommand::Add(args) => {
            let store = open_store(db_path)?;
            let identity = UserIdentity {
                id: args.user_id.clone(),
                role: args.role.clone(),
                department: args.department.clone(),
                clearance: Clearance::from(args.clearance),
            };
            store.upsert_identity(&identity)?;
            print_json(&identity)
        }
        IdentityCommand::Show(args) => {
            let store = open_store(db_path)?;
            let identity = store
                .get_identity(&args.user_id)?
                .ok_or_else(|| anyhow!("identity not found: {}", args.user_id))?;
            print_json(&identity)
        }
    }
}

fn run_evaluate(db_path: &Path, config: EngineConfig, args: EvaluateArgs) -> Result<()> {
    let api = SurfacingApi::sqlite(db_path.to_path_buf(), config)?;
    let decision = api.evaluate(EvaluateRequest {
        source: args.source,
        raw_input: args.input,
        user_id: args.user_id,
        as_of: args.as_of.as_deref().map(parse_timestamp).transpose()?,
    })?;
    print_json(&decision)
}

fn run_feedback(db_path: &Path, config: EngineConfig, args: FeedbackArgs) -> Result<()> {
    let api = SurfacingApi::sqlite(db_path.to_path_buf(), config)?;
    let ack = api.ingest_feedback(FeedbackRequest {
        memory_id: parse_memory_id(&args.memory_id)?,
        context_fingerprint: args.fingerprint,
        outcome: FeedbackOutcome::from(args.outcome),
        occurred_at: args.at.as_deref().map(parse_timestamp).transpose()?,
    })?;
    print_json(&ack)
}

fn run_decision(db_path: &Path, config: EngineConfig, command: &DecisionCommand) -> Result<()> {
    match command {
        DecisionCommand::Show(args) => {
            let api = SurfacingApi::sqlite(db_path.to_path_buf(), config)?;
            let record = api
                .decision(&args.id)?
                .ok_or_else(|| anyhow!("decision not found: {}", args.id))?;
            print_json(&record)
        }
    }
}

fn build_memory(config: &EngineConfig, args: &MemoryAddArgs) -> Result<Memory> {
    let answer = match (&args.answer_json, &args.answer_text) {
        (Some(json), None) => {
            serde_json::from_str(json).context("answer-json is not valid JSON")?
        }
        (None, Some(text)) => serde_json::json!({ "markdown": text }),
        (None, None) => return Err(anyhow!("one of --answer-json or --answer-text is required")),
        (Some(_), Some(_)) => unreachable!("clap conflicts_with prevents both answers"),
    };

    let now = OffsetDateTime::now_utc();
    let expiration = match (&args.expires_at, args.reconfirm_days) {
        (Some(raw), None) => Expiration::At { at: parse_timestamp(raw)? },
        (None, Some(interval_days)) => {
            Expiration::Reconfirm { interval_days, last_confirmed_at: now }
        }
        (None, None) => Expiration::Reconfirm { interval_days: 180, last_confirmed_at: now },
        (Some(_), Some(_)) => unreachable!("clap conflicts_with prevents both expirations"),
    };

    let workflows = args
        .workflows
        .iter()
        .map(|raw| parse_workflow_binding(raw))
        .collect::<Result<Vec<_>>>()?;

    let mut clauses: Vec<AccessClause> = args
        .deny_roles
        .iter()
        .map(|role| AccessClause {
            roles: vec![role.clone()],
            departments: Vec::new(),
            min_clearance: None,
            effect: AccessEffect::Deny,
        })
        .collect();
    clauses.push(AccessClause {
        roles: Vec::new(),
        departments: if args.department_only { args.departments.clone() } else { Vec::new() },
        min_clearance: Some(Clearance::from(args.min_clearance)),
        effect: AccessEffect::Allow,
    });

    let memory = Memory {
        id: MemoryId::new(),
        canonical_question: args.question.clone(),
        semantic_variants: args.variants.clone(),
        answer,
        embedding: embed_memory_text(
            &args.question,
            &args.variants,
            config.retrieval.embedding_dim,
        ),
        departments: args.departments.iter().cloned().collect(),
        tags: args.tags.iter().cloned().collect(),
        workflows,
        access_rule: AccessRule { clauses, default_effect: AccessEffect::Deny },
        expiration,
        authority_score: args.authority_score,
        usage_stats: UsageStats::default(),
        status: MemoryStatus::from(args.status),
        created_at: now,
        updated_at: now,
    };
    memory.validate().map_err(|err| anyhow!("memory rejected: {err}"))?;
    Ok(memory)
}

fn parse_workflow_binding(raw: &str) -> Result<WorkflowBinding> {
    match raw.split_once(':') {
        Some((workflow, step)) => {
            let step = step
                .parse::<u32>()
                .with_context(|| format!("invalid workflow step in `{raw}`"))?;
            Ok(WorkflowBinding { workflow: workflow.to_string(), step: Some(step) })
        }
        None => Ok(WorkflowBinding { workflow: raw.to_string(), step: None }),
    }
}

fn parse_memory_id(raw: &str) -> Result<MemoryId> {
    Ulid::from_str(raw)
        .map(MemoryId)
        .map_err(|err| anyhow!("invalid memory id `{raw}`: {err}"))
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .with_context(|| format!("invalid RFC 3339 timestamp: {raw}"))
}

fn print_json<T: Serialize>(data: &T) -> Result<()> {
    let envelope = CliEnvelope { cli_contract_version: CLI_CONTRACT_VERSION, data };
    println!(
        "{}",
        serde_json::to_string_pretty(&envelope).context("failed to serialize cli output")?
    );
    Ok(())
}
