use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gengtu_contracts::journal::JobJournal;
use gengtu_contracts::ledger::{JsonLedger, Ledger};
use gengtu_contracts::models::SizePreset;
use gengtu_engine::{
    EngineConfig, ErrorKind, GenerationOrchestrator, ImageGenerationClient, StorageConfig,
    TextGenerationClient,
};
use serde_json::{json, Value};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gengtu", version, about = "Turn riddle answers into picture puzzles")]
struct Cli {
    /// Overrides GENGTU_LEDGER_PATH.
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one picture for an answer, spending one credit on success.
    Generate(GenerateArgs),
    #[command(subcommand)]
    Account(AccountCommand),
    /// List an account's jobs, newest first.
    History(HistoryArgs),
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    account: String,
    #[arg(long)]
    answer: String,
    /// vertical, horizontal or square; anything else is vertical.
    #[arg(long, default_value = "vertical")]
    size: String,
}

#[derive(Debug, Subcommand)]
enum AccountCommand {
    Show {
        #[arg(long)]
        account: String,
    },
    /// Top up an account, creating it if needed.
    Grant {
        #[arg(long)]
        account: String,
        #[arg(long)]
        credits: u64,
    },
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long)]
    account: String,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

const EXIT_BUSINESS_RULE: i32 = 2;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("gengtu error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut storage = StorageConfig::from_env();
    if let Some(path) = cli.ledger {
        storage.ledger_path = path;
    }
    let _log_guard = init_logging(storage.log_dir.as_deref())?;

    match cli.command {
        Command::Generate(args) => run_generate(args, storage),
        Command::Account(AccountCommand::Show { account }) => {
            let ledger = open_ledger(&storage.ledger_path)?;
            print_json(&show_account(&ledger, &account)?)?;
            Ok(0)
        }
        Command::Account(AccountCommand::Grant { account, credits }) => {
            let ledger = open_ledger(&storage.ledger_path)?;
            print_json(&grant_credits(&ledger, &account, credits)?)?;
            Ok(0)
        }
        Command::History(args) => {
            let ledger = open_ledger(&storage.ledger_path)?;
            print_json(&history(&ledger, &args.account, args.limit)?)?;
            Ok(0)
        }
    }
}

fn run_generate(args: GenerateArgs, storage: StorageConfig) -> Result<i32> {
    let mut config = EngineConfig::from_env().context("invalid configuration")?;
    config.storage = storage;

    let ledger = Arc::new(open_ledger(&config.storage.ledger_path)?);
    let text = TextGenerationClient::new(config.text).context("failed to build text client")?;
    let image = ImageGenerationClient::new(config.image, &config.storage.artifacts.output_dir)
        .context("failed to build image client")?;
    let mut orchestrator = GenerationOrchestrator::new(
        Arc::new(text),
        Arc::new(image),
        ledger,
        config.storage.artifacts.public_prefix.clone(),
    );
    if let Some(path) = &config.storage.journal_path {
        orchestrator = orchestrator.with_journal(JobJournal::new(path));
    }

    let size = SizePreset::from_name(&args.size);
    match orchestrator.run(&args.account, &args.answer, size) {
        Ok(outcome) => {
            print_json(&json!({ "ok": true, "result": outcome }))?;
            Ok(0)
        }
        Err(err) => {
            print_json(&json!({
                "ok": false,
                "error": {
                    "kind": err.kind().as_str(),
                    "message": err.public_message(),
                },
            }))?;
            Ok(match err.kind() {
                ErrorKind::BusinessRule => EXIT_BUSINESS_RULE,
                _ => 1,
            })
        }
    }
}

fn open_ledger(path: &Path) -> Result<JsonLedger> {
    JsonLedger::open(path).with_context(|| format!("failed to open ledger {}", path.display()))
}

fn show_account(ledger: &dyn Ledger, account_id: &str) -> Result<Value> {
    let account = ledger
        .account(account_id)?
        .with_context(|| format!("account not found: {account_id}"))?;
    Ok(serde_json::to_value(account)?)
}

fn grant_credits(ledger: &dyn Ledger, account_id: &str, credits: u64) -> Result<Value> {
    let account = ledger.grant_credits(account_id, credits)?;
    tracing::info!(account_id, granted = credits, balance = account.credits, "credits granted");
    Ok(serde_json::to_value(account)?)
}

fn history(ledger: &dyn Ledger, account_id: &str, limit: usize) -> Result<Value> {
    let jobs = ledger.jobs_for_account(account_id, Some(limit))?;
    Ok(json!({ "account_id": account_id, "jobs": jobs }))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Logs go to stderr (stdout carries the JSON result), or to a daily file
/// under `log_dir` when one is configured.
fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "gengtu.log"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}
