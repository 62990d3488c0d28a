use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use backdrop_contracts::character::Character;
use backdrop_contracts::chat::load_messages;
use backdrop_contracts::events::EventWriter;
use backdrop_contracts::settings::ProviderSettings;
use backdrop_contracts::store::{JsonFileStore, KeyValueStore};
use backdrop_engine::{
    BackgroundCommit, BackgroundOrchestrator, CaptionChain, EngineConfig, NovelAiClient,
    ProcessedLedger, TranscriptHistory,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "backdrop", version, about = "Scene background generator for chat characters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a background for the latest message of a conversation.
    Trigger(TriggerArgs),
    /// Inspect or reset the processed-message ledger.
    #[command(subcommand)]
    Ledger(LedgerCommand),
}

#[derive(Debug, Parser)]
struct TriggerArgs {
    #[arg(long)]
    character: PathBuf,
    #[arg(long)]
    history: PathBuf,
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    store: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Per-attempt bound for caption and image calls, in seconds.
    #[arg(long)]
    call_timeout_secs: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum LedgerCommand {
    Show(LedgerArgs),
    Clear(LedgerArgs),
}

#[derive(Debug, Parser)]
struct LedgerArgs {
    #[arg(long)]
    store: PathBuf,
    #[arg(long)]
    character: String,
}

const FAILURE_EXIT_CODE: i32 = 2;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("backdrop error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    match cli.command {
        Command::Trigger(args) => runtime.block_on(run_trigger(args)),
        Command::Ledger(LedgerCommand::Show(args)) => runtime.block_on(run_ledger_show(args)),
        Command::Ledger(LedgerCommand::Clear(args)) => runtime.block_on(run_ledger_clear(args)),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_trigger(args: TriggerArgs) -> Result<i32> {
    let character = Character::load(&args.character)?;
    if character.id.trim().is_empty() {
        bail!("character file {} has no id", args.character.display());
    }
    let messages = load_messages(&args.history)?;
    let settings = ProviderSettings::resolve(args.settings.as_deref())?;
    let timeout = Duration::from_secs(settings.request_timeout_secs.max(1));

    let config = EngineConfig {
        call_timeout: args.call_timeout_secs.map(Duration::from_secs),
        ..EngineConfig::default()
    };
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&args.store));
    let mut orchestrator = BackgroundOrchestrator::new(
        store,
        Arc::new(TranscriptHistory::from_messages(&messages)),
        CaptionChain::from_settings(&settings)?,
        Arc::new(NovelAiClient::new(&settings.novelai, &args.out, timeout)?),
        config,
    );
    if let Some(events_path) = &args.events {
        orchestrator = orchestrator.with_events(EventWriter::new(events_path, session_id()));
    }

    let commit = CharacterFileCommit::new(&args.character);
    let result = orchestrator.trigger(&character, &messages, &commit).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.success { 0 } else { FAILURE_EXIT_CODE })
}

async fn run_ledger_show(args: LedgerArgs) -> Result<i32> {
    let ledger = ProcessedLedger::new(Arc::new(JsonFileStore::new(&args.store)));
    ledger.load(&args.character).await;
    let payload = json!({
        "character_id": args.character,
        "processed_ids": ledger.ids(&args.character),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(0)
}

async fn run_ledger_clear(args: LedgerArgs) -> Result<i32> {
    let ledger = ProcessedLedger::new(Arc::new(JsonFileStore::new(&args.store)));
    if !ledger.clear(&args.character).await {
        bail!(
            "failed to clear processed ids for {} in {}",
            args.character,
            args.store.display()
        );
    }
    println!("cleared processed ids for {}", args.character);
    Ok(0)
}

fn session_id() -> String {
    format!("session-{}-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S"), std::process::id())
}

/// Writes the generated image back into the character file it came from.
struct CharacterFileCommit {
    path: PathBuf,
}

impl CharacterFileCommit {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl BackgroundCommit for CharacterFileCommit {
    async fn commit(&self, character_id: &str, image_url: &str) -> Result<()> {
        // Re-read so edits made while the task ran are kept.
        let mut character = Character::load(&self.path)?;
        if character.id != character_id {
            bail!(
                "character file {} now belongs to {}, not {character_id}",
                self.path.display(),
                character.id
            );
        }
        character.extra_background_image = Some(image_url.to_string());
        character.save(&self.path)?;
        tracing::info!(character_id, path = %self.path.display(), "extra background saved");
        Ok(())
    }
}
