//! CodeCraft - controlled code mutation CLI
//!
//! The `codecraft` command submits change proposals to the mutation pipeline
//! and inspects its persisted state.
//!
//! ## Commands
//!
//! - `run`: Submit proposals and process them to completion
//! - `status`: Show the recorded outcome of a proposal
//! - `quarantine`: List or release blocked parameter values

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use codecraft_core::telemetry::{init_tracing, LogFormat};
use codecraft_core::{
    ChangeResult, CodeMutationPipeline, CodecraftConfig, Priority, Proposal, StructuredProposal,
    Worker,
};

#[derive(Parser)]
#[command(name = "codecraft")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Controlled code mutation pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "CODECRAFT_CONFIG")]
    config: Option<PathBuf>,

    /// Repository to operate on (overrides the configuration)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit proposals and process them in priority order
    Run {
        /// Proposal texts or JSON objects
        proposals: Vec<String>,

        /// JSON file holding an array of proposals
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Submit with automated-source priority
        #[arg(long)]
        auto: bool,
    },

    /// Show the state or final result of a proposal
    Status {
        /// Proposal ID
        id: String,
    },

    /// Manage the quarantine of rejected parameter values
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },
}

#[derive(Subcommand)]
enum QuarantineAction {
    /// List blocked parameter values
    List,

    /// Unblock every value of a parameter
    Release {
        /// Parameter key (`file::symbol`)
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(format, level);

    let config = load_config(cli.config.as_deref(), cli.repo)?;
    let pipeline = Arc::new(
        CodeMutationPipeline::from_config(&config).context("Failed to build the pipeline")?,
    );

    match cli.command {
        Commands::Run {
            proposals,
            file,
            auto,
        } => {
            let mut all = proposals
                .iter()
                .map(|p| Proposal::from_input(p))
                .collect::<Vec<_>>();
            if let Some(path) = file {
                all.extend(read_proposals(&path)?);
            }
            let priority = if auto { Priority::Auto } else { Priority::User };
            cmd_run(pipeline, all, priority).await
        }
        Commands::Status { id } => cmd_status(&pipeline, &id),
        Commands::Quarantine { action } => match action {
            QuarantineAction::List => cmd_quarantine_list(&pipeline),
            QuarantineAction::Release { key } => cmd_quarantine_release(&pipeline, &key),
        },
    }
}

fn load_config(path: Option<&Path>, repo: Option<PathBuf>) -> Result<CodecraftConfig> {
    let mut config = match path {
        Some(path) => CodecraftConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CodecraftConfig::from_env().context("Invalid CODECRAFT_* environment")?,
    };
    if let Some(repo) = repo {
        config.repo_root = repo;
    }
    Ok(config)
}

/// Parse a proposals file: a JSON array whose items are either strings
/// (free text) or structured proposal objects.
fn read_proposals(path: &Path) -> Result<Vec<Proposal>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let items: Vec<Value> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array", path.display()))?;
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::String(s) => Ok(Proposal::from_input(&s)),
            Value::Object(_) => serde_json::from_value::<StructuredProposal>(item)
                .map(Proposal::Structured)
                .with_context(|| format!("proposal #{i} in {} is malformed", path.display())),
            other => bail!("proposal #{i} must be a string or an object, got {other}"),
        })
        .collect()
}

/// Submit everything, then drain the queue with a single worker. Ctrl-C
/// cancels the running proposal and drops the ones still queued.
async fn cmd_run(
    pipeline: Arc<CodeMutationPipeline>,
    proposals: Vec<Proposal>,
    priority: Priority,
) -> Result<()> {
    if proposals.is_empty() {
        bail!("no proposals given; pass text arguments or --file");
    }

    let mut ids = Vec::with_capacity(proposals.len());
    for proposal in proposals {
        let id = pipeline
            .submit(proposal, priority)
            .context("Failed to queue proposal")?;
        info!(proposal_id = %id, priority = %priority, "proposal queued");
        ids.push(id);
    }
    pipeline.queue().close();

    let worker = Worker::new(pipeline.clone());
    let cancel = worker.cancel_handle();
    let interrupt = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; cancelling remaining proposals");
                for id in &ids {
                    pipeline.cancel_queued(id);
                }
                cancel.cancel();
            }
        })
    };

    let results = worker.drain().await;
    interrupt.abort();

    println!("{}", serde_json::to_string_pretty(&results)?);

    let not_ready = count_not_ready(&results);
    if not_ready > 0 {
        bail!("{not_ready} of {} proposal(s) did not reach ready", results.len());
    }
    Ok(())
}

fn count_not_ready(results: &[ChangeResult]) -> usize {
    results.iter().filter(|r| !r.is_ready()).count()
}

fn cmd_status(pipeline: &CodeMutationPipeline, id: &str) -> Result<()> {
    let report = pipeline.status(id)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_quarantine_list(pipeline: &CodeMutationPipeline) -> Result<()> {
    let entries = pipeline.quarantine().list();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn cmd_quarantine_release(pipeline: &CodeMutationPipeline, key: &str) -> Result<()> {
    let released = pipeline
        .quarantine()
        .release(key)
        .with_context(|| format!("Failed to release '{key}'"))?;
    if released == 0 {
        println!("Nothing quarantined under '{key}'");
    } else {
        println!("Released {released} value(s) of '{key}'");
    }
    Ok(())
}
