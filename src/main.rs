// ABOUTME: Command line entry point for running backfills and the full reindex
// ABOUTME: Renders job progress and notifications while loops run in the background

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use transcript_backfill::events::{Level, Notification, Notifier};
use transcript_backfill::reindex::PollOutcome;
use transcript_backfill::{
    BackfillKind, BackfillReport, Config, LoopOutcome, Orchestrator, ReindexError, StartOutcome,
};

#[derive(Parser)]
#[command(name = "transcript-backfill")]
#[command(about = "Resumable backfill and reindex jobs for call transcript analysis")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "backfill.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show index counts and job state
    Status {
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Process records missing embeddings, entities or deal heat scores
    Backfill {
        #[arg(value_enum)]
        target: Target,
    },
    /// Manage the server-side full reindex job
    Reindex {
        #[command(subcommand)]
        action: ReindexAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Embeddings,
    Entities,
    DealHeat,
    All,
}

impl Target {
    fn kinds(self) -> Vec<BackfillKind> {
        match self {
            Target::Embeddings => vec![BackfillKind::Embeddings],
            Target::Entities => vec![BackfillKind::Entities],
            Target::DealHeat => vec![BackfillKind::DealHeat],
            Target::All => BackfillKind::ALL.to_vec(),
        }
    }
}

#[derive(Subcommand)]
enum ReindexAction {
    /// Start a full reindex and follow it
    Start {
        /// Return once the job is queued
        #[arg(long)]
        no_watch: bool,
    },
    /// Follow the active reindex job
    Watch,
    /// Cancel the active reindex job
    Cancel {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(&cli.config)?;
    let orchestrator = Arc::new(Orchestrator::connect(&config)?);

    match cli.command {
        Commands::Status { json } => show_status(&orchestrator, json).await,
        Commands::Backfill { target } => run_backfills(orchestrator, target.kinds()).await,
        Commands::Reindex { action } => match action {
            ReindexAction::Start { no_watch } => start_reindex(&orchestrator, no_watch).await,
            ReindexAction::Watch => watch_reindex(&orchestrator).await,
            ReindexAction::Cancel { yes } => cancel_reindex(&orchestrator, yes).await,
        },
    }
}

async fn show_status(orchestrator: &Orchestrator, json: bool) -> Result<()> {
    orchestrator
        .status()
        .refresh()
        .await
        .context("Failed to load index status")?;
    orchestrator.reindex().resume().await?;
    let summary = orchestrator.summary().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    for kind in &summary.kinds {
        println!(
            "{:<18} {:>3}% complete, {} missing",
            kind.kind.to_string(),
            kind.percent_complete.unwrap_or(0),
            kind.missing.unwrap_or(0)
        );
    }
    match &summary.reindex_job_id {
        Some(id) => println!(
            "full reindex       job {} {}{}",
            id,
            summary.reindex_message.as_deref().unwrap_or("running"),
            if summary.reindex_stalled { " (stalled)" } else { "" }
        ),
        None => println!("full reindex       idle"),
    }
    Ok(())
}

async fn run_backfills(orchestrator: Arc<Orchestrator>, kinds: Vec<BackfillKind>) -> Result<()> {
    let multi = MultiProgress::new();
    let printer = print_notifications(orchestrator.notifier(), multi.clone());

    let stopper = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping after the current batch");
                orchestrator.stop_all();
            }
        })
    };

    let mut runs = Vec::new();
    let mut bars = Vec::new();
    for kind in kinds {
        let controller = orchestrator.backfill(kind);
        let bar = multi.add(ProgressBar::new(0));
        bar.set_style(bar_style());
        bar.set_prefix(kind.to_string());
        bars.push(follow_backfill(controller.subscribe(), bar));

        match controller.start() {
            StartOutcome::Started(handle) => runs.push(handle),
            StartOutcome::AlreadyRunning => info!(kind = %kind, "Backfill already running"),
        }
    }

    let reports: Vec<BackfillReport> = futures::future::join_all(runs)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .context("Backfill task panicked")?;
    stopper.abort();
    for bar in bars {
        let _ = bar.await;
    }
    printer.abort();

    let failed: Vec<_> = reports
        .iter()
        .filter(|r| !matches!(r.outcome, LoopOutcome::Completed | LoopOutcome::Stopped))
        .map(|r| r.kind.to_string())
        .collect();
    if !failed.is_empty() {
        bail!("Backfill did not finish for: {}", failed.join(", "));
    }
    Ok(())
}

async fn start_reindex(orchestrator: &Orchestrator, no_watch: bool) -> Result<()> {
    match orchestrator.reindex().start().await {
        Ok(job_id) => println!("Full reindex queued as job {}", job_id),
        Err(ReindexError::AlreadyInProgress { job_id }) => {
            println!("A full reindex is already running (job {}), following it", job_id);
        }
        Err(e) => return Err(e.into()),
    }
    if no_watch {
        return Ok(());
    }
    follow_reindex(orchestrator).await
}

async fn watch_reindex(orchestrator: &Orchestrator) -> Result<()> {
    match orchestrator.reindex().resume().await? {
        Some(job_id) => {
            println!("Following reindex job {}", job_id);
            follow_reindex(orchestrator).await
        }
        None => {
            println!("No active reindex job");
            Ok(())
        }
    }
}

async fn cancel_reindex(orchestrator: &Orchestrator, yes: bool) -> Result<()> {
    let Some(job_id) = orchestrator.reindex().resume().await? else {
        println!("No active reindex job");
        return Ok(());
    };

    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Cancel reindex job {}?", job_id))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            println!("Cancellation aborted");
            return Ok(());
        }
    }

    orchestrator.reindex().cancel().await?;
    println!("Cancelled reindex job {}", job_id);
    Ok(())
}

async fn follow_reindex(orchestrator: &Orchestrator) -> Result<()> {
    let multi = MultiProgress::new();
    let printer = print_notifications(orchestrator.notifier(), multi.clone());
    let spinner = multi.add(ProgressBar::new_spinner());
    spinner.enable_steady_tick(Duration::from_millis(120));

    let mut snapshots = orchestrator.reindex().subscribe();
    let updater = {
        let spinner = spinner.clone();
        tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let snapshot = snapshots.borrow_and_update().clone();
                if let Some(job) = &snapshot.job {
                    let progress = job.progress.clone().unwrap_or_default();
                    spinner.set_message(format!(
                        "{} {:.0}% {}{}",
                        job.status,
                        progress.percent.unwrap_or(0.0),
                        progress.message.unwrap_or_default(),
                        if snapshot.stalled { " (stalled)" } else { "" }
                    ));
                }
            }
        })
    };

    let outcome = orchestrator.reindex().watch().await;
    updater.abort();
    spinner.finish_and_clear();
    printer.abort();

    match outcome? {
        PollOutcome::Finished(job) => println!("Reindex job {} {}", job.id, job.status),
        PollOutcome::AutoCancelled { job_id, .. } => {
            bail!("Reindex job {} stalled and was cancelled", job_id)
        }
        _ => {}
    }
    Ok(())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:>18} [{bar:40}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn follow_backfill(
    mut snapshots: tokio::sync::watch::Receiver<transcript_backfill::backfill::BackfillSnapshot>,
    bar: ProgressBar,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if let Some(progress) = snapshot.progress {
                bar.set_length(progress.total);
                bar.set_position(progress.processed);
            }
            if snapshot.retry_count > 0 {
                bar.set_message(format!("retry {}", snapshot.retry_count));
            } else {
                bar.set_message("");
            }
            if !snapshot.is_running {
                break;
            }
        }
        bar.finish();
    })
}

fn print_notifications(notifier: &Notifier, multi: MultiProgress) -> JoinHandle<()> {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let _ = multi.println(format_notification(&notification));
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn format_notification(n: &Notification) -> String {
    let marker = match n.level {
        Level::Info => "info",
        Level::Success => "done",
        Level::Warning => "warn",
        Level::Error => "FAIL",
    };
    format!("[{}] {}: {}", marker, n.title, n.message)
}
