//! CLI entry points: serve the API, run workers, trigger maintenance.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::app::{Collaborators, Engine};
use crate::config::Settings;
use crate::matter::MatterId;

/// Check if verbose logging was requested (used before clap runs so the
/// subscriber can be installed first).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Parser)]
#[command(name = "lexpipe")]
#[command(about = "Legal document processing job engine")]
#[command(version)]
pub struct Cli {
    /// Database file path (overrides LEXPIPE_DATABASE_PATH).
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the job API with an embedded worker pool and sweepers.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8700, env = "LEXPIPE_PORT")]
        port: u16,
        /// Worker tasks to run alongside the server.
        #[arg(long, env = "WORKER_COUNT")]
        workers: Option<usize>,
    },
    /// Run a standalone worker pool with maintenance sweeps.
    Worker {
        #[arg(long, env = "WORKER_COUNT")]
        workers: Option<usize>,
    },
    /// Run the recovery sweep once (all stale jobs, or one job).
    Recover {
        /// Recover a single job instead of sweeping.
        job_id: Option<String>,
    },
    /// Show queue statistics for a matter.
    Stats { matter_id: String },
    /// Register a local PDF as a document and start its pipeline.
    Ingest {
        matter_id: String,
        file: PathBuf,
        /// Display title; defaults to the file name.
        #[arg(long)]
        title: Option<String>,
        /// Page count of the document.
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
}

fn load_settings(database: Option<PathBuf>) -> Settings {
    let mut settings = Settings::from_env();
    if let Some(database) = database {
        settings.database_path = database;
    }
    settings
}

/// Spawn the maintenance timer for an engine.
fn spawn_maintenance(engine: &Engine) -> tokio::task::JoinHandle<()> {
    let queue = engine.queue.clone();
    let settings = engine.settings.clone();
    tokio::spawn(crate::recovery::run_maintenance_timer(
        queue,
        Duration::from_secs(60),
        settings.stuck_queued_timeout_minutes,
        settings.drift_timeout_minutes,
        settings.chunk_retention_hours,
    ))
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.database);
    let collaborators = Collaborators::offline(&settings);
    let engine = Engine::build(settings, collaborators)?;

    match cli.command {
        Command::Serve {
            host,
            port,
            workers,
        } => {
            let workers = workers.unwrap_or(engine.settings.worker_count);
            let _pool = engine.spawn_workers(workers);
            let _maintenance = spawn_maintenance(&engine);
            crate::server::serve(engine.state.clone(), &host, port).await
        }
        Command::Worker { workers } => {
            let workers = workers.unwrap_or(engine.settings.worker_count);
            let pool = engine.spawn_workers(workers);
            let _maintenance = spawn_maintenance(&engine);
            pool.join().await;
            Ok(())
        }
        Command::Recover { job_id } => {
            let recovery = engine.state.recovery.clone();
            match job_id {
                Some(job_id) => {
                    let outcome = recovery.recover_job(&job_id).await;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
                None => {
                    let summary = recovery.recover_all().await;
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
            }
            Ok(())
        }
        Command::Stats { matter_id } => {
            let matter = MatterId::parse(&matter_id)?;
            let stats = engine.state.tracker.repo().stats_by_matter(matter.as_str())?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Ingest {
            matter_id,
            file,
            title,
            pages,
        } => {
            let matter = MatterId::parse(&matter_id)?;
            let bytes = std::fs::read(&file)?;
            let title = title.unwrap_or_else(|| {
                file.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "document.pdf".to_string())
            });

            let document_id = uuid::Uuid::new_v4().to_string();
            let blob_path = format!("{}/{}/source.pdf", matter.as_str(), document_id);
            // Upload first so the OCR stage finds the source blob.
            engine
                .state
                .blob
                .upload(&blob_path, &bytes)
                .await
                .map_err(|e| anyhow::anyhow!("blob upload failed: {e}"))?;

            let document =
                engine
                    .state
                    .docs
                    .create(matter.as_str(), &title, &blob_path, pages)?;
            let job = engine.state.orchestrator.start(&document.id, false).await?;
            println!("document {} job {}", document.id, job.id);

            // Drain the pipeline inline so the one-shot command finishes it.
            let pool = engine.spawn_workers(engine.settings.worker_count);
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let job = engine.state.tracker.repo().get_required(&job.id)?;
                if job.status.is_terminal() {
                    println!(
                        "job {} {} ({}%)",
                        job.id,
                        job.status.as_str(),
                        job.progress_pct
                    );
                    break;
                }
            }
            drop(pool);
            Ok(())
        }
    }
}
