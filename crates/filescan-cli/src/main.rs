//! filescan: operator CLI for the scan pipeline.
//!
//! Reads the same environment as the worker (DATABASE_URL, BROKER_URL, SCAN_*).
//! Output is JSON on stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use filescan_cli::{init_tracing, FileSummary, RescanSummary};
use filescan_core::models::{FileId, FileStatus};
use filescan_core::ScanConfig;
use filescan_db::{
    run_migrations, setup_database, FileRecordStore, PgFileRepository, ScanQueueRepository,
};
use filescan_worker::{
    ChannelManager, FileSubmission, PgConnector, PgConnectorConfig, PublisherConfig, QueueTopology,
    ScanPublisher,
};

#[derive(Parser)]
#[command(name = "filescan", about = "Filescan pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a file and queue it for scanning
    Submit {
        /// Display name of the file
        name: String,
        /// Where the worker fetches the content from
        locator: String,
    },
    /// List file records, newest first
    List {
        /// Filter by status: pending, scanned, failed
        #[arg(long)]
        status: Option<FileStatus>,
    },
    /// Show a single file record
    Get {
        /// File ID
        id: String,
    },
    /// Queue another scan request for a pending file
    Rescan {
        /// File ID
        id: String,
    },
    /// Queue another scan request for every file pending longer than the threshold
    RescanStale {
        #[arg(long, default_value = "600")]
        older_than_secs: u64,
    },
    /// Inspect or replay rejected scan messages
    DeadLetters {
        #[command(subcommand)]
        sub: DeadLetterCommands,
    },
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// Number of messages in the dead-letter queue
    Count,
    /// Move dead-lettered messages back onto the scan queue
    Replay {
        /// Maximum number of messages to move
        #[arg(long, default_value = "100")]
        limit: i64,
    },
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

fn dead_letter_queue(config: &ScanConfig) -> anyhow::Result<&str> {
    config
        .dead_letter_queue
        .as_deref()
        .context("No dead-letter queue configured (SCAN_DEAD_LETTER_QUEUE is empty)")
}

/// Publisher side of the pipeline, connected to the configured broker.
fn submission(config: &ScanConfig, store: Arc<dyn FileRecordStore>) -> (Arc<ChannelManager>, FileSubmission) {
    let channels = Arc::new(ChannelManager::new(
        Arc::new(PgConnector::new(PgConnectorConfig::from(config))),
        QueueTopology::from(config),
    ));
    let publisher = ScanPublisher::new(channels.clone(), PublisherConfig::from(config));
    (channels, FileSubmission::new(store, publisher))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ScanConfig::from_env()?;

    let pool = setup_database(&config.database_url, 2, config.db_timeout())
        .await
        .context("Failed to connect to the record store. Set DATABASE_URL")?;
    run_migrations(&pool).await?;
    let store: Arc<dyn FileRecordStore> = Arc::new(PgFileRepository::new(pool.clone()));

    match cli.command {
        Commands::Submit { name, locator } => {
            let (channels, submission) = submission(&config, store);
            let record = submission.submit(&name, &locator).await;
            channels.shutdown().await;
            print_json(&record?)?;
        }
        Commands::List { status } => {
            let records = store.list_all().await?;
            let summaries: Vec<FileSummary> = records
                .iter()
                .filter(|r| status.map_or(true, |s| r.status == s))
                .map(FileSummary::from)
                .collect();
            print_json(&summaries)?;
        }
        Commands::Get { id } => {
            let record = store.get(&FileId::new(id)).await?;
            print_json(&record)?;
        }
        Commands::Rescan { id } => {
            let (channels, submission) = submission(&config, store);
            let id = FileId::new(id);
            let result = submission.republish(&id).await;
            channels.shutdown().await;
            result?;
            print_json(&serde_json::json!({ "requeued": id.to_string() }))?;
        }
        Commands::RescanStale { older_than_secs } => {
            let (channels, submission) = submission(&config, store);
            let report = submission
                .republish_stale(Duration::from_secs(older_than_secs))
                .await;
            channels.shutdown().await;
            print_json(&RescanSummary::from(report?))?;
        }
        Commands::DeadLetters { sub } => {
            let dead_letters = dead_letter_queue(&config)?;
            let broker_pool = if config.broker_url == config.database_url {
                pool.clone()
            } else {
                setup_database(&config.broker_url, 2, config.db_timeout())
                    .await
                    .context("Failed to connect to the broker. Set BROKER_URL")?
            };
            let queue = ScanQueueRepository::new(broker_pool);

            match sub {
                DeadLetterCommands::Count => {
                    let count = queue.count(dead_letters).await?;
                    print_json(&serde_json::json!({ "queue": dead_letters, "count": count }))?;
                }
                DeadLetterCommands::Replay { limit } => {
                    let moved = queue
                        .move_messages(dead_letters, &config.queue_name, limit)
                        .await?;
                    print_json(&serde_json::json!({
                        "from": dead_letters,
                        "to": config.queue_name,
                        "moved": moved,
                    }))?;
                }
            }
        }
    }

    pool.close().await;
    Ok(())
}
