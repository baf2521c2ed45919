use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use filescan_core::ScanConfig;
use filescan_db::{run_migrations, setup_database, PgFileRepository};
use filescan_infra::{cancel_on_shutdown_signal, init_telemetry, shutdown_telemetry};
use filescan_services::{HttpContentFetcher, KeywordClassifier};
use filescan_worker::{retry_until_ready, PgConnector, PgConnectorConfig, ScanWorker};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = ScanConfig::from_env()?;
    init_telemetry("filescan-worker", config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    let shutdown = CancellationToken::new();
    cancel_on_shutdown_signal(shutdown.clone());

    // The store may come up after the worker; keep trying until it answers.
    let database_url = config.database_url.as_str();
    let (max_connections, acquire_timeout) = (config.db_max_connections, config.db_timeout());
    let pool = match retry_until_ready(
        "record store",
        config.reconnect_interval(),
        &shutdown,
        move || setup_database(database_url, max_connections, acquire_timeout),
    )
    .await
    {
        Some(pool) => pool,
        None => {
            tracing::info!("Shutdown requested before the record store was reachable");
            return Ok(());
        }
    };
    run_migrations(&pool).await?;

    let worker = ScanWorker::new(
        &config,
        Arc::new(PgConnector::new(PgConnectorConfig::from(&config))),
        Arc::new(PgFileRepository::new(pool.clone())),
        Arc::new(HttpContentFetcher::new()?),
        Arc::new(KeywordClassifier::default()),
    );

    tracing::info!(
        queue = %config.queue_name,
        dead_letter_queue = ?config.dead_letter_queue,
        fail_open = config.fail_open_on_fetch_error,
        "Scan worker ready"
    );
    worker.run(shutdown).await;

    pool.close().await;
    shutdown_telemetry().await;
    Ok(())
}
