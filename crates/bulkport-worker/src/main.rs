//! Bulkport Worker - Main entry point

use anyhow::{Context, Result};
use bulkport_common::logging::{init_logging, LogConfig};
use clap::{Parser, Subcommand};
use serde_json::Map;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use bulkport_worker::bulk::{
    BulkJob, BulkRequestService, BulkRequestStore, EventType, JobOptions, NewBulkRequest,
    PgBulkStore, ScheduleOptions, SourceFileStore,
};
use bulkport_worker::catalog::{CatalogSettings, MediaCatalogProcessor, PgCatalog, PROCESSOR_NAME};
use bulkport_worker::config::{Config, LockBackend};
use bulkport_worker::lock::{LockManager, LockStore, MemoryLockStore, PgLockStore};
use bulkport_worker::queue::{Maintenance, PgJobQueue, QueueWorker};
use bulkport_worker::run_migrations;
use bulkport_worker::storage::{ObjectStore, S3Storage};
use bulkport_worker::transfer::TransferPipeline;

#[derive(Parser)]
#[command(name = "bulkport-worker")]
#[command(about = "Bulk spreadsheet ingestion and media transfer worker", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run queue workers until interrupted
    Run,

    /// Apply database migrations and exit
    Migrate,

    /// Create a bulk request for an uploaded file and queue it
    Enqueue {
        /// Id of the new request (generated when omitted)
        #[arg(long)]
        request_id: Option<Uuid>,

        #[arg(long)]
        file_id: Uuid,

        #[arg(long)]
        company_id: Uuid,

        /// User the request is billed to
        #[arg(long)]
        user_id: Uuid,

        #[arg(long, default_value = PROCESSOR_NAME)]
        processor: String,

        /// Persist rows first and transfer media in a follow-up unit
        #[arg(long)]
        two_phase: bool,

        #[arg(long)]
        stop_on_first_error: bool,

        #[arg(long)]
        total_rows: Option<u64>,
    },

    /// Ask a running request to stop
    Cancel { request_id: Uuid },

    /// Print a request's status and counters as JSON
    Status { request_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("bulkport-worker")
        .filter_directives("bulkport_worker=debug,sqlx=warn,aws_smithy_runtime=info")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let config = Config::load()?;
    let pool = connect(&config).await?;

    let result = match cli.command {
        Commands::Run => run(config, pool.clone()).await,
        Commands::Migrate => {
            run_migrations(&pool).await?;
            info!("Database migrations completed");
            Ok(())
        },
        Commands::Enqueue {
            request_id,
            file_id,
            company_id,
            user_id,
            processor,
            two_phase,
            stop_on_first_error,
            total_rows,
        } => {
            let job = BulkJob {
                request_id: request_id.unwrap_or_else(Uuid::new_v4),
                event_type: EventType::ProcessFile,
                file_id,
                file_name: String::new(),
                company_id,
                user_id,
                processor,
                options: JobOptions {
                    two_phase,
                    stop_on_first_error,
                    total_rows,
                },
                metadata: Map::new(),
            };
            enqueue(&config, &pool, job).await
        },
        Commands::Cancel { request_id } => {
            let queue = PgJobQueue::new(pool.clone());
            if queue.request_cancel(request_id).await? {
                println!("Cancellation requested for {}", request_id);
            } else {
                println!("Request {} is not running; nothing to cancel", request_id);
            }
            Ok(())
        },
        Commands::Status { request_id } => {
            let store = PgBulkStore::new(pool.clone());
            let request = store.load(request_id).await?;
            println!("{}", serde_json::to_string_pretty(&request)?);
            Ok(())
        },
    };

    pool.close().await;

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to the database")?;

    info!("Database connection pool established");
    Ok(pool)
}

async fn run(config: Config, pool: PgPool) -> Result<()> {
    run_migrations(&pool).await?;
    info!("Database migrations completed");

    let storage: Arc<dyn ObjectStore> = Arc::new(S3Storage::new(&config.storage));

    let lock_store: Arc<dyn LockStore> = match config.lock.backend {
        LockBackend::Postgres => Arc::new(PgLockStore::new(pool.clone())),
        LockBackend::Memory => {
            warn!("In-memory locks only exclude workers of this process");
            Arc::new(MemoryLockStore::new(config.lock.registry_capacity))
        },
    };
    let locks = LockManager::new(lock_store, config.lock.clone());

    let bulk_store = Arc::new(PgBulkStore::new(pool.clone()));
    let transfers = Arc::new(TransferPipeline::new(storage.clone(), config.transfer.clone())?);

    let catalog = MediaCatalogProcessor::new(
        Arc::new(PgCatalog::new(pool.clone())),
        bulk_store.clone(),
        transfers,
        locks.clone(),
        CatalogSettings::from_config(&config),
    );

    let service = Arc::new(
        BulkRequestService::new(
            bulk_store.clone(),
            bulk_store,
            storage,
            locks,
            config.bulk.clone(),
        )
        .register(Arc::new(catalog)),
    );

    let queue = PgJobQueue::new(pool.clone());
    let shutdown = CancellationToken::new();
    let mut tasks = Vec::with_capacity(config.worker.concurrency + 1);

    for _ in 0..config.worker.concurrency {
        let worker = QueueWorker::new(queue.clone(), service.clone(), config.worker.clone());
        tasks.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    let mut maintenance = Maintenance::new(queue, service, config.worker.clone());
    if config.lock.backend == LockBackend::Postgres {
        maintenance = maintenance.with_lock_purge(PgLockStore::new(pool.clone()));
    }
    tasks.push(tokio::spawn(maintenance.run(shutdown.clone())));

    info!(workers = config.worker.concurrency, "Bulkport worker running");

    shutdown_signal().await;
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Worker task ended abnormally");
        }
    }

    info!("Worker shut down gracefully");
    Ok(())
}

async fn enqueue(config: &Config, pool: &PgPool, mut job: BulkJob) -> Result<()> {
    let store = PgBulkStore::new(pool.clone());
    let file = store
        .get(job.file_id)
        .await
        .with_context(|| format!("Source file {} is not registered", job.file_id))?;
    job.file_name = file.name.clone();

    store
        .create(&NewBulkRequest {
            id: job.request_id,
            company_id: job.company_id,
            requested_by: job.user_id,
            file_id: job.file_id,
            file_name: file.name,
            processor: job.processor.clone(),
            total_rows: job.options.total_rows,
            metadata: Map::new(),
        })
        .await?;

    let queue = PgJobQueue::new(pool.clone());
    let unit_id = queue
        .enqueue(
            &job,
            ScheduleOptions::immediate(
                config.worker.max_attempts,
                Duration::from_secs(config.bulk.cleanup_retention_secs),
            ),
        )
        .await?;

    println!("Request {} queued as work unit {}", job.request_id, unit_id);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing claimed work units");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing claimed work units");
        },
    }
}
