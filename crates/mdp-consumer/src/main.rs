//! MDP Consumer - loads staged market data artifacts announced on a queue

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mdp_common::logging::{init_logging, LogConfig, LogLevel};
use mdp_consumer::config::ConsumerConfig;
use mdp_consumer::sink::{ObjectStoreSink, PostgresSink, RecordSink, SinkKind, SinkRouter};
use mdp_consumer::{ArtifactStore, ConsumerLoop, S3ArtifactStore, SourceKind, SqsQueue};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mdp-consumer")]
#[command(author, version, about = "Market data queue consumer")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Default source schema for notifications without a known source tag
    #[arg(short, long, global = true, env = "MDP_SOURCE")]
    source: Option<SourceKind>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drain one batch and print the invocation report
    RunOnce,

    /// Poll continuously until Ctrl+C or SIGTERM
    Poll,

    /// Apply database migrations for the Postgres sink
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("mdp-consumer")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut config = ConsumerConfig::load().context("Failed to load consumer configuration")?;
    if let Some(source) = cli.source {
        config.queue.default_source = source;
    }

    match cli.command {
        Command::Migrate => {
            let sink = PostgresSink::connect_lazy(&config.database)?;
            info!("Running database migrations");
            sqlx::migrate!("../../migrations").run(sink.pool()).await?;
            info!("Migrations complete");
        },
        Command::RunOnce => {
            let consumer = build_consumer(&config).await?;
            let report = consumer.run_once().await;
            println!("{}", serde_json::to_string(&report)?);
        },
        Command::Poll => {
            let consumer = build_consumer(&config).await?;
            info!(
                queue = %config.queue.queue_url,
                default_source = %config.queue.default_source,
                concurrency = config.queue.concurrency,
                "Starting consumer loop"
            );
            let report = consumer.run_until(shutdown_signal()).await;
            info!(
                processed = report.processed,
                records_loaded = report.records_loaded,
                "Consumer shut down gracefully"
            );
        },
    }

    Ok(())
}

async fn build_consumer(config: &ConsumerConfig) -> Result<ConsumerLoop> {
    let sdk_config = config.aws.load().await;

    let queue = Arc::new(SqsQueue::new(
        &sdk_config,
        &config.queue.queue_url,
        config.visibility_timeout(),
    ));
    let store: Arc<dyn ArtifactStore> = Arc::new(S3ArtifactStore::new(&sdk_config, &config.storage));

    let postgres: Option<Arc<dyn RecordSink>> = if config.uses(SinkKind::Postgres) {
        Some(Arc::new(PostgresSink::connect_lazy(&config.database)?))
    } else {
        None
    };

    let object_store: Option<Arc<dyn RecordSink>> = match &config.storage.destination_bucket {
        Some(bucket) if config.uses(SinkKind::ObjectStore) => Some(Arc::new(ObjectStoreSink::new(
            store.clone(),
            bucket,
            &config.storage.destination_prefix,
        ))),
        _ => None,
    };

    let mut router = SinkRouter::new();
    for (source, kind) in &config.sinks {
        let sink = match kind {
            SinkKind::Postgres => postgres.clone(),
            SinkKind::ObjectStore => object_store.clone(),
        };
        if let Some(sink) = sink {
            info!(source = %source, sink = %kind, "Routing source");
            router = router.route(*source, sink);
        }
    }

    Ok(ConsumerLoop::new(queue, store, router, config.consumer_settings()))
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing up");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing up");
        },
    }
}
