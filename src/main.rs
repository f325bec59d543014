//! Fraud Ensemble - Main Entry Point
//!
//! Consumes transaction records from NATS JetStream, scores them with the
//! four-model ensemble, and publishes and persists every result.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fraud_ensemble::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    consumer::TransactionConsumer,
    dispatch::{Dispatcher, ResultSink},
    ensemble::{DirectResponse, Ensemble},
    metrics::{MetricsReporter, PipelineMetrics},
    models::ModelRegistry,
    pipeline::StreamPipeline,
    producer::ResultPublisher,
    store::ResultStore,
    types::result::{EnsembleResult, ModelRole},
};
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fraud-ensemble")]
#[command(about = "Real-time fraud scoring with a four-model ensemble")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stream pipeline until Ctrl-C
    Serve,
    /// Score JSON records from a file or stdin and print the responses
    Score {
        /// Input file (object or array of objects); stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Load configuration and models, then report what is available
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from_path(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    init_logging(&config);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Score { input } => score(config, input),
        Commands::Check => check(config),
    }
}

/// `RUST_LOG` wins over `logging.level`; logs go to stderr so `score`
/// output stays clean
fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("Starting fraud ensemble service");
    info!(
        threshold = config.detection.threshold,
        workers = config.pipeline.workers,
        timeout_ms = config.pipeline.timeout_ms,
        "Configuration loaded"
    );

    let metrics = Arc::new(PipelineMetrics::new());

    let registry = Arc::new(ModelRegistry::load(&config.models)?);
    info!(
        models = registry.model_count(),
        roles = ?registry.roles(),
        "Model registry initialized"
    );
    let ensemble = Arc::new(Ensemble::from_config(
        &config,
        registry.clone(),
        Some(metrics.clone()),
    ));

    // Connect to NATS
    let client = async_nats::connect(&config.nats.url)
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", config.nats.url))?;
    info!(url = %config.nats.url, "Connected to NATS");

    let mut sinks: Vec<Arc<dyn ResultSink>> = vec![Arc::new(ResultPublisher::new(
        client.clone(),
        &config.nats.result_subject,
    ))];
    if config.storage.enabled {
        let store = ResultStore::open(&config.storage.results_path)
            .await
            .context("Failed to open results log")?;
        sinks.push(Arc::new(store));
    }
    let dispatcher = Dispatcher::new(sinks).with_metrics(metrics.clone());
    info!(sinks = ?dispatcher.sink_names(), "Dispatch configured");

    let consumer = TransactionConsumer::new(client.clone(), &config.nats);
    let events = consumer.subscribe().await?;

    let reporter = tokio::spawn(
        MetricsReporter::new(metrics.clone(), config.pipeline.metrics_interval_secs).start(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let pipeline = StreamPipeline::new(ensemble, dispatcher, metrics.clone(), &config.pipeline);
    let summary = pipeline.run(events, shutdown_rx).await;

    reporter.abort();
    if let Err(e) = client.flush().await {
        warn!(error = %e, "Failed to flush pending publishes");
    }

    info!(
        received = summary.received,
        dispatched = summary.dispatched,
        failed = summary.failed,
        redelivery_requested = summary.redelivery_requested,
        sink_failures = summary.sink_failures,
        "Pipeline shutting down..."
    );
    metrics.print_summary();

    // In-flight work is drained; models and connections go last
    drop(pipeline);
    drop(registry);
    Ok(())
}

fn score(config: AppConfig, input: Option<PathBuf>) -> Result<()> {
    let raw = match &input {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let ensemble = match ModelRegistry::load(&config.models) {
        Ok(registry) => Ensemble::from_config(&config, Arc::new(registry), None),
        Err(e) => {
            let response = DirectResponse::from(Err::<EnsembleResult, _>(e));
            println!("{}", serde_json::to_string_pretty(&response)?);
            return Ok(());
        }
    };

    let output = match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Array(records)) => {
            let responses: Vec<DirectResponse> =
                records.iter().map(|r| ensemble.evaluate_json(r)).collect();
            serde_json::to_string_pretty(&responses)?
        }
        Ok(record) => serde_json::to_string_pretty(&ensemble.evaluate_json(&record))?,
        Err(_) => serde_json::to_string_pretty(&ensemble.evaluate_slice(&raw))?,
    };
    println!("{}", output);
    Ok(())
}

fn check(config: AppConfig) -> Result<()> {
    println!("Configuration OK");
    println!(
        "  NATS:       {} ({} -> {})",
        config.nats.url, config.nats.transaction_subject, config.nats.result_subject
    );
    println!("  Threshold:  {}", config.detection.threshold);
    println!("  Degraded:   {}", config.models.degraded_mode);
    println!();

    for role in ModelRole::ALL {
        let path = config.models.artifact_path(role);
        let status = if path.exists() { "found" } else { "MISSING" };
        println!(
            "  {:<9} weight={:<4} {} ({})",
            role.as_str(),
            config.models.weight(role),
            path.display(),
            status
        );
    }
    println!();

    match ModelRegistry::load(&config.models) {
        Ok(registry) => {
            println!(
                "Loaded {}/{} models{}",
                registry.model_count(),
                ModelRole::ALL.len(),
                if registry.is_complete() { "" } else { " (degraded)" }
            );
            Ok(())
        }
        Err(e) => {
            println!("Model registry unavailable: {}", e);
            Err(e.into())
        }
    }
}
