use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eventpipe_common::EventValidator;
use eventpipe_config::PipelineConfig;
use eventpipe_gateway::GatewayServer;
use eventpipe_kafka::{BrokerPublisher, KafkaEventSink, OverflowBuffer};
use eventpipe_pipeline::{setup_shutdown_hooks, PipelineOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

mod logging;

#[derive(Parser)]
#[command(name = "event-pipeline", about = "Learner event ingestion pipeline", version)]
struct Args {
    /// Configuration file; defaults plus environment overrides when absent
    #[arg(short, long, global = true, env = "EVENTPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP and gRPC ingestion gateway
    Gateway,
    /// Run the broker consumer that writes Parquet to object storage
    Consumer,
    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    logging::init_tracing(&config.logging)?;

    match args.command {
        Command::Gateway => run_gateway(Arc::new(config)).await,
        Command::Consumer => run_consumer(Arc::new(config)).await,
        Command::CheckConfig => {
            let rendered = serde_yaml::to_string(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
            info!("Configuration is valid");
            Ok(())
        }
    }
}

async fn run_gateway(config: Arc<PipelineConfig>) -> Result<()> {
    info!(
        "Starting gateway (http={}, grpc={}, topic={})",
        config.gateway.http_bind, config.gateway.grpc_bind, config.kafka.raw_topic
    );

    let sink = Arc::new(KafkaEventSink::new(&config.kafka).context("Failed to create Kafka producer")?);
    let buffer = OverflowBuffer::open(&config.buffer)
        .with_context(|| format!("Failed to open overflow buffer at {:?}", config.buffer.directory))?;
    let publisher = Arc::new(BrokerPublisher::new(
        sink,
        buffer,
        EventValidator::new(&config.validation),
        config.publisher.clone(),
        &config.kafka,
    ));

    let (shutdown_tx, _) = broadcast::channel(4);
    setup_shutdown_hooks(shutdown_tx.clone());

    GatewayServer::new(config, publisher).run(shutdown_tx).await
}

async fn run_consumer(config: Arc<PipelineConfig>) -> Result<()> {
    info!(
        "Starting consumer (group={}, topic={}, storage={})",
        config.kafka.group_id, config.kafka.raw_topic, config.storage.uri
    );

    let pipeline = Arc::new(PipelineOrchestrator::from_config(config)?);
    setup_shutdown_hooks(pipeline.shutdown_sender());
    pipeline.run().await?;
    Ok(())
}
