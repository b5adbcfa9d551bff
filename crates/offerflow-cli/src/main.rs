use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use offerflow_bus::{BusConfig, BusTransport};
use offerflow_core::{
    process_env, shutdown_in_order, staging_queue, LogLevel, StageHandle, StopOutcome,
    OFFER_INPUT_QUEUE, PROCESSED_OFFERS_QUEUE,
};
use offerflow_db::{DatabaseConfig, PgRepository};
use offerflow_importer::{
    DispatchStrategy, DocumentProcessor, FileImporter, ImporterConfig, OfferDispatch,
    PdfTextExtractor,
};
use offerflow_pipeline::{OfferNormalizer, PipelineConfig};
use offerflow_reconcile::{
    ChatCompletionClient, ComparisonDelegate, CompletionConfig, ReconciliationScheduler,
};
use offerflow_storage::{ArtifactStore, PersistenceConfig, PersistenceSink};
use offerflow_web::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const STAGE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "offerflow")]
#[command(about = "Offer ingestion and invoice reconciliation services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch PATH_OFFERS and publish extracted offers.
    Import,
    /// Normalize offers, reconcile invoices and serve the REST API.
    Pipeline,
    /// Write every processed offer to OFFER_PERSISTENCE_PATH.
    Persist,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(LogLevel::from_lookup(&process_env));

    let result = match cli.command {
        Commands::Import => run_import().await,
        Commands::Pipeline => run_pipeline().await,
        Commands::Persist => run_persist().await,
        Commands::Migrate => run_migrate().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "offerflow stopped with an error");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over `LOG_LEVEL` when both are set.
fn init_tracing(level: LogLevel) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.as_directive())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_import() -> Result<()> {
    let config = ImporterConfig::from_env().context("loading importer configuration")?;
    info!(
        dir = %config.offers_dir.display(),
        strategy = config.strategy.as_str(),
        max_file_size_mb = config.max_file_size_mb,
        "starting offer importer"
    );

    let (dispatch, transport) = match config.strategy {
        DispatchStrategy::Logging => (OfferDispatch::Logging, None),
        DispatchStrategy::MessageBus => {
            let bus = BusConfig::from_env().context("loading broker configuration")?;
            let transport = Arc::new(BusTransport::new(bus));
            let dispatch = OfferDispatch::message_bus(&transport)
                .await
                .context("binding to the offer input queue")?;
            (dispatch, Some(transport))
        }
    };

    let (outbox, inbox) = staging_queue(config.staging_capacity);
    let importer = FileImporter::new(config, Arc::new(PdfTextExtractor), outbox)
        .context("building offer layout parser")?;
    let processor = DocumentProcessor::new(dispatch);

    let stages = vec![
        StageHandle::spawn("offer-watcher", move |token| importer.run(token)),
        StageHandle::spawn("document-processor", move |token| async move {
            processor.run(inbox, token).await
        }),
    ];
    supervise(stages).await;

    if let Some(transport) = transport {
        transport.close().await.context("closing broker connection")?;
    }
    Ok(())
}

async fn run_pipeline() -> Result<()> {
    let config = PipelineConfig::from_env().context("loading pipeline configuration")?;
    let bus = BusConfig::from_env().context("loading broker configuration")?;
    let completion = CompletionConfig::from_env().context("loading completion configuration")?;

    let repository = Arc::new(
        PgRepository::connect(&config.database)
            .await
            .context("connecting to the database")?,
    );
    repository.migrate().await.context("applying migrations")?;

    let transport = Arc::new(BusTransport::new(bus));
    transport.connect().await.context("connecting to the broker")?;
    let offer_input = transport
        .queue_handle(OFFER_INPUT_QUEUE)
        .await
        .context("declaring the offer input queue")?;
    let processed = transport
        .queue_handle(PROCESSED_OFFERS_QUEUE)
        .await
        .context("declaring the processed offers queue")?;

    let client = ChatCompletionClient::new(completion).context("building completion client")?;
    let delegate = Arc::new(ComparisonDelegate::new(Arc::new(client)));
    let scheduler = Arc::new(ReconciliationScheduler::new(
        repository.clone(),
        delegate,
        config.matching_interval,
    ));
    let normalizer = OfferNormalizer::new(repository.clone(), processed);
    let web_state = AppState::new(repository);
    let web_port = config.web_port;

    let (tx, rx) = staging_queue(config.staging_capacity);

    let stages = vec![
        StageHandle::spawn("rest-api", move |token| {
            offerflow_web::serve(web_state, web_port, token)
        }),
        StageHandle::spawn("reconciliation", move |token| scheduler.run(token)),
        StageHandle::spawn("offer-consumer", move |token| async move {
            offer_input.consume_into("offer-normalizer", tx, token).await?;
            Ok::<(), anyhow::Error>(())
        }),
        StageHandle::spawn("offer-normalizer", move |token| async move {
            normalizer.run(rx, token).await
        }),
    ];
    supervise(stages).await;

    transport.close().await.context("closing broker connection")?;
    Ok(())
}

async fn run_persist() -> Result<()> {
    let config = PersistenceConfig::from_env().context("loading persistence configuration")?;
    let bus = BusConfig::from_env().context("loading broker configuration")?;
    info!(dir = %config.output_dir.display(), "starting persistence sink");

    let transport = Arc::new(BusTransport::new(bus));
    transport.connect().await.context("connecting to the broker")?;
    let processed = transport
        .queue_handle(PROCESSED_OFFERS_QUEUE)
        .await
        .context("declaring the processed offers queue")?;

    let (tx, rx) = staging_queue(config.staging_capacity);
    let sink = PersistenceSink::new(ArtifactStore::new(config.output_dir));

    let stages = vec![
        StageHandle::spawn("processed-consumer", move |token| async move {
            processed.consume_into("offer-persistence", tx, token).await?;
            Ok::<(), anyhow::Error>(())
        }),
        StageHandle::spawn("persistence-sink", move |token| async move {
            sink.run(rx, token).await
        }),
    ];
    supervise(stages).await;

    transport.close().await.context("closing broker connection")?;
    Ok(())
}

async fn run_migrate() -> Result<()> {
    let config = DatabaseConfig::from_env().context("loading database configuration")?;
    let repository = PgRepository::connect(&config)
        .await
        .context("connecting to the database")?;
    repository.migrate().await.context("applying migrations")?;
    Ok(())
}

/// Run until a shutdown signal arrives or a stage exits on its own, then
/// stop every stage in order (producers first).
async fn supervise(stages: Vec<StageHandle>) {
    tokio::select! {
        _ = shutdown_signal() => {}
        name = first_finished(&stages) => warn!(stage = %name, "stage exited; shutting down"),
    }

    for (stage, outcome) in shutdown_in_order(stages, STAGE_STOP_TIMEOUT).await {
        if outcome != StopOutcome::Completed {
            warn!(stage = %stage, outcome = ?outcome, "stage did not stop cleanly");
        }
    }
    info!("all stages stopped");
}

async fn first_finished(stages: &[StageHandle]) -> String {
    loop {
        if let Some(stage) = stages.iter().find(|s| s.is_finished()) {
            return stage.name().to_string();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "installing ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
