//! Runs the mailbox ingestion service until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use tms::analysis::chat::ChatOptions;
use tms::config::TmsConfig;
use tms::db::Database;
use tms::email::ImapConnector;
use tms::ingest::{run_system_check, IngestSettings, IngestionService, Ingestor};
use tms::notify::BroadcastNotifier;
use tms::ticket::SqliteTicketStore;
use tms::{init_logging, load_config, ChatAnalysisClient, ClassificationService};

#[derive(Parser, Debug)]
#[command(name = "tms-daemon")]
#[command(version, about = "Polls the abuse mailbox and files deduplicated tickets", long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "tms.yaml")]
    config: PathBuf,

    /// Run one ingestion cycle, print its summary as JSON and exit
    #[arg(long)]
    once: bool,

    /// Check the mailbox connection, cursor search and analysis backend,
    /// then exit without ingesting anything
    #[arg(long, conflicts_with = "once")]
    check: bool,

    /// SQLite database file, overriding `database.path`
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    if args.check {
        return system_check(&config).await;
    }

    let db_path = args
        .database
        .clone()
        .or_else(|| config.database.resolved_path())
        .context("no database path configured and no data directory available")?;
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    let notifier = BroadcastNotifier::default().with_database(db.clone());
    spawn_notification_log(notifier.subscribe());

    let ingestor = Arc::new(build_ingestor(&config, db, notifier)?);

    if args.once {
        let summary = ingestor
            .try_run_cycle()
            .await
            .context("ingestion cycle failed")?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let service = IngestionService::new(
        ingestor,
        Duration::from_secs(config.ingest.poll_interval),
    );

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    service.start();
    info!(
        "Watching '{}' on {} for mail from {}",
        config.mailbox.folder, config.mailbox.host, config.mailbox.target_sender
    );

    shutdown_rx.recv().await;
    info!("Shutdown requested");

    if !service
        .stop(Duration::from_secs(config.ingest.stop_timeout))
        .await
    {
        warn!("Ingestion loop was aborted during shutdown");
    }
    info!("Stopped after {} cycles", service.status().cycles_completed);
    Ok(())
}

fn build_ingestor(
    config: &TmsConfig,
    db: Database,
    notifier: BroadcastNotifier,
) -> Result<Ingestor> {
    let settings = IngestSettings::from_config(&config.mailbox, &config.ingest);
    let mut ingestor = Ingestor::new(
        Arc::new(ImapConnector::new(config.mailbox.clone())),
        Arc::new(SqliteTicketStore::new(db.clone())),
        Arc::new(notifier),
        settings,
    )
    .with_cursor_store(db);

    if let Some(client) = build_analyzer(config)? {
        info!("Ticket analysis enabled with model {}", config.analysis.model);
        ingestor = ingestor.with_analyzer(Arc::new(client));
    }

    Ok(ingestor)
}

fn build_analyzer(config: &TmsConfig) -> Result<Option<ChatAnalysisClient>> {
    let analysis = &config.analysis;
    if !analysis.enabled {
        return Ok(None);
    }
    let api_key = analysis
        .resolve_api_key()
        .context("analysis is enabled but no API key could be resolved")?;
    let client = ChatAnalysisClient::new(
        analysis.base_url.clone(),
        analysis.model.clone(),
        api_key,
        ChatOptions {
            temperature: analysis.temperature,
            max_tokens: analysis.max_tokens,
            request_timeout: Duration::from_secs(analysis.request_timeout),
        },
    )?;
    Ok(Some(client))
}

/// `--check`: exercises the mailbox and the analysis backend. The database
/// is never opened.
async fn system_check(config: &TmsConfig) -> Result<()> {
    let connector = ImapConnector::new(config.mailbox.clone());
    let analyzer = build_analyzer(config)?;
    let criteria = config.mailbox.search_criteria();

    let check = run_system_check(
        &connector,
        criteria,
        analyzer.as_ref().map(|a| a as &dyn ClassificationService),
    )
    .await;

    for step in &check.steps {
        let mark = if step.ok { "ok" } else { "FAILED" };
        println!("{:<10} {:<6} {}", step.name, mark, step.detail);
    }
    if !check.passed() {
        anyhow::bail!("system check failed");
    }
    println!("All checks passed");
    Ok(())
}

/// Logs every published ticket event.
fn spawn_notification_log(mut rx: broadcast::Receiver<tms::TicketNotification>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!(event = %json, "Ticket notification"),
                    Err(e) => warn!("Failed to encode notification: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Notification log lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
