mod commands;
mod config;
mod dedup;
mod delivery;
mod executor;
mod platform;
mod responder;
mod router;
mod scheduler;
mod update;
mod upload;
mod webhook;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, DedupBackend};
use crate::dedup::{DedupStore, MemoryDedupStore, SqliteDedupStore};
use crate::delivery::{DeliveryQueue, DeliverySettings, JobOutcome};
use crate::platform::telegram::BotApiClient;
use crate::platform::PlatformApi;
use crate::scheduler::Scheduler;
use crate::upload::UploadPipeline;
use crate::webhook::WebhookState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,docbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Listen: {}{}", config.webhook.listen_addr, config.webhook.path);
    info!("  Dedup backend: {}", config.dedup.backend);
    info!("  Documents: {}", config.handlers.documents_dir.display());

    // Outbound side
    let client = Arc::new(BotApiClient::new(
        &config.telegram,
        Duration::from_secs(config.delivery.request_timeout_secs),
    )?);
    let api: Arc<dyn PlatformApi> = client.clone();
    let uploader = UploadPipeline::new(api.clone(), config.delivery.max_document_bytes);
    let queue = DeliveryQueue::new(api, uploader, DeliverySettings::from(&config.delivery));
    spawn_report_logger(&queue);

    // Inbound side
    let mut scheduler = None;
    let dedup: Arc<dyn DedupStore> = match config.dedup.backend {
        DedupBackend::Memory => Arc::new(MemoryDedupStore::new(
            config.dedup.retention(),
            config.dedup.max_entries,
        )),
        DedupBackend::Sqlite => {
            let store: Arc<dyn DedupStore> = Arc::new(SqliteDedupStore::open(
                &config.dedup.database_path,
                config.dedup.retention(),
            )?);
            let jobs = Scheduler::new().await?;
            jobs.schedule_dedup_prune(&config.dedup.prune_cron, store.clone())
                .await?;
            jobs.start().await?;
            scheduler = Some(jobs);
            store
        }
    };

    let router = commands::default_router(&config.handlers);
    info!("Registered {} routes plus fallback", router.len());

    let state = WebhookState {
        dedup,
        router: Arc::new(router),
        queue,
        handler_deadline: config.handlers.deadline(),
        secret_token: config.webhook.secret_token.clone(),
    };
    let app = webhook::app(state, &config.webhook.path);

    let listener = tokio::net::TcpListener::bind(&config.webhook.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.webhook.listen_addr))?;
    info!("Webhook listening on {}", config.webhook.listen_addr);

    if let Some(public_url) = &config.telegram.public_url {
        let url = format!("{}{}", public_url.trim_end_matches('/'), config.webhook.path);
        if let Err(e) = client
            .set_webhook(&url, config.webhook.secret_token.as_deref())
            .await
        {
            warn!("Failed to register webhook at {}: {:#}", url, e);
        }
    }

    info!("Bot is starting...");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Webhook server failed")?;

    if let Some(mut jobs) = scheduler {
        jobs.shutdown().await?;
    }

    Ok(())
}

/// Drain delivery reports into the log.
fn spawn_report_logger(queue: &DeliveryQueue) {
    let mut reports = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => match report.outcome {
                    JobOutcome::Delivered(receipt) => info!(
                        job_id = %receipt.job_id,
                        chat_id = report.chat_id,
                        attempts = report.attempts,
                        message_id = receipt.platform_message_id,
                        delivered_at = %receipt.delivered_at,
                        "Delivered"
                    ),
                    JobOutcome::Failed(err) => error!(
                        job_id = %report.job_id,
                        chat_id = report.chat_id,
                        attempts = report.attempts,
                        "Delivery failed: {}",
                        err
                    ),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Report logger fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
