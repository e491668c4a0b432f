use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DedupBackend {
    #[default]
    Memory,
    Sqlite,
}

impl std::fmt::Display for DedupBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DedupBackend::Memory => write!(f, "memory"),
            DedupBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default = "default_webhook_config")]
    pub webhook: WebhookConfig,
    #[serde(default = "default_dedup_config")]
    pub dedup: DedupConfig,
    #[serde(default = "default_delivery_config")]
    pub delivery: DeliveryConfig,
    #[serde(default = "default_handlers_config")]
    pub handlers: HandlersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Public HTTPS base URL; `webhook.path` is appended and registered with
    /// `setWebhook` at startup. When unset the webhook is assumed to be
    /// registered out of band.
    #[serde(default)]
    pub public_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_webhook_path")]
    pub path: String,
    /// Compared against the `X-Telegram-Bot-Api-Secret-Token` header.
    #[serde(default)]
    pub secret_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default)]
    pub backend: DedupBackend,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_prune_cron")]
    pub prune_cron: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Minimum spacing between two sends to the same chat.
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,
    #[serde(default = "default_worker_idle_secs")]
    pub worker_idle_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HandlersConfig {
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,
}

fn default_api_base_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_webhook_path() -> String {
    "/webhook".to_string()
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_entries() -> usize {
    100_000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("docbot.db")
}

fn default_prune_cron() -> String {
    "0 */10 * * * *".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_min_send_interval_ms() -> u64 {
    1_000
}

fn default_worker_idle_secs() -> u64 {
    300
}

fn default_request_timeout_secs() -> u64 {
    60
}

// Bot API upload ceiling for sendDocument.
fn default_max_document_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_deadline_secs() -> u64 {
    30
}

fn default_documents_dir() -> PathBuf {
    PathBuf::from("documents")
}

fn default_webhook_config() -> WebhookConfig {
    WebhookConfig {
        listen_addr: default_listen_addr(),
        path: default_webhook_path(),
        secret_token: None,
    }
}

fn default_dedup_config() -> DedupConfig {
    DedupConfig {
        backend: DedupBackend::default(),
        retention_secs: default_retention_secs(),
        max_entries: default_max_entries(),
        database_path: default_db_path(),
        prune_cron: default_prune_cron(),
    }
}

fn default_delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        max_attempts: default_max_attempts(),
        initial_backoff_ms: default_initial_backoff_ms(),
        max_backoff_ms: default_max_backoff_ms(),
        backoff_multiplier: default_backoff_multiplier(),
        min_send_interval_ms: default_min_send_interval_ms(),
        worker_idle_secs: default_worker_idle_secs(),
        request_timeout_secs: default_request_timeout_secs(),
        max_document_bytes: default_max_document_bytes(),
    }
}

fn default_handlers_config() -> HandlersConfig {
    HandlersConfig {
        deadline_secs: default_deadline_secs(),
        documents_dir: default_documents_dir(),
    }
}

impl DedupConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl HandlersConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&content)?;

        if !config.handlers.documents_dir.exists() {
            std::fs::create_dir_all(&config.handlers.documents_dir).with_context(|| {
                format!(
                    "Failed to create documents directory: {}",
                    config.handlers.documents_dir.display()
                )
            })?;
        }

        Ok(config)
    }

    /// Parse and validate a TOML document without touching the filesystem.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token must not be empty");
        }
        if !self.webhook.path.starts_with('/') {
            anyhow::bail!(
                "webhook.path must start with '/', got '{}'",
                self.webhook.path
            );
        }
        if self.dedup.retention_secs == 0 {
            anyhow::bail!("dedup.retention_secs must be positive");
        }
        if self.dedup.max_entries == 0 {
            anyhow::bail!("dedup.max_entries must be positive");
        }
        if self.delivery.max_attempts == 0 {
            anyhow::bail!("delivery.max_attempts must be at least 1");
        }
        if !(self.delivery.backoff_multiplier >= 1.0 && self.delivery.backoff_multiplier.is_finite())
        {
            anyhow::bail!(
                "delivery.backoff_multiplier must be a finite value >= 1.0, got {}",
                self.delivery.backoff_multiplier
            );
        }
        if self.delivery.max_backoff_ms < self.delivery.initial_backoff_ms {
            anyhow::bail!("delivery.max_backoff_ms must not be below initial_backoff_ms");
        }
        if self.delivery.request_timeout_secs == 0 {
            anyhow::bail!("delivery.request_timeout_secs must be positive");
        }
        if self.delivery.max_document_bytes == 0 {
            anyhow::bail!("delivery.max_document_bytes must be positive");
        }
        if self.handlers.deadline_secs == 0 {
            anyhow::bail!("handlers.deadline_secs must be positive");
        }
        Ok(())
    }
}
