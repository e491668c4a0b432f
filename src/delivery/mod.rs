//! Outbound delivery queue.
//!
//! Each destination chat gets its own worker task fed by a FIFO channel. A
//! worker takes one job at a time and drives it to a terminal state (retrying
//! transient failures with backoff, pausing for platform rate-limit hints)
//! before looking at the next job, which gives per-chat ordering while chats
//! proceed independently. Workers retire after an idle period.

pub mod error;
pub mod retry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::platform::PlatformApi;
use crate::upload::{DocumentPayload, UploadPipeline};

use self::error::{DeliveryError, UploadError};
use self::retry::RetryPolicy;

const REPORT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobContent {
    Text(String),
    Document {
        payload: DocumentPayload,
        caption: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    InFlight,
    Delivered,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OutboundJob {
    pub id: JobId,
    pub chat_id: i64,
    pub content: JobContent,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub state: JobState,
}

impl OutboundJob {
    pub fn new(chat_id: i64, content: JobContent) -> Self {
        Self {
            id: JobId::new(),
            chat_id,
            content,
            attempt_count: 0,
            created_at: Utc::now(),
            state: JobState::Queued,
        }
    }

    pub fn text(chat_id: i64, text: impl Into<String>) -> Self {
        Self::new(chat_id, JobContent::Text(text.into()))
    }

    pub fn document(chat_id: i64, payload: DocumentPayload, caption: Option<String>) -> Self {
        Self::new(chat_id, JobContent::Document { payload, caption })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub job_id: JobId,
    pub platform_message_id: i64,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered(DeliveryReceipt),
    Failed(DeliveryError),
}

/// Terminal record of a job, broadcast to [`DeliveryQueue::subscribe`]rs.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    pub chat_id: i64,
    pub attempts: u32,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub retry: RetryPolicy,
    /// Minimum spacing between attempts to the same chat.
    pub min_send_interval: Duration,
    pub worker_idle: Duration,
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            retry: RetryPolicy::from(config),
            min_send_interval: Duration::from_millis(config.min_send_interval_ms),
            worker_idle: Duration::from_secs(config.worker_idle_secs),
        }
    }
}

struct WorkerHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<OutboundJob>,
}

struct QueueInner {
    api: Arc<dyn PlatformApi>,
    uploader: UploadPipeline,
    settings: DeliverySettings,
    workers: Mutex<HashMap<i64, WorkerHandle>>,
    next_generation: AtomicU64,
    reports: broadcast::Sender<JobReport>,
}

impl QueueInner {
    /// Remove the worker's slot if nothing is waiting for it. Submissions
    /// happen under the same lock, so a job can't slip in between the check
    /// and the removal.
    fn retire(&self, chat_id: i64, generation: u64, rx: &mpsc::UnboundedReceiver<OutboundJob>) -> bool {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !rx.is_empty() {
            return false;
        }
        if workers.get(&chat_id).map(|w| w.generation) == Some(generation) {
            workers.remove(&chat_id);
        }
        true
    }
}

#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    pub fn new(api: Arc<dyn PlatformApi>, uploader: UploadPipeline, settings: DeliverySettings) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                api,
                uploader,
                settings,
                workers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                reports,
            }),
        }
    }

    /// Terminal reports for every job submitted after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<JobReport> {
        self.inner.reports.subscribe()
    }

    /// Number of destinations with a live worker.
    #[cfg(test)]
    pub fn active_destinations(&self) -> usize {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Enqueue a job without waiting for delivery. Documents that can never
    /// be uploaded are refused here, before they reach a worker.
    pub fn submit(&self, mut job: OutboundJob) -> Result<JobId, UploadError> {
        if let JobContent::Document { payload, .. } = &job.content {
            if let Err(err) = self.inner.uploader.validate(payload) {
                warn!(chat_id = job.chat_id, error = %err, "Refusing document job");
                return Err(err);
            }
        }

        job.state = JobState::Queued;
        let job_id = job.id;
        let chat_id = job.chat_id;

        let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let job = match workers.get(&chat_id) {
            Some(worker) => match worker.tx.send(job) {
                Ok(()) => {
                    debug!(chat_id, %job_id, "Job queued");
                    return Ok(job_id);
                }
                // the worker retired and dropped its receiver
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // rx is alive, so this cannot fail
        let _ = tx.send(job);
        workers.insert(chat_id, WorkerHandle { generation, tx });
        drop(workers);

        let worker = Worker {
            chat_id,
            generation,
            inner: self.inner.clone(),
            last_attempt: None,
        };
        tokio::spawn(worker.run(rx));

        debug!(chat_id, %job_id, "Job queued on new worker");
        Ok(job_id)
    }
}

struct Worker {
    chat_id: i64,
    generation: u64,
    inner: Arc<QueueInner>,
    last_attempt: Option<Instant>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<OutboundJob>) {
        debug!(chat_id = self.chat_id, "Delivery worker started");

        loop {
            let job = match tokio::time::timeout(self.inner.settings.worker_idle, rx.recv()).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(_) => {
                    if self.inner.retire(self.chat_id, self.generation, &rx) {
                        break;
                    }
                    continue;
                }
            };
            self.deliver(job).await;
        }

        debug!(chat_id = self.chat_id, "Delivery worker retired");
    }

    /// Drive one job to a terminal state.
    async fn deliver(&mut self, mut job: OutboundJob) {
        let policy = self.inner.settings.retry.clone();
        job.state = JobState::InFlight;

        loop {
            self.pace().await;
            job.attempt_count += 1;
            let result = self.attempt(&job).await;
            self.last_attempt = Some(Instant::now());

            match result {
                Ok(message_id) => {
                    job.state = JobState::Delivered;
                    info!(
                        chat_id = job.chat_id,
                        job_id = %job.id,
                        attempt = job.attempt_count,
                        message_id,
                        latency_ms = (Utc::now() - job.created_at).num_milliseconds(),
                        "Job delivered"
                    );
                    let receipt = DeliveryReceipt {
                        job_id: job.id,
                        platform_message_id: message_id,
                        delivered_at: Utc::now(),
                    };
                    self.report(&job, JobOutcome::Delivered(receipt));
                    return;
                }
                Err(err) if err.is_transient() && policy.allows_another_attempt(job.attempt_count) => {
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| policy.backoff_for(job.attempt_count));
                    warn!(
                        chat_id = job.chat_id,
                        job_id = %job.id,
                        attempt = job.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Delivery attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    job.state = JobState::Failed;
                    error!(
                        chat_id = job.chat_id,
                        job_id = %job.id,
                        attempts = job.attempt_count,
                        error = %err,
                        "Job failed"
                    );
                    self.report(&job, JobOutcome::Failed(err));
                    return;
                }
            }
        }
    }

    async fn attempt(&self, job: &OutboundJob) -> Result<i64, DeliveryError> {
        match &job.content {
            JobContent::Text(text) => {
                let sent = self.inner.api.send_text(job.chat_id, text).await?;
                sent.message_id.ok_or_else(|| {
                    DeliveryError::Transient("acknowledgement without message id".to_string())
                })
            }
            JobContent::Document { payload, caption } => {
                self.inner
                    .uploader
                    .upload(job.chat_id, payload, caption.as_deref())
                    .await
            }
        }
    }

    /// Keep consecutive attempts to this chat at least `min_send_interval` apart.
    async fn pace(&self) {
        if let Some(last) = self.last_attempt {
            let next = last + self.inner.settings.min_send_interval;
            if next > Instant::now() {
                tokio::time::sleep_until(next).await;
            }
        }
    }

    fn report(&self, job: &OutboundJob, outcome: JobOutcome) {
        debug!(job_id = %job.id, state = ?job.state, "Job reached terminal state");
        // no subscribers is fine; the outcome has been logged
        let _ = self.inner.reports.send(JobReport {
            job_id: job.id,
            chat_id: job.chat_id,
            attempts: job.attempt_count,
            outcome,
        });
    }
}
