use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::delivery::error::UploadError;
use crate::delivery::{DeliveryQueue, JobId, OutboundJob};
use crate::upload::DocumentPayload;

/// Telegram rejects messages above 4096 characters; stay under it in bytes.
const MAX_TEXT_LEN: usize = 4000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResponderError {
    #[error("responder is closed; the handler's execution slot has ended")]
    Closed,
    #[error("refusing to send an empty message")]
    EmptyMessage,
    #[error(transparent)]
    Rejected(#[from] UploadError),
}

/// Reply capability handed to a handler for one update. Every method only
/// enqueues work and returns immediately.
#[derive(Clone)]
pub struct Responder {
    chat_id: i64,
    queue: DeliveryQueue,
    open: Arc<AtomicBool>,
}

impl Responder {
    pub fn new(chat_id: i64, queue: DeliveryQueue) -> Self {
        Self {
            chat_id,
            queue,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    /// Queue a text reply, split into several messages when it is too long.
    pub fn reply_text(&self, text: impl Into<String>) -> Result<Vec<JobId>, ResponderError> {
        self.ensure_open()?;
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ResponderError::EmptyMessage);
        }

        let mut ids = Vec::new();
        for chunk in split_message(&text, MAX_TEXT_LEN) {
            // text jobs are never refused by the queue
            ids.push(self.queue.submit(OutboundJob::text(self.chat_id, chunk))?);
        }
        Ok(ids)
    }

    pub fn reply_document(&self, payload: DocumentPayload) -> Result<JobId, ResponderError> {
        self.submit_document(payload, None)
    }

    pub fn reply_document_with_caption(
        &self,
        payload: DocumentPayload,
        caption: impl Into<String>,
    ) -> Result<JobId, ResponderError> {
        self.submit_document(payload, Some(caption.into()))
    }

    fn submit_document(
        &self,
        payload: DocumentPayload,
        caption: Option<String>,
    ) -> Result<JobId, ResponderError> {
        self.ensure_open()?;
        let job = OutboundJob::document(self.chat_id, payload, caption);
        Ok(self.queue.submit(job)?)
    }

    /// Refuse any further replies, including from clones.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ResponderError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ResponderError::Closed)
        }
    }
}

/// Split long messages, preferring newline then space boundaries.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            // a boundary at the window start would leave a blank chunk
            let window = &text[start..end];
            window
                .rfind('\n')
                .filter(|&pos| pos > 0)
                .or_else(|| window.rfind(' ').filter(|&pos| pos > 0))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}
