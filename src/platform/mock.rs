//! Scripted stand-in for the Bot API used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{PlatformApi, SentMessage};
use crate::delivery::error::DeliveryError;
use crate::upload::DocumentPayload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    Text(String),
    Document(String),
}

#[derive(Debug, Clone)]
pub struct ApiCall {
    pub chat_id: i64,
    pub kind: CallKind,
    pub at: Instant,
}

/// Answers calls from a queue of scripted results, then succeeds with
/// increasing message ids once the script runs dry.
#[derive(Default)]
pub struct ScriptedApi {
    script: Mutex<VecDeque<Result<SentMessage, DeliveryError>>>,
    calls: Mutex<Vec<ApiCall>>,
    delays: Mutex<HashMap<String, Duration>>,
    next_id: Mutex<i64>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Result<SentMessage, DeliveryError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// Hold the response for calls whose text (or filename) matches `key`.
    pub fn delay(&self, key: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn respond(&self, chat_id: i64, kind: CallKind) -> Result<SentMessage, DeliveryError> {
        let key = match &kind {
            CallKind::Text(text) => text.clone(),
            CallKind::Document(name) => name.clone(),
        };
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ApiCall {
                chat_id,
                kind,
                at: Instant::now(),
            });

        let delay = self
            .delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match scripted {
            Some(result) => result,
            None => {
                let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
                *next_id += 1;
                Ok(SentMessage {
                    message_id: Some(*next_id),
                })
            }
        }
    }
}

#[async_trait]
impl PlatformApi for ScriptedApi {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<SentMessage, DeliveryError> {
        self.respond(chat_id, CallKind::Text(text.to_string())).await
    }

    async fn send_document(
        &self,
        chat_id: i64,
        document: &DocumentPayload,
        _caption: Option<&str>,
    ) -> Result<SentMessage, DeliveryError> {
        self.respond(chat_id, CallKind::Document(document.filename.clone()))
            .await
    }
}
