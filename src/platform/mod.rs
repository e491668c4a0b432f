pub mod telegram;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;

use crate::delivery::error::DeliveryError;
use crate::upload::DocumentPayload;

/// Acknowledgement of an accepted send. `message_id` is `None` when the
/// platform answered `ok` without naming the created message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: Option<i64>,
}

/// Outbound calls to the chat platform, one attempt each.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<SentMessage, DeliveryError>;

    async fn send_document(
        &self,
        chat_id: i64,
        document: &DocumentPayload,
        caption: Option<&str>,
    ) -> Result<SentMessage, DeliveryError>;
}
