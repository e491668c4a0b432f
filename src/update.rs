//! Decoding of raw webhook bodies into normalized [`Update`]s.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed update payload: {0}")]
    MalformedPayload(String),
    #[error("unsupported update kind: {0}")]
    UnsupportedKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Text,
    Command,
    Document,
    Other,
}

/// A file attached to an inbound message, referenced by its platform id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Command { name: String, args: String },
    Document(DocumentRef),
    Other,
}

/// One normalized inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub update_id: i64,
    pub chat_id: i64,
    /// Absent for channel posts.
    pub sender_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl Update {
    pub fn kind(&self) -> UpdateKind {
        match self.payload {
            Payload::Text(_) => UpdateKind::Text,
            Payload::Command { .. } => UpdateKind::Command,
            Payload::Document(_) => UpdateKind::Document,
            Payload::Other => UpdateKind::Other,
        }
    }

    /// Command name (lowercase, without the leading slash) and its arguments.
    pub fn command(&self) -> Option<(&str, &str)> {
        match &self.payload {
            Payload::Command { name, args } => Some((name.as_str(), args.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    edited_message: Option<RawMessage>,
    #[serde(default)]
    channel_post: Option<RawMessage>,
    #[serde(default)]
    edited_channel_post: Option<RawMessage>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    date: i64,
    chat: RawChat,
    #[serde(default)]
    from: Option<RawUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    document: Option<RawDocument>,
}

#[derive(Debug, Deserialize)]
struct RawChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
}

/// Parse a webhook body into an [`Update`].
pub fn decode(raw: &[u8]) -> Result<Update, DecodeError> {
    let raw: RawUpdate = serde_json::from_slice(raw)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    let message = raw
        .message
        .or(raw.edited_message)
        .or(raw.channel_post)
        .or(raw.edited_channel_post);

    let Some(message) = message else {
        let kind = raw
            .rest
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "empty".to_string());
        return Err(DecodeError::UnsupportedKind(kind));
    };

    let timestamp = DateTime::from_timestamp(message.date, 0).ok_or_else(|| {
        DecodeError::MalformedPayload(format!("date {} is out of range", message.date))
    })?;

    let payload = if let Some(document) = message.document {
        Payload::Document(DocumentRef {
            file_id: document.file_id,
            file_name: document.file_name,
            mime_type: document.mime_type,
            file_size: document.file_size,
        })
    } else if let Some(text) = message.text {
        parse_text(text)
    } else {
        Payload::Other
    };

    Ok(Update {
        update_id: raw.update_id,
        chat_id: message.chat.id,
        sender_id: message.from.map(|user| user.id),
        timestamp,
        payload,
    })
}

fn parse_text(text: String) -> Payload {
    let Some(command) = text.strip_prefix('/') else {
        return Payload::Text(text);
    };

    let (head, args) = match command.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (command, ""),
    };
    // "/send@docbot" addresses a specific bot in group chats
    let name = head.split('@').next().unwrap_or_default();
    if name.is_empty() {
        return Payload::Text(text);
    }

    Payload::Command {
        name: name.to_lowercase(),
        args: args.to_string(),
    }
}
