//! Built-in command handlers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::HandlersConfig;
use crate::delivery::error::UploadError;
use crate::responder::{Responder, ResponderError};
use crate::router::{CommandRouter, Handler};
use crate::update::{Payload, Update, UpdateKind};
use crate::upload::DocumentPayload;

const HELP_TEXT: &str = "Hello! I deliver documents on request.\n\n\
     Commands:\n\
     /send <file> [caption] - Send a document from the shared folder\n\
     /help - Show this message";

/// Resolve `requested` inside `documents_dir`, refusing anything that
/// escapes it. Returns the canonicalized path.
async fn resolve_document(documents_dir: &Path, requested: &str) -> Result<PathBuf> {
    let root = tokio::fs::canonicalize(documents_dir)
        .await
        .with_context(|| format!("Documents directory not found: {}", documents_dir.display()))?;

    if requested.is_empty() || Path::new(requested).is_absolute() {
        anyhow::bail!("Access denied: '{}' is not a relative file name", requested);
    }

    let candidate = tokio::fs::canonicalize(root.join(requested))
        .await
        .with_context(|| format!("No document named '{}'", requested))?;

    if !candidate.starts_with(&root) {
        anyhow::bail!(
            "Access denied: '{}' is outside the documents directory",
            requested
        );
    }

    Ok(candidate)
}

pub struct StartHandler;

#[async_trait]
impl Handler for StartHandler {
    fn name(&self) -> &str {
        "start"
    }

    async fn handle(&self, _update: &Update, responder: &Responder) -> Result<()> {
        responder.reply_text(HELP_TEXT)?;
        Ok(())
    }
}

/// `/send <file> [caption]`: reply with a document from the shared folder.
pub struct SendHandler {
    documents_dir: PathBuf,
}

impl SendHandler {
    pub fn new(documents_dir: PathBuf) -> Self {
        Self { documents_dir }
    }
}

#[async_trait]
impl Handler for SendHandler {
    fn name(&self) -> &str {
        "send"
    }

    async fn handle(&self, update: &Update, responder: &Responder) -> Result<()> {
        let args = update.command().map(|(_, args)| args).unwrap_or_default();
        let (requested, caption) = match args.split_once(char::is_whitespace) {
            Some((file, caption)) => (file, Some(caption.trim())),
            None => (args, None),
        };
        if requested.is_empty() {
            responder.reply_text("Usage: /send <file> [caption]")?;
            return Ok(());
        }

        let path = match resolve_document(&self.documents_dir, requested).await {
            Ok(path) => path,
            Err(e) => {
                info!(chat_id = responder.chat_id(), "Document lookup failed: {:#}", e);
                responder.reply_text(format!("Cannot send '{}': not found.", requested))?;
                return Ok(());
            }
        };

        let payload = match DocumentPayload::from_path(&path).await {
            Ok(payload) => payload,
            Err(e) => {
                info!(chat_id = responder.chat_id(), "Cannot send document: {}", e);
                responder.reply_text(format!("Cannot send '{}': not a document.", requested))?;
                return Ok(());
            }
        };
        let submitted = match caption.filter(|c| !c.is_empty()) {
            Some(caption) => responder.reply_document_with_caption(payload, caption),
            None => responder.reply_document(payload),
        };
        match submitted {
            Ok(_) => Ok(()),
            Err(ResponderError::Rejected(UploadError::PayloadTooLarge { size, limit, .. })) => {
                responder.reply_text(format!(
                    "'{}' is too large to send ({} bytes, limit {}).",
                    requested, size, limit
                ))?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Confirms receipt of an inbound document.
pub struct DocumentReceivedHandler;

#[async_trait]
impl Handler for DocumentReceivedHandler {
    fn name(&self) -> &str {
        "document-received"
    }

    async fn handle(&self, update: &Update, responder: &Responder) -> Result<()> {
        let Payload::Document(document) = &update.payload else {
            return Ok(());
        };

        debug!(
            file_id = %document.file_id,
            mime_type = document.mime_type.as_deref().unwrap_or("unknown"),
            "Inbound document"
        );
        let name = document.file_name.as_deref().unwrap_or("your file");
        let reply = match document.file_size {
            Some(size) => format!("Received {} ({} bytes).", name, size),
            None => format!("Received {}.", name),
        };
        responder.reply_text(reply)?;
        Ok(())
    }
}

pub struct FallbackHandler;

#[async_trait]
impl Handler for FallbackHandler {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn handle(&self, update: &Update, responder: &Responder) -> Result<()> {
        match update.command() {
            Some((name, _)) => {
                responder.reply_text(format!("Unknown command /{}. Try /help.", name))?;
            }
            None if update.kind() == UpdateKind::Text => {
                responder.reply_text("I only understand commands. Try /help.")?;
            }
            // stickers, photos and the like get no answer
            None => {}
        }
        Ok(())
    }
}

pub fn default_router(config: &HandlersConfig) -> CommandRouter {
    CommandRouter::new(FallbackHandler)
        .command("start", StartHandler)
        .command("help", StartHandler)
        .command("send", SendHandler::new(config.documents_dir.clone()))
        .route_when(
            |update| update.kind() == UpdateKind::Document,
            DocumentReceivedHandler,
        )
}
