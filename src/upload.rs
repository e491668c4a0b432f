//! Document upload pipeline.
//!
//! Validates a [`DocumentPayload`] against the platform limits before any
//! network traffic, hands it to the [`PlatformApi`] for a single transfer and
//! checks that the acknowledgement names the created message. Retries are
//! driven by the delivery worker; every attempt re-reads the source from the
//! start since the Bot API has no resumable uploads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::delivery::error::{DeliveryError, UploadError};
use crate::platform::PlatformApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    Memory(Vec<u8>),
    /// Streamed from disk on every attempt.
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPayload {
    pub source: DocumentSource,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

impl DocumentPayload {
    pub fn from_bytes(
        bytes: Vec<u8>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let size = bytes.len() as u64;
        Self {
            source: DocumentSource::Memory(bytes),
            filename: filename.into(),
            mime_type: mime_type.into(),
            size,
        }
    }

    /// Describe a file on disk. Size comes from metadata; the MIME type is
    /// guessed from the extension.
    pub async fn from_path(path: &Path) -> Result<Self, UploadError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            UploadError::InvalidDocument(format!("cannot stat {}: {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(UploadError::InvalidDocument(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            source: DocumentSource::File(path.to_path_buf()),
            mime_type: guess_mime_type(&filename).to_string(),
            filename,
            size: metadata.len(),
        })
    }
}

/// MIME type for common document extensions, `application/octet-stream`
/// otherwise.
pub fn guess_mime_type(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" | "htm" => "text/html",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

fn is_valid_mime_type(mime: &str) -> bool {
    match mime.split_once('/') {
        Some((kind, subtype)) => {
            !kind.is_empty()
                && !subtype.is_empty()
                && !mime.contains(char::is_whitespace)
                && !subtype.contains('/')
        }
        None => false,
    }
}

#[derive(Clone)]
pub struct UploadPipeline {
    api: Arc<dyn PlatformApi>,
    max_document_bytes: u64,
}

impl UploadPipeline {
    pub fn new(api: Arc<dyn PlatformApi>, max_document_bytes: u64) -> Self {
        Self {
            api,
            max_document_bytes,
        }
    }

    /// Checks that need no network: name, MIME type and size ceiling.
    pub fn validate(&self, document: &DocumentPayload) -> Result<(), UploadError> {
        if document.filename.trim().is_empty() {
            return Err(UploadError::InvalidDocument(
                "filename must not be empty".to_string(),
            ));
        }
        if !is_valid_mime_type(&document.mime_type) {
            return Err(UploadError::InvalidDocument(format!(
                "malformed MIME type '{}'",
                document.mime_type
            )));
        }
        if document.size > self.max_document_bytes {
            return Err(UploadError::PayloadTooLarge {
                filename: document.filename.clone(),
                size: document.size,
                limit: self.max_document_bytes,
            });
        }
        Ok(())
    }

    /// One upload attempt. Returns the platform message id on success.
    pub async fn upload(
        &self,
        chat_id: i64,
        document: &DocumentPayload,
        caption: Option<&str>,
    ) -> Result<i64, DeliveryError> {
        self.validate(document)?;

        debug!(
            chat_id,
            filename = %document.filename,
            size = document.size,
            "Uploading document"
        );

        let sent = self.api.send_document(chat_id, document, caption).await?;
        sent.message_id
            .ok_or(DeliveryError::Upload(UploadError::MissingAck))
    }
}
