use std::io::ErrorKind;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{PlatformApi, SentMessage};
use crate::config::TelegramConfig;
use crate::delivery::error::{DeliveryError, UploadError};
use crate::upload::{DocumentPayload, DocumentSource};

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct SetWebhookRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_token: Option<&'a str>,
    allowed_updates: &'a [&'a str],
}

/// Envelope wrapped around every Bot API response.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

const ALLOWED_UPDATES: &[&str] = &[
    "message",
    "edited_message",
    "channel_post",
    "edited_channel_post",
];

/// Minimal Telegram Bot API client covering the calls the bot makes.
pub struct BotApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl BotApiClient {
    pub fn new(config: &TelegramConfig, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// Register the public webhook URL with the platform.
    pub async fn set_webhook(&self, url: &str, secret_token: Option<&str>) -> Result<()> {
        let request = SetWebhookRequest {
            url,
            secret_token,
            allowed_updates: ALLOWED_UPDATES,
        };

        let response = self
            .client
            .post(self.method_url("setWebhook"))
            .json(&request)
            .send()
            .await
            .map_err(|e| e.without_url())
            .context("Failed to send setWebhook request")?;

        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| e.without_url())
            .context("Failed to parse setWebhook response")?;
        if !status.is_success() || !body.ok {
            anyhow::bail!(
                "setWebhook rejected ({}): {}",
                status,
                body.description.unwrap_or_default()
            );
        }

        info!("Webhook registered at {}", url);
        Ok(())
    }

    async fn document_part(&self, document: &DocumentPayload) -> Result<Part, DeliveryError> {
        let part = match &document.source {
            DocumentSource::Memory(bytes) => Part::bytes(bytes.clone()),
            DocumentSource::File(path) => {
                // Reopened per attempt, so a retry restarts the transfer.
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    if e.kind() == ErrorKind::NotFound {
                        UploadError::InvalidDocument(format!("{} not found", path.display()))
                    } else {
                        UploadError::Interrupted(format!(
                            "cannot open {}: {}",
                            path.display(),
                            e
                        ))
                    }
                })?;
                let size = file
                    .metadata()
                    .await
                    .map_err(|e| {
                        UploadError::Interrupted(format!("cannot stat {}: {}", path.display(), e))
                    })?
                    .len();
                // the size limit was checked against the queued size
                if size != document.size {
                    return Err(UploadError::InvalidDocument(format!(
                        "{} changed since it was queued ({} -> {} bytes)",
                        path.display(),
                        document.size,
                        size
                    ))
                    .into());
                }
                Part::stream_with_length(file, size)
            }
        };

        part.file_name(document.filename.clone())
            .mime_str(&document.mime_type)
            .map_err(|e| UploadError::InvalidDocument(e.to_string()).into())
    }
}

/// Map an HTTP response onto the delivery error taxonomy.
async fn read_ack(response: reqwest::Response) -> Result<SentMessage, DeliveryError> {
    let status = response.status();
    let body: ApiResponse = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            return Err(DeliveryError::Transient(format!(
                "unreadable response ({}): {}",
                status, e
            )))
        }
    };

    if let Some(seconds) = body.parameters.as_ref().and_then(|p| p.retry_after) {
        return Err(DeliveryError::RateLimited {
            retry_after: Duration::from_secs(seconds),
        });
    }

    let describe = || {
        format!(
            "{} {}",
            body.error_code.unwrap_or(status.as_u16()),
            body.description.as_deref().unwrap_or("no description")
        )
    };

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(DeliveryError::Transient(describe()));
    }
    if !status.is_success() || !body.ok {
        return Err(DeliveryError::Terminal(describe()));
    }

    let message_id = body
        .result
        .as_ref()
        .and_then(|result| result.get("message_id"))
        .and_then(serde_json::Value::as_i64);

    Ok(SentMessage { message_id })
}

#[async_trait]
impl PlatformApi for BotApiClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<SentMessage, DeliveryError> {
        debug!(chat_id, len = text.len(), "sendMessage");

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&SendMessageRequest { chat_id, text })
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("sendMessage failed: {}", e.without_url())))?;

        read_ack(response).await
    }

    async fn send_document(
        &self,
        chat_id: i64,
        document: &DocumentPayload,
        caption: Option<&str>,
    ) -> Result<SentMessage, DeliveryError> {
        debug!(chat_id, filename = %document.filename, "sendDocument");

        let mut form = Form::new().text("chat_id", chat_id.to_string());
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        form = form.part("document", self.document_part(document).await?);

        let response = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Interrupted(e.without_url().to_string()))?;

        read_ack(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "123:test";

    fn client(server: &MockServer) -> BotApiClient {
        let config = TelegramConfig {
            bot_token: TOKEN.to_string(),
            api_base_url: server.uri(),
            public_url: None,
        };
        BotApiClient::new(&config, Duration::from_secs(5)).unwrap()
    }

    async fn mount(server: &MockServer, api_method: &str, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path(format!("/bot{}/{}", TOKEN, api_method)))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_send_text_returns_message_id() {
        let server = MockServer::start().await;
        mount(
            &server,
            "sendMessage",
            ResponseTemplate::new(200)
                .set_body_json(json!({ "ok": true, "result": { "message_id": 321 } })),
        )
        .await;

        let sent = client(&server).send_text(100, "hi").await.unwrap();
        assert_eq!(sent.message_id, Some(321));
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        mount(
            &server,
            "sendMessage",
            ResponseTemplate::new(429).set_body_json(json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 5",
                "parameters": { "retry_after": 5 }
            })),
        )
        .await;

        let err = client(&server).send_text(100, "hi").await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::RateLimited {
                retry_after: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_chat_is_terminal() {
        let server = MockServer::start().await;
        mount(
            &server,
            "sendMessage",
            ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: chat not found"
            })),
        )
        .await;

        let err = client(&server).send_text(1, "hi").await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::Terminal("400 Bad Request: chat not found".to_string())
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        mount(
            &server,
            "sendMessage",
            ResponseTemplate::new(502).set_body_string("<html>Bad Gateway</html>"),
        )
        .await;

        let err = client(&server).send_text(1, "hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transient(_)));
    }

    #[tokio::test]
    async fn test_ok_without_message_id_is_reported_as_missing() {
        let server = MockServer::start().await;
        mount(
            &server,
            "sendDocument",
            ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": {} })),
        )
        .await;

        let doc = DocumentPayload::from_bytes(b"abc".to_vec(), "a.txt", "text/plain");
        let sent = client(&server).send_document(1, &doc, None).await.unwrap();
        assert_eq!(sent.message_id, None);
    }

    #[tokio::test]
    async fn test_send_document_streams_file() {
        let server = MockServer::start().await;
        mount(
            &server,
            "sendDocument",
            ResponseTemplate::new(200)
                .set_body_json(json!({ "ok": true, "result": { "message_id": 9 } })),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("report.pdf");
        tokio::fs::write(&file, b"%PDF-1.4 fake").await.unwrap();
        let doc = DocumentPayload::from_path(&file).await.unwrap();

        let sent = client(&server)
            .send_document(100, &doc, Some("monthly"))
            .await
            .unwrap();
        assert_eq!(sent.message_id, Some(9));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("filename=\"report.pdf\""));
        assert!(body.contains("%PDF-1.4 fake"));
        assert!(body.contains("monthly"));
    }

    #[tokio::test]
    async fn test_missing_source_file_is_terminal() {
        let server = MockServer::start().await;
        let doc = DocumentPayload {
            source: DocumentSource::File("/nonexistent/docbot/report.pdf".into()),
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: 10,
        };

        let err = client(&server).send_document(1, &doc, None).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Upload(UploadError::InvalidDocument(_))
        ));
        assert!(!err.is_transient());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_changed_after_queueing_is_not_sent() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("report.pdf");
        tokio::fs::write(&file, b"%PDF-1.4").await.unwrap();
        let doc = DocumentPayload::from_path(&file).await.unwrap();
        tokio::fs::write(&file, b"%PDF-1.4 with more pages").await.unwrap();

        let err = client(&server).send_document(1, &doc, None).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Upload(UploadError::InvalidDocument(_))
        ));
        assert!(!err.is_transient());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_webhook_error_hides_token() {
        let config = TelegramConfig {
            bot_token: "999:SECRET_TOKEN".to_string(),
            api_base_url: "http://127.0.0.1:1".to_string(),
            public_url: None,
        };
        let client = BotApiClient::new(&config, Duration::from_secs(5)).unwrap();

        let err = client
            .set_webhook("https://bot.example.com/webhook", None)
            .await
            .unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("setWebhook"));
        assert!(!message.contains("SECRET_TOKEN"));
    }

    #[tokio::test]
    async fn test_set_webhook_sends_secret() {
        let server = MockServer::start().await;
        mount(
            &server,
            "setWebhook",
            ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })),
        )
        .await;

        client(&server)
            .set_webhook("https://bot.example.com/webhook", Some("s3cret"))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["url"], "https://bot.example.com/webhook");
        assert_eq!(body["secret_token"], "s3cret");
    }
}
