// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Webhook downstream sender.
//!
//! Each flushed batch is POSTed as JSON. With a secret configured the raw
//! body is signed with HMAC-SHA256 and the digest sent as
//! `X-Herald-Signature: sha256=<hex>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use herald_config::model::WebhookConfig;
use herald_core::{DownstreamSender, HeraldError, MessageBatch};
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use sha2::Sha256;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-herald-signature";

/// Returns `sha256=<hex>` for `body` keyed with `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, HeraldError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| HeraldError::Internal(format!("invalid webhook secret: {e}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Delivers batches to an HTTP endpoint.
pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookSender {
    pub fn new(
        url: impl Into<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, HeraldError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HeraldError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            secret: secret.filter(|s| !s.is_empty()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DownstreamSender for WebhookSender {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, batch: &MessageBatch) -> Result<(), HeraldError> {
        let body = serde_json::to_vec(batch)
            .map_err(|e| HeraldError::Internal(format!("failed to encode batch: {e}")))?;

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, &body)?);
        }

        let response = request.body(body).send().await.map_err(|e| {
            HeraldError::downstream(format!("webhook request failed: {e}"), Some(Box::new(e)))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                session_id = %batch.session_id,
                chat_id = %batch.chat_id,
                status = %status,
                "webhook rejected batch"
            );
            return Err(HeraldError::downstream(
                format!("webhook returned {status}: {body}"),
                None,
            ));
        }

        debug!(
            session_id = %batch.session_id,
            chat_id = %batch.chat_id,
            count = batch.count,
            status = %status,
            "batch delivered to webhook"
        );
        Ok(())
    }
}

/// Stand-in used when no webhook URL is configured: batches are logged and
/// counted as delivered.
pub struct LogSender;

#[async_trait]
impl DownstreamSender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, batch: &MessageBatch) -> Result<(), HeraldError> {
        info!(
            session_id = %batch.session_id,
            chat_id = %batch.chat_id,
            count = batch.count,
            "batch flushed (no webhook configured)"
        );
        Ok(())
    }
}

/// Picks the downstream sender for `config`.
pub fn sender_from_config(config: &WebhookConfig) -> Result<Arc<dyn DownstreamSender>, HeraldError> {
    match &config.url {
        Some(url) => {
            let sender = WebhookSender::new(
                url.clone(),
                config.secret.clone(),
                Duration::from_secs(config.timeout_secs),
            )?;
            info!(url = %sender.url(), signed = sender.secret.is_some(), "webhook sender configured");
            Ok(Arc::new(sender))
        }
        None => {
            warn!("no webhook url configured, flushed batches will only be logged");
            Ok(Arc::new(LogSender))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::{InboundMessage, SessionId};
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn batch() -> MessageBatch {
        let message = InboundMessage {
            id: "m1".into(),
            chat_id: "c1".into(),
            sender_id: "111@c.us".into(),
            body: "hello".into(),
            timestamp: chrono::Utc::now(),
            is_group: false,
            from_me: false,
            has_media: false,
            media: None,
            contact: None,
        };
        MessageBatch::new(&SessionId::parse("s1").unwrap(), "c1", vec![message])
    }

    #[test]
    fn sign_matches_rfc4231_vector() {
        let signature = sign("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[tokio::test]
    async fn posts_batch_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender =
            WebhookSender::new(format!("{}/hook", server.uri()), None, Duration::from_secs(5))
                .unwrap();
        sender.send(&batch()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["session_id"], "s1");
        assert_eq!(body["chat_id"], "c1");
        assert_eq!(body["count"], 1);
        assert_eq!(body["messages"][0]["id"], "m1");
        assert!(requests[0].headers.get(SIGNATURE_HEADER).is_none());
    }

    #[tokio::test]
    async fn signs_body_when_secret_is_set() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let sender = WebhookSender::new(
            format!("{}/", server.uri()),
            Some("topsecret".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        sender.send(&batch()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let sent = requests[0]
            .headers
            .get(SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(sent, sign("topsecret", &requests[0].body).unwrap());
    }

    #[tokio::test]
    async fn non_success_status_is_a_downstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let sender = WebhookSender::new(server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = sender.send(&batch()).await.unwrap_err();
        assert_eq!(err.kind(), herald_core::ErrorKind::DownstreamSend);
        assert!(err.to_string().contains("503"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn empty_secret_disables_signing() {
        let sender =
            WebhookSender::new("http://127.0.0.1:9", Some(String::new()), Duration::from_secs(1))
                .unwrap();
        assert!(sender.secret.is_none());
    }

    #[tokio::test]
    async fn missing_url_falls_back_to_log_sender() {
        let sender = sender_from_config(&WebhookConfig::default()).unwrap();
        assert_eq!(sender.name(), "log");
        sender.send(&batch()).await.unwrap();
    }
}
