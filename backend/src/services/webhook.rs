// Outbound webhook delivery with HMAC request signing

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::DeliveryError;

pub const SIGNATURE_HEADER: &str = "X-Cadence-Signature";
pub const IDEMPOTENCY_HEADER: &str = "X-Cadence-Idempotency-Key";

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Serialized JSON body, signed as-is
    pub body: Vec<u8>,
    pub signature: Option<String>,
    pub idempotency_key: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookClient: Send + Sync {
    /// POST the request; returns the response status on success
    async fn post(&self, request: &WebhookRequest) -> Result<u16, DeliveryError>;
}

/// Signs payloads as `sha256=<hex hmac>` so receivers can verify the sender
#[derive(Clone)]
pub struct WebhookSigner {
    secret: Option<String>,
}

impl WebhookSigner {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret: secret.filter(|s| !s.is_empty()) }
    }

    pub fn sign(&self, payload: &[u8]) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(payload);
        Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
    }
}

pub struct HttpWebhookClient {
    client: reqwest::Client,
}

impl HttpWebhookClient {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Permanent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// 408, 429 and 5xx are worth another attempt; any other non-2xx is final
    pub fn classify_status(status: StatusCode) -> Result<u16, DeliveryError> {
        if status.is_success() {
            Ok(status.as_u16())
        } else if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            Err(DeliveryError::Transient(format!("HTTP {}", status)))
        } else {
            Err(DeliveryError::Permanent(format!("HTTP {}", status)))
        }
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn post(&self, request: &WebhookRequest) -> Result<u16, DeliveryError> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| DeliveryError::Permanent(format!("invalid webhook url '{}': {}", request.url, e)))?;
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(signature) = &request.signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }

        let response = builder.body(request.body.clone()).send().await.map_err(|e| {
            warn!("Webhook request to {} failed: {}", request.url, e);
            if e.is_builder() {
                DeliveryError::Permanent(e.to_string())
            } else {
                DeliveryError::Transient(e.to_string())
            }
        })?;

        debug!("Webhook {} responded with {}", request.url, response.status());
        Self::classify_status(response.status())
    }
}
