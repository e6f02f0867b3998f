//! HTTP client for webhook delivery.
//!
//! Builds the JSON envelope, applies tenant headers plus the gateway's own
//! identification headers, and classifies responses for the retry policy.

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use reqwest::{header::CONTENT_TYPE, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{DomainEvent, EventKind, TenantId};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Kept response body, enough to log why an endpoint refused a delivery.
const MAX_KEPT_BODY: usize = 1024;

/// Configuration for the webhook client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout of a single attempt.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: "Switchboard-Webhook/1.0".to_string(),
            max_redirects: 3,
        }
    }
}

/// Body POSTed to webhook endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Event kind, e.g. `message.received`.
    pub event: EventKind,
    /// Tenant ID.
    pub instance_id: TenantId,
    /// Tenant display name.
    pub instance: String,
    /// Unix timestamp of the event, in seconds.
    pub timestamp: i64,
    /// Kind specific payload.
    pub data: Value,
}

impl WebhookEnvelope {
    /// Wraps `event` for the tenant named `tenant_name`.
    pub fn new(event: &DomainEvent, tenant_name: impl Into<String>) -> Self {
        Self {
            event: event.kind,
            instance_id: event.tenant_id.clone(),
            instance: tenant_name.into(),
            timestamp: event.timestamp.timestamp(),
            data: event.data(),
        }
    }

    /// Serializes the envelope.
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| DeliveryError::configuration(format!("unserializable event: {e}")))
    }
}

/// One attempt to deliver an envelope.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Unique ID of this attempt.
    pub delivery_id: Uuid,
    /// Event being delivered.
    pub event_id: Uuid,
    /// Kind of the event.
    pub event_kind: EventKind,
    /// Tenant the event belongs to.
    pub tenant_id: TenantId,
    /// Destination URL.
    pub url: String,
    /// Tenant configured headers.
    pub headers: BTreeMap<String, String>,
    /// Serialized [`WebhookEnvelope`].
    pub body: Bytes,
    /// Attempt number, starting at 1.
    pub attempt_number: u32,
}

/// Response of a delivery attempt.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated.
    pub body: String,
    /// Duration of the request.
    pub duration: Duration,
}

impl WebhookResponse {
    /// Whether the endpoint answered 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Turns a non-2xx answer into the matching error.
    pub fn into_result(self) -> Result<Self> {
        match self.status_code {
            200..=299 => Ok(self),
            500..=599 => Err(DeliveryError::server_error(self.status_code, self.body)),
            _ => Err(DeliveryError::client_error(self.status_code, self.body)),
        }
    }
}

/// HTTP client shared by every dispatch worker.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Performs one delivery attempt.
    ///
    /// Any HTTP answer is returned as a response, whatever its status;
    /// [`WebhookResponse::into_result`] classifies it.
    ///
    /// # Errors
    ///
    /// `Timeout` when the endpoint does not answer in time, `Network` for
    /// every other transport failure.
    pub async fn deliver(&self, request: WebhookRequest) -> Result<WebhookResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            tenant_id = %request.tenant_id,
            event_id = %request.event_id,
            event_kind = %request.event_kind,
            delivery_id = %request.delivery_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let mut http_request = self
                .client
                .post(&request.url)
                .body(request.body.clone())
                .header(CONTENT_TYPE, "application/json");

            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            http_request = http_request
                .header("X-Switchboard-Event", request.event_kind.as_str())
                .header("X-Switchboard-Instance", request.tenant_id.as_str())
                .header("X-Switchboard-Event-Id", request.event_id.to_string())
                .header("X-Switchboard-Delivery-Id", request.delivery_id.to_string())
                .header("X-Switchboard-Delivery-Attempt", request.attempt_number.to_string());

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let response = read_response(response, start_time.elapsed()).await;

            match response.status_code {
                200..=299 => {
                    tracing::info!(
                        status = response.status_code,
                        duration_ms = response.duration.as_millis(),
                        "webhook delivered"
                    );
                },
                status => {
                    tracing::warn!(
                        status,
                        duration_ms = response.duration.as_millis(),
                        "webhook endpoint refused delivery"
                    );
                },
            }

            Ok(response)
        }
        .instrument(span)
        .await
    }
}

async fn read_response(response: Response, duration: Duration) -> WebhookResponse {
    let status_code = response.status().as_u16();

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_KEPT_BODY => {
            let suffix = "... (truncated)";
            let kept = String::from_utf8_lossy(&bytes[..MAX_KEPT_BODY - suffix.len()]);
            format!("{kept}{suffix}")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!("failed to read response body: {}", e);
            format!("[failed to read response body: {e}]")
        },
    };

    WebhookResponse { status_code, body, duration }
}

/// Headers the client sets itself; tenant supplied values are ignored.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_ascii_lowercase();
    lowercase.starts_with("x-switchboard-")
        || matches!(
            lowercase.as_str(),
            "content-type"
                | "content-length"
                | "host"
                | "user-agent"
                | "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "te"
                | "trailer"
                | "transfer-encoding"
                | "upgrade"
        )
}
