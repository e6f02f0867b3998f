//! HTTP transport for a protocol sidecar.
//!
//! The sidecar owns the wire protocol and device credentials. This transport
//! drives it over HTTP and long-polls its event feed, which returns batches
//! of raw `{type, data}` events per tenant.
//!
//! Sidecar endpoints, relative to the base URL:
//!
//! | method | path                          | purpose                    |
//! |--------|-------------------------------|----------------------------|
//! | POST   | `/sessions/{id}/connect`      | start connecting           |
//! | POST   | `/sessions/{id}/disconnect`   | close, keep credentials    |
//! | POST   | `/sessions/{id}/logout`       | unpair                     |
//! | GET    | `/sessions/{id}/status`       | `{connected}`              |
//! | POST   | `/sessions/{id}/messages`     | send, returns `{message_id}` |
//! | GET    | `/sessions/{id}/events`       | long-poll event batch      |

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use switchboard_core::{CoreError, Result, Tenant, TenantId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{SendRequest, SessionTransport, TransportEvent, TransportFactory, TransportHandle};

/// Sidecar connection settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base URL, e.g. `http://127.0.0.1:3001`.
    pub base_url: String,
    /// How long the sidecar may hold an event poll open.
    pub poll_timeout: Duration,
    /// Timeout for control requests.
    pub request_timeout: Duration,
    /// Pause after a failed or empty poll.
    pub retry_delay: Duration,
    /// Per-session event buffer.
    pub event_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3001".to_string(),
            poll_timeout: Duration::from_secs(25),
            request_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    connected: bool,
}

#[derive(Debug, Deserialize)]
struct SentBody {
    message_id: String,
}

fn http_error(err: reqwest::Error) -> CoreError {
    CoreError::transport(format!("sidecar request failed: {err}"))
}

/// Creates [`BridgeTransport`]s sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct BridgeTransportFactory {
    client: reqwest::Client,
    config: Arc<BridgeConfig>,
}

impl BridgeTransportFactory {
    /// Creates a factory for the sidecar described by `config`.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        // Polls carry their own timeout; the client-wide one must outlast them.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.request_timeout.max(config.poll_timeout + Duration::from_secs(5)))
            .build()
            .map_err(http_error)?;
        Ok(Self { client, config: Arc::new(config) })
    }
}

impl TransportFactory for BridgeTransportFactory {
    fn create(&self, tenant: &Tenant) -> Result<TransportHandle> {
        let (tx, events) = mpsc::channel(self.config.event_buffer.max(1));
        let transport = BridgeTransport {
            tenant_id: tenant.id.clone(),
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            events: tx,
            poller: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        };
        Ok(TransportHandle { transport: Arc::new(transport), events })
    }
}

/// One tenant's session on the sidecar.
#[derive(Debug)]
pub struct BridgeTransport {
    tenant_id: TenantId,
    client: reqwest::Client,
    config: Arc<BridgeConfig>,
    events: mpsc::Sender<TransportEvent>,
    poller: Mutex<Option<CancellationToken>>,
    connected: Arc<AtomicBool>,
}

impl BridgeTransport {
    fn url(&self, action: &str) -> String {
        format!(
            "{}/sessions/{}/{action}",
            self.config.base_url.trim_end_matches('/'),
            self.tenant_id
        )
    }

    async fn post_control(&self, action: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url(action))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(http_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CoreError::transport(format!("sidecar {action} returned {status}: {body}")));
        }
        Ok(())
    }

    fn start_poller(&self) {
        let Ok(mut slot) = self.poller.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let poller = EventPoller {
            tenant_id: self.tenant_id.clone(),
            client: self.client.clone(),
            url: self.url("events"),
            config: Arc::clone(&self.config),
            events: self.events.clone(),
            connected: Arc::clone(&self.connected),
        };
        tokio::spawn(poller.run(token));
    }

    fn stop_poller(&self) {
        if let Ok(mut slot) = self.poller.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }
}

#[async_trait]
impl SessionTransport for BridgeTransport {
    async fn connect(&self) -> Result<()> {
        self.start_poller();
        self.post_control("connect").await
    }

    async fn disconnect(&self) -> Result<()> {
        let result = self.post_control("disconnect").await;
        self.stop_poller();
        self.connected.store(false, Ordering::Release);
        result
    }

    async fn logout(&self) -> Result<()> {
        let result = self.post_control("logout").await;
        self.stop_poller();
        self.connected.store(false, Ordering::Release);
        result
    }

    async fn is_connected(&self) -> bool {
        let status = async {
            let resp = self
                .client
                .get(self.url("status"))
                .timeout(self.config.request_timeout)
                .send()
                .await?
                .error_for_status()?;
            resp.json::<StatusBody>().await
        };

        match status.await {
            Ok(body) => body.connected,
            Err(error) => {
                debug!(tenant_id = %self.tenant_id, error = %error, "status check failed, using last known state");
                self.connected.load(Ordering::Acquire)
            },
        }
    }

    async fn send(&self, request: SendRequest) -> Result<String> {
        let resp = self
            .client
            .post(self.url("messages"))
            .timeout(self.config.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(http_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(tenant_id = %self.tenant_id, %status, "sidecar send failed: {body}");
            return Err(CoreError::transport(format!("sidecar send returned {status}: {body}")));
        }

        let body: SentBody = resp.json().await.map_err(http_error)?;
        debug!(tenant_id = %self.tenant_id, message_id = %body.message_id, "message sent via sidecar");
        Ok(body.message_id)
    }
}

impl Drop for BridgeTransport {
    fn drop(&mut self) {
        self.stop_poller();
    }
}

struct EventPoller {
    tenant_id: TenantId,
    client: reqwest::Client,
    url: String,
    config: Arc<BridgeConfig>,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

impl EventPoller {
    async fn run(self, token: CancellationToken) {
        info!(tenant_id = %self.tenant_id, "sidecar event poller started");

        loop {
            let batch = tokio::select! {
                () = token.cancelled() => break,
                batch = self.poll() => batch,
            };

            let pause = match batch {
                Ok(raw_events) => {
                    // A sidecar that answers empty batches at once instead of
                    // holding the poll open is paced like a failing one.
                    let idle = raw_events.is_empty();
                    for raw in raw_events {
                        let event = TransportEvent::from_raw(&raw.kind, raw.data);
                        self.track(&event);
                        if self.events.send(event).await.is_err() {
                            debug!(tenant_id = %self.tenant_id, "event receiver gone, stopping poller");
                            return;
                        }
                    }
                    idle
                },
                Err(error) => {
                    warn!(tenant_id = %self.tenant_id, error = %error, "sidecar event poll failed");
                    true
                },
            };

            if pause {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(self.config.retry_delay) => {},
                }
            }
        }

        info!(tenant_id = %self.tenant_id, "sidecar event poller stopped");
    }

    async fn poll(&self) -> std::result::Result<Vec<RawEvent>, reqwest::Error> {
        self.client
            .get(&self.url)
            .query(&[("timeout", self.config.poll_timeout.as_secs())])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<RawEvent>>()
            .await
    }

    fn track(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected { .. } => self.connected.store(true, Ordering::Release),
            TransportEvent::Disconnected { .. }
            | TransportEvent::LoggedOut { .. }
            | TransportEvent::ConnectFailure { .. } => self.connected.store(false, Ordering::Release),
            _ => {},
        }
    }
}
