//! Bounded webhook dispatch pool.
//!
//! `dispatch` never waits on HTTP: it pushes the event into a bounded queue
//! and returns. A fixed set of workers pulls events off the queue and runs
//! one delivery sequence per event (initial attempt plus retries with
//! backoff). When the queue is full the event is dropped and counted, which
//! caps memory under bursts.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchboard_core::{
    Clock, DomainEvent, EventSink, TenantId, TenantStore, WebhookConfig, WebhookConfigProvider,
};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::{ClientConfig, WebhookClient, WebhookEnvelope, WebhookRequest},
    error::{DeliveryError, ErrorCategory, Result},
    retry::{RetryContext, RetryDecision, RetryPolicy},
};

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Concurrent delivery sequences.
    pub worker_count: usize,
    /// Events waiting for a worker before new ones are dropped.
    pub queue_capacity: usize,
    /// Default retry policy; a webhook's `max_retries` overrides the count.
    pub retry: RetryPolicy,
    /// HTTP client settings.
    pub client: ClientConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            retry: RetryPolicy::default(),
            client: ClientConfig::default(),
        }
    }
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Events accepted into the queue.
    pub dispatched: u64,
    /// Sequences that ended with a 2xx answer.
    pub delivered: u64,
    /// Sequences that gave up.
    pub failed: u64,
    /// Events with no matching, enabled webhook.
    pub skipped: u64,
    /// Events rejected because the queue was full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Record of one HTTP attempt within a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Attempt number, starting at 1.
    pub attempt_number: u32,
    /// Unique ID sent in `X-Switchboard-Delivery-Id`.
    pub delivery_id: Uuid,
    /// Backoff waited before this attempt.
    pub backoff: Duration,
    /// HTTP status, if the endpoint answered.
    pub status_code: Option<u16>,
    /// Failure reason, if the attempt failed.
    pub error: Option<String>,
}

/// How a delivery sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint answered 2xx.
    Delivered,
    /// The sequence stopped without success.
    GaveUp {
        /// Terminal error.
        error: DeliveryError,
    },
}

/// Result of one delivery sequence.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// Delivered event.
    pub event_id: Uuid,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Endpoint URL.
    pub url: String,
    /// Every attempt, in order.
    pub attempts: Vec<AttemptRecord>,
    /// Final outcome.
    pub outcome: DeliveryOutcome,
}

impl DeliveryReport {
    /// Whether the event reached the endpoint.
    pub fn is_delivered(&self) -> bool {
        self.outcome == DeliveryOutcome::Delivered
    }

    /// Backoffs waited between attempts.
    pub fn backoffs(&self) -> Vec<Duration> {
        self.attempts.iter().skip(1).map(|attempt| attempt.backoff).collect()
    }
}

/// State shared by the workers.
#[derive(Debug)]
struct DeliveryContext {
    client: WebhookClient,
    webhooks: Arc<dyn WebhookConfigProvider>,
    tenants: Arc<dyn TenantStore>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl DeliveryContext {
    async fn matching_config(&self, event: &DomainEvent) -> Result<Option<WebhookConfig>> {
        let config = self
            .webhooks
            .get_by_tenant(&event.tenant_id)
            .await
            .map_err(|e| DeliveryError::configuration(e.to_string()))?;

        Ok(config.filter(|config| config.accepts(event.kind)))
    }

    async fn tenant_name(&self, tenant_id: &TenantId) -> String {
        match self.tenants.find(tenant_id).await {
            Ok(Some(tenant)) => tenant.name,
            Ok(None) => tenant_id.to_string(),
            Err(error) => {
                debug!(tenant_id = %tenant_id, error = %error, "tenant lookup failed, using id as name");
                tenant_id.to_string()
            },
        }
    }

    /// Runs the whole sequence for `event`. `None` when no webhook wants it.
    async fn run(
        &self,
        event: &DomainEvent,
        cancel: &CancellationToken,
    ) -> Result<Option<DeliveryReport>> {
        let Some(config) = self.matching_config(event).await? else {
            Counters::bump(&self.counters.skipped);
            debug!(
                tenant_id = %event.tenant_id,
                event_kind = %event.kind,
                "no enabled webhook subscribed to event"
            );
            return Ok(None);
        };

        let policy = match config.max_retries {
            Some(max_retries) => self.policy.clone().with_max_retries(max_retries),
            None => self.policy.clone(),
        };

        let tenant_name = self.tenant_name(&event.tenant_id).await;
        let body = WebhookEnvelope::new(event, tenant_name).to_bytes()?;

        let started = self.clock.now();
        let mut attempts = Vec::new();
        let mut backoff = Duration::ZERO;
        let mut attempt_number = 0_u32;

        let outcome = loop {
            attempt_number += 1;
            let delivery_id = Uuid::new_v4();
            let request = WebhookRequest {
                delivery_id,
                event_id: event.id,
                event_kind: event.kind,
                tenant_id: event.tenant_id.clone(),
                url: config.url.clone(),
                headers: config.headers.clone(),
                body: body.clone(),
                attempt_number,
            };

            let mut record = AttemptRecord {
                attempt_number,
                delivery_id,
                backoff,
                status_code: None,
                error: None,
            };

            // An attempt never outlives the sequence deadline, whatever the
            // client timeout.
            let remaining =
                policy.deadline.saturating_sub(self.clock.now().saturating_duration_since(started));
            let result = match tokio::time::timeout(remaining, self.client.deliver(request)).await {
                Ok(result) => result.and_then(|r| r.into_result()),
                Err(_) => {
                    let error = DeliveryError::DeadlineExceeded {
                        attempts: attempt_number,
                        deadline_seconds: policy.deadline.as_secs(),
                    };
                    debug!(
                        tenant_id = %event.tenant_id,
                        event_id = %event.id,
                        attempt = attempt_number,
                        remaining_ms = remaining.as_millis(),
                        "webhook attempt abandoned at the delivery deadline"
                    );
                    record.error = Some(error.to_string());
                    attempts.push(record);
                    break DeliveryOutcome::GaveUp { error };
                },
            };

            let error = match result {
                Ok(response) => {
                    record.status_code = Some(response.status_code);
                    attempts.push(record);
                    break DeliveryOutcome::Delivered;
                },
                Err(error) => {
                    record.status_code = error.status_code();
                    record.error = Some(error.to_string());
                    attempts.push(record);
                    error
                },
            };

            let elapsed = self.clock.now().saturating_duration_since(started);
            match RetryContext::new(attempt_number, &error, elapsed, &policy).decide_retry() {
                RetryDecision::Retry { delay } => {
                    debug!(
                        tenant_id = %event.tenant_id,
                        event_id = %event.id,
                        attempt = attempt_number,
                        error_category = %ErrorCategory::from(&error),
                        delay_ms = delay.as_millis(),
                        "webhook attempt failed, retrying"
                    );
                    backoff = delay;
                    tokio::select! {
                        () = cancel.cancelled() => {
                            break DeliveryOutcome::GaveUp { error: DeliveryError::ShutdownRequested };
                        },
                        () = self.clock.sleep(delay) => {},
                    }
                },
                RetryDecision::GiveUp { error } => break DeliveryOutcome::GaveUp { error },
            }
        };

        match &outcome {
            DeliveryOutcome::Delivered => Counters::bump(&self.counters.delivered),
            DeliveryOutcome::GaveUp { error } => {
                Counters::bump(&self.counters.failed);
                error!(
                    tenant_id = %event.tenant_id,
                    event_id = %event.id,
                    event_kind = %event.kind,
                    url = %config.url,
                    attempts = attempts.len(),
                    error = %error,
                    "webhook delivery failed permanently, event discarded"
                );
            },
        }

        Ok(Some(DeliveryReport {
            event_id: event.id,
            tenant_id: event.tenant_id.clone(),
            url: config.url,
            attempts,
            outcome,
        }))
    }
}

/// Webhook dispatcher with a bounded queue and a fixed worker pool.
#[derive(Debug)]
pub struct WebhookDispatcher {
    jobs: mpsc::Sender<Arc<DomainEvent>>,
    capacity: usize,
    context: Arc<DeliveryContext>,
    cancellation_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WebhookDispatcher {
    /// Creates the dispatcher and spawns its workers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built or the pool is configured with zero workers or capacity.
    pub fn start(
        config: DispatcherConfig,
        webhooks: Arc<dyn WebhookConfigProvider>,
        tenants: Arc<dyn TenantStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.worker_count == 0 || config.queue_capacity == 0 {
            return Err(DeliveryError::configuration(
                "worker_count and queue_capacity must be positive",
            ));
        }

        let context = Arc::new(DeliveryContext {
            client: WebhookClient::new(config.client)?,
            webhooks,
            tenants,
            policy: config.retry,
            clock,
            counters: Counters::default(),
        });

        let (jobs, rx) = mpsc::channel(config.queue_capacity);
        let rx = Arc::new(AsyncMutex::new(rx));
        let cancellation_token = CancellationToken::new();

        info!(worker_count = config.worker_count, "spawning webhook workers");
        let worker_handles = (0..config.worker_count)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&rx),
                    Arc::clone(&context),
                    cancellation_token.clone(),
                ))
            })
            .collect();

        Ok(Self {
            jobs,
            capacity: config.queue_capacity,
            context,
            cancellation_token,
            worker_handles: Mutex::new(worker_handles),
        })
    }

    /// Queues `event` for delivery without waiting for it.
    ///
    /// # Errors
    ///
    /// `QueueFull` when every slot is taken (the event is dropped),
    /// `ShutdownRequested` after shutdown.
    pub fn dispatch(&self, event: Arc<DomainEvent>) -> Result<()> {
        match self.jobs.try_send(event) {
            Ok(()) => {
                Counters::bump(&self.context.counters.dispatched);
                Ok(())
            },
            Err(mpsc::error::TrySendError::Full(event)) => {
                Counters::bump(&self.context.counters.dropped);
                warn!(
                    tenant_id = %event.tenant_id,
                    event_id = %event.id,
                    capacity = self.capacity,
                    "webhook queue full, dropping event"
                );
                Err(DeliveryError::QueueFull { capacity: self.capacity })
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::ShutdownRequested),
        }
    }

    /// Runs a delivery sequence for `event` on the caller's task.
    ///
    /// Returns `None` when no enabled webhook is subscribed to the event.
    pub async fn deliver_now(&self, event: &DomainEvent) -> Result<Option<DeliveryReport>> {
        self.context.run(event, &self.cancellation_token).await
    }

    /// Current counters.
    pub fn stats(&self) -> DispatchStats {
        self.context.counters.snapshot()
    }

    /// Stops the workers, letting in-flight attempts finish.
    ///
    /// Queued events that no worker picked up are discarded. Pending backoff
    /// sleeps end the sequence early.
    ///
    /// # Errors
    ///
    /// `ShutdownTimeout` if workers are still running after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.cancellation_token.cancel();

        let handles = self
            .worker_handles
            .lock()
            .map(|mut handles| std::mem::take(&mut *handles))
            .unwrap_or_default();

        info!(worker_count = handles.len(), "stopping webhook workers");

        let join_all = async {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "webhook worker panicked");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("webhook dispatcher stopped");
                Ok(())
            },
            Err(_elapsed) => {
                error!(timeout_ms = timeout.as_millis(), "webhook worker shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WebhookDispatcher {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled() {
            warn!("WebhookDispatcher dropped without shutdown, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

#[async_trait]
impl EventSink for WebhookDispatcher {
    async fn deliver(&self, event: Arc<DomainEvent>) {
        // Failures are counted and logged by `dispatch`.
        let _ = self.dispatch(event);
    }
}

async fn run_worker(
    worker_id: usize,
    jobs: Arc<AsyncMutex<mpsc::Receiver<Arc<DomainEvent>>>>,
    context: Arc<DeliveryContext>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "webhook worker starting");

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            event = async { jobs.lock().await.recv().await } => event,
        };
        let Some(event) = next else { break };

        if let Err(error) = context.run(&event, &cancel).await {
            warn!(
                worker_id,
                tenant_id = %event.tenant_id,
                event_id = %event.id,
                error = %error,
                "webhook dispatch aborted"
            );
        }
    }

    debug!(worker_id, "webhook worker stopped");
}
