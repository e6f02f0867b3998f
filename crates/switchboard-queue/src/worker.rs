//! Outbound command worker pool.
//!
//! Every worker owns one consumer on the command queue and processes its
//! deliveries one at a time:
//!
//! 1. Undecodable payloads go to the dead-letter queue untouched.
//! 2. A tenant over its send rate is held back, then republished as is; the
//!    retry counter does not move.
//! 3. A redelivered attempt (same command ID and retry counter) whose
//!    outcome was already settled is dropped. Attempts are marked only after
//!    their follow-up publish succeeded, so a nacked attempt runs again.
//! 4. `processing` is published, the handler runs, then `sent` or `failed`.
//! 5. A retryable failure below the retry limit is requeued with the counter
//!    incremented; anything else is dead-lettered.
//!
//! The delivery is acked only after its follow-up message is published. If
//! that publish fails the delivery is nacked back onto the queue.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use switchboard_coord::{Deduplicator, RateLimiter};
use switchboard_core::{Clock, OutboundCommand, StatusUpdate};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{CommandError, QueueError, Result},
    handler::HandlerRegistry,
    transport::{Consumer, Delivery, QueueTransport},
};

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Queue commands are consumed from.
    pub command_queue: String,
    /// Queue status updates are published to.
    pub status_queue: String,
    /// Queue for commands that will not be retried.
    pub dead_letter_queue: String,
    /// Requeues allowed before a failing command is dead-lettered.
    pub max_retries: u32,
    /// Pause before a rate-limited command is put back.
    pub rate_limit_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            command_queue: "commands".to_string(),
            status_queue: "status".to_string(),
            dead_letter_queue: "commands.dlq".to_string(),
            max_retries: 3,
            rate_limit_delay: Duration::from_secs(1),
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Handler invocations.
    pub processed: u64,
    /// Commands the transport accepted.
    pub sent: u64,
    /// Failed handler invocations.
    pub failed: u64,
    /// Commands put back for another attempt.
    pub requeued: u64,
    /// Commands routed to the dead-letter queue.
    pub dead_lettered: u64,
    /// Redeliveries skipped by deduplication.
    pub duplicates: u64,
    /// Commands held back by the rate limiter.
    pub rate_limited: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    duplicates: AtomicU64,
    rate_limited: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

/// What happens to the delivery after processing.
enum Settlement {
    Ack,
    Requeue,
    Discard,
}

#[derive(Debug)]
struct CommandProcessor {
    transport: Arc<dyn QueueTransport>,
    handlers: HandlerRegistry,
    dedup: Option<Deduplicator>,
    limiter: Option<RateLimiter>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    counters: Counters,
}

impl CommandProcessor {
    async fn process(&self, worker_id: usize, delivery: &Delivery) -> Settlement {
        let command: OutboundCommand = match serde_json::from_slice(&delivery.payload) {
            Ok(command) => command,
            Err(decode_error) => {
                warn!(worker_id, error = %decode_error, "undecodable command, dead-lettering payload");
                return match self.publish_raw(&self.config.dead_letter_queue, delivery.payload.clone()).await {
                    Ok(()) => {
                        Counters::bump(&self.counters.dead_lettered);
                        Settlement::Ack
                    },
                    Err(error) => {
                        error!(worker_id, error = %error, "failed to dead-letter undecodable command");
                        Settlement::Discard
                    },
                };
            },
        };

        if !self.within_rate(&command).await {
            Counters::bump(&self.counters.rate_limited);
            debug!(
                worker_id,
                tenant_id = %command.instance_id,
                command_id = %command.id,
                delay_ms = self.config.rate_limit_delay.as_millis(),
                "tenant over send rate, holding command back"
            );
            self.clock.sleep(self.config.rate_limit_delay).await;
            return self.settle_after(
                worker_id,
                &command,
                self.publish_raw(&self.config.command_queue, delivery.payload.clone()).await,
            );
        }

        if self.already_seen(&command).await {
            Counters::bump(&self.counters.duplicates);
            debug!(
                worker_id,
                command_id = %command.id,
                retries = command.retries,
                "duplicate delivery skipped"
            );
            return Settlement::Ack;
        }

        let settlement = self.execute(worker_id, &command).await;
        if matches!(settlement, Settlement::Ack) {
            self.mark_seen(&command).await;
        }
        settlement
    }

    /// Runs the handler and routes the outcome. Only an `Ack` means the
    /// attempt's outcome (sent, requeued or dead-lettered) is durable.
    async fn execute(&self, worker_id: usize, command: &OutboundCommand) -> Settlement {
        self.publish_status(&StatusUpdate::processing(command, self.clock.now_utc())).await;

        Counters::bump(&self.counters.processed);
        let outcome = match self.handlers.get(command.command_type) {
            Some(handler) => handler.handle(command).await,
            None => Err(CommandError::invalid(format!(
                "no handler registered for {}",
                command.command_type
            ))),
        };

        match outcome {
            Ok(external_id) => {
                Counters::bump(&self.counters.sent);
                info!(
                    worker_id,
                    tenant_id = %command.instance_id,
                    command_id = %command.id,
                    command_type = %command.command_type,
                    "command sent"
                );
                self.publish_status(&StatusUpdate::sent(command, external_id, self.clock.now_utc()))
                    .await;
                Settlement::Ack
            },
            Err(failure) => {
                Counters::bump(&self.counters.failed);
                self.publish_status(&StatusUpdate::failed(
                    &command,
                    failure.to_string(),
                    self.clock.now_utc(),
                ))
                .await;
                self.retry_or_dead_letter(worker_id, command, &failure).await
            },
        }
    }

    async fn retry_or_dead_letter(
        &self,
        worker_id: usize,
        command: &OutboundCommand,
        failure: &CommandError,
    ) -> Settlement {
        if failure.is_retryable() && command.retries < self.config.max_retries {
            let next = command.next_attempt();
            let published = self.publish_command(&self.config.command_queue, &next).await;
            if published.is_ok() {
                Counters::bump(&self.counters.requeued);
                warn!(
                    worker_id,
                    tenant_id = %command.instance_id,
                    command_id = %command.id,
                    retries = next.retries,
                    max_retries = self.config.max_retries,
                    error = %failure,
                    "command failed, requeued"
                );
            }
            return self.settle_after(worker_id, command, published);
        }

        let published = self.publish_command(&self.config.dead_letter_queue, command).await;
        if published.is_ok() {
            Counters::bump(&self.counters.dead_lettered);
            error!(
                worker_id,
                tenant_id = %command.instance_id,
                command_id = %command.id,
                retries = command.retries,
                error = %failure,
                "command failed permanently, dead-lettered"
            );
        }
        self.settle_after(worker_id, command, published)
    }

    fn settle_after(&self, worker_id: usize, command: &OutboundCommand, published: Result<()>) -> Settlement {
        match published {
            Ok(()) => Settlement::Ack,
            Err(error) => {
                error!(
                    worker_id,
                    command_id = %command.id,
                    error = %error,
                    "follow-up publish failed, returning command to the queue"
                );
                Settlement::Requeue
            },
        }
    }

    async fn within_rate(&self, command: &OutboundCommand) -> bool {
        let Some(limiter) = &self.limiter else { return true };
        match limiter.allow(command.instance_id.as_str()).await {
            Ok(decision) => decision.allowed,
            Err(error) => {
                warn!(tenant_id = %command.instance_id, error = %error, "rate limiter unavailable, allowing command");
                true
            },
        }
    }

    async fn already_seen(&self, command: &OutboundCommand) -> bool {
        let Some(dedup) = &self.dedup else { return false };
        match dedup.is_marked(&command.dedup_key()).await {
            Ok(seen) => seen,
            Err(error) => {
                warn!(command_id = %command.id, error = %error, "deduplicator unavailable, processing command");
                false
            },
        }
    }

    /// Marks the attempt as done once its outcome is durable.
    async fn mark_seen(&self, command: &OutboundCommand) {
        let Some(dedup) = &self.dedup else { return };
        match dedup.check_and_mark(&command.dedup_key()).await {
            Ok(false) => {},
            Ok(true) => debug!(
                command_id = %command.id,
                retries = command.retries,
                "attempt was settled concurrently by another worker"
            ),
            Err(error) => {
                warn!(command_id = %command.id, error = %error, "failed to mark command attempt");
            },
        }
    }

    async fn publish_raw(&self, queue: &str, payload: Bytes) -> Result<()> {
        self.transport.publish(queue, payload).await
    }

    async fn publish_command(&self, queue: &str, command: &OutboundCommand) -> Result<()> {
        let payload = serde_json::to_vec(command)?;
        self.publish_raw(queue, Bytes::from(payload)).await
    }

    /// Status updates are informational; a lost one never blocks the command.
    async fn publish_status(&self, update: &StatusUpdate) {
        let published = match serde_json::to_vec(update) {
            Ok(payload) => self.publish_raw(&self.config.status_queue, Bytes::from(payload)).await,
            Err(e) => Err(QueueError::from(e)),
        };
        if let Err(error) = published {
            warn!(
                command_id = %update.message_id,
                status = ?update.status,
                error = %error,
                "failed to publish status update"
            );
        }
    }
}

/// Fixed-size pool of command workers.
#[derive(Debug)]
pub struct WorkerPool {
    processor: Arc<CommandProcessor>,
    cancellation_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool. Nothing runs until [`WorkerPool::start`].
    pub fn new(
        config: WorkerConfig,
        transport: Arc<dyn QueueTransport>,
        handlers: HandlerRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            processor: Arc::new(CommandProcessor {
                transport,
                handlers,
                dedup: None,
                limiter: None,
                clock,
                config,
                counters: Counters::default(),
            }),
            cancellation_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    fn processor_mut(&mut self) -> Option<&mut CommandProcessor> {
        Arc::get_mut(&mut self.processor)
    }

    /// Skips redelivered attempts.
    #[must_use]
    pub fn with_deduplicator(mut self, dedup: Deduplicator) -> Self {
        if let Some(processor) = self.processor_mut() {
            processor.dedup = Some(dedup);
        }
        self
    }

    /// Caps each tenant's send rate.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        if let Some(processor) = self.processor_mut() {
            processor.limiter = Some(limiter);
        }
        self
    }

    /// Opens one consumer per worker and starts processing.
    ///
    /// # Errors
    ///
    /// `Configuration` for a zero worker count, or the transport error if a
    /// consumer cannot be opened.
    pub async fn start(&self) -> Result<()> {
        let config = &self.processor.config;
        if config.worker_count == 0 {
            return Err(QueueError::configuration("worker_count must be at least 1"));
        }

        let mut consumers = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count {
            consumers.push(self.processor.transport.consume(&config.command_queue).await?);
        }

        info!(
            worker_count = config.worker_count,
            queue = %config.command_queue,
            "spawning command workers"
        );

        let handles = consumers.into_iter().enumerate().map(|(worker_id, consumer)| {
            tokio::spawn(run_worker(
                worker_id,
                consumer,
                Arc::clone(&self.processor),
                self.cancellation_token.clone(),
            ))
        });

        self.worker_handles
            .lock()
            .map_err(|_| QueueError::transport("worker handle lock poisoned"))?
            .extend(handles);
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> WorkerStats {
        self.processor.counters.snapshot()
    }

    /// Signals shutdown and waits for in-flight commands to finish.
    ///
    /// # Errors
    ///
    /// `ShutdownTimeout` if workers are still busy after `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.cancellation_token.cancel();

        let handles = self
            .worker_handles
            .lock()
            .map(|mut handles| std::mem::take(&mut *handles))
            .unwrap_or_default();

        info!(worker_count = handles.len(), "stopping command workers");

        let join_all = async {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "command worker panicked");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("command worker pool stopped");
                Ok(())
            },
            Err(_elapsed) => {
                error!(timeout_ms = timeout.as_millis(), "command worker shutdown timed out");
                Err(QueueError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled() {
            warn!("WorkerPool dropped without stop, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    mut consumer: Box<dyn Consumer>,
    processor: Arc<CommandProcessor>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "command worker starting");

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            delivery = consumer.next() => delivery,
        };
        let Some(delivery) = next else { break };

        let settled = match processor.process(worker_id, &delivery).await {
            Settlement::Ack => delivery.ack().await,
            Settlement::Requeue => delivery.nack(true).await,
            Settlement::Discard => delivery.nack(false).await,
        };
        if let Err(error) = settled {
            warn!(worker_id, delivery_tag = delivery.delivery_tag, error = %error, "failed to settle delivery");
        }
    }

    debug!(worker_id, "command worker stopped");
}

#[cfg(test)]
mod tests {
    use switchboard_core::RealClock;

    use super::*;
    use crate::transport::MemoryBroker;

    fn pool(config: WorkerConfig) -> WorkerPool {
        WorkerPool::new(config, Arc::new(MemoryBroker::new()), HandlerRegistry::new(), Arc::new(RealClock::new()))
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let pool = pool(WorkerConfig { worker_count: 0, ..WorkerConfig::default() });

        assert!(matches!(pool.start().await, Err(QueueError::Configuration { .. })));
        pool.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn idle_pool_stops_promptly() {
        let pool = pool(WorkerConfig { worker_count: 3, ..WorkerConfig::default() });
        pool.start().await.unwrap();

        pool.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(pool.stats(), WorkerStats::default());
    }

    #[test]
    fn defaults_name_the_queues() {
        let config = WorkerConfig::default();

        assert_eq!(config.command_queue, "commands");
        assert_eq!(config.status_queue, "status");
        assert_eq!(config.dead_letter_queue, "commands.dlq");
        assert_eq!(config.max_retries, 3);
    }
}
