//! Session registry: owns every tenant session and its transport.
//!
//! The registry map is guarded by one read/write lock that is only held to
//! look up, insert or remove entries. Each session's mutable fields live
//! behind the session's own lock, so one tenant's state change never
//! serializes behind another's.
//!
//! Every session runs one event pump task that reads its transport's event
//! stream in order, applies the derived state transition under the session
//! lock, and only then forwards the domain event to the sink. Dispatch
//! channels therefore never see an event for a state the registry does not
//! reflect yet.

use std::{collections::HashMap, sync::Arc, time::Duration};

use switchboard_coord::DistributedLock;
use switchboard_core::{
    Clock, ConnectionState, CoreError, DomainEvent, EventPayload, EventSink, Result,
    SessionSnapshot, Tenant, TenantId, TenantStore,
};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    normalizer::EventNormalizer,
    state::{Applied, SessionState, Transition},
    transport::{SendRequest, SessionTransport, TransportEvent, TransportFactory},
};

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// TTL of the per-tenant restore lock.
    pub restore_lock_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { restore_lock_ttl: Duration::from_secs(60) }
    }
}

/// Counts from one [`SessionRegistry::restore_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Sessions created.
    pub restored: usize,
    /// Restored sessions asked to reconnect.
    pub reconnected: usize,
    /// Tenants skipped because a session already existed or another process
    /// holds the restore lock.
    pub skipped: usize,
    /// Tenants whose restore failed.
    pub failed: usize,
}

/// Collaborators shared by the registry and its background tasks.
#[derive(Debug, Clone)]
struct Pipeline {
    sink: Arc<dyn EventSink>,
    store: Arc<dyn TenantStore>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    async fn emit(&self, tenant_id: &TenantId, payload: EventPayload) {
        let event = DomainEvent::new(tenant_id.clone(), payload, self.clock.now_utc());
        self.sink.deliver(Arc::new(event)).await;
    }

    async fn emit_state(&self, tenant_id: &TenantId, state: ConnectionState, reason: Option<String>) {
        let payload =
            EventPayload::ConnectionChanged { state, phone: None, display_name: None, reason };
        self.emit(tenant_id, payload).await;
    }

    async fn persist(&self, tenant_id: &TenantId, state: ConnectionState, phone: Option<String>) {
        if let Err(error) = self.store.update_status(tenant_id, state, phone).await {
            match error {
                CoreError::NotFound { .. } => {
                    debug!(tenant_id = %tenant_id, "tenant not persisted, status not recorded");
                },
                error => {
                    warn!(tenant_id = %tenant_id, error = %error, "failed to record session status");
                },
            }
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    tenant_id: TenantId,
    name: String,
    transport: Arc<dyn SessionTransport>,
    state: RwLock<SessionState>,
    cancel: CancellationToken,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionEntry {
    async fn snapshot(&self) -> SessionSnapshot {
        self.state.read().await.snapshot(&self.tenant_id, &self.name)
    }

    async fn apply(&self, transition: Transition, pipeline: &Pipeline) -> Result<Applied> {
        let mut state = self.state.write().await;
        let phone = match &transition {
            Transition::Authenticated(profile) => Some(profile.phone.clone()),
            _ => None,
        };
        let applied = state.apply(transition, pipeline.clock.now_utc())?;

        // Persisted under the state lock so the store sees transitions in
        // the order they were applied.
        if applied.changed() || phone.is_some() {
            pipeline.persist(&self.tenant_id, applied.to, phone).await;
        }
        drop(state);
        Ok(applied)
    }

    fn stop_pump(&self) {
        self.cancel.cancel();
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

/// Owner of all tenant sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<TenantId, Arc<SessionEntry>>>,
    factory: Arc<dyn TransportFactory>,
    pipeline: Pipeline,
    lock: Option<DistributedLock>,
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn TenantStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            pipeline: Pipeline { sink, store, clock },
            lock: None,
            config: RegistryConfig::default(),
        }
    }

    /// Takes a per-tenant distributed lock around restores.
    #[must_use]
    pub fn with_restore_lock(mut self, lock: DistributedLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Overrides registry settings.
    #[must_use]
    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    async fn entry(&self, tenant_id: &TenantId) -> Result<Arc<SessionEntry>> {
        self.sessions
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(tenant_id))
    }

    /// Creates a disconnected session and its transport for `tenant`.
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id))]
    pub async fn create_session(&self, tenant: &Tenant) -> Result<SessionSnapshot> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&tenant.id) {
            return Err(CoreError::AlreadyExists { tenant_id: tenant.id.clone() });
        }

        let handle = self.factory.create(tenant)?;
        let entry = Arc::new(SessionEntry {
            tenant_id: tenant.id.clone(),
            name: tenant.name.clone(),
            transport: handle.transport,
            state: RwLock::new(SessionState::new(self.pipeline.clock.now_utc())),
            cancel: CancellationToken::new(),
            pump: std::sync::Mutex::new(None),
        });

        let pump = tokio::spawn(run_event_pump(
            Arc::clone(&entry),
            handle.events,
            self.pipeline.clone(),
        ));
        if let Ok(mut slot) = entry.pump.lock() {
            *slot = Some(pump);
        }

        sessions.insert(tenant.id.clone(), Arc::clone(&entry));
        drop(sessions);

        info!("session created");
        Ok(entry.snapshot().await)
    }

    /// Returns a snapshot of the tenant's session, if one exists.
    pub async fn get(&self, tenant_id: &TenantId) -> Option<SessionSnapshot> {
        let entry = self.sessions.read().await.get(tenant_id).cloned()?;
        Some(entry.snapshot().await)
    }

    /// Snapshots of every session, ordered by tenant ID.
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let entries: Vec<Arc<SessionEntry>> = self.sessions.read().await.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        snapshots
    }

    /// Number of sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry holds no sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Starts connecting the tenant's session.
    ///
    /// Returns as soon as the session is marked `connecting`; the transport
    /// call runs in the background and completion is observed through state
    /// queries or events. Already connected or connecting sessions are left
    /// alone, so concurrent callers start at most one connection attempt.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn connect(&self, tenant_id: &TenantId) -> Result<()> {
        let entry = self.entry(tenant_id).await?;

        {
            let mut state = entry.state.write().await;
            if state.state().is_active() {
                debug!(state = %state.state(), "connect ignored, session already active");
                return Ok(());
            }
            state.apply(Transition::Connect, self.pipeline.clock.now_utc())?;
            self.pipeline.persist(tenant_id, ConnectionState::Connecting, None).await;
        }

        self.pipeline.emit_state(tenant_id, ConnectionState::Connecting, None).await;

        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            if let Err(error) = entry.transport.connect().await {
                error!(tenant_id = %entry.tenant_id, error = %error, "transport connect failed");
                if entry.apply(Transition::Failed, &pipeline).await.is_ok() {
                    pipeline
                        .emit_state(&entry.tenant_id, ConnectionState::Error, Some(error.to_string()))
                        .await;
                }
            }
        });

        Ok(())
    }

    /// Closes the tenant's connection, keeping its credentials.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn disconnect(&self, tenant_id: &TenantId) -> Result<()> {
        let entry = self.entry(tenant_id).await?;
        entry.transport.disconnect().await?;

        let applied =
            entry.apply(Transition::Disconnected { will_reconnect: false }, &self.pipeline).await?;
        if applied.changed() {
            self.pipeline.emit_state(tenant_id, ConnectionState::Disconnected, None).await;
        }
        info!("session disconnected");
        Ok(())
    }

    /// Unpairs the tenant's device.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn logout(&self, tenant_id: &TenantId) -> Result<()> {
        let entry = self.entry(tenant_id).await?;
        entry.transport.logout().await?;

        let applied = entry.apply(Transition::LoggedOut, &self.pipeline).await?;
        if applied.changed() {
            self.pipeline
                .emit_state(tenant_id, ConnectionState::Disconnected, Some("logged_out".into()))
                .await;
        }
        info!("session logged out");
        Ok(())
    }

    /// Removes the tenant's session, tearing its transport down first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn delete(&self, tenant_id: &TenantId) -> Result<()> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(tenant_id)
            .ok_or_else(|| CoreError::not_found(tenant_id))?;

        if let Err(error) = entry.transport.disconnect().await {
            warn!(error = %error, "transport teardown failed during delete");
        }
        entry.stop_pump();
        info!("session deleted");
        Ok(())
    }

    /// Sends a message through a connected session.
    pub async fn send(&self, tenant_id: &TenantId, request: SendRequest) -> Result<String> {
        let entry = self.entry(tenant_id).await?;
        let state = entry.state.read().await.state();
        if state != ConnectionState::Connected {
            return Err(CoreError::not_connected(tenant_id, state));
        }
        entry.transport.send(request).await
    }

    /// Re-creates sessions for every persisted tenant and reconnects those
    /// last recorded as connected.
    ///
    /// Individual failures are logged and counted, never fatal; only a
    /// failure to list tenants is returned.
    #[instrument(skip_all)]
    pub async fn restore_all(&self, source: &dyn TenantStore) -> Result<RestoreReport> {
        let tenants = source.get_all().await?;
        let mut report = RestoreReport::default();

        for tenant in tenants {
            let lock_name = format!("restore:{}", tenant.id);
            if let Some(lock) = &self.lock {
                match lock.try_lock(&lock_name, self.config.restore_lock_ttl).await {
                    Ok(true) => {},
                    Ok(false) => {
                        debug!(tenant_id = %tenant.id, "restore lock held elsewhere, skipping");
                        report.skipped += 1;
                        continue;
                    },
                    Err(error) => {
                        warn!(tenant_id = %tenant.id, error = %error, "restore lock unavailable");
                        report.failed += 1;
                        continue;
                    },
                }
            }

            self.restore_one(&tenant, &mut report).await;

            if let Some(lock) = &self.lock {
                if let Err(error) = lock.unlock(&lock_name).await {
                    warn!(tenant_id = %tenant.id, error = %error, "failed to release restore lock");
                }
            }
        }

        info!(
            restored = report.restored,
            reconnected = report.reconnected,
            skipped = report.skipped,
            failed = report.failed,
            "session restore complete"
        );
        Ok(report)
    }

    async fn restore_one(&self, tenant: &Tenant, report: &mut RestoreReport) {
        match self.create_session(tenant).await {
            Ok(_) => report.restored += 1,
            Err(CoreError::AlreadyExists { .. }) => {
                report.skipped += 1;
                return;
            },
            Err(error) => {
                warn!(tenant_id = %tenant.id, error = %error, "failed to restore session");
                report.failed += 1;
                return;
            },
        }

        if tenant.status != ConnectionState::Connected {
            return;
        }
        match self.connect(&tenant.id).await {
            Ok(()) => report.reconnected += 1,
            Err(error) => {
                warn!(tenant_id = %tenant.id, error = %error, "failed to reconnect restored session");
                report.failed += 1;
            },
        }
    }

    /// Disconnects every transport and stops all event pumps.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.write().await.drain().map(|(_, entry)| entry).collect();

        for entry in entries {
            if entry.transport.is_connected().await {
                if let Err(error) = entry.transport.disconnect().await {
                    warn!(tenant_id = %entry.tenant_id, error = %error, "disconnect on shutdown failed");
                }
            }
            entry.stop_pump();
        }
    }
}

async fn run_event_pump(
    entry: Arc<SessionEntry>,
    mut events: mpsc::Receiver<TransportEvent>,
    pipeline: Pipeline,
) {
    let normalizer = EventNormalizer::new(entry.tenant_id.clone());
    debug!(tenant_id = %entry.tenant_id, "event pump started");

    loop {
        let event = tokio::select! {
            () = entry.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let normalized = normalizer.normalize(event, pipeline.clock.now_utc());

        if let Some(transition) = normalized.transition {
            let name = transition.name();
            match entry.apply(transition, &pipeline).await {
                Ok(applied) => {
                    // A repeated disconnect notification carries no news.
                    let is_connection_event = normalized
                        .event
                        .as_ref()
                        .is_some_and(|event| matches!(event.payload, EventPayload::ConnectionChanged { .. }));
                    if is_connection_event && !applied.changed() && applied.to != ConnectionState::Connected {
                        continue;
                    }
                },
                Err(error) => {
                    warn!(
                        tenant_id = %entry.tenant_id,
                        transition = name,
                        error = %error,
                        "transport event rejected by state machine"
                    );
                    continue;
                },
            }
        }

        if let Some(event) = normalized.event {
            debug!(tenant_id = %entry.tenant_id, event_kind = %event.kind, "forwarding event");
            pipeline.sink.deliver(Arc::new(event)).await;
        }
    }

    debug!(tenant_id = %entry.tenant_id, "event pump stopped");
}
