//! Scriptable session transport.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Context;
use switchboard_core::{CoreError, Result, Tenant, TenantId};
use switchboard_sessions::{
    SendRequest, SessionTransport, TransportEvent, TransportFactory, TransportHandle,
};
use tokio::sync::mpsc;

/// Transport double that counts calls and lets tests inject events.
#[derive(Debug)]
pub struct MockTransport {
    events: mpsc::Sender<TransportEvent>,
    connect_delay: Duration,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    fail_connect: AtomicBool,
    connected: AtomicBool,
    send_failures: Mutex<VecDeque<String>>,
    sent: Mutex<Vec<SendRequest>>,
}

impl MockTransport {
    fn new(events: mpsc::Sender<TransportEvent>, connect_delay: Duration) -> Self {
        Self {
            events,
            connect_delay,
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            send_failures: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Emits an event as if the protocol library produced it.
    pub async fn emit(&self, event: TransportEvent) -> anyhow::Result<()> {
        if let TransportEvent::Connected { .. } = event {
            self.connected.store(true, Ordering::SeqCst);
        }
        self.events.send(event).await.context("event pump is gone")
    }

    /// Number of `connect` calls.
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls.
    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Number of `logout` calls.
    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    /// Makes every following `connect` fail.
    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    /// Makes the next `send` calls fail with the given reasons, in order.
    pub fn fail_sends<I, S>(&self, reasons: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut failures) = self.send_failures.lock() {
            failures.extend(reasons.into_iter().map(Into::into));
        }
    }

    /// Requests accepted by `send`.
    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl SessionTransport for MockTransport {
    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(CoreError::transport("mock connect failure"));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, request: SendRequest) -> Result<String> {
        let failure = self.send_failures.lock().ok().and_then(|mut failures| failures.pop_front());
        if let Some(reason) = failure {
            return Err(CoreError::transport(reason));
        }

        let mut sent = self.sent.lock().map_err(|_| CoreError::transport("mock poisoned"))?;
        sent.push(request);
        Ok(format!("MOCK{}", sent.len()))
    }
}

/// Factory handing out [`MockTransport`]s and keeping them for inspection.
#[derive(Debug, Default)]
pub struct MockTransportFactory {
    transports: Mutex<HashMap<TenantId, Arc<MockTransport>>>,
    failing: Mutex<HashSet<TenantId>>,
    connect_delay: Duration,
}

impl MockTransportFactory {
    /// Creates a factory whose transports connect instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory whose transports take `delay` to connect.
    pub fn with_connect_delay(delay: Duration) -> Self {
        Self { connect_delay: delay, ..Self::default() }
    }

    /// Makes `create` fail for `tenant_id`.
    pub fn fail_create_for(&self, tenant_id: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(TenantId::from(tenant_id));
        }
    }

    /// The transport created for `tenant_id`, if any.
    pub fn transport(&self, tenant_id: &str) -> Option<Arc<MockTransport>> {
        self.transports.lock().ok()?.get(&TenantId::from(tenant_id)).cloned()
    }

    /// Emits an event on `tenant_id`'s transport.
    pub async fn emit(&self, tenant_id: &str, event: TransportEvent) -> anyhow::Result<()> {
        let transport = self
            .transport(tenant_id)
            .with_context(|| format!("no transport for {tenant_id}"))?;
        transport.emit(event).await
    }

    /// Total `connect` calls across all transports.
    pub fn total_connect_calls(&self) -> usize {
        self.transports
            .lock()
            .map(|transports| transports.values().map(|t| t.connect_calls()).sum())
            .unwrap_or(0)
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, tenant: &Tenant) -> Result<TransportHandle> {
        let failing = self.failing.lock().map(|f| f.contains(&tenant.id)).unwrap_or(false);
        if failing {
            return Err(CoreError::transport(format!("cannot create transport for {}", tenant.id)));
        }

        let (tx, events) = mpsc::channel(64);
        let transport = Arc::new(MockTransport::new(tx, self.connect_delay));
        if let Ok(mut transports) = self.transports.lock() {
            transports.insert(tenant.id.clone(), Arc::clone(&transport));
        }
        Ok(TransportHandle { transport, events })
    }
}
