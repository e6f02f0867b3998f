//! Event sink that records deliveries.

use std::sync::{Arc, Mutex};

use switchboard_core::{DomainEvent, EventKind, EventSink, TenantId};

/// Records every delivered event in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Arc<DomainEvent>>>>,
}

impl RecordingSink {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events.
    pub fn events(&self) -> Vec<Arc<DomainEvent>> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Kinds of all recorded events, in delivery order.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|event| event.kind).collect()
    }

    /// Recorded events for one tenant.
    pub fn for_tenant(&self, tenant_id: &TenantId) -> Vec<Arc<DomainEvent>> {
        self.events().into_iter().filter(|event| &event.tenant_id == tenant_id).collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, event: Arc<DomainEvent>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
