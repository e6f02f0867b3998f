//! Session registry behavior against a scripted transport.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use switchboard_coord::{DistributedLock, MemoryCache, SharedCache};
use switchboard_core::{
    AccountProfile, ConnectionState, CoreError, EventKind, MemoryStore, RealClock, TenantId,
    TenantStore,
};
use switchboard_sessions::{MessageContent, SendRequest, SessionRegistry, TransportEvent};
use switchboard_testing::{
    eventually, inbound_message, tenant, MockTransportFactory, RecordingSink, TenantBuilder,
};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    registry: Arc<SessionRegistry>,
    factory: Arc<MockTransportFactory>,
    sink: RecordingSink,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        Self::with_factory(MockTransportFactory::new())
    }

    fn with_factory(factory: MockTransportFactory) -> Self {
        let factory = Arc::new(factory);
        let sink = RecordingSink::new();
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new(
            factory.clone(),
            Arc::new(sink.clone()),
            store.clone(),
            Arc::new(RealClock::new()),
        );
        Self { registry: Arc::new(registry), factory, sink, store }
    }

    async fn state_is(&self, tenant_id: &str, expected: ConnectionState) -> Result<()> {
        let id = &TenantId::from(tenant_id);
        let registry = &self.registry;
        eventually(WAIT, || async move {
            registry.get(id).await.is_some_and(|s| s.state == expected)
        })
        .await
    }
}

fn connected(phone: &str) -> TransportEvent {
    TransportEvent::Connected {
        profile: AccountProfile { phone: phone.to_string(), ..AccountProfile::default() },
    }
}

#[tokio::test]
async fn qr_pairing_flow_reaches_connected_and_clears_qr() -> Result<()> {
    let h = &Harness::new();
    let acme = TenantId::from("acme");
    h.store.insert_tenant(tenant("acme")).await;

    h.registry.create_session(&tenant("acme")).await?;
    h.registry.connect(&acme).await?;
    h.factory.emit("acme", TransportEvent::Qr { code: "2@pairing".into() }).await?;

    h.state_is("acme", ConnectionState::QrPending).await?;
    let pending = h.registry.get(&acme).await.unwrap();
    assert_eq!(pending.qr.as_deref(), Some("2@pairing"));

    h.factory.emit("acme", connected("5511999999999")).await?;

    h.state_is("acme", ConnectionState::Connected).await?;
    let session = h.registry.get(&acme).await.unwrap();
    assert_eq!(session.qr, None);
    assert_eq!(session.profile.unwrap().phone, "5511999999999");

    eventually(WAIT, || async move { h.sink.len() == 3 }).await?;
    assert_eq!(
        h.sink.kinds(),
        vec![EventKind::ConnectionUpdate, EventKind::QrUpdated, EventKind::ConnectionUpdate]
    );

    let stored = h.store.find(&acme).await?.unwrap();
    assert_eq!(stored.status, ConnectionState::Connected);
    assert_eq!(stored.phone.as_deref(), Some("5511999999999"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_start_one_transport_attempt() -> Result<()> {
    let h = &Harness::with_factory(MockTransportFactory::with_connect_delay(Duration::from_millis(50)));
    h.registry.create_session(&tenant("acme")).await?;
    let acme = TenantId::from("acme");

    let first = {
        let registry = h.registry.clone();
        let acme = acme.clone();
        tokio::spawn(async move { registry.connect(&acme).await })
    };
    let second = {
        let registry = h.registry.clone();
        let acme = acme.clone();
        tokio::spawn(async move { registry.connect(&acme).await })
    };
    first.await??;
    second.await??;

    eventually(WAIT, || async move { h.factory.total_connect_calls() >= 1 }).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.factory.total_connect_calls(), 1);
    assert_eq!(h.registry.get(&acme).await.unwrap().state, ConnectionState::Connecting);
    Ok(())
}

#[tokio::test]
async fn connect_on_connected_session_is_a_no_op() -> Result<()> {
    let h = &Harness::new();
    let acme = TenantId::from("acme");
    h.registry.create_session(&tenant("acme")).await?;
    h.registry.connect(&acme).await?;
    h.factory.emit("acme", connected("5511")).await?;
    h.state_is("acme", ConnectionState::Connected).await?;

    h.registry.connect(&acme).await?;

    assert_eq!(h.factory.total_connect_calls(), 1);
    assert_eq!(h.registry.get(&acme).await.unwrap().state, ConnectionState::Connected);
    Ok(())
}

#[tokio::test]
async fn failed_transport_connect_moves_session_to_error() -> Result<()> {
    let h = &Harness::new();
    let acme = TenantId::from("acme");
    h.registry.create_session(&tenant("acme")).await?;
    h.factory.transport("acme").unwrap().fail_connect();

    h.registry.connect(&acme).await?;

    h.state_is("acme", ConnectionState::Error).await?;
    eventually(WAIT, || async move { h.sink.len() == 2 }).await?;
    let last = h.sink.events().pop().unwrap();
    assert_eq!(last.data()["state"], "error");
    Ok(())
}

#[tokio::test]
async fn events_are_forwarded_in_transport_order() -> Result<()> {
    let h = &Harness::new();
    let acme = TenantId::from("acme");
    h.registry.create_session(&tenant("acme")).await?;
    h.registry.connect(&acme).await?;
    h.factory.emit("acme", connected("5511")).await?;

    for i in 0..10 {
        h.factory.emit("acme", inbound_message(&format!("msg-{i}"))).await?;
    }

    eventually(WAIT, || async move { h.sink.len() == 12 }).await?;
    let texts: Vec<String> = h
        .sink
        .events()
        .iter()
        .filter(|event| event.kind == EventKind::MessageReceived)
        .map(|event| event.data()["text"].as_str().unwrap_or_default().to_string())
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("msg-{i}")).collect();
    assert_eq!(texts, expected);
    Ok(())
}

#[tokio::test]
async fn rejected_transition_drops_the_connection_event() -> Result<()> {
    let h = &Harness::new();
    h.registry.create_session(&tenant("acme")).await?;

    // Not connecting, so a pairing code is out of place.
    h.factory.emit("acme", TransportEvent::Qr { code: "stray".into() }).await?;
    h.factory.emit("acme", inbound_message("after")).await?;

    eventually(WAIT, || async move { h.sink.len() == 1 }).await?;
    assert_eq!(h.sink.kinds(), vec![EventKind::MessageReceived]);
    assert_eq!(
        h.registry.get(&TenantId::from("acme")).await.unwrap().state,
        ConnectionState::Disconnected
    );
    Ok(())
}

#[tokio::test]
async fn send_goes_through_connected_transport() -> Result<()> {
    let h = &Harness::new();
    let acme = TenantId::from("acme");
    h.registry.create_session(&tenant("acme")).await?;
    h.registry.connect(&acme).await?;
    h.factory.emit("acme", connected("5511")).await?;
    h.state_is("acme", ConnectionState::Connected).await?;

    let request =
        SendRequest { to: "5522".into(), content: MessageContent::Text { text: "hi".into() } };
    let message_id = h.registry.send(&acme, request.clone()).await?;

    assert_eq!(message_id, "MOCK1");
    assert_eq!(h.factory.transport("acme").unwrap().sent(), vec![request]);
    Ok(())
}

#[tokio::test]
async fn disconnect_and_logout_return_to_disconnected() -> Result<()> {
    let h = &Harness::new();
    let acme = TenantId::from("acme");
    h.registry.create_session(&tenant("acme")).await?;
    h.registry.connect(&acme).await?;
    h.factory.emit("acme", connected("5511")).await?;
    h.state_is("acme", ConnectionState::Connected).await?;

    h.registry.disconnect(&acme).await?;
    assert_eq!(h.registry.get(&acme).await.unwrap().state, ConnectionState::Disconnected);

    h.registry.connect(&acme).await?;
    h.factory.emit("acme", connected("5511")).await?;
    h.state_is("acme", ConnectionState::Connected).await?;

    h.registry.logout(&acme).await?;
    let session = h.registry.get(&acme).await.unwrap();
    assert_eq!(session.state, ConnectionState::Disconnected);
    assert!(session.profile.is_none());

    let transport = h.factory.transport("acme").unwrap();
    assert_eq!(transport.disconnect_calls(), 1);
    assert_eq!(transport.logout_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn delete_tears_down_transport_and_stops_events() -> Result<()> {
    let h = &Harness::new();
    let acme = TenantId::from("acme");
    h.registry.create_session(&tenant("acme")).await?;
    let transport = h.factory.transport("acme").unwrap();

    h.registry.delete(&acme).await?;

    assert_eq!(transport.disconnect_calls(), 1);
    assert!(h.registry.get(&acme).await.is_none());
    assert!(matches!(h.registry.disconnect(&acme).await, Err(CoreError::NotFound { .. })));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let _ = transport.emit(inbound_message("late")).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.sink.is_empty());
    Ok(())
}

#[tokio::test]
async fn restore_all_reconnects_only_previously_connected_tenants() -> Result<()> {
    let factory = MockTransportFactory::new();
    factory.fail_create_for("broken");
    let h = &Harness::with_factory(factory);

    h.store
        .insert_tenant(TenantBuilder::new("acme").status(ConnectionState::Connected).build())
        .await;
    h.store.insert_tenant(tenant("beta")).await;
    h.store
        .insert_tenant(TenantBuilder::new("broken").status(ConnectionState::Connected).build())
        .await;

    let report = h.registry.restore_all(h.store.as_ref()).await?;

    assert_eq!(report.restored, 2);
    assert_eq!(report.reconnected, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 0);

    eventually(WAIT, || async move { h.factory.total_connect_calls() == 1 }).await?;
    assert_eq!(h.factory.transport("acme").unwrap().connect_calls(), 1);
    assert_eq!(h.factory.transport("beta").unwrap().connect_calls(), 0);

    let again = h.registry.restore_all(h.store.as_ref()).await?;
    assert_eq!(again.skipped, 2);
    assert_eq!(again.restored, 0);
    Ok(())
}

#[tokio::test]
async fn restore_skips_tenants_locked_by_another_process() -> Result<()> {
    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
    let other_process = DistributedLock::new(cache.clone());
    assert!(other_process.try_lock("restore:acme", Duration::from_secs(60)).await?);

    let factory = Arc::new(MockTransportFactory::new());
    let store = Arc::new(MemoryStore::new());
    store.insert_tenant(tenant("acme")).await;
    store.insert_tenant(tenant("beta")).await;

    let registry = SessionRegistry::new(
        factory.clone(),
        Arc::new(RecordingSink::new()),
        store.clone(),
        Arc::new(RealClock::new()),
    )
    .with_restore_lock(DistributedLock::new(cache.clone()));

    let report = registry.restore_all(store.as_ref()).await?;

    assert_eq!(report.skipped, 1);
    assert_eq!(report.restored, 1);
    assert!(registry.get(&TenantId::from("acme")).await.is_none());
    // The lock taken for beta was released after restoring it.
    assert_eq!(cache.get("lock:restore:beta").await?, None);
    Ok(())
}
