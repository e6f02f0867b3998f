//! Sidecar bridge transport against a mock HTTP sidecar.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use switchboard_core::CoreError;
use switchboard_sessions::{
    BridgeConfig, BridgeTransportFactory, MessageContent, SendRequest, TransportEvent,
    TransportFactory,
};
use switchboard_testing::tenant;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn factory(server: &MockServer) -> Result<BridgeTransportFactory> {
    Ok(BridgeTransportFactory::new(BridgeConfig {
        base_url: server.uri(),
        poll_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(2),
        retry_delay: Duration::from_millis(20),
        event_buffer: 16,
    })?)
}

async fn mount_idle_event_feed(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/sessions/acme/events"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_millis(50)),
        )
        .with_priority(10)
        .mount(server)
        .await;
}

#[tokio::test]
async fn connect_starts_polling_and_parses_events() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sessions/acme/connect"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/acme/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"type": "qr", "data": {"code": "2@abc"}},
            {"type": "connected", "data": {"phone": "5511999999999"}},
            {"type": "call_offer", "data": {"from": "5522"}}
        ])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_idle_event_feed(&server).await;

    let mut handle = factory(&server)?.create(&tenant("acme"))?;
    handle.transport.connect().await?;

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(2), handle.events.recv())
            .await?
            .context("event stream closed")?;
        received.push(event);
    }

    assert_eq!(received[0], TransportEvent::Qr { code: "2@abc".into() });
    assert!(matches!(&received[1], TransportEvent::Connected { profile } if profile.phone == "5511999999999"));
    assert!(matches!(&received[2], TransportEvent::Unknown { kind, .. } if kind == "call_offer"));

    handle.transport.disconnect().await.ok();
    Ok(())
}

#[tokio::test]
async fn empty_batches_are_paced_by_the_retry_delay() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions/acme/connect"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/acme/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    let factory = BridgeTransportFactory::new(BridgeConfig {
        base_url: server.uri(),
        poll_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(2),
        retry_delay: Duration::from_millis(200),
        event_buffer: 16,
    })?;

    let handle = factory.create(&tenant("acme"))?;
    handle.transport.connect().await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.transport.disconnect().await.ok();

    let polls = server
        .received_requests()
        .await
        .context("request recording enabled")?
        .iter()
        .filter(|request| request.method.as_str() == "GET")
        .count();
    assert!((1..=5).contains(&polls), "{polls} polls in 500ms");
    Ok(())
}

#[tokio::test]
async fn send_returns_sidecar_message_id() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions/acme/messages"))
        .and(body_partial_json(json!({"to": "5522", "content": {"type": "text", "text": "hi"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "3EB0ABC"})))
        .expect(1)
        .mount(&server)
        .await;

    let handle = factory(&server)?.create(&tenant("acme"))?;
    let message_id = handle
        .transport
        .send(SendRequest { to: "5522".into(), content: MessageContent::Text { text: "hi".into() } })
        .await?;

    assert_eq!(message_id, "3EB0ABC");
    Ok(())
}

#[tokio::test]
async fn sidecar_error_status_is_transport_error() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions/acme/messages"))
        .respond_with(ResponseTemplate::new(409).set_body_string("not connected"))
        .mount(&server)
        .await;

    let handle = factory(&server)?.create(&tenant("acme"))?;
    let err = handle
        .transport
        .send(SendRequest { to: "5522".into(), content: MessageContent::Text { text: "hi".into() } })
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Transport { ref message } if message.contains("409")));
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn is_connected_reads_sidecar_status() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sessions/acme/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"connected": true})))
        .mount(&server)
        .await;

    let handle = factory(&server)?.create(&tenant("acme"))?;
    assert!(handle.transport.is_connected().await);

    let unknown = factory(&server)?.create(&tenant("beta"))?;
    assert!(!unknown.transport.is_connected().await);
    Ok(())
}
