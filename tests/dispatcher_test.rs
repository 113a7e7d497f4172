use std::time::{Duration, Instant};

use serde_json::{json, Value};
use webhook_relay::{
    DeliveryRecord, DeliveryStatus, DispatchManager, Endpoint, EndpointId, Event, EventId, ManagerConfig,
    WebhookError,
};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn manager() -> DispatchManager {
    DispatchManager::new(ManagerConfig::default()).unwrap()
}

async fn wait_for_terminal(manager: &DispatchManager, event_id: &EventId, expected: usize) -> Vec<DeliveryRecord> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let records = manager.deliveries_for_event(event_id).await;
        if records.len() == expected && records.iter().all(|r| r.status.is_terminal()) {
            return records;
        }
        assert!(Instant::now() < deadline, "deliveries did not finish: {records:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn event_fans_out_to_matching_enabled_endpoints() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let manager = manager();
    let url = |path: &str| format!("{}{path}", server.uri());
    manager
        .register_endpoint(Endpoint::new(url("/exact")).with_id("exact").with_events(["user.created"]))
        .await
        .unwrap();
    manager
        .register_endpoint(Endpoint::new(url("/wildcard")).with_id("wildcard").with_events(["*"]))
        .await
        .unwrap();
    manager
        .register_endpoint(Endpoint::new(url("/all")).with_id("all"))
        .await
        .unwrap();
    manager
        .register_endpoint(
            Endpoint::new(url("/disabled"))
                .with_id("disabled")
                .with_events(["user.created"])
                .with_enabled(false),
        )
        .await
        .unwrap();
    manager
        .register_endpoint(Endpoint::new(url("/other")).with_id("other").with_events(["user.deleted"]))
        .await
        .unwrap();
    manager
        .register_endpoint(Endpoint::new(url("/prefix")).with_id("prefix").with_events(["user.*"]))
        .await
        .unwrap();

    let event = Event::new("user.created", "accounts", json!({ "user_id": 42 }));
    let event_id = event.id.clone();
    let launched = manager.trigger_event(event).await.unwrap();
    assert_eq!(launched, 3);

    let records = wait_for_terminal(&manager, &event_id, 3).await;
    let mut endpoints: Vec<_> = records.iter().map(|r| r.endpoint_id.to_string()).collect();
    endpoints.sort();
    assert_eq!(endpoints, ["all", "exact", "wildcard"]);
    assert!(records.iter().all(|r| r.status == DeliveryStatus::Success));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["id"], event_id.as_str());
    assert_eq!(body["type"], "user.created");
    assert_eq!(body["source"], "accounts");
    assert_eq!(body["data"], json!({ "user_id": 42 }));
}

#[tokio::test]
async fn trigger_returns_before_deliveries_complete() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .mount(&server)
        .await;

    let manager = manager();
    for id in ["a", "b"] {
        manager
            .register_endpoint(Endpoint::new(format!("{}/{id}", server.uri())).with_id(id))
            .await
            .unwrap();
    }

    let event = Event::new("order.paid", "shop", json!({}));
    let event_id = event.id.clone();
    let started = Instant::now();
    assert_eq!(manager.trigger_event(event).await.unwrap(), 2);
    assert!(started.elapsed() < Duration::from_millis(500));

    // Records exist as soon as trigger returns.
    let records = manager.deliveries_for_event(&event_id).await;
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == DeliveryStatus::Pending));

    let records = wait_for_terminal(&manager, &event_id, 2).await;
    assert!(records.iter().all(|r| r.status == DeliveryStatus::Success));
}

#[tokio::test]
async fn one_failing_endpoint_does_not_affect_others() {
    let server = MockServer::start().await;
    Mock::given(matchers::path("/good"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(matchers::path("/bad"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let manager = manager();
    manager
        .register_endpoint(Endpoint::new(format!("{}/good", server.uri())).with_id("good"))
        .await
        .unwrap();
    manager
        .register_endpoint(
            Endpoint::new(format!("{}/bad", server.uri()))
                .with_id("bad")
                .with_max_retries(2)
                .with_retry_delay(Duration::from_millis(10)),
        )
        .await
        .unwrap();

    let event = Event::new("user.created", "accounts", json!({}));
    let event_id = event.id.clone();
    manager.trigger_event(event).await.unwrap();

    let records = wait_for_terminal(&manager, &event_id, 2).await;
    let good = records.iter().find(|r| r.endpoint_id.as_str() == "good").unwrap();
    let bad = records.iter().find(|r| r.endpoint_id.as_str() == "bad").unwrap();

    assert_eq!(good.status, DeliveryStatus::Success);
    assert_eq!(good.attempts, 1);
    assert_eq!(bad.status, DeliveryStatus::Failed);
    assert_eq!(bad.attempts, 2);
    assert_eq!(bad.status_code, Some(500));
}

#[tokio::test]
async fn retrying_state_is_visible_while_backing_off() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let manager = manager();
    let id = manager
        .register_endpoint(
            Endpoint::new(format!("{}/hook", server.uri()))
                .with_max_retries(3)
                .with_retry_delay(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    let event = Event::new("user.created", "accounts", json!({}));
    manager.trigger_event(event).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let record = loop {
        let records = manager.deliveries_for_endpoint(&id).await;
        if let Some(record) = records.into_iter().find(|r| r.status == DeliveryStatus::Retrying) {
            break record;
        }
        assert!(Instant::now() < deadline, "delivery never entered retrying");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(record.attempts, 1);
    assert!(record.next_attempt.is_some());
    assert!(record.error.is_some());

    // Shutdown cancels the pending backoff and settles the record.
    manager.shutdown();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = manager.delivery(&record.id).await.unwrap();
        if current.status == DeliveryStatus::Failed {
            assert_eq!(current.error.as_deref(), Some("delivery cancelled"));
            break;
        }
        assert!(Instant::now() < deadline, "shutdown did not cancel the backoff");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn send_webhook_waits_for_outcome_and_tracks_it() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .mount(&server)
        .await;

    let manager = manager();
    let id = manager
        .register_endpoint(Endpoint::new(format!("{}/hook", server.uri())))
        .await
        .unwrap();

    let record = manager
        .send_webhook(&id, Event::new("user.created", "accounts", json!({})))
        .await
        .unwrap();

    assert_eq!(record.status, DeliveryStatus::Success);
    assert_eq!(record.status_code, Some(201));
    assert_eq!(record.response_body.as_deref(), Some("created"));
    assert_eq!(manager.delivery(&record.id).await.unwrap(), record);
}

#[tokio::test]
async fn unregistered_endpoint_is_gone() {
    let manager = manager();
    let id = manager
        .register_endpoint(Endpoint::new("https://example.com/hook"))
        .await
        .unwrap();

    manager.unregister_endpoint(&id).await.unwrap();

    assert!(manager.list_endpoints().await.is_empty());
    let err = manager
        .send_webhook(&id, Event::new("user.created", "accounts", json!({})))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(manager.unregister_endpoint(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn registration_validates_and_fills_defaults() {
    let manager = manager();

    for url in ["", "not a url", "ftp://example.com/hook"] {
        let err = manager.register_endpoint(Endpoint::new(url)).await.unwrap_err();
        assert!(matches!(err, WebhookError::Validation { .. }), "{url:?} accepted");
    }

    let id = manager
        .register_endpoint(Endpoint::new("https://example.com/hook"))
        .await
        .unwrap();
    assert!(!id.is_empty());

    let endpoint = manager.get_endpoint(&id).await.unwrap();
    assert_eq!(endpoint.method, "POST");
    assert_eq!(endpoint.max_retries, 3);
    assert_eq!(endpoint.retry_delay, Duration::from_secs(5));
    assert_eq!(endpoint.timeout, Duration::from_secs(30));
    assert!(endpoint.created_at.is_some());

    let duplicate = Endpoint::new("https://example.com/other").with_id(id.as_str());
    assert!(manager.register_endpoint(duplicate).await.is_err());
}

#[tokio::test]
async fn disabling_an_endpoint_stops_fan_out() {
    let manager = manager();
    let id = manager
        .register_endpoint(Endpoint::new("http://127.0.0.1:9/hook").with_events(["user.created"]))
        .await
        .unwrap();

    manager.set_endpoint_enabled(&id, false).await.unwrap();
    let launched = manager
        .trigger_event(Event::new("user.created", "accounts", json!({})))
        .await
        .unwrap();
    assert_eq!(launched, 0);

    let stats = manager.stats().await;
    assert_eq!(stats.endpoints_total, 1);
    assert_eq!(stats.endpoints_enabled, 0);
    assert!(manager
        .set_endpoint_enabled(&EndpointId::from("missing"), true)
        .await
        .unwrap_err()
        .is_not_found());
}
