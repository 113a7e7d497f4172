use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::json;
use webhook_relay::{
    handler_fn, verify_webhook_request, DeliveryStatus, DispatchManager, Endpoint, Event, InboundHandler,
    InboundRequest, InboundServer, ManagerConfig, ResponseWriter, ServerConfig, ServerStats,
};

/// Writes two statuses; only the first may reach the client.
struct DoubleWrite;

#[async_trait]
impl InboundHandler for DoubleWrite {
    async fn handle(&self, request: InboundRequest, writer: &mut ResponseWriter) {
        writer.write_header(StatusCode::ACCEPTED);
        writer.write_header(StatusCode::CONFLICT);
        writer.write(&request.body);
    }
}

async fn started(server: &mut InboundServer) -> String {
    let addr = server.start().await.unwrap();
    format!("http://{addr}")
}

async fn wait_until_idle(server: &InboundServer) -> ServerStats {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = server.stats().await;
        if stats.requests_total > 0 && stats.active_handlers == 0 {
            return stats;
        }
        assert!(Instant::now() < deadline, "request never settled: {stats:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn first_written_status_is_sent_and_counted() {
    let mut server = InboundServer::new(ServerConfig::default());
    server.register_handler("/hooks/double", DoubleWrite).unwrap();
    let base = started(&mut server).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/hooks/double"))
        .body("ping")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    assert_eq!(response.text().await.unwrap(), "ping");

    let stats = server.stats().await;
    assert_eq!(stats.requests_total, 1);
    assert_eq!(stats.requests_success, 1);
    assert_eq!(stats.requests_error, 0);
    assert_eq!(stats.active_handlers, 0);
    assert!(stats.last_request_time.is_some());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn error_statuses_are_counted_as_errors() {
    let mut server = InboundServer::new(ServerConfig::default());
    server
        .register_handler(
            "/hooks/broken",
            handler_fn(|_request| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string()) }),
        )
        .unwrap();
    server
        .register_handler(
            "/hooks/ok",
            handler_fn(|request| async move {
                let name = request.header("x-name").unwrap_or("anonymous").to_string();
                (StatusCode::OK, format!("hello {name}"))
            }),
        )
        .unwrap();
    let base = started(&mut server).await;
    let http = reqwest::Client::new();

    let broken = http.post(format!("{base}/hooks/broken")).send().await.unwrap();
    assert_eq!(broken.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

    let ok = http
        .get(format!("{base}/hooks/ok"))
        .header("X-Name", "relay")
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), reqwest::StatusCode::OK);
    assert_eq!(ok.text().await.unwrap(), "hello relay");

    let stats = server.stats().await;
    assert_eq!(stats.requests_total, 2);
    assert_eq!(stats.requests_success, 1);
    assert_eq!(stats.requests_error, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let config = ServerConfig {
        max_body_bytes: 8,
        ..ServerConfig::default()
    };
    let mut server = InboundServer::new(config);
    server.register_handler("/hooks/small", DoubleWrite).unwrap();
    let base = started(&mut server).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/hooks/small"))
        .body("x".repeat(64))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(server.stats().await.requests_error, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn start_twice_fails_and_stop_releases_the_socket() {
    let mut server = InboundServer::new(ServerConfig::default());
    server.register_handler("/hooks/double", DoubleWrite).unwrap();
    let base = started(&mut server).await;

    assert!(server.is_running());
    assert!(server.start().await.is_err());
    assert!(server.register_handler("/hooks/late", DoubleWrite).is_err());

    server.stop().await.unwrap();
    assert!(!server.is_running());
    assert_eq!(server.local_addr(), None);
    server.stop().await.unwrap();

    let result = reqwest::Client::new()
        .post(format!("{base}/hooks/double"))
        .timeout(Duration::from_secs(2))
        .send()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn signed_deliveries_verify_at_the_receiver() {
    const SECRET: &str = "shared-secret";

    let mut server = InboundServer::new(ServerConfig::default());
    server
        .register_handler(
            "/hooks/orders",
            handler_fn(|request| async move {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap()
                    .as_secs();
                match verify_webhook_request(request.header_pairs(), &request.body, SECRET, 300, now) {
                    Ok(()) => (StatusCode::NO_CONTENT, String::new()),
                    Err(e) => (StatusCode::UNAUTHORIZED, e.to_string()),
                }
            }),
        )
        .unwrap();
    let base = started(&mut server).await;

    let manager = DispatchManager::new(ManagerConfig::default()).unwrap();
    let good = manager
        .register_endpoint(
            Endpoint::new(format!("{base}/hooks/orders"))
                .with_secret(SECRET)
                .with_max_retries(1),
        )
        .await
        .unwrap();
    let wrong = manager
        .register_endpoint(
            Endpoint::new(format!("{base}/hooks/orders"))
                .with_secret("not-the-secret")
                .with_max_retries(1),
        )
        .await
        .unwrap();

    let event = Event::new("order.created", "shop", json!({ "order_id": 7 }));
    let accepted = manager.send_webhook(&good, event.clone()).await.unwrap();
    let rejected = manager.send_webhook(&wrong, event).await.unwrap();

    assert_eq!(accepted.status, DeliveryStatus::Success);
    assert_eq!(accepted.status_code, Some(204));
    assert_eq!(rejected.status, DeliveryStatus::Failed);
    assert_eq!(rejected.status_code, Some(401));

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.stats().await.requests_total < 2 {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = server.stats().await;
    assert_eq!(stats.requests_success, 1);
    assert_eq!(stats.requests_error, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn abandoned_request_is_counted_as_error() {
    let mut server = InboundServer::new(ServerConfig::default());
    server
        .register_handler(
            "/hooks/slow",
            handler_fn(|_request| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                (StatusCode::OK, "late".to_string())
            }),
        )
        .unwrap();
    let base = started(&mut server).await;

    let result = reqwest::Client::new()
        .post(format!("{base}/hooks/slow"))
        .timeout(Duration::from_millis(50))
        .send()
        .await;
    assert!(result.is_err());

    let stats = wait_until_idle(&server).await;
    assert_eq!(stats.requests_total, 1);
    assert_eq!(stats.requests_success, 0);
    assert_eq!(stats.requests_error, 1);
    assert_eq!(stats.active_handlers, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_answers_500() {
    let mut server = InboundServer::new(ServerConfig::default());
    server
        .register_handler(
            "/hooks/panic",
            handler_fn(|request| async move {
                if request.body.is_empty() {
                    panic!("handler exploded");
                }
                (StatusCode::OK, String::new())
            }),
        )
        .unwrap();
    let base = started(&mut server).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/hooks/panic"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

    let stats = wait_until_idle(&server).await;
    assert_eq!(stats.requests_total, 1);
    assert_eq!(stats.requests_success, 0);
    assert_eq!(stats.requests_error, 1);
    assert_eq!(stats.active_handlers, 0);

    server.stop().await.unwrap();
}
