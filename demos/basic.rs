use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use webhook_relay::{
    handler_fn, verify_webhook_request, DispatchManager, Endpoint, Event, InboundServer, ManagerConfig,
    ServerConfig,
};

const SECRET: &str = "supersecret";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // A local receiver standing in for a subscriber.
    let mut server = InboundServer::new(ServerConfig::default());
    server.register_handler(
        "/hooks/orders",
        handler_fn(|request| async move {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            match verify_webhook_request(request.header_pairs(), &request.body, SECRET, 300, now) {
                Ok(()) => (StatusCode::ACCEPTED, "accepted".to_string()),
                Err(e) => (StatusCode::UNAUTHORIZED, e.to_string()),
            }
        }),
    )?;
    let addr = server.start().await?;

    let manager = DispatchManager::new(ManagerConfig::default())?;
    manager
        .register_endpoint(
            Endpoint::new(format!("http://{addr}/hooks/orders"))
                .with_id("orders")
                .with_events(["order.created", "order.paid"])
                .with_secret(SECRET),
        )
        .await?;

    let event = Event::new("order.created", "shop", json!({ "order_id": 123, "total": "19.99" }));
    let event_id = event.id.clone();
    let launched = manager.trigger_event(event).await?;
    println!("launched {launched} delivery(ies) for {event_id}");

    tokio::time::sleep(Duration::from_millis(500)).await;

    for record in manager.deliveries_for_event(&event_id).await {
        println!(
            "{} -> {}: {} after {} attempt(s)",
            record.id, record.endpoint_id, record.status, record.attempts
        );
    }
    println!("server: {:?}", server.stats().await);
    println!("manager: {:?}", manager.stats().await);

    manager.shutdown();
    server.stop().await?;
    Ok(())
}
