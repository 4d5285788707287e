//! Transaction and request/response integration tests.
//!
//! Exercises the public bus API end to end: a pricing service answering on a
//! channel, one-shot requests, and transactions that mix channel requests
//! with waits on a replicated store.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, LoopbackConnection, PUB_PREFIX, TOPIC_PREFIX};
use fabric_bus::bus::{EventBus, Message, MessageHandler};
use fabric_bus::interfaces::BrokerConnection;
use fabric_bus::services::StoreSyncService;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Quote {
    item: String,
    price: u32,
}

/// Answers `{"item": ...}` requests with a quote, or an error for unknown items.
async fn pricing_service(bus: &Arc<EventBus>) -> MessageHandler {
    bus.channel_manager().create_channel("pricing").await;
    let handler = bus.listen_request_stream("pricing").await.unwrap();
    let responder = Arc::clone(bus);
    handler
        .handle(
            move |req: Arc<Message>| {
                let responder = Arc::clone(&responder);
                tokio::spawn(async move {
                    let item = req.payload()["item"].as_str().unwrap_or_default().to_string();
                    let price = match item.as_str() {
                        "apple" => Some(3),
                        "pear" => Some(4),
                        _ => None,
                    };
                    let sent = match price {
                        Some(price) => {
                            responder
                                .send_response_message("pricing", Quote { item, price }, req.correlation_id())
                                .await
                        }
                        None => {
                            responder
                                .send_error_message("pricing", format!("no price for {item}"), req.correlation_id())
                                .await
                        }
                    };
                    sent.unwrap();
                });
            },
            |_| {},
        )
        .await
        .unwrap();
    handler
}

#[tokio::test]
async fn test_request_once_receives_only_its_reply() {
    let bus = Arc::new(EventBus::default());
    let _service = pricing_service(&bus).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = bus.request_once("pricing", json!({"item": "apple"})).await.unwrap();
    let second = bus.request_once("pricing", json!({"item": "pear"})).await.unwrap();
    let tx2 = tx.clone();
    first
        .handle(move |msg| { let _ = tx.send(("first", msg)); }, |_| {})
        .await
        .unwrap();
    second
        .handle(move |msg| { let _ = tx2.send(("second", msg)); }, |_| {})
        .await
        .unwrap();

    first.fire().await.unwrap();
    second.fire().await.unwrap();

    let mut replies = Vec::new();
    for _ in 0..2 {
        let (who, msg) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        replies.push((who, msg.payload_as::<Quote>().unwrap().price));
    }
    replies.sort();
    assert_eq!(replies, vec![("first", 3), ("second", 4)]);
}

#[tokio::test]
async fn test_request_error_goes_to_error_callback() {
    let bus = Arc::new(EventBus::default());
    let _service = pricing_service(&bus).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let request = bus.request_once("pricing", json!({"item": "plum"})).await.unwrap();
    request
        .handle(|_| panic!("unexpected success"), move |msg| {
            let _ = tx.send(msg.error_text());
        })
        .await
        .unwrap();
    request.fire().await.unwrap();

    let text = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(text, "no price for plum");
}

#[tokio::test]
async fn test_transaction_waits_for_replica_then_prices() {
    let server = Arc::new(EventBus::default());
    let sync = StoreSyncService::new(Arc::clone(&server));
    let _monitor = sync.start();
    let basket = server.store_manager().create_store("basket").await;

    let bus = Arc::new(EventBus::default());
    let _service = pricing_service(&bus).await;
    let conn = LoopbackConnection::new(Arc::clone(&server));
    bus.store_manager()
        .configure_store_sync_channel(conn.clone(), TOPIC_PREFIX, PUB_PREFIX)
        .await
        .unwrap();
    let counter = Arc::clone(&sync);
    eventually(|| {
        let counter = Arc::clone(&counter);
        async move { counter.client_count().await == 1 }
    })
    .await;
    bus.store_manager()
        .open_galactic_store("basket", conn.id())
        .await
        .unwrap();

    let tx = bus.create_sync_transaction();
    tx.wait_for_store_ready("basket").await.unwrap();
    tx.send_request("pricing", json!({"item": "apple"})).await.unwrap();
    let (done_tx, mut done) = mpsc::unbounded_channel();
    tx.on_complete(move |responses| {
        let _ = done_tx.send(responses);
    })
    .await
    .unwrap();
    tx.commit().await.unwrap();

    // The replica is not ready until the owner's store is.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(done.try_recv().is_err());
    basket
        .populate([("apple".to_string(), json!(2))].into_iter().collect())
        .await
        .unwrap();

    let responses = timeout(Duration::from_secs(1), done.recv()).await.unwrap().unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].payload(), &json!({"apple": 2}));
    assert_eq!(
        responses[1].payload_as::<Quote>().unwrap(),
        Quote {
            item: "apple".to_string(),
            price: 3
        }
    );
}

#[tokio::test]
async fn test_async_transaction_aborts_on_unknown_item() {
    let bus = Arc::new(EventBus::default());
    let _service = pricing_service(&bus).await;
    let tx = bus.create_async_transaction();
    tx.send_request("pricing", json!({"item": "apple"})).await.unwrap();
    tx.send_request("pricing", json!({"item": "durian"})).await.unwrap();
    let (err_tx, mut errors) = mpsc::unbounded_channel();
    tx.on_error(move |msg| {
        let _ = err_tx.send(msg.error_text());
    })
    .await
    .unwrap();
    tx.on_complete(|_| panic!("transaction should abort")).await.unwrap();

    tx.commit().await.unwrap();

    let text = timeout(Duration::from_secs(1), errors.recv()).await.unwrap().unwrap();
    assert_eq!(text, "no price for durian");
}
