use super::*;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

fn recording_handler(run_once: bool, filter: MessageFilter) -> (EventHandler, mpsc::UnboundedReceiver<Arc<Message>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = handler_fn(move |msg| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
        }
    });
    (EventHandler::new(Uuid::new_v4(), run_once, filter, callback), rx)
}

#[test]
fn test_filter_all_matches_everything() {
    let filter = MessageFilter::all();
    assert!(filter.matches(&Message::request("c", json!(1), None)));
    assert!(filter.matches(&Message::error("c", json!(1), Some(Uuid::new_v4()))));
}

#[test]
fn test_filter_directions() {
    let filter = MessageFilter::directions(&[Direction::Response, Direction::Error]);
    assert!(filter.matches(&Message::response("c", json!(1), None)));
    assert!(filter.matches(&Message::error("c", json!(1), None)));
    assert!(!filter.matches(&Message::request("c", json!(1), None)));
}

#[test]
fn test_filter_correlation() {
    let id = Uuid::new_v4();
    let filter = MessageFilter::all().with_correlation(id);
    assert!(filter.matches(&Message::response("c", json!(1), Some(id))));
    assert!(!filter.matches(&Message::response("c", json!(1), Some(Uuid::new_v4()))));
    assert!(!filter.matches(&Message::response("c", json!(1), None)));
}

#[tokio::test]
async fn test_send_reaches_all_handlers() {
    let channel = Channel::new("orders");
    let (h1, mut rx1) = recording_handler(false, MessageFilter::all());
    let (h2, mut rx2) = recording_handler(false, MessageFilter::all());
    channel.subscribe(h1).await;
    channel.subscribe(h2).await;

    let dispatched = channel.send(Message::response("orders", json!("hi"), None)).await;

    assert_eq!(dispatched, 2);
    assert_eq!(rx1.recv().await.unwrap().payload(), &json!("hi"));
    assert_eq!(rx2.recv().await.unwrap().payload(), &json!("hi"));
}

#[tokio::test]
async fn test_run_once_handler_removed_after_first_delivery() {
    let channel = Channel::new("orders");
    let (handler, mut rx) = recording_handler(true, MessageFilter::all());
    channel.subscribe(handler).await;

    channel.send(Message::response("orders", json!(1), None)).await;
    channel.send(Message::response("orders", json!(2), None)).await;
    channel.wait_for_delivery().await;

    assert_eq!(rx.recv().await.unwrap().payload(), &json!(1));
    assert!(rx.try_recv().is_err());
    assert_eq!(channel.handler_count().await, 0);
}

#[tokio::test]
async fn test_run_once_handler_survives_non_matching_messages() {
    let channel = Channel::new("orders");
    let id = Uuid::new_v4();
    let (handler, mut rx) = recording_handler(true, MessageFilter::all().with_correlation(id));
    channel.subscribe(handler).await;

    let dispatched = channel.send(Message::response("orders", json!("other"), Some(Uuid::new_v4()))).await;
    assert_eq!(dispatched, 0);
    assert_eq!(channel.handler_count().await, 1);

    channel.send(Message::response("orders", json!("mine"), Some(id))).await;
    assert_eq!(rx.recv().await.unwrap().payload(), &json!("mine"));
    assert_eq!(channel.handler_count().await, 0);
}

#[tokio::test]
async fn test_unsubscribe_unknown_handler_returns_false() {
    let channel = Channel::new("orders");
    assert!(!channel.unsubscribe(Uuid::new_v4()).await);
}

#[tokio::test]
async fn test_wait_for_delivery_waits_for_slow_handler() {
    let channel = Channel::new("slow");
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    let callback = handler_fn(move |_msg| {
        let flag = Arc::clone(&flag);
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        }
    });
    channel
        .subscribe(EventHandler::new(Uuid::new_v4(), false, MessageFilter::all(), callback))
        .await;

    channel.send(Message::request("slow", json!(null), None)).await;
    assert_eq!(channel.barrier().in_flight(), 1);

    channel.wait_for_delivery().await;

    assert!(done.load(Ordering::SeqCst));
    assert_eq!(channel.barrier().in_flight(), 0);
}

#[tokio::test]
async fn test_wait_for_delivery_returns_immediately_when_idle() {
    let channel = Channel::new("idle");
    tokio::time::timeout(Duration::from_millis(100), channel.wait_for_delivery())
        .await
        .expect("idle barrier should not block");
}
