//! Subscription manager transitions and stale-delivery isolation

use camrelay::config::CamRelayConfig;
use camrelay::session::SubscriptionManager;
use camrelay::testing::{wait_until, LoopbackBroker};
use camrelay::topics;
use camrelay::types::{Command, CommandPayload, FramePayload};
use camrelay::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn manager(broker: &LoopbackBroker) -> SubscriptionManager {
    let conn = Connection::new(Arc::new(broker.clone()), CamRelayConfig::default().transport);
    SubscriptionManager::new(conn)
}

/// Wait until the broker has seen the given SUBSCRIBE/UNSUBSCRIBE counts
async fn settled(broker: &LoopbackBroker, subscribes: usize, unsubscribes: usize) -> bool {
    wait_until(Duration::from_secs(1), || {
        broker.subscribe_frames() == subscribes && broker.unsubscribe_frames() == unsubscribes
    })
    .await
}

fn frame_body(timestamp: i64) -> String {
    serde_json::to_string(&FramePayload::new("data:image/jpeg;base64,AAAA", timestamp)).unwrap()
}

#[tokio::test]
async fn test_a_a_b_transitions() {
    let broker = LoopbackBroker::new();
    let manager = manager(&broker);

    manager.subscribe_to_session("a").await.unwrap();
    let after_first = manager.stats();
    assert_eq!(after_first.setups, 1);
    assert_eq!(after_first.teardowns, 0);

    manager.subscribe_to_session("a").await.unwrap();
    assert_eq!(manager.stats(), after_first);

    manager.subscribe_to_session("b").await.unwrap();
    let after_switch = manager.stats();
    assert_eq!(after_switch.setups, 2);
    assert_eq!(after_switch.teardowns, 1);
    assert_eq!(manager.active_session().await.as_deref(), Some("b"));

    // Exactly one pair live, for "b" only
    assert!(settled(&broker, 4, 2).await);
    assert_eq!(manager.connection().subscription_count(), 2);
    assert_eq!(
        broker.subscribed_destinations(),
        vec![topics::frame_topic("b"), topics::command_topic("b")]
    );
}

#[tokio::test]
async fn test_frames_after_unsubscribe_are_not_delivered() {
    let broker = LoopbackBroker::new();
    let manager = manager(&broker);
    let latest = manager.latest_frame();

    manager.subscribe_to_session("S1").await.unwrap();
    assert!(settled(&broker, 2, 0).await);
    broker.publish(&topics::frame_topic("S1"), &frame_body(1));
    let mut frames = manager.latest_frame();
    timeout(Duration::from_secs(1), frames.wait_for(|f| f.is_some()))
        .await
        .unwrap()
        .unwrap();

    manager.unsubscribe_from_current().await;
    assert!(latest.borrow().is_none(), "cached frame cleared on teardown");

    broker.publish(&topics::frame_topic("S1"), &frame_body(2));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(latest.borrow().is_none());
}

#[tokio::test]
async fn test_switching_never_attributes_old_frames_to_new_session() {
    let broker = LoopbackBroker::new();
    let manager = manager(&broker);

    manager.subscribe_to_session("S1").await.unwrap();
    manager.subscribe_to_session("S2").await.unwrap();
    assert!(settled(&broker, 4, 2).await);

    broker.publish(&topics::frame_topic("S1"), &frame_body(1));
    broker.publish(&topics::frame_topic("S2"), &frame_body(2));

    let mut frames = manager.latest_frame();
    timeout(Duration::from_secs(1), frames.wait_for(|f| f.is_some()))
        .await
        .unwrap()
        .unwrap();
    let frame = manager.latest_frame().borrow().clone().unwrap();
    assert_eq!(frame.session_id, "S2");
    assert_eq!(frame.payload.timestamp, 2);
}

#[tokio::test]
async fn test_unsubscribe_twice_is_silent() {
    let broker = LoopbackBroker::new();
    let manager = manager(&broker);
    manager.subscribe_to_session("S1").await.unwrap();

    manager.unsubscribe_from_current().await;
    let stats = manager.stats();
    manager.unsubscribe_from_current().await;

    assert_eq!(manager.stats(), stats);
    assert_eq!(manager.active_session().await, None);
}

#[tokio::test]
async fn test_unsubscribe_tolerates_dead_connection() {
    let broker = LoopbackBroker::new();
    let manager = manager(&broker);
    manager.subscribe_to_session("S1").await.unwrap();

    manager.connection().disconnect().await;
    manager.unsubscribe_from_current().await;

    assert_eq!(manager.active_session().await, None);
    assert_eq!(manager.stats().teardowns, 1);
}

#[tokio::test]
async fn test_every_command_is_broadcast() {
    let broker = LoopbackBroker::new();
    let manager = manager(&broker);
    let mut commands = manager.commands();
    manager.subscribe_to_session("S1").await.unwrap();
    assert!(settled(&broker, 2, 0).await);

    for command in [Command::ToggleRecording, Command::TakeScreenshot] {
        let body = serde_json::to_string(&CommandPayload::new(command)).unwrap();
        broker.publish(&topics::command_topic("S1"), &body);
    }

    let first = timeout(Duration::from_secs(1), commands.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(1), commands.recv()).await.unwrap().unwrap();
    assert_eq!(first.payload.command, Command::ToggleRecording);
    assert_eq!(second.payload.command, Command::TakeScreenshot);
    assert_eq!(first.session_id, "S1");
}

#[tokio::test]
async fn test_malformed_payloads_are_skipped() {
    let broker = LoopbackBroker::new();
    let manager = manager(&broker);
    manager.subscribe_to_session("S1").await.unwrap();
    assert!(settled(&broker, 2, 0).await);

    broker.publish(&topics::frame_topic("S1"), "not json");
    broker.publish(&topics::frame_topic("S1"), &frame_body(7));

    let mut frames = manager.latest_frame();
    timeout(Duration::from_secs(1), frames.wait_for(|f| f.is_some()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        manager.latest_frame().borrow().as_ref().map(|f| f.payload.timestamp),
        Some(7)
    );
}
