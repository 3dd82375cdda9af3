use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{stream, StreamExt};
use serde_json::json;
use tokio::task::JoinHandle;

use bitcoin_pg_explorer::bridge::{
    ChannelSource, ClientFrame, CloseReason, NotificationBridge, UpstreamEvent, WireMessage,
};
use bitcoin_pg_explorer::{Config, Context};

fn bridge(queue: usize) -> Arc<NotificationBridge> {
    NotificationBridge::new(Context::new(Config {
        subscriber_queue: queue,
        subscriber_write_timeout: Duration::from_millis(50),
        ..Config::default()
    }))
}

fn block_event(height: i32) -> UpstreamEvent {
    UpstreamEvent::BlockConnected {
        height,
        hash: format!("{height:064x}"),
        merkle_root: "aa".repeat(32),
        prev_block_hash: format!("{:064x}", height - 1),
        transactions: vec![],
    }
}

/// Subscribe and stream into an unbounded channel we can read from.
async fn reader(
    bridge: &Arc<NotificationBridge>,
) -> (mpsc::UnboundedReceiver<String>, JoinHandle<CloseReason>) {
    let subscriber = bridge.subscribe().await;
    subscriber.handshake_complete();
    let (sink, rx) = mpsc::unbounded();
    let task = tokio::spawn(subscriber.run(sink, stream::pending::<ClientFrame>(), bridge.shutdown_signal()));
    (rx, task)
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<String>) -> WireMessage {
    let frame = tokio::time::timeout(Duration::from_secs(2), rx.next())
        .await
        .expect("frame in time")
        .expect("stream open");
    serde_json::from_str(&frame).unwrap()
}

#[tokio::test]
async fn every_subscriber_gets_every_event_in_order() {
    let bridge = bridge(16);
    let mut readers = Vec::new();
    for _ in 0..3 {
        readers.push(reader(&bridge).await);
    }

    bridge.publish(block_event(1)).await;
    bridge.publish(block_event(2)).await;

    for (rx, _) in &mut readers {
        let first = next_message(rx).await;
        let second = next_message(rx).await;
        assert_eq!(first.height, Some(1));
        assert_eq!(second.height, Some(2));
        assert!(first.seq < second.seq);
        assert_eq!(second.prev_block_hash, first.hash);
    }

    bridge.shutdown().await;
    bridge.shutdown().await;
    for (_, task) in readers {
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
    }
}

#[tokio::test]
async fn stalled_subscriber_does_not_hold_up_the_others() {
    let bridge = bridge(16);
    let (mut healthy, healthy_task) = reader(&bridge).await;

    let stalled = bridge.subscribe().await;
    let (stalled_sink, _never_read) = mpsc::channel::<String>(0);
    let stalled_task = tokio::spawn(stalled.run(
        stalled_sink,
        stream::pending::<ClientFrame>(),
        bridge.shutdown_signal(),
    ));

    for height in 1..=3 {
        bridge.publish(block_event(height)).await;
    }
    for height in 1..=3 {
        assert_eq!(next_message(&mut healthy).await.height, Some(height));
    }

    assert_eq!(stalled_task.await.unwrap(), CloseReason::Unresponsive);
    assert_eq!(bridge.subscriber_count().await, 1);

    bridge.publish(block_event(4)).await;
    assert_eq!(next_message(&mut healthy).await.height, Some(4));

    bridge.shutdown().await;
    assert_eq!(healthy_task.await.unwrap(), CloseReason::Shutdown);
}

#[tokio::test]
async fn overflowing_queue_evicts_the_subscriber() {
    let bridge = bridge(2);
    let idle = bridge.subscribe().await;

    for height in 1..=3 {
        bridge.publish(block_event(height)).await;
    }
    assert_eq!(bridge.subscriber_count().await, 0);

    let (sink, _rx) = mpsc::unbounded();
    let reason = idle
        .run(sink, stream::pending::<ClientFrame>(), bridge.shutdown_signal())
        .await;
    assert_eq!(reason, CloseReason::Evicted);
}

#[tokio::test]
async fn source_events_reach_subscribers_and_loss_of_source_closes_them() {
    let bridge = bridge(16);
    let (mut rx, task) = reader(&bridge).await;

    let (events, source) = ChannelSource::new(4);
    bridge.spawn_source(source);

    events
        .send(UpstreamEvent::Notification {
            channel: "address_notify".into(),
            payload: json!({"id": 1, "hash": "1abc", "balance": 50}),
        })
        .await
        .unwrap();
    let msg = next_message(&mut rx).await;
    assert_eq!(msg.channel.as_deref(), Some("address_notify"));
    assert_eq!(msg.hash.as_deref(), Some("1abc"));

    drop(events);
    bridge.join().await;
    assert!(bridge.is_shut_down());
    assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
}

#[tokio::test]
async fn client_close_removes_the_subscriber() {
    let bridge = bridge(16);
    let subscriber = bridge.subscribe().await;
    let states = subscriber.watch_state();
    let (sink, _rx) = mpsc::unbounded();
    let reason = subscriber
        .run(sink, stream::iter(vec![ClientFrame::Close]), bridge.shutdown_signal())
        .await;

    assert_eq!(reason, CloseReason::ClientClosed);
    assert_eq!(
        *states.borrow(),
        bitcoin_pg_explorer::bridge::SubscriberState::Closed
    );
    assert_eq!(bridge.subscriber_count().await, 0);
}

#[tokio::test]
async fn two_chain_events_three_subscribers_one_unresponsive() {
    let bridge = bridge(16);
    let (mut first, first_task) = reader(&bridge).await;

    let middle = bridge.subscribe().await;
    middle.handshake_complete();
    let (middle_sink, _never_read) = mpsc::channel::<String>(0);
    let middle_task = tokio::spawn(middle.run(
        middle_sink,
        stream::pending::<ClientFrame>(),
        bridge.shutdown_signal(),
    ));

    let (mut third, third_task) = reader(&bridge).await;

    let (events, source) = ChannelSource::new(4);
    bridge.spawn_source(source);
    events.send(block_event(100)).await.unwrap();
    events.send(block_event(101)).await.unwrap();

    for rx in [&mut first, &mut third] {
        assert_eq!(next_message(rx).await.height, Some(100));
        assert_eq!(next_message(rx).await.height, Some(101));
    }
    assert_eq!(middle_task.await.unwrap(), CloseReason::Unresponsive);

    bridge.shutdown().await;
    assert_eq!(first_task.await.unwrap(), CloseReason::Shutdown);
    assert_eq!(third_task.await.unwrap(), CloseReason::Shutdown);
    drop(events);
    bridge.join().await;
}
