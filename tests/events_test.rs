//! Event bus behavior: publish/subscribe, filtering, metrics, shutdown.

use std::time::Duration;

use dragnet::{EventBus, EventBusError, ShutdownReason, SystemEvent};
use tokio::time::timeout;

#[tokio::test]
async fn publish_with_no_subscribers_reports_it() {
    let bus = EventBus::new();
    assert_eq!(bus.subscriber_count(), 0);
    assert!(!bus.has_subscribers());

    let result = bus.publish(SystemEvent::persist_state(false));
    assert!(matches!(result, Err(EventBusError::NoSubscribers)));

    // The lossy variant swallows exactly that case
    bus.publish_lossy(SystemEvent::persist_state(false));
}

#[tokio::test]
async fn subscribers_receive_published_events() {
    let bus = EventBus::new();
    let mut receiver = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 1);

    let delivered = bus.publish(SystemEvent::migrating()).unwrap();
    assert_eq!(delivered, 1);

    let event = timeout(Duration::from_millis(100), receiver.recv())
        .await
        .expect("timed out")
        .expect("receive failed");
    assert!(matches!(event, SystemEvent::Migrating { .. }));
}

#[tokio::test]
async fn every_subscriber_sees_every_event() {
    let bus = EventBus::new();
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();

    let delivered = bus.publish(SystemEvent::aborting()).unwrap();
    assert_eq!(delivered, 2);

    for receiver in [&mut first, &mut second] {
        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timed out")
            .expect("receive failed");
        assert!(matches!(event, SystemEvent::Aborting { .. }));
    }
}

#[tokio::test]
async fn filtered_subscription_skips_unmatched_events() {
    let bus = EventBus::new();
    let mut migrations =
        bus.subscribe_filtered(|event| matches!(event, SystemEvent::Migrating { .. }));

    bus.publish(SystemEvent::persist_state(false)).unwrap();
    bus.publish(SystemEvent::migrating()).unwrap();

    let event = timeout(Duration::from_millis(100), migrations.recv())
        .await
        .expect("timed out")
        .expect("receive failed");
    assert!(matches!(event, SystemEvent::Migrating { .. }));
    assert!(migrations.try_recv().unwrap().is_none());
}

#[tokio::test]
async fn metrics_track_published_and_dropped() {
    let bus = EventBus::new();
    let _receiver = bus.subscribe();

    bus.publish(SystemEvent::persist_state(false)).unwrap();
    bus.publish(SystemEvent::persist_state(false)).unwrap();

    let snapshot = bus.metrics().snapshot();
    assert_eq!(snapshot.events_published, 2);
    assert_eq!(snapshot.events_failed, 0);
    assert_eq!(snapshot.active_subscribers, 1);
    assert!(snapshot.success_rate() > 0.99);
}

#[tokio::test]
async fn graceful_shutdown_delivers_a_final_event() {
    let bus = EventBus::new();
    let mut receiver = bus.subscribe();

    bus.shutdown_gracefully(ShutdownReason::CrawlCompleted).await;
    assert!(bus.is_shutdown());

    let event = timeout(Duration::from_millis(100), receiver.recv())
        .await
        .expect("timed out")
        .expect("receive failed");
    match event {
        SystemEvent::Shutdown { reason, .. } => {
            assert!(matches!(reason, ShutdownReason::CrawlCompleted));
        }
        other => panic!("expected shutdown event, got {other:?}"),
    }

    // Publishing after shutdown is rejected
    assert!(matches!(
        bus.publish(SystemEvent::persist_state(false)),
        Err(EventBusError::Shutdown)
    ));
}

#[tokio::test]
async fn clones_share_the_shutdown_signal() {
    let bus = EventBus::new();
    let clone = bus.clone();

    let waiter = tokio::spawn(async move {
        clone.wait_for_shutdown().await;
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.shutdown();

    timeout(Duration::from_secs(1), waiter)
        .await
        .expect("shutdown never observed")
        .unwrap();
}
