use std::time::Duration;

use amqp_autorecovery::testing::MemoryBroker;
use amqp_autorecovery::{
    ConnectionState, ConsumerConfig, Message, RecoveryError, ResourceKind, ResourceState,
    RoutingType, TransportError,
};
use tokio_util::sync::CancellationToken;

use super::{anycast_consumer, connect, eventually, fast_config, spawn_receive, within};

#[tokio::test]
async fn pending_receive_spans_broker_restart() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("restart").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;

    let pending = spawn_receive(&consumer);
    tokio::task::yield_now().await;

    broker.stop();
    eventually(|| connection.state() == ConnectionState::Reconnecting).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished(), "receive should wait out the outage");

    broker.start();
    eventually(|| {
        connection.state() == ConnectionState::Connected && broker.consumer_count("orders") == 1
    })
    .await;
    broker.enqueue("orders", Some(RoutingType::Anycast), Message::from("after restart"));

    let message = within(pending).await.unwrap().unwrap();
    assert_eq!(message.body_str(), Some("after restart"));
    consumer.accept(&message, None).await.unwrap();

    assert_eq!(broker.accepted().len(), 1);
    assert_eq!(connection.recovery_state().reconnects(), 1);
}

#[tokio::test]
async fn link_loss_is_repaired_without_reconnecting() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("link-loss").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;

    let pending = spawn_receive(&consumer);
    tokio::task::yield_now().await;

    assert_eq!(broker.close_consumer_links("orders"), 1);
    eventually(|| broker.consumer_count("orders") == 1).await;
    broker.enqueue("orders", Some(RoutingType::Anycast), Message::from("m1"));

    let message = within(pending).await.unwrap().unwrap();
    assert_eq!(message.body_str(), Some("m1"));
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(connection.recovery_state().reconnects(), 0);
    assert_eq!(consumer.state(), ResourceState::Active);
}

#[tokio::test]
async fn unsettled_delivery_is_redelivered_after_reconnect() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("redelivery").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;
    let cancel = CancellationToken::new();

    broker.enqueue("orders", Some(RoutingType::Anycast), Message::from("first"));
    let first = within(consumer.receive(&cancel)).await.unwrap();

    broker.drop_connections();
    let again = within(consumer.receive(&cancel)).await.unwrap();
    assert_eq!(again.body_str(), Some("first"));

    // The original delivery belonged to the link that was replaced.
    assert_eq!(
        consumer.accept(&first, None).await.unwrap_err(),
        RecoveryError::StaleDelivery
    );
    consumer.accept(&again, None).await.unwrap();
    assert_eq!(broker.accepted().len(), 1);
}

#[tokio::test]
async fn settling_another_consumers_delivery_fails() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("foreign").build()).await;
    let orders = anycast_consumer(&connection, "orders").await;
    let invoices = anycast_consumer(&connection, "invoices").await;
    let cancel = CancellationToken::new();

    broker.enqueue("orders", Some(RoutingType::Anycast), Message::from("o1"));
    let message = within(orders.receive(&cancel)).await.unwrap();

    assert_eq!(
        invoices.accept(&message, None).await.unwrap_err(),
        RecoveryError::ForeignDelivery
    );
    assert_eq!(
        orders.reject(&Message::from("never received"), true).await.unwrap_err(),
        RecoveryError::ForeignDelivery
    );
    orders.reject(&message, true).await.unwrap();
    assert_eq!(broker.rejected().len(), 1);
}

#[tokio::test]
async fn consumer_on_lost_queue_terminates_with_cause() {
    let broker = MemoryBroker::new();
    broker.declare_queue("audit.temp", "audit", RoutingType::Multicast, false, false);
    let connection = connect(&broker, fast_config("lost-queue").build()).await;
    let consumer = connection
        .create_consumer(
            ConsumerConfig::builder("audit", RoutingType::Multicast)
                .queue("audit.temp")
                .build(),
        )
        .await
        .unwrap();

    let pending = spawn_receive(&consumer);
    tokio::task::yield_now().await;

    // Non-durable queues do not survive a restart.
    broker.restart();

    let error = within(pending).await.unwrap().unwrap_err();
    assert!(
        matches!(
            error,
            RecoveryError::ConsumerClosed {
                cause: Some(TransportError::Rejected { .. })
            }
        ),
        "unexpected error: {error:?}"
    );
    assert_eq!(consumer.state(), ResourceState::Terminated);

    // Later calls fail straight away with the same cause.
    let error = consumer.receive(&CancellationToken::new()).await.unwrap_err();
    assert!(error.is_closed());
    assert!(matches!(error.cause(), Some(TransportError::Rejected { .. })));

    eventually(|| connection.state() == ConnectionState::Connected).await;
}

#[tokio::test]
async fn cancelling_a_suspended_receive_leaves_others_waiting() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("cancel").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;

    broker.stop();
    eventually(|| consumer.state() == ResourceState::Suspended).await;

    let cancel = CancellationToken::new();
    let cancelled = {
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.receive(&cancel).await })
    };
    let waiting = spawn_receive(&consumer);
    tokio::time::sleep(Duration::from_millis(20)).await;

    cancel.cancel();
    assert_eq!(
        within(cancelled).await.unwrap().unwrap_err(),
        RecoveryError::Cancelled
    );
    assert!(!waiting.is_finished());

    broker.start();
    broker.enqueue("orders", Some(RoutingType::Anycast), Message::from("m1"));
    let message = within(waiting).await.unwrap().unwrap();
    assert_eq!(message.body_str(), Some("m1"));
}

#[tokio::test]
async fn receive_gives_up_after_too_many_recovery_cycles() {
    let broker = MemoryBroker::new();
    let config = fast_config("cycles").max_receive_recoveries(2).build();
    let connection = connect(&broker, config).await;
    let consumer = anycast_consumer(&connection, "orders").await;

    let pending = spawn_receive(&consumer);
    tokio::task::yield_now().await;

    for _ in 0..2 {
        eventually(|| broker.consumer_count("orders") == 1).await;
        broker.close_consumer_links("orders");
    }
    eventually(|| broker.consumer_count("orders") == 1).await;
    broker.close_consumer_links("orders");

    let error = within(pending).await.unwrap().unwrap_err();
    assert!(
        matches!(error, RecoveryError::RecoveryCyclesExceeded { cycles: 3, .. }),
        "unexpected error: {error:?}"
    );
    assert!(!error.is_closed());

    // The consumer itself keeps working.
    eventually(|| broker.consumer_count("orders") == 1).await;
    broker.enqueue("orders", Some(RoutingType::Anycast), Message::from("m1"));
    let message = within(consumer.receive(&CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(message.body_str(), Some("m1"));
}

#[tokio::test]
async fn disposed_consumer_fails_pending_and_later_calls() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("consumer-dispose").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;
    assert_eq!(connection.resource_count(), 1);

    let pending = spawn_receive(&consumer);
    tokio::task::yield_now().await;

    consumer.dispose().await.unwrap();
    let disposed = RecoveryError::Disposed {
        resource: ResourceKind::Consumer,
    };
    assert_eq!(within(pending).await.unwrap().unwrap_err(), disposed);
    assert_eq!(
        consumer.receive(&CancellationToken::new()).await.unwrap_err(),
        disposed
    );

    consumer.dispose().await.unwrap();
    assert_eq!(consumer.state(), ResourceState::Disposed);
    assert_eq!(connection.resource_count(), 0);
    assert_eq!(broker.consumer_count("orders"), 0);
}

#[tokio::test]
async fn multicast_subscribers_each_get_a_copy_after_recovery() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("fan-out").build()).await;
    let first = connection
        .create_consumer(ConsumerConfig::new("prices", RoutingType::Multicast))
        .await
        .unwrap();
    let second = connection
        .create_consumer(ConsumerConfig::new("prices", RoutingType::Multicast))
        .await
        .unwrap();

    broker.drop_connections();
    // Both subscriptions must be back on the broker before the publish.
    eventually(|| {
        connection.recovery_state().reconnects() >= 1
            && connection.state() == ConnectionState::Connected
            && first.state() == ResourceState::Active
            && second.state() == ResourceState::Active
    })
    .await;

    broker.enqueue("prices", Some(RoutingType::Multicast), Message::from("tick"));
    let cancel = CancellationToken::new();
    for consumer in [&first, &second] {
        let message = within(consumer.receive(&cancel)).await.unwrap();
        assert_eq!(message.body_str(), Some("tick"));
    }
}
