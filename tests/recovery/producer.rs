use std::time::Duration;

use amqp_autorecovery::testing::MemoryBroker;
use amqp_autorecovery::{
    ConnectionState, Destination, Message, RecoveryError, ResourceState, RoutingType,
    TransportError,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use super::{anycast_consumer, connect, eventually, fast_config, spawn_receive, within};

#[tokio::test]
async fn interrupted_send_fails_and_resend_succeeds() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("resend").build()).await;
    let producer = connection
        .create_producer("orders", Some(RoutingType::Anycast))
        .await
        .unwrap();

    broker.stall_sends(true);
    let pending = {
        let producer = producer.clone();
        tokio::spawn(async move {
            producer
                .send(&Message::from("o1"), None, &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.close_producer_links("orders"), 1);

    let error = within(pending).await.unwrap().unwrap_err();
    assert!(error.is_retryable());
    assert!(
        matches!(
            error,
            RecoveryError::SendInterrupted {
                source: TransportError::LinkClosed(_)
            }
        ),
        "unexpected error: {error:?}"
    );

    // The interrupted message was not replayed behind the caller's back.
    assert_eq!(broker.queue_depth("orders"), None);

    broker.stall_sends(false);
    within(producer.send(&Message::from("o1"), None, &CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("orders"), Some(1));
    assert_eq!(producer.state(), ResourceState::Active);
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn sends_fail_while_receives_span_the_same_outage() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("asymmetry").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;
    let producer = connection
        .create_producer("orders", Some(RoutingType::Anycast))
        .await
        .unwrap();

    let receiving = spawn_receive(&consumer);
    broker.stall_sends(true);
    let sending = {
        let producer = producer.clone();
        tokio::spawn(async move {
            producer
                .send(&Message::from("o1"), None, &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    broker.drop_connections();

    let error = within(sending).await.unwrap().unwrap_err();
    assert!(
        matches!(
            error,
            RecoveryError::SendInterrupted {
                source: TransportError::ConnectionClosed(_)
            }
        ),
        "unexpected error: {error:?}"
    );
    assert!(!receiving.is_finished());

    broker.stall_sends(false);
    within(producer.send(&Message::from("o1"), None, &CancellationToken::new()))
        .await
        .unwrap();

    let message = within(receiving).await.unwrap().unwrap();
    assert_eq!(message.body_str(), Some("o1"));
    assert_eq!(broker.queue_depth("orders"), Some(0));
}

#[tokio::test]
async fn send_waits_for_recovery_instead_of_failing() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("anonymous").build()).await;
    let producer = connection.create_anonymous_producer().await.unwrap();

    broker.stop();
    eventually(|| producer.state() == ResourceState::Suspended).await;

    let pending = {
        let producer = producer.clone();
        tokio::spawn(async move {
            producer
                .send(
                    &Destination::new("orders", Some(RoutingType::Anycast)),
                    &Message::from("queued while down"),
                    None,
                    &CancellationToken::new(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished());

    broker.start();
    within(pending).await.unwrap().unwrap();
    assert_eq!(broker.queue_depth("orders"), Some(1));
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn cancelled_send_while_suspended() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("send-cancel").build()).await;
    let producer = connection.create_producer("orders", None).await.unwrap();

    broker.stop();
    eventually(|| producer.state() == ResourceState::Suspended).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = within(producer.send(&Message::from("o1"), None, &cancel))
        .await
        .unwrap_err();
    assert!(error.is_cancelled());
}

#[tokio::test]
async fn producer_works_as_a_tower_service() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("service").build()).await;
    let producer = connection
        .create_producer("orders", Some(RoutingType::Anycast))
        .await
        .unwrap();

    producer
        .clone()
        .oneshot(Message::from("via service"))
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("orders"), Some(1));

    producer.dispose().await.unwrap();
    let error = producer
        .oneshot(Message::from("too late"))
        .await
        .unwrap_err();
    assert!(error.is_closed());
    assert_eq!(connection.resource_count(), 0);
}
