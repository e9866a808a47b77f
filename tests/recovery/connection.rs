use std::sync::Arc;
use std::time::Duration;

use amqp_autorecovery::testing::MemoryBroker;
use amqp_autorecovery::{
    Connection, ConnectionState, ConsumerConfig, Endpoint, Message, RecoveryError, ResourceKind,
    ResourceState, RoutingType, TransportError,
};
use tokio_util::sync::CancellationToken;

use super::{anycast_consumer, connect, eventually, fast_config, spawn_receive, within};

#[tokio::test]
async fn initial_connect_gives_up_after_max_attempts() {
    let broker = MemoryBroker::new();
    broker.stop();

    let result = Connection::connect(
        broker.transport(),
        [broker.endpoint()],
        fast_config("unreachable").max_attempts(3).build(),
    )
    .await;

    let error = result.unwrap_err();
    assert!(
        matches!(
            error,
            RecoveryError::ConnectionClosed {
                cause: Some(TransportError::ConnectFailed(_))
            }
        ),
        "unexpected error: {error:?}"
    );
    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test]
async fn connect_without_endpoints_fails() {
    let broker = MemoryBroker::new();
    let error = Connection::connect(
        broker.transport(),
        Vec::<Endpoint>::new(),
        fast_config("no-endpoints").build(),
    )
    .await
    .unwrap_err();

    assert!(matches!(error.cause(), Some(TransportError::ConnectFailed(_))));
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn endpoints_are_tried_round_robin() {
    let broker = MemoryBroker::new();
    let connection = Connection::connect(
        broker.transport(),
        [Endpoint::new("standby.invalid", 5672), broker.endpoint()],
        fast_config("failover").build(),
    )
    .await
    .unwrap();

    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.recovery_state().attempts(), 0);
}

#[tokio::test]
async fn refused_connects_are_retried() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(2);

    let connection = connect(&broker, fast_config("flaky").build()).await;

    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.name(), "flaky");
}

#[tokio::test]
async fn refused_link_is_not_retried() {
    let broker = MemoryBroker::new();
    broker.deny_consumers_on("orders");
    let connection = connect(&broker, fast_config("refused").build()).await;

    let error = connection
        .create_consumer(ConsumerConfig::new("orders", RoutingType::Anycast))
        .await
        .unwrap_err();
    assert!(
        matches!(
            error,
            RecoveryError::Create {
                resource: ResourceKind::Consumer,
                source: TransportError::Rejected { .. }
            }
        ),
        "unexpected error: {error:?}"
    );
    assert_eq!(connection.resource_count(), 0);

    let error = connection
        .create_consumer(
            ConsumerConfig::builder("orders", RoutingType::Anycast)
                .queue("undeclared")
                .build(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, RecoveryError::Create { .. }));
}

#[tokio::test]
async fn creation_waits_for_reconnect() {
    let broker = MemoryBroker::new();
    let connection = Arc::new(connect(&broker, fast_config("create-wait").build()).await);

    broker.stop();
    eventually(|| connection.state() == ConnectionState::Reconnecting).await;

    let pending = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            connection
                .create_consumer(ConsumerConfig::new("orders", RoutingType::Anycast))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished());

    broker.start();
    let consumer = within(pending).await.unwrap().unwrap();
    assert_eq!(consumer.state(), ResourceState::Active);
    assert_eq!(connection.resource_count(), 1);
    assert_eq!(broker.consumer_count("orders"), 1);
}

#[tokio::test]
async fn dispose_closes_every_resource_cleanly() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("dispose").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;
    let producer = connection.create_producer("orders", None).await.unwrap();
    let anonymous = connection.create_anonymous_producer().await.unwrap();
    assert_eq!(connection.resource_count(), 3);

    let pending = spawn_receive(&consumer);
    tokio::task::yield_now().await;

    within(connection.dispose()).await.unwrap();

    assert_eq!(
        within(pending).await.unwrap().unwrap_err(),
        RecoveryError::ConsumerClosed { cause: None }
    );
    assert_eq!(connection.state(), ConnectionState::Terminated);
    assert_eq!(consumer.state(), ResourceState::Terminated);
    assert_eq!(producer.state(), ResourceState::Terminated);
    assert_eq!(anonymous.state(), ResourceState::Terminated);
    assert_eq!(
        producer
            .send(&Message::from("late"), None, &CancellationToken::new())
            .await
            .unwrap_err(),
        RecoveryError::ProducerClosed { cause: None }
    );
    assert_eq!(
        connection
            .create_anonymous_producer()
            .await
            .unwrap_err(),
        RecoveryError::Disposed {
            resource: ResourceKind::Connection
        }
    );
    assert_eq!(broker.connection_count(), 0);

    // Idempotent.
    connection.dispose().await.unwrap();
}

#[tokio::test]
async fn dispose_aborts_a_reconnect_in_progress() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("abort").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;

    broker.stop();
    eventually(|| broker.connect_attempts() >= 3).await;

    within(connection.dispose()).await.unwrap();
    let attempts = broker.connect_attempts();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.connect_attempts(), attempts, "no attempts after dispose");
    assert_eq!(consumer.state(), ResourceState::Terminated);
    assert_eq!(
        consumer
            .receive(&CancellationToken::new())
            .await
            .unwrap_err(),
        RecoveryError::ConsumerClosed { cause: None }
    );
}

#[tokio::test]
async fn exhausted_budget_terminates_everything_with_cause() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("exhausted").max_attempts(2).build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;
    let producer = connection.create_producer("orders", None).await.unwrap();

    let pending = spawn_receive(&consumer);
    tokio::task::yield_now().await;

    broker.stop();
    eventually(|| connection.state() == ConnectionState::Terminated).await;

    let error = within(pending).await.unwrap().unwrap_err();
    assert!(
        matches!(
            error,
            RecoveryError::ConsumerClosed {
                cause: Some(TransportError::ConnectFailed(_))
            }
        ),
        "unexpected error: {error:?}"
    );
    let error = producer
        .send(&Message::from("o1"), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        RecoveryError::ProducerClosed {
            cause: Some(TransportError::ConnectFailed(_))
        }
    ));
    let error = connection
        .create_producer("orders", None)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        RecoveryError::ConnectionClosed {
            cause: Some(TransportError::ConnectFailed(_))
        }
    ));

    // One initial connect plus the two reconnect attempts.
    assert_eq!(broker.connect_attempts(), 3);
    connection.dispose().await.unwrap();
}

#[tokio::test]
async fn max_elapsed_bounds_the_reconnect() {
    let broker = MemoryBroker::new();
    let config = fast_config("elapsed")
        .max_elapsed(Duration::from_millis(60))
        .build();
    let connection = connect(&broker, config).await;

    broker.stop();
    eventually(|| connection.state() == ConnectionState::Terminated).await;

    let attempts = broker.connect_attempts();
    assert!(attempts > 2, "expected several attempts, got {attempts}");
    assert!(attempts < 20, "expected the time budget to stop retries, got {attempts}");
}

#[tokio::test]
async fn dropping_the_connection_terminates_resources() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("drop").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;

    drop(connection);

    eventually(|| consumer.state() == ResourceState::Terminated).await;
    eventually(|| broker.connection_count() == 0).await;
}

#[tokio::test]
async fn dropped_handles_leave_the_registry() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("dropped-handles").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;
    let kept = anycast_consumer(&connection, "audit").await;
    assert_eq!(connection.resource_count(), 2);

    drop(consumer);
    assert_eq!(connection.resource_count(), 1);
    eventually(|| broker.consumer_count("orders") == 0).await;

    // The survivor is still swept on the next reconnect.
    broker.drop_connections();
    eventually(|| {
        connection.recovery_state().reconnects() >= 1 && kept.state() == ResourceState::Active
    })
    .await;
    assert_eq!(broker.consumer_count("audit"), 1);
    assert_eq!(broker.consumer_count("orders"), 0);
}

#[tokio::test]
async fn link_timeout_on_a_live_connection_is_not_retried() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("link-timeout").build()).await;

    broker.time_out_next_links(1);
    let config = ConsumerConfig::new("orders", RoutingType::Anycast);
    let error = within(connection.create_consumer(config))
        .await
        .unwrap_err();
    assert!(
        matches!(
            error,
            RecoveryError::Create {
                resource: ResourceKind::Consumer,
                source: TransportError::Timeout(_)
            }
        ),
        "unexpected error: {error:?}"
    );
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.resource_count(), 0);
    assert_eq!(broker.connect_attempts(), 1);

    let consumer = anycast_consumer(&connection, "orders").await;
    assert_eq!(consumer.state(), ResourceState::Active);
}

#[tokio::test]
async fn creation_interrupted_by_connection_loss_is_retried() {
    let broker = MemoryBroker::new();
    let connection = Arc::new(connect(&broker, fast_config("create-interrupted").build()).await);

    broker.stall_link_creation(true);
    let pending = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            connection
                .create_consumer(ConsumerConfig::new("orders", RoutingType::Anycast))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished());

    broker.stall_link_creation(false);
    broker.drop_connections();

    let consumer = within(pending).await.unwrap().unwrap();
    assert_eq!(consumer.state(), ResourceState::Active);
    assert_eq!(connection.resource_count(), 1);
    assert_eq!(broker.consumer_count("orders"), 1);
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test]
async fn dispose_interrupts_a_stalled_reattach() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker, fast_config("stalled-reattach").build()).await;
    let consumer = anycast_consumer(&connection, "orders").await;

    broker.stall_link_creation(true);
    broker.drop_connections();
    eventually(|| broker.connect_attempts() >= 2).await;

    within(connection.dispose()).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Terminated);
    assert_eq!(consumer.state(), ResourceState::Terminated);
    assert_eq!(
        consumer
            .receive(&CancellationToken::new())
            .await
            .unwrap_err(),
        RecoveryError::ConsumerClosed { cause: None }
    );
}

#[tokio::test]
async fn stalled_reattach_spends_the_budget() {
    let broker = MemoryBroker::new();
    let config = fast_config("stalled-budget")
        .attempt_timeout(Duration::from_millis(50))
        .max_attempts(3)
        .build();
    let connection = connect(&broker, config).await;
    let consumer = anycast_consumer(&connection, "orders").await;

    broker.stall_link_creation(true);
    broker.drop_connections();
    eventually(|| connection.state() == ConnectionState::Terminated).await;

    let error = within(consumer.receive(&CancellationToken::new()))
        .await
        .unwrap_err();
    assert!(
        matches!(
            error,
            RecoveryError::ConsumerClosed {
                cause: Some(TransportError::Timeout(_))
            }
        ),
        "unexpected error: {error:?}"
    );
    // One initial connect plus three that each lost their sweep.
    assert_eq!(broker.connect_attempts(), 4);
    connection.dispose().await.unwrap();
}
