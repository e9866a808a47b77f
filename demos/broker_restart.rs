//! Consumers and a producer riding out a broker restart.
//!
//! Run with: cargo run --example broker_restart

use std::time::Duration;

use amqp_autorecovery::testing::MemoryBroker;
use amqp_autorecovery::{
    Connection, ConsumerConfig, Message, RecoveryConfig, RecoveryError, RecoveryPolicy,
    RoutingType,
};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let broker = MemoryBroker::new();
    let config = RecoveryConfig::builder()
        .name("demo")
        .policy(RecoveryPolicy::exponential(
            Duration::from_millis(50),
            Duration::from_secs(1),
        ))
        .max_attempts(20)
        .on_reconnected(|attempts| println!("reconnected after {} attempts", attempts))
        .build();
    let connection = Connection::connect(broker.transport(), [broker.endpoint()], config).await?;

    let consumers = try_join_all((0..3).map(|_| {
        connection.create_consumer(ConsumerConfig::new("orders", RoutingType::Anycast))
    }))
    .await?;
    let producer = connection
        .create_producer("orders", Some(RoutingType::Anycast))
        .await?;

    let cancel = CancellationToken::new();
    let workers: Vec<_> = consumers
        .into_iter()
        .enumerate()
        .map(|(worker, consumer)| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    match consumer.receive(&cancel).await {
                        Ok(message) => {
                            println!(
                                "worker {} got {}",
                                worker,
                                message.body_str().unwrap_or("<binary>")
                            );
                            if let Err(error) = consumer.accept(&message, None).await {
                                println!("worker {} could not settle: {}", worker, error);
                            }
                        }
                        Err(error) if error.is_cancelled() || error.is_closed() => break,
                        Err(error) => println!("worker {} receive failed: {}", worker, error),
                    }
                }
            })
        })
        .collect();

    for i in 0..10 {
        if i == 5 {
            println!("restarting broker");
            broker.stop();
            tokio::time::sleep(Duration::from_millis(200)).await;
            broker.start();
        }

        let message = Message::from(format!("order-{}", i));
        loop {
            match producer.send(&message, None, &cancel).await {
                Ok(()) => break,
                Err(RecoveryError::SendInterrupted { .. }) => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    for worker in workers {
        worker.await?;
    }

    connection.dispose().await?;
    println!(
        "done: {} accepted, {} reconnects",
        broker.accepted().len(),
        connection.recovery_state().reconnects()
    );
    Ok(())
}
