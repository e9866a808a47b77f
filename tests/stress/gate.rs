//! Suspension gate stress tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use amqp_autorecovery_core::SuspensionGate;
use tokio_util::sync::CancellationToken;

/// Test: Ten thousand waiters released by one open
#[tokio::test]
#[ignore]
async fn stress_ten_thousand_waiters() {
    println!("\n=== Gate: 10k waiters ===");

    let gate = Arc::new(SuspensionGate::closed());
    let released = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..10_000)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let released = Arc::clone(&released);
            tokio::spawn(async move {
                gate.wait().await;
                released.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(released.load(Ordering::SeqCst), 0);
    println!("Parked waiters: {}", gate.waiters());

    let start = Instant::now();
    gate.open();
    for handle in handles {
        handle.await.unwrap();
    }

    println!("Release time: {:?}", start.elapsed());
    assert_eq!(released.load(Ordering::SeqCst), 10_000);
}

/// Test: Rapid close/open cycles with cancellable waiters
#[tokio::test]
#[ignore]
async fn stress_rapid_cycles_with_cancellation() {
    println!("\n=== Gate: 1k close/open cycles, 100 waiters each ===");

    let gate = Arc::new(SuspensionGate::new());
    let passed = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    for cycle in 0..1_000 {
        gate.close();
        let token = CancellationToken::new();
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let token = token.clone();
                let passed = Arc::clone(&passed);
                let cancelled = Arc::clone(&cancelled);
                tokio::spawn(async move {
                    match gate.wait_cancellable(&token).await {
                        Ok(()) => passed.fetch_add(1, Ordering::SeqCst),
                        Err(_) => cancelled.fetch_add(1, Ordering::SeqCst),
                    };
                })
            })
            .collect();
        tokio::task::yield_now().await;

        if cycle % 2 == 0 {
            token.cancel();
        }
        gate.open();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    println!("Time: {:?}", start.elapsed());
    println!(
        "Passed: {}, cancelled: {}",
        passed.load(Ordering::SeqCst),
        cancelled.load(Ordering::SeqCst)
    );
    assert_eq!(
        passed.load(Ordering::SeqCst) + cancelled.load(Ordering::SeqCst),
        100_000
    );
    assert!(!gate.is_closed());
}
