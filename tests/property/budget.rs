//! Property tests for the reconnect budget.
//!
//! Invariants tested:
//! - The initial connect makes at most max_attempts attempts
//! - It succeeds exactly when a refusal streak is shorter than the budget

use amqp_autorecovery::testing::MemoryBroker;
use amqp_autorecovery::{Connection, RecoveryConfig, RecoveryPolicy};
use proptest::prelude::*;
use std::time::Duration;
use tokio::runtime::Runtime;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: refusals below the budget are ridden out, the rest exhaust it
    #[test]
    fn connect_respects_attempt_budget(
        refusals in 0u32..8,
        max_attempts in 1u32..8,
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let broker = MemoryBroker::new();
            broker.fail_next_connects(refusals);
            let config = RecoveryConfig::builder()
                .policy(RecoveryPolicy::fixed(Duration::from_millis(1)))
                .max_attempts(max_attempts)
                .build();

            let result = Connection::connect(broker.transport(), [broker.endpoint()], config).await;

            prop_assert_eq!(result.is_ok(), refusals < max_attempts);
            prop_assert_eq!(broker.connect_attempts(), (refusals + 1).min(max_attempts));
            if let Ok(connection) = result {
                connection.dispose().await.unwrap();
            }
            Ok(())
        })?;
    }
}
