use std::sync::Once;

use metrics::{describe_counter, describe_gauge};

static METRICS_INIT: Once = Once::new();

pub(crate) fn describe() {
    METRICS_INIT.call_once(|| {
        describe_counter!(
            "amqp_recovery_reconnect_attempts_total",
            "Total number of connect attempts made while recovering"
        );
        describe_counter!(
            "amqp_recovery_reconnects_total",
            "Total number of completed reconnect sequences"
        );
        describe_counter!(
            "amqp_recovery_resources_suspended_total",
            "Total number of consumer and producer suspensions"
        );
        describe_counter!(
            "amqp_recovery_resources_terminated_total",
            "Total number of consumers and producers terminated"
        );
        describe_gauge!(
            "amqp_recovery_registered_resources",
            "Current number of live consumers and producers"
        );
    });
}
