//! Process-wide client metrics.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle. Every increment is
//! gated on the [`report_metrics`] switch so embedders can turn reporting off
//! wholesale without touching call sites.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};

lazy_static! {
    // --- Connection lifecycle ---
    /// The total number of connections ever opened by this process.
    pub static ref CONNECTIONS_TOTAL: Counter =
        register_counter!("redlink_connections_total", "Total number of connections opened.").unwrap();
    /// The number of connections currently open.
    pub static ref ACTIVE_CONNECTIONS: Gauge =
        register_gauge!("redlink_active_connections", "Number of currently open connections.").unwrap();

    // --- Subscriptions ---
    /// The number of channel subscriptions currently registered.
    pub static ref ACTIVE_CHANNEL_SUBSCRIPTIONS: Gauge =
        register_gauge!("redlink_active_channel_subscriptions", "Number of active channel subscriptions.").unwrap();
    /// The number of pattern subscriptions currently registered.
    pub static ref ACTIVE_PATTERN_SUBSCRIPTIONS: Gauge =
        register_gauge!("redlink_active_pattern_subscriptions", "Number of active pattern subscriptions.").unwrap();
    /// The total number of pub/sub messages delivered to receivers.
    pub static ref SUBSCRIPTION_MESSAGES_RECEIVED_TOTAL: Counter =
        register_counter!("redlink_subscription_messages_received_total", "Total number of subscription messages received.").unwrap();

    // --- Commands ---
    /// The total number of commands that resolved with a non-error reply.
    pub static ref COMMANDS_SUCCESS_TOTAL: Counter =
        register_counter!("redlink_commands_success_total", "Total number of commands that succeeded.").unwrap();
    /// The total number of commands that resolved with a Redis error reply.
    pub static ref COMMANDS_FAILURE_TOTAL: Counter =
        register_counter!("redlink_commands_failure_total", "Total number of commands that received an error reply.").unwrap();
    /// A histogram of command round-trip latencies, submission to resolution.
    pub static ref COMMAND_ROUND_TRIP_SECONDS: Histogram =
        register_histogram!("redlink_command_round_trip_seconds", "Round-trip latency of commands in seconds.").unwrap();
}

static REPORT_METRICS: AtomicBool = AtomicBool::new(true);

/// Enables or disables metric reporting process-wide. Defaults to enabled.
pub fn set_report_metrics(enabled: bool) {
    REPORT_METRICS.store(enabled, Ordering::SeqCst);
}

/// Returns whether metric reporting is currently enabled.
pub fn report_metrics() -> bool {
    REPORT_METRICS.load(Ordering::SeqCst)
}

/// Bumps a counter if reporting is enabled.
pub(crate) fn incr_counter(counter: &Counter) {
    if report_metrics() {
        counter.inc();
    }
}

/// Adjusts a gauge by `delta` if reporting is enabled.
pub(crate) fn add_gauge(gauge: &Gauge, delta: f64) {
    if report_metrics() {
        gauge.add(delta);
    }
}

/// Pins a gauge to an absolute value if reporting is enabled.
pub(crate) fn set_gauge(gauge: &Gauge, value: f64) {
    if report_metrics() {
        gauge.set(value);
    }
}

/// Records a command round trip if reporting is enabled.
pub(crate) fn observe_round_trip(elapsed: Duration) {
    if report_metrics() {
        COMMAND_ROUND_TRIP_SECONDS.observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the report switch is process-wide state and must not be
    // toggled concurrently from parallel test threads.
    #[test]
    fn test_report_switch_gates_recording() {
        let before = COMMANDS_SUCCESS_TOTAL.get();
        set_report_metrics(false);
        incr_counter(&COMMANDS_SUCCESS_TOTAL);
        assert_eq!(COMMANDS_SUCCESS_TOTAL.get(), before);
        set_report_metrics(true);
        incr_counter(&COMMANDS_SUCCESS_TOTAL);
        assert_eq!(COMMANDS_SUCCESS_TOTAL.get(), before + 1.0);

        let gauge_before = ACTIVE_CONNECTIONS.get();
        add_gauge(&ACTIVE_CONNECTIONS, 1.0);
        add_gauge(&ACTIVE_CONNECTIONS, -1.0);
        assert_eq!(ACTIVE_CONNECTIONS.get(), gauge_before);
    }
}
