// Metrics for lock and session activity
// Published through the `metrics` facade; the embedding application installs a recorder

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use tamarind_common::SessionState;

/// Register metric descriptions. Call once at startup, after installing a recorder.
pub fn init_metrics() {
    describe_counter!(
        "tamarind_lock_attempts_total",
        "Total number of lock node create attempts"
    );
    describe_counter!(
        "tamarind_lock_contended_total",
        "Lock attempts that found the node already held"
    );
    describe_counter!(
        "tamarind_lock_faults_total",
        "Lock attempts that failed for a reason other than contention"
    );
    describe_counter!("tamarind_lock_acquired_total", "Total number of acquired locks");
    describe_counter!("tamarind_lock_released_total", "Total number of released locks");
    describe_histogram!(
        "tamarind_lock_wait_seconds",
        "Time from first attempt to acquisition"
    );
    describe_histogram!(
        "tamarind_lock_hold_seconds",
        "Time a scoped critical section held its lock"
    );
    describe_gauge!(
        "tamarind_session_state",
        "Session state: 0 connecting, 1 connected, 2 disconnected, 3 expired, 4 closed"
    );

    tracing::debug!("Metrics described");
}

/// Record a single lock attempt and its outcome ("acquired", "contended", "fault").
pub fn record_lock_attempt(outcome: &str) {
    counter!("tamarind_lock_attempts_total").increment(1);
    match outcome {
        "contended" => counter!("tamarind_lock_contended_total").increment(1),
        "fault" => counter!("tamarind_lock_faults_total").increment(1),
        _ => {}
    }
}

pub fn record_lock_acquired(wait_secs: f64) {
    counter!("tamarind_lock_acquired_total").increment(1);
    histogram!("tamarind_lock_wait_seconds").record(wait_secs);
}

pub fn record_lock_released(deleted: bool) {
    counter!("tamarind_lock_released_total", "deleted" => deleted.to_string()).increment(1);
}

pub fn record_lock_hold(hold_secs: f64) {
    histogram!("tamarind_lock_hold_seconds").record(hold_secs);
}

pub fn set_session_state(state: SessionState) {
    let value = match state {
        SessionState::Connecting => 0.0,
        SessionState::Connected => 1.0,
        SessionState::Disconnected => 2.0,
        SessionState::Expired => 3.0,
        SessionState::Closed => 4.0,
    };
    gauge!("tamarind_session_state").set(value);
}

/// Timer helper for measuring wait and hold durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let elapsed = timer.elapsed_secs();
        assert!(elapsed >= 0.01);
        assert!(elapsed < 1.0);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        init_metrics();
        record_lock_attempt("contended");
        record_lock_acquired(0.5);
        record_lock_released(true);
        set_session_state(SessionState::Expired);
    }
}
