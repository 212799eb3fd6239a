//! Metrics definitions for the wallet service.
//!
//! Metrics are collected using the `metrics` crate and exported
//! to Prometheus via `metrics-exporter-prometheus` by the binary.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "ledger_commits_total",
        "Total number of ledger entries committed, by primary transaction kind"
    );
    describe_histogram!(
        "ledger_commit_duration_seconds",
        "Time taken to commit a ledger entry in seconds"
    );
    describe_counter!(
        "ledger_lock_timeouts_total",
        "Total number of account lock acquisitions that timed out"
    );
    describe_counter!(
        "webhooks_total",
        "Total number of gateway webhooks, by gateway and outcome"
    );
    describe_counter!(
        "settlements_total",
        "Total number of election settlements, by outcome"
    );
    describe_counter!(
        "escrow_transitions_total",
        "Total number of escrow deposit status transitions"
    );
    describe_counter!(
        "sweeper_resolutions_total",
        "Total number of stale pending records resolved by the sweeper"
    );
}

/// Record a committed ledger entry.
pub fn record_commit(kind: &str) {
    counter!("ledger_commits_total", "kind" => kind.to_string()).increment(1);
}

/// Record ledger commit duration.
pub fn record_commit_duration(duration_secs: f64) {
    histogram!("ledger_commit_duration_seconds").record(duration_secs);
}

/// Record a lock acquisition timeout.
pub fn record_lock_timeout() {
    counter!("ledger_lock_timeouts_total").increment(1);
}

/// Record a webhook outcome.
///
/// # Arguments
/// * `gateway` - The gateway name ("stripe", "paddle", ...)
/// * `outcome` - "processed", "duplicate", "ignored" or "failed"
pub fn record_webhook(gateway: &str, outcome: &str) {
    counter!("webhooks_total", "gateway" => gateway.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record an election settlement.
pub fn record_settlement(outcome: &str) {
    counter!("settlements_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record an escrow deposit transition to `status`.
pub fn record_escrow_transition(status: &str) {
    counter!("escrow_transitions_total", "status" => status.to_string()).increment(1);
}

/// Record records resolved by one sweeper pass.
pub fn record_sweeper_resolutions(count: u64) {
    counter!("sweeper_resolutions_total").increment(count);
}

/// A timer that records commit duration when dropped.
pub struct CommitTimer {
    start: Instant,
}

impl CommitTimer {
    /// Start a new commit timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for CommitTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CommitTimer {
    fn drop(&mut self) {
        record_commit_duration(self.start.elapsed().as_secs_f64());
    }
}
