//! Fleet counters
//!
//! Plain atomic counters; the daemon logs a snapshot periodically and tests
//! assert on them directly.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counter identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    CommandsSent,
    CommandsSucceeded,
    CommandsFailed,
    CommandsTimedOut,
    CommandsDisconnected,
    /// Results that arrived after their command timed out or was rejected
    LateResults,
    Heartbeats,
    /// Heartbeats that could not be persisted
    HeartbeatFailures,
    UnknownMessages,
}

/// Process-wide fleet counters
#[derive(Debug, Default)]
pub struct FleetMetrics {
    commands_sent: AtomicU64,
    commands_succeeded: AtomicU64,
    commands_failed: AtomicU64,
    commands_timed_out: AtomicU64,
    commands_disconnected: AtomicU64,
    late_results: AtomicU64,
    heartbeats: AtomicU64,
    heartbeat_failures: AtomicU64,
    unknown_messages: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub commands_sent: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub commands_timed_out: u64,
    pub commands_disconnected: u64,
    pub late_results: u64,
    pub heartbeats: u64,
    pub heartbeat_failures: u64,
    pub unknown_messages: u64,
}

impl FleetMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::CommandsSent => &self.commands_sent,
            Counter::CommandsSucceeded => &self.commands_succeeded,
            Counter::CommandsFailed => &self.commands_failed,
            Counter::CommandsTimedOut => &self.commands_timed_out,
            Counter::CommandsDisconnected => &self.commands_disconnected,
            Counter::LateResults => &self.late_results,
            Counter::Heartbeats => &self.heartbeats,
            Counter::HeartbeatFailures => &self.heartbeat_failures,
            Counter::UnknownMessages => &self.unknown_messages,
        }
    }

    /// Increment a counter
    pub fn incr(&self, counter: Counter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a counter
    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    /// Copy all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_sent: self.get(Counter::CommandsSent),
            commands_succeeded: self.get(Counter::CommandsSucceeded),
            commands_failed: self.get(Counter::CommandsFailed),
            commands_timed_out: self.get(Counter::CommandsTimedOut),
            commands_disconnected: self.get(Counter::CommandsDisconnected),
            late_results: self.get(Counter::LateResults),
            heartbeats: self.get(Counter::Heartbeats),
            heartbeat_failures: self.get(Counter::HeartbeatFailures),
            unknown_messages: self.get(Counter::UnknownMessages),
        }
    }
}
