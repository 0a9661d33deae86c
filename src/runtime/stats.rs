//! Live counters snapshot

use serde::Serialize;

/// Point-in-time view of the process counters
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Stat {
    /// Supervised tasks currently running
    pub task_count: i64,
    /// Queues in the connection registry
    pub queue_count: usize,
    /// UDP virtual sessions alive
    pub udp_session_count: usize,
    /// Unix seconds when the process started waiting for exit, 0 before that
    pub start_time: u64,
    /// Unix seconds of the last recovered panic, 0 if none
    pub last_panic: u64,
    /// Panics recovered so far
    pub panic_count: u64,
}
