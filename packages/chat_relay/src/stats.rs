//! Relay counters
//!
//! Plain atomics bumped by the controller, the workers and the broadcast
//! engine. Nothing reads them to make decisions; they exist for the logs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct RelayStats {
    // Connection counters
    /// Connections that got a registry slot
    pub accepted: AtomicU64,
    /// Connections turned away because the registry was full
    pub rejected: AtomicU64,
    /// Workers that reached their terminal state
    pub disconnected: AtomicU64,
    /// Connections removed by a broadcast after a failed write
    pub evicted: AtomicU64,

    // Message counters
    pub messages_received: AtomicU64,
    /// One per successful write to a receiver
    pub messages_relayed: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Wire bytes written to receivers, newline included
    pub bytes_relayed: AtomicU64,

    start_time: Option<Instant>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peers_evicted(&self, count: usize) {
        self.evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn message_relayed(&self, receivers: usize, wire_len: usize) {
        self.messages_relayed
            .fetch_add(receivers as u64, Ordering::Relaxed);
        self.bytes_relayed
            .fetch_add((receivers * wire_len) as u64, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of the counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub disconnected: u64,
    pub evicted: u64,
    pub messages_received: u64,
    pub messages_relayed: u64,
    pub bytes_received: u64,
    pub bytes_relayed: u64,
}
