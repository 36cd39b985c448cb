//! Event bus for discovery events.
//!
//! Thin wrapper around [`tokio::sync::broadcast`]. The registry publishes
//! while holding its lock — publishing only queues, so observer code runs
//! on subscriber tasks, never under the lock and never on the scan tasks.
//! An observer that panics takes down its own task only.

use tokio::sync::broadcast;

use crate::connection::Connection;

/// A registry change, carrying the full record at the time of the change.
///
/// For a single peer, `Added` precedes any `Updated`, and `Removed` (if
/// emitted) is last. Events for different peers are unordered relative to
/// each other.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// First response from a previously unknown console.
    Added(Connection),
    /// State transition on a known console.
    Updated(Connection),
    /// Console evicted after disconnect, or purged.
    Removed(Connection),
}

impl ScanEvent {
    /// The record the event is about.
    pub fn connection(&self) -> &Connection {
        match self {
            ScanEvent::Added(c) | ScanEvent::Updated(c) | ScanEvent::Removed(c) => c,
        }
    }
}

/// Broadcast channel for discovery events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<ScanEvent>,
}

impl Bus {
    /// New bus with the given channel capacity. Slow subscribers lag and
    /// observe [`broadcast::error::RecvError::Lagged`] rather than blocking
    /// the publisher.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all subscribers. Non-blocking; an event with no
    /// subscribers is dropped.
    pub fn publish(&self, ev: ScanEvent) {
        let _ = self.tx.send(ev);
    }

    /// New receiver for consuming events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }
}
