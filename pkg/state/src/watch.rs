use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// One state mutation. Carries no value; interested controllers re-read
/// the authoritative record, since any cached copy is assumed stale.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
}

/// Broadcast fan-out of store mutations with monotonic sequence numbers.
/// Slow subscribers lag (and observe `RecvError::Lagged`) rather than
/// blocking writers.
#[derive(Clone)]
pub struct EventLog {
    seq: Arc<AtomicU64>,
    sender: broadcast::Sender<WatchEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            seq: Arc::new(AtomicU64::new(0)),
            sender,
        }
    }

    /// Record a mutation. Called by the store on put/delete.
    pub fn emit(&self, event_type: EventType, key: &str) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        // Send errors just mean nobody is listening.
        let _ = self.sender.send(WatchEvent {
            seq,
            event_type,
            key: key.to_string(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}
