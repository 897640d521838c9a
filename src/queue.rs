use crate::frame::FrameEnvelope;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::Notify;
use tracing::trace;

/// Result of a push into the bounded queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame accepted without displacing anything
    Queued,
    /// Queue was full; the named prior frame was evicted to make room
    EvictedPrior { evicted_sequence: u64 },
}

/// Ordering key: ascending priority, and among equal priorities the
/// greatest key is the earliest sequence (so the natural maximum is
/// "highest priority, oldest first").
#[derive(Debug, Clone, Copy)]
struct QueueKey {
    priority: f64,
    sequence: u64,
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.priority.total_cmp(&other.priority).is_eq() && self.sequence == other.sequence
    }
}

impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Bounded priority queue between the ingest endpoint and the processor
/// worker. Single writer (ingest), single reader (processor). This is the
/// pipeline's only backpressure point: overflow evicts the oldest
/// lowest-priority pending frame.
pub struct FramePriorityQueue {
    entries: Mutex<BTreeMap<QueueKey, FrameEnvelope>>,
    capacity: usize,
    notify: Notify,
}

impl FramePriorityQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Insert a frame, evicting the oldest lowest-priority entry when full.
    pub fn push(&self, envelope: FrameEnvelope) -> PushOutcome {
        let key = QueueKey {
            priority: envelope.priority,
            sequence: envelope.sequence,
        };

        let outcome = {
            let mut entries = self.entries.lock();
            let outcome = if entries.len() >= self.capacity {
                match Self::evict_lowest(&mut entries) {
                    Some(evicted_sequence) => PushOutcome::EvictedPrior { evicted_sequence },
                    None => PushOutcome::Queued,
                }
            } else {
                PushOutcome::Queued
            };

            entries.insert(key, envelope);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Remove and return the highest-priority pending frame, waiting until
    /// one is available.
    pub async fn pop_highest(&self) -> FrameEnvelope {
        loop {
            let notified = self.notify.notified();
            if let Some(envelope) = self.try_pop_highest() {
                return envelope;
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`pop_highest`](Self::pop_highest)
    pub fn try_pop_highest(&self) -> Option<FrameEnvelope> {
        let mut entries = self.entries.lock();
        let key = *entries.keys().next_back()?;
        let envelope = entries.remove(&key);
        if let Some(ref env) = envelope {
            trace!(
                sequence = env.sequence,
                priority = env.priority,
                "popped highest-priority frame"
            );
        }
        envelope
    }

    /// Evict the minimum-priority entry; among equal priorities the oldest
    /// (smallest sequence) goes first. Returns the evicted sequence.
    fn evict_lowest(entries: &mut BTreeMap<QueueKey, FrameEnvelope>) -> Option<u64> {
        let min_priority = entries.keys().next()?.priority;
        let victim = *entries
            .keys()
            .take_while(|k| k.priority.total_cmp(&min_priority).is_eq())
            .min_by_key(|k| k.sequence)?;
        entries.remove(&victim);
        Some(victim.sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
