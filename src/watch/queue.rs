//! Per-listener coalescing mailbox.
//!
//! Each listener owns one [`DispatchQueue`]. The poll engine is the only
//! producer; the consumer thread that registered the listener is the only
//! drainer. Repeated updates to the same key within a polling cycle
//! collapse to the most recent value, so a slow consumer sees at most one
//! pending entry per key.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

/// One pending key/value event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Path segments; unique as a tuple within a queue.
    pub key: Vec<String>,
    /// Payload; empty for tombstones and synthetic markers.
    pub value: String,
    /// Watcher wait index at the time the entry was produced.
    pub source_index: u64,
}

/// Thread-safe mailbox that coalesces repeated updates to the same key.
///
/// Inserts go through a [`Batch`] so that a blocked drainer is woken at
/// most once per batch, and only when the queue transitions from empty to
/// non-empty. Entries keep insertion order; re-inserting an existing key
/// replaces the value and moves the entry to the tail.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    pending: Mutex<IndexMap<Vec<String>, QueueEntry>>,
    ready: Condvar,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a batched insert session.
    ///
    /// The queue stays locked until the returned [`Batch`] is committed
    /// or dropped.
    pub fn begin(&self) -> Batch<'_> {
        let guard = self.pending.lock();
        let was_empty = guard.is_empty();
        Batch {
            queue: self,
            guard,
            was_empty,
        }
    }

    /// Block until at least one entry is pending or the timeout elapses,
    /// then detach and return the whole pending list in insertion order.
    ///
    /// A timeout yields an empty vec; callers are expected to retry.
    /// Consumers observe only the most recent value per key - intermediate
    /// values inside one polling cycle are never delivered.
    pub fn drain(&self, timeout: Duration) -> Vec<QueueEntry> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while pending.is_empty() {
            // The condvar can wake spuriously; loop until the deadline.
            if self.ready.wait_until(&mut pending, deadline).timed_out() {
                return Vec::new();
            }
        }
        std::mem::take(&mut *pending).into_values().collect()
    }

    /// Number of distinct keys currently pending.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Exclusive insert session over a [`DispatchQueue`].
///
/// Dropping the batch commits it.
pub struct Batch<'a> {
    queue: &'a DispatchQueue,
    guard: MutexGuard<'a, IndexMap<Vec<String>, QueueEntry>>,
    was_empty: bool,
}

impl Batch<'_> {
    /// Insert an entry, replacing any pending entry with an identical key
    /// tuple. The entry always ends up at the tail of the pending list.
    pub fn insert(&mut self, entry: QueueEntry) {
        self.guard.shift_remove(&entry.key);
        self.guard.insert(entry.key.clone(), entry);
    }

    /// Release the queue, waking drainers if this batch filled an empty
    /// queue.
    pub fn commit(self) {
        // Drop does the work.
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if self.was_empty && !self.guard.is_empty() {
            self.queue.ready.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn entry(key: &[&str], value: &str, source_index: u64) -> QueueEntry {
        QueueEntry {
            key: key.iter().map(|s| s.to_string()).collect(),
            value: value.to_string(),
            source_index,
        }
    }

    #[test]
    fn test_drain_timeout_yields_empty() {
        let queue = DispatchQueue::new();
        let start = Instant::now();
        let drained = queue.drain(Duration::from_millis(50));
        assert!(drained.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_duplicate_key_keeps_latest_value_at_tail() {
        let queue = DispatchQueue::new();

        let mut batch = queue.begin();
        batch.insert(entry(&["foo", "config"], "port=8081", 10));
        batch.insert(entry(&["bar", "config"], "port=9000", 10));
        batch.insert(entry(&["foo", "config"], "port=8082", 11));
        batch.commit();

        let drained = queue.drain(Duration::from_millis(10));
        assert_eq!(drained.len(), 2);
        // bar kept its position, foo moved to the tail with the new value
        assert_eq!(drained[0].key, vec!["bar", "config"]);
        assert_eq!(drained[1].key, vec!["foo", "config"]);
        assert_eq!(drained[1].value, "port=8082");
        assert_eq!(drained[1].source_index, 11);
    }

    #[test]
    fn test_duplicate_across_batches() {
        let queue = DispatchQueue::new();

        let mut batch = queue.begin();
        batch.insert(entry(&["a"], "1", 1));
        batch.commit();

        let mut batch = queue.begin();
        batch.insert(entry(&["a"], "2", 2));
        batch.commit();

        let drained = queue.drain(Duration::from_millis(10));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].value, "2");
    }

    #[test]
    fn test_batch_wakes_blocked_drainer() {
        let queue = Arc::new(DispatchQueue::new());
        let producer = Arc::clone(&queue);

        let drainer = thread::spawn(move || queue.drain(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(50));
        let mut batch = producer.begin();
        batch.insert(entry(&["svc", "a"], "x", 3));
        batch.insert(entry(&["svc", "b"], "y", 3));
        batch.commit();

        let drained = drainer.join().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].key, vec!["svc", "a"]);
        assert_eq!(drained[1].key, vec!["svc", "b"]);
    }

    #[test]
    fn test_drain_resets_queue() {
        let queue = DispatchQueue::new();
        let mut batch = queue.begin();
        batch.insert(entry(&["k"], "v", 1));
        batch.commit();

        assert_eq!(queue.drain(Duration::from_millis(10)).len(), 1);
        assert!(queue.is_empty());
        assert!(queue.drain(Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn test_empty_batch_does_not_wake() {
        let queue = DispatchQueue::new();
        let batch = queue.begin();
        batch.commit();
        // No entries were inserted; a drain must still time out.
        assert!(queue.drain(Duration::from_millis(20)).is_empty());
    }
}
