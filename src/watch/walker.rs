//! Recursive descent over a decoded v2 response tree.
//!
//! The walker does two jobs in one pass: it folds every node's
//! modification index into the watcher's wait index, and it turns leaf
//! nodes into flat key-path events routed to matching listeners.

use std::sync::Arc;

use super::listener::Listener;
use super::queue::QueueEntry;
use super::response::{Node, WatchResponse};

/// Synthetic trailing segment appended to tombstone events.
pub const DELETE_MARKER: &str = "delete";
/// Synthetic key delivered to every active listener when a periodic
/// resynchronization starts, so consumers can discard stale state.
pub const FLUSH_MARKER: &str = "flush";

/// A leaf node flattened to a key path relative to the watch prefix.
pub(crate) struct LeafEvent {
    relative: String,
    value: String,
    tombstone: bool,
}

/// Result of the collection phase: the folded wait index plus the leaf
/// events found under the prefix.
pub(crate) struct Walked {
    pub(crate) index: u64,
    events: Vec<LeafEvent>,
}

/// Walks one parsed response for a fixed set of target listeners.
pub struct TreeWalker<'a> {
    /// Watch prefix, normalized with leading and trailing `/`.
    prefix: &'a str,
    listeners: &'a [Arc<Listener>],
}

impl<'a> TreeWalker<'a> {
    pub(crate) fn new(prefix: &'a str, listeners: &'a [Arc<Listener>]) -> Self {
        Self { prefix, listeners }
    }

    /// Collect leaf events and fold modification indexes.
    ///
    /// The returned index is at least `wait_index`, and greater than
    /// every modification index in the response, including nodes outside
    /// the prefix (the store reports the highest index it has seen
    /// anywhere in the response).
    pub(crate) fn collect(&self, response: &WatchResponse, wait_index: u64) -> Walked {
        let mut index = wait_index;
        let mut events = Vec::new();
        if let Some(node) = &response.node {
            self.visit(node, response.is_tombstone(), &mut index, &mut events);
        }
        Walked { index, events }
    }

    /// Collect and deliver in one step.
    pub(crate) fn walk(&self, response: &WatchResponse, wait_index: u64) -> u64 {
        let walked = self.collect(response, wait_index);
        self.deliver(&walked);
        walked.index
    }

    fn visit(&self, node: &Node, tombstone: bool, index: &mut u64, events: &mut Vec<LeafEvent>) {
        if let Some(modified) = node.modified_index {
            *index = (*index).max(modified + 1);
        }

        if node.dir {
            // Recurse into directories under the prefix and into
            // ancestors of it; siblings cannot contain watched keys.
            let key = node.key.trim_end_matches('/');
            let prefix = self.prefix.trim_end_matches('/');
            if key.starts_with(self.prefix) || prefix.starts_with(key) {
                for child in &node.nodes {
                    self.visit(child, tombstone, index, events);
                }
            }
            return;
        }

        let Some(relative) = self.strip_prefix(&node.key) else {
            return;
        };
        events.push(LeafEvent {
            relative: relative.to_string(),
            value: if tombstone {
                String::new()
            } else {
                node.value.clone().unwrap_or_default()
            },
            tombstone,
        });
    }

    fn strip_prefix<'k>(&self, key: &'k str) -> Option<&'k str> {
        if key == self.prefix.trim_end_matches('/') {
            return Some("");
        }
        key.strip_prefix(self.prefix)
    }

    /// Route the collected leaf events.
    ///
    /// One batch per listener per response: however many keys a response
    /// touches, a drainer blocked on that listener's queue is signaled
    /// once.
    pub(crate) fn deliver(&self, walked: &Walked) {
        let index = walked.index;
        for listener in self.listeners {
            let mut batch = None;
            for event in &walked.events {
                let Some(remainder) = listener.matches(&event.relative) else {
                    continue;
                };
                let synthetic = event.tombstone.then_some(DELETE_MARKER);
                let entry = QueueEntry {
                    key: listener.key_tuple(remainder, synthetic),
                    value: event.value.clone(),
                    source_index: index,
                };
                batch
                    .get_or_insert_with(|| listener.queue.begin())
                    .insert(entry);
            }
        }
    }
}

/// Deliver the synthetic flush marker to every listener, ahead of the
/// resynchronized tree for this cycle.
pub(crate) fn deliver_flush(listeners: &[Arc<Listener>], index: u64) {
    for listener in listeners {
        let entry = QueueEntry {
            key: listener.key_tuple("", Some(FLUSH_MARKER)),
            value: String::new(),
            source_index: index,
        };
        let mut batch = listener.queue.begin();
        batch.insert(entry);
    }
}
