//! Listener registration: path filtering and segment transposition.

use std::sync::Arc;
use std::time::Duration;

use super::queue::{DispatchQueue, QueueEntry};

/// Upper bound on delivered key-tuple length. Longer keys indicate a
/// configuration or data problem upstream: they fail a debug assertion,
/// and release builds log at error level and truncate.
pub const MAX_KEY_SEGMENTS: usize = 16;

/// Reorders a key's path segments before delivery to a listener.
///
/// Slot `remap[i]` is the output position for natural segment `i`; a
/// position past the end of the remap stays where it is. A synthetic
/// trailing marker (tombstone or flush) uses the slot assigned to the
/// position immediately after the last real segment. The slots must form
/// a permutation of output positions; colliding slots overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRemap(Vec<usize>);

impl SegmentRemap {
    pub fn new(slots: impl Into<Vec<usize>>) -> Self {
        Self(slots.into())
    }

    fn slot(&self, position: usize) -> usize {
        self.0.get(position).copied().unwrap_or(position)
    }

    /// Place `segments`, plus an optional synthetic trailing marker, into
    /// their output slots.
    pub fn apply(&self, segments: &[String], synthetic: Option<&str>) -> Vec<String> {
        let len = segments.len() + usize::from(synthetic.is_some());
        let mut out = vec![String::new(); len];
        for (i, segment) in segments.iter().enumerate() {
            out[self.slot(i).min(len - 1)] = segment.clone();
        }
        if let Some(marker) = synthetic {
            out[self.slot(segments.len()).min(len - 1)] = marker.to_string();
        }
        out
    }
}

/// A registered consumer of one sub-path of the watch prefix.
///
/// Never mutated after construction; the poll engine and consumer threads
/// share it through `Arc` and synchronize only on the queue.
pub(crate) struct Listener {
    /// Relative path this listener cares about; empty means everything
    /// under the watch prefix.
    pub(crate) path: String,
    pub(crate) remap: Option<SegmentRemap>,
    pub(crate) queue: Arc<DispatchQueue>,
    pub(crate) id: u64,
}

impl Listener {
    pub(crate) fn new(id: u64, path: &str, remap: Option<SegmentRemap>) -> Arc<Self> {
        Arc::new(Self {
            path: path.trim_matches('/').to_string(),
            remap,
            queue: Arc::new(DispatchQueue::new()),
            id,
        })
    }

    /// Boundary-correct prefix match.
    ///
    /// The filter must be a literal prefix of `relative_key` and the next
    /// character must be `/` or end-of-string, so a filter `search` never
    /// matches `searchengine/x`. Returns the remainder after the filter.
    pub(crate) fn matches<'k>(&self, relative_key: &'k str) -> Option<&'k str> {
        if self.path.is_empty() {
            return Some(relative_key);
        }
        let rest = relative_key.strip_prefix(self.path.as_str())?;
        match rest.as_bytes().first() {
            None => Some(""),
            Some(b'/') => Some(&rest[1..]),
            Some(_) => None,
        }
    }

    /// Build the delivered key tuple for a matched remainder, applying
    /// the remap and appending the synthetic marker if any.
    pub(crate) fn key_tuple(&self, remainder: &str, synthetic: Option<&str>) -> Vec<String> {
        let mut segments: Vec<String> = remainder
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if segments.len() > MAX_KEY_SEGMENTS {
            tracing::error!(
                "[listener] key exceeds {MAX_KEY_SEGMENTS} segments, truncating: {remainder}"
            );
            debug_assert!(
                segments.len() <= MAX_KEY_SEGMENTS,
                "key exceeds {MAX_KEY_SEGMENTS} segments: {remainder}"
            );
            segments.truncate(MAX_KEY_SEGMENTS);
        }
        match &self.remap {
            Some(remap) => remap.apply(&segments, synthetic),
            None => {
                if let Some(marker) = synthetic {
                    segments.push(marker.to_string());
                }
                segments
            }
        }
    }
}

/// Public handle to a registered listener's queue.
///
/// Draining is the only way data leaves the watcher. Dropping the handle
/// does not deregister the listener; call [`Watcher::remove_listener`]
/// for that.
///
/// [`Watcher::remove_listener`]: super::Watcher::remove_listener
#[derive(Clone)]
pub struct ListenerHandle {
    pub(crate) listener: Arc<Listener>,
}

impl ListenerHandle {
    /// Block until events are pending or the timeout elapses, returning
    /// the coalesced batch in insertion order. Timeout yields an empty
    /// vec.
    pub fn drain(&self, timeout: Duration) -> Vec<QueueEntry> {
        self.listener.queue.drain(timeout)
    }

    /// The relative path filter this listener was registered with.
    pub fn path(&self) -> &str {
        &self.listener.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_match_requires_segment_boundary() {
        let listener = Listener::new(1, "search", None);
        assert_eq!(listener.matches("search"), Some(""));
        assert_eq!(listener.matches("search/asearch"), Some("asearch"));
        assert_eq!(listener.matches("searchengine/x"), None);
        assert_eq!(listener.matches("sea"), None);
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let listener = Listener::new(1, "", None);
        assert_eq!(listener.matches("anything/at/all"), Some("anything/at/all"));
        assert_eq!(listener.matches(""), Some(""));
    }

    #[test]
    fn test_filter_slashes_are_normalized() {
        let listener = Listener::new(1, "/search/asearch/", None);
        assert_eq!(listener.matches("search/asearch/foo"), Some("foo"));
    }

    #[test]
    fn test_key_tuple_without_remap() {
        let listener = Listener::new(1, "search/asearch", None);
        assert_eq!(
            listener.key_tuple("foo/config", None),
            segs(&["foo", "config"])
        );
        assert_eq!(
            listener.key_tuple("foo/config", Some("delete")),
            segs(&["foo", "config", "delete"])
        );
    }

    #[test]
    fn test_remap_reorders_segments() {
        let listener = Listener::new(1, "search/asearch", Some(SegmentRemap::new([1usize, 0])));
        assert_eq!(
            listener.key_tuple("foo/config", None),
            segs(&["config", "foo"])
        );
    }

    #[test]
    fn test_remap_places_synthetic_marker() {
        // Marker position (2) is not remapped, so it stays trailing.
        let listener = Listener::new(1, "svc", Some(SegmentRemap::new([1usize, 0])));
        assert_eq!(
            listener.key_tuple("a/b", Some("delete")),
            segs(&["b", "a", "delete"])
        );
    }

    #[test]
    fn test_remap_can_relocate_marker() {
        // Three slots: real segments to 1 and 2, marker to 0.
        let listener = Listener::new(1, "svc", Some(SegmentRemap::new([1usize, 2, 0])));
        assert_eq!(
            listener.key_tuple("a/b", Some("flush")),
            segs(&["flush", "a", "b"])
        );
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "key exceeds")]
    fn test_oversized_key_fails_debug_assertion() {
        let listener = Listener::new(1, "", None);
        let long = (0..20).map(|i| i.to_string()).collect::<Vec<_>>().join("/");
        listener.key_tuple(&long, None);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_oversized_key_is_truncated() {
        let listener = Listener::new(1, "", None);
        let long = (0..20).map(|i| i.to_string()).collect::<Vec<_>>().join("/");
        let tuple = listener.key_tuple(&long, None);
        assert_eq!(tuple.len(), MAX_KEY_SEGMENTS);
        assert_eq!(tuple[0], "0");
        assert_eq!(tuple[MAX_KEY_SEGMENTS - 1], "15");
    }
}
