//! Watch-and-dispatch engine over the etcd v2 keys API.
//!
//! This module watches one subtree of a remote key space and republishes
//! every change as per-listener event streams, so many subsystems in one
//! process can observe slices of the same namespace over one connection.
//!
//! # Architecture
//!
//! ```text
//! Watcher (public handle)
//!   - shared wait index + listener sets, one mutex
//!   - one PollEngine thread while running
//!         |
//!     PollEngine --- Fetch (HTTP long poll) ---> TreeWalker
//!         |                                          |
//!   wakeup channel / flush timer         per-listener DispatchQueue
//! ```

mod engine;
mod error;
mod fetch;
mod listener;
mod queue;
mod response;
mod walker;
mod watcher;

pub use error::WatchError;
pub use fetch::{ETCD_INDEX_HEADER, Fetch, FetchResponse, HttpFetcher};
pub use listener::{ListenerHandle, MAX_KEY_SEGMENTS, SegmentRemap};
pub use queue::{Batch, DispatchQueue, QueueEntry};
pub use response::{Node, WatchResponse};
pub use walker::{DELETE_MARKER, FLUSH_MARKER};
pub use watcher::Watcher;
