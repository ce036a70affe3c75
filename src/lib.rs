pub mod config;
pub mod logging;
pub mod watch;

pub use config::Settings;
pub use watch::{
    DELETE_MARKER, DispatchQueue, FLUSH_MARKER, Fetch, FetchResponse, HttpFetcher, ListenerHandle,
    QueueEntry, SegmentRemap, WatchError, Watcher,
};
