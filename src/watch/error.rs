//! Error types for the watch subsystem.

use thiserror::Error;

/// Errors from watcher operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("Malformed response from {url}: {reason}")]
    Protocol { url: String, reason: String },

    #[error("Watcher is already running")]
    AlreadyRunning,

    #[error("Failed to spawn poll thread: {reason}")]
    SpawnFailed { reason: String },
}
