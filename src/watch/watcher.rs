//! Public watcher handle: lifecycle and the listener registration
//! protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;

use super::engine::{EngineConfig, PollEngine};
use super::error::WatchError;
use super::fetch::{Fetch, HttpFetcher};
use super::listener::{Listener, ListenerHandle, SegmentRemap};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// State shared between the watcher handle and its poll engine thread.
pub(crate) struct Shared {
    pub(crate) server_url: String,
    /// Watch prefix, normalized with leading and trailing `/`.
    pub(crate) prefix: String,
    pub(crate) state: Mutex<SharedState>,
}

pub(crate) struct SharedState {
    /// Monotonic consistency cursor; 0 until seeded. The poll engine is
    /// the sole writer while running.
    pub(crate) wait_index: u64,
    /// Listeners adopted by the poll loop.
    pub(crate) listeners: Vec<Arc<Listener>>,
    /// Listeners registered while running, not yet caught up.
    pub(crate) pending: Vec<Arc<Listener>>,
    /// Interval between full resynchronizations; `None` disables them.
    pub(crate) flush_period: Option<Duration>,
    pub(crate) running: bool,
}

impl Shared {
    /// Snapshot the active listener set for a walk, so queue writes
    /// happen outside the watcher lock.
    pub(crate) fn active_listeners(&self) -> Vec<Arc<Listener>> {
        self.state.lock().listeners.clone()
    }
}

struct EngineThread {
    cancel: CancellationToken,
    wakeup: mpsc::UnboundedSender<()>,
    thread: std::thread::JoinHandle<()>,
}

/// Watches one subtree of an etcd v2 key space and republishes every
/// change to registered listeners.
///
/// Each started watcher owns exactly one background poll thread.
/// Listeners can be added and removed from any thread at any time,
/// including while a long poll is in flight.
pub struct Watcher {
    shared: Arc<Shared>,
    fetcher: Arc<dyn Fetch>,
    engine_config: EngineConfig,
    next_listener_id: AtomicU64,
    engine: Option<EngineThread>,
}

impl Watcher {
    /// Create a watcher for `prefix` on the store at `server_url`.
    pub fn new(server_url: &str, prefix: &str) -> Result<Self, WatchError> {
        let fetcher = Arc::new(HttpFetcher::new(DEFAULT_REQUEST_TIMEOUT)?);
        Ok(Self::with_fetcher(server_url, prefix, fetcher))
    }

    /// Create a watcher from layered [`Settings`].
    pub fn with_settings(settings: &Settings) -> Result<Self, WatchError> {
        let timeout = Duration::from_secs(settings.watch.request_timeout_secs);
        let fetcher = Arc::new(HttpFetcher::new(timeout)?);
        let mut watcher = Self::with_fetcher(&settings.server_url, &settings.prefix, fetcher);
        watcher.engine_config = EngineConfig {
            backoff_initial: Duration::from_millis(settings.watch.backoff_initial_ms),
            backoff_max: Duration::from_millis(settings.watch.backoff_max_ms),
        };
        if settings.watch.flush_period_secs > 0 {
            watcher.set_flush_period(Some(Duration::from_secs(settings.watch.flush_period_secs)));
        }
        Ok(watcher)
    }

    /// Create a watcher over a caller-supplied transport.
    pub fn with_fetcher(server_url: &str, prefix: &str, fetcher: Arc<dyn Fetch>) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        };
        Self {
            shared: Arc::new(Shared {
                server_url: server_url.trim_end_matches('/').to_string(),
                prefix,
                state: Mutex::new(SharedState {
                    wait_index: 0,
                    listeners: Vec::new(),
                    pending: Vec::new(),
                    flush_period: None,
                    running: false,
                }),
            }),
            fetcher,
            engine_config: EngineConfig::default(),
            next_listener_id: AtomicU64::new(1),
            engine: None,
        }
    }

    /// Register a listener for `path` relative to the watch prefix.
    ///
    /// Before `start()` the listener joins the active set directly. While
    /// running it is parked in the pending set and the poll thread is
    /// woken to give it a dedicated catch-up fetch; should the wakeup
    /// push fail (the poll thread is gone), the listener is adopted
    /// directly so a registration never stalls.
    pub fn add_listener(&self, path: &str, remap: Option<SegmentRemap>) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener = Listener::new(id, path, remap);
        let handle = ListenerHandle {
            listener: Arc::clone(&listener),
        };

        let mut state = self.shared.state.lock();
        if !state.running {
            state.listeners.push(listener);
            return handle;
        }

        state.pending.push(listener);
        let woken = self
            .engine
            .as_ref()
            .is_some_and(|e| e.wakeup.send(()).is_ok());
        if !woken {
            tracing::warn!(
                "[watcher] wakeup push failed, adopting listener '{path}' without catch-up"
            );
            if let Some(listener) = state.pending.pop() {
                state.listeners.push(listener);
            }
        }
        handle
    }

    /// Deregister a listener, whether active or still pending.
    /// Safe to call while the poll loop is mid-response; the listener's
    /// queue dies with its last handle.
    pub fn remove_listener(&self, handle: &ListenerHandle) {
        let id = handle.listener.id;
        let mut state = self.shared.state.lock();
        state.listeners.retain(|l| l.id != id);
        state.pending.retain(|l| l.id != id);
    }

    /// Enable or disable the periodic full resynchronization.
    pub fn set_flush_period(&self, period: Option<Duration>) {
        self.shared.state.lock().flush_period = period;
    }

    /// Start the background poll thread.
    pub fn start(&mut self) -> Result<(), WatchError> {
        if self.engine.is_some() {
            return Err(WatchError::AlreadyRunning);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WatchError::InitFailed {
                reason: e.to_string(),
            })?;

        let cancel = CancellationToken::new();
        let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();
        let engine = PollEngine::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.fetcher),
            wakeup_rx,
            cancel.clone(),
            self.engine_config.clone(),
        );

        self.shared.state.lock().running = true;
        let thread = std::thread::Builder::new()
            .name("etcdwatch-poll".to_string())
            .spawn(move || runtime.block_on(engine.run()))
            .map_err(|e| {
                self.shared.state.lock().running = false;
                WatchError::SpawnFailed {
                    reason: e.to_string(),
                }
            })?;

        self.engine = Some(EngineThread {
            cancel,
            wakeup: wakeup_tx,
            thread,
        });
        crate::log_event!("watcher", "started", "prefix={}", self.shared.prefix);
        Ok(())
    }

    /// Stop and join the poll thread.
    ///
    /// Unblocks any in-flight wait within one bounded I/O wait; no queue
    /// writes happen after this returns. A no-op if not running.
    pub fn stop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        engine.cancel.cancel();
        drop(engine.wakeup);
        if engine.thread.join().is_err() {
            tracing::error!("[watcher] poll thread panicked");
        }
        self.shared.state.lock().running = false;
        crate::log_event!("watcher", "stopped");
    }

    /// Current consistency cursor; 0 until the first response is
    /// processed.
    pub fn wait_index(&self) -> u64 {
        self.shared.state.lock().wait_index
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_some()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}
