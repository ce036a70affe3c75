//! The poll engine: long-poll fetch loop, periodic flush cycle, catch-up
//! fetches for late registrations, and failure backoff.
//!
//! One engine runs per started watcher, on its own thread, as the sole
//! writer of the shared wait index and the sole producer into listener
//! queues. Registrations reach it through a wakeup channel that is raced
//! against the in-flight fetch, so a new listener never waits for a
//! long poll to return on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::WatchError;
use super::fetch::{Fetch, FetchResponse};
use super::listener::Listener;
use super::response::WatchResponse;
use super::walker::{self, TreeWalker};
use super::watcher::Shared;

/// Backoff bounds for failed fetches.
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    pub(crate) backoff_initial: Duration,
    pub(crate) backoff_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

/// The request the engine is about to issue.
enum FetchKind {
    /// Entire subtree, no wait parameter; seeds the wait index from the
    /// index response header when it is not yet known.
    Full,
    /// `wait=true&waitIndex=N` long poll from the shared cursor.
    LongPoll,
    /// One-off full fetch scoped to a newly registered listener's path,
    /// leaving the shared cursor undisturbed.
    Catchup(Arc<Listener>),
}

/// What the select loop observed this iteration.
enum Tick {
    Cancelled,
    FlushDue,
    Wakeup(Option<()>),
    Fetched(Result<FetchResponse, WatchError>),
}

pub(crate) struct PollEngine {
    shared: Arc<Shared>,
    fetcher: Arc<dyn Fetch>,
    wakeup: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
    config: EngineConfig,
    backoff: Duration,
    /// A flush timer fired; the next fetch is a full resync.
    flush_pending: bool,
    /// The first full fetch completed and the cursor is trustworthy.
    seeded: bool,
    last_flush: Instant,
}

impl PollEngine {
    pub(crate) fn new(
        shared: Arc<Shared>,
        fetcher: Arc<dyn Fetch>,
        wakeup: mpsc::UnboundedReceiver<()>,
        cancel: CancellationToken,
        config: EngineConfig,
    ) -> Self {
        let backoff = config.backoff_initial;
        Self {
            shared,
            fetcher,
            wakeup,
            cancel,
            config,
            backoff,
            flush_pending: false,
            seeded: false,
            last_flush: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) {
        crate::log_event!("engine", "polling", "{}", self.shared.prefix);
        let fetcher = Arc::clone(&self.fetcher);
        let cancel = self.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let kind = self.next_fetch();
            let url = self.url_for(&kind);
            let flush_armed = !self.flush_pending;
            let flush_deadline = self.flush_deadline();
            // A wakeup may abort an idle long poll, but never an
            // in-flight catch-up; the pending listener it announces is
            // picked up right after.
            let interruptible = !matches!(kind, FetchKind::Catchup(_));

            let tick = tokio::select! {
                biased;
                _ = cancel.cancelled() => Tick::Cancelled,
                _ = wait_until(flush_deadline), if flush_armed => Tick::FlushDue,
                received = self.wakeup.recv(), if interruptible => Tick::Wakeup(received),
                result = fetcher.get(&url) => Tick::Fetched(result),
            };

            let failure = match tick {
                Tick::Cancelled => break,
                Tick::FlushDue => {
                    crate::debug_event!("engine", "flush due");
                    self.flush_pending = true;
                    continue;
                }
                Tick::Wakeup(Some(())) => continue,
                Tick::Wakeup(None) => break,
                Tick::Fetched(Ok(response)) => self.apply(&kind, &url, response),
                Tick::Fetched(Err(e)) => Some(e),
            };

            if let Some(reason) = failure {
                tracing::warn!("[engine] {reason}, retrying in {:?}", self.backoff);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.backoff) => {}
                }
                self.backoff = (self.backoff * 2).min(self.config.backoff_max);
            }
        }
        crate::debug_event!("engine", "exited");
    }

    /// Pick the next request: a due flush wins, then one pending
    /// registration, then the regular poll.
    fn next_fetch(&self) -> FetchKind {
        if self.flush_pending || !self.seeded {
            return FetchKind::Full;
        }
        // The pending listener stays in the set until its catch-up
        // succeeds, so a failed catch-up retries the same listener.
        if let Some(listener) = self.shared.state.lock().pending.first() {
            return FetchKind::Catchup(Arc::clone(listener));
        }
        FetchKind::LongPoll
    }

    fn url_for(&self, kind: &FetchKind) -> String {
        let base = format!("{}/v2/keys{}", self.shared.server_url, self.shared.prefix);
        match kind {
            FetchKind::Full => format!("{base}?recursive=true"),
            FetchKind::LongPoll => {
                let wait_index = self.shared.state.lock().wait_index;
                format!("{base}?recursive=true&wait=true&waitIndex={wait_index}")
            }
            FetchKind::Catchup(listener) => format!("{base}{}?recursive=true", listener.path),
        }
    }

    fn flush_deadline(&self) -> Option<Instant> {
        let period = self.shared.state.lock().flush_period?;
        Some(self.last_flush + period)
    }

    /// Process one successful fetch. A body that is not a usable
    /// response comes back as a protocol error, retried exactly like a
    /// transport failure.
    fn apply(&mut self, kind: &FetchKind, url: &str, response: FetchResponse) -> Option<WatchError> {
        let parsed = match WatchResponse::parse(&response.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Some(WatchError::Protocol {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        self.backoff = self.config.backoff_initial;

        match kind {
            FetchKind::Full => {
                // The marker means "discard state for what follows"; an
                // unseeded watcher has delivered nothing to discard, so
                // a flush timer firing before the first synchronization
                // does not produce one.
                let flushing = self.flush_pending && self.seeded;
                let (listeners, wait_index) = {
                    let mut state = self.shared.state.lock();
                    if state.wait_index == 0
                        && let Some(index) = response.etcd_index
                    {
                        state.wait_index = index + 1;
                    }
                    (state.listeners.clone(), state.wait_index)
                };
                // Consumers get the flush marker before the re-delivered
                // tree, so they can tell stale keys from refreshed ones.
                if flushing {
                    walker::deliver_flush(&listeners, wait_index);
                }
                let walker = TreeWalker::new(&self.shared.prefix, &listeners);
                let walked = walker.collect(&parsed, wait_index);
                let updated = walked.index;
                // Cursor first, delivery second: a consumer woken by the
                // batch always observes an up-to-date wait index.
                self.shared.state.lock().wait_index = updated;
                walker.deliver(&walked);
                self.seeded = true;
                self.flush_pending = false;
                self.last_flush = Instant::now();
                crate::log_event!(
                    "engine",
                    if flushing { "flushed" } else { "synchronized" },
                    "waitIndex={updated}"
                );
            }
            FetchKind::LongPoll => {
                let listeners = self.shared.active_listeners();
                let wait_index = self.shared.state.lock().wait_index;
                let walker = TreeWalker::new(&self.shared.prefix, &listeners);
                let walked = walker.collect(&parsed, wait_index);
                let updated = walked.index;
                self.shared.state.lock().wait_index = updated;
                walker.deliver(&walked);
                crate::debug_event!("engine", "change", "waitIndex={updated}");
            }
            FetchKind::Catchup(listener) => {
                // Scoped to the new listener only; the shared cursor may
                // move forward from what the catch-up saw, never back.
                let preproc_index = self.shared.state.lock().wait_index;
                let targets = [Arc::clone(listener)];
                let walker = TreeWalker::new(&self.shared.prefix, &targets);
                let walked = walker.collect(&parsed, preproc_index);
                self.shared.state.lock().wait_index = preproc_index.max(walked.index);
                walker.deliver(&walked);
                let mut state = self.shared.state.lock();
                if let Some(pos) = state.pending.iter().position(|l| l.id == listener.id) {
                    let adopted = state.pending.remove(pos);
                    state.listeners.push(adopted);
                    crate::log_event!("engine", "caught up", "{}", listener.path);
                }
            }
        }
        None
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
