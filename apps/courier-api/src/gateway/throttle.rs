//! Outbound throttling: per-key batching with deferred flush.
//!
//! Each delivery key is a two-state machine — idle, or flush-scheduled.
//! Two triggers converge on the same flush routine: the queue reaching the
//! batch ceiling (synchronous, immediate) and the interval timer firing
//! (deferred). A flush hands the whole queue to the callback in insertion
//! order, then the key goes back to idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::envelope::Envelope;

/// Receives the entire batch for a key in one call.
pub type FlushFn = Arc<dyn Fn(Vec<Envelope>) + Send + Sync>;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_BATCH: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// How long the first queued envelope may wait before a deferred flush.
    pub interval: Duration,
    /// Queue length that triggers an immediate synchronous flush.
    pub max_batch: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

struct KeyQueue {
    pending: Vec<Envelope>,
    /// Generation-tagged timer handle. Present iff the queue is non-empty
    /// and below the batch ceiling. The generation lets a timer that lost
    /// the race detect that its queue was already flushed or cleared.
    timer: Option<(u64, JoinHandle<()>)>,
}

/// Per-key outbound batcher. Keys are independent; clearing or flushing one
/// never touches another.
pub struct Throttler {
    queues: Arc<Mutex<HashMap<String, KeyQueue>>>,
    config: ThrottleConfig,
    timer_seq: AtomicU64,
}

impl Throttler {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            config,
            timer_seq: AtomicU64::new(0),
        }
    }

    /// Queue an envelope under the key, using this throttler's defaults.
    pub fn add(&self, key: &str, envelope: Envelope, on_flush: FlushFn) {
        self.add_with(key, envelope, on_flush, self.config);
    }

    /// Queue an envelope with an explicit interval and batch ceiling.
    ///
    /// Reaching the ceiling flushes synchronously on the caller's stack;
    /// otherwise the first queued envelope arms a deferred-flush timer.
    pub fn add_with(
        &self,
        key: &str,
        envelope: Envelope,
        on_flush: FlushFn,
        config: ThrottleConfig,
    ) {
        let batch = {
            let mut queues = self.queues.lock();
            let entry = queues.entry(key.to_string()).or_insert_with(|| KeyQueue {
                pending: Vec::new(),
                timer: None,
            });
            entry.pending.push(envelope);

            if entry.pending.len() >= config.max_batch {
                if let Some((_, handle)) = entry.timer.take() {
                    handle.abort();
                }
                let batch = std::mem::take(&mut entry.pending);
                queues.remove(key);
                Some(batch)
            } else {
                if entry.timer.is_none() {
                    let generation = self.timer_seq.fetch_add(1, Ordering::Relaxed);
                    let handle = self.spawn_timer(
                        key.to_string(),
                        generation,
                        config.interval,
                        Arc::clone(&on_flush),
                    );
                    entry.timer = Some((generation, handle));
                }
                None
            }
        };

        // Callback runs outside the lock so it may safely re-enter.
        if let Some(batch) = batch {
            on_flush(batch);
        }
    }

    fn spawn_timer(
        &self,
        key: String,
        generation: u64,
        interval: Duration,
        on_flush: FlushFn,
    ) -> JoinHandle<()> {
        let queues = Arc::clone(&self.queues);
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let batch = {
                let mut map = queues.lock();
                let Some(entry) = map.get_mut(&key) else {
                    return;
                };
                match entry.timer {
                    Some((g, _)) if g == generation => {}
                    _ => return,
                }
                entry.timer = None;
                let batch = std::mem::take(&mut entry.pending);
                map.remove(&key);
                batch
            };
            if !batch.is_empty() {
                on_flush(batch);
            }
        })
    }

    /// Discard one key's queued envelopes without delivering them.
    pub fn clear(&self, key: &str) {
        let mut queues = self.queues.lock();
        if let Some(mut entry) = queues.remove(key) {
            if let Some((_, handle)) = entry.timer.take() {
                handle.abort();
            }
        }
    }

    /// Discard everything (shutdown or explicit reset).
    pub fn clear_all(&self) {
        let mut queues = self.queues.lock();
        for entry in queues.values_mut() {
            if let Some((_, handle)) = entry.timer.take() {
                handle.abort();
            }
        }
        queues.clear();
    }

    pub fn pending_count(&self, key: &str) -> usize {
        self.queues
            .lock()
            .get(key)
            .map_or(0, |entry| entry.pending.len())
    }

    pub fn has_pending_timer(&self, key: &str) -> bool {
        self.queues
            .lock()
            .get(key)
            .is_some_and(|entry| entry.timer.is_some())
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}
