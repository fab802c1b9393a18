//! Per-key event batching with size-based and time-based flush triggers.
//!
//! Every distinct dataset/options pair gets its own [`Batch`]. Pushing to a
//! batch never waits on I/O: the first event arms a flush timer, and reaching
//! the size threshold flushes straight away. A flush swaps the buffer out
//! under the batch lock and hands it to an [`IngestSink`] on a spawned task.
//!
//! Flushes are single-flight per key. While one is in flight, further flush
//! calls share its outcome and newly pushed events wait for the next one, so
//! events for one key reach the sink in push order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::event::{BatchKey, Event, IngestOptions, IngestStatus};

/// Maximum buffer capacity to prevent memory issues.
/// If a buffer exceeds this, oldest events will be dropped.
const MAX_BUFFER_CAPACITY: usize = 10_000;

/// What a batch does with the events of a failed flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Report the failure and drop the events (at-most-once delivery)
    #[default]
    Drop,

    /// Put the events back at the front of the buffer when the failure is
    /// transient; they go out with the next flush
    Requeue,
}

/// Configuration for a batch.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Number of events to accumulate before flushing
    pub max_batch_size: usize,

    /// Duration to wait before flushing, even if batch size not reached
    pub flush_interval: Duration,

    /// Maximum number of events to hold in the buffer
    pub max_capacity: usize,

    pub failure_policy: FailurePolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1_000,
            flush_interval: Duration::from_secs(1),
            max_capacity: MAX_BUFFER_CAPACITY,
            failure_policy: FailurePolicy::Drop,
        }
    }
}

impl BatchConfig {
    /// Create a new batch config with the specified batch size and flush interval.
    pub fn new(max_batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            max_batch_size,
            flush_interval,
            ..Self::default()
        }
    }
}

/// Destination for flushed events.
#[async_trait]
pub trait IngestSink: Send + Sync {
    /// Send one batch of events to `dataset`.
    async fn ingest_events(
        &self,
        dataset: &str,
        events: &[Event],
        options: &IngestOptions,
    ) -> Result<IngestStatus>;
}

/// Callback receiving failures nobody awaits. Must not panic.
pub type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Outcome of a flush, shared by every caller waiting on it.
pub type FlushResult = std::result::Result<IngestStatus, Arc<ClientError>>;

/// A flush that may still be in flight. Cloning shares the same outcome.
pub type PendingFlush = Shared<BoxFuture<'static, FlushResult>>;

/// Statistics about batch operations.
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    /// Total number of events pushed
    pub events_received: u64,

    /// Total number of events delivered in successful flushes
    pub events_flushed: u64,

    /// Total number of events dropped due to overflow or failed flushes
    pub events_dropped: u64,

    /// Number of flushes triggered by the size threshold
    pub size_flushes: u64,

    /// Number of flushes triggered by the flush timer
    pub time_flushes: u64,

    /// Number of flushes that failed
    pub failed_flushes: u64,
}

struct Timer {
    id: u64,
    handle: AbortHandle,
}

struct BatchState {
    events: Vec<Event>,
    timer: Option<Timer>,
    next_timer_id: u64,
    in_flight: Option<PendingFlush>,
    stats: BatchStats,
}

/// Buffered events for one dataset/options pair.
pub struct Batch {
    key: BatchKey,
    config: BatchConfig,
    sink: Arc<dyn IngestSink>,
    on_error: ErrorHandler,
    state: Mutex<BatchState>,
}

impl Batch {
    pub fn new(
        dataset: impl Into<String>,
        options: IngestOptions,
        config: BatchConfig,
        sink: Arc<dyn IngestSink>,
        on_error: ErrorHandler,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: BatchKey {
                dataset: dataset.into(),
                options,
            },
            state: Mutex::new(BatchState {
                events: Vec::with_capacity(config.max_batch_size.min(MAX_BUFFER_CAPACITY)),
                timer: None,
                next_timer_id: 0,
                in_flight: None,
                stats: BatchStats::default(),
            }),
            config,
            sink,
            on_error,
        })
    }

    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append events to the buffer.
    ///
    /// Arms the flush timer when the buffer was empty and flushes right away
    /// once the size threshold is reached. Must be called within a Tokio runtime.
    pub fn push(self: &Arc<Self>, events: impl IntoIterator<Item = Event>) {
        let mut state = self.state();
        for event in events {
            self.add_entry(&mut state, event);
        }

        if state.events.is_empty() {
            return;
        }

        if state.events.len() >= self.config.max_batch_size && state.in_flight.is_none() {
            state.stats.size_flushes += 1;
            debug!(
                key = %self.key,
                batch_size = state.events.len(),
                "Flushing batch: batch size threshold reached"
            );
            drop(state);
            // Nobody waits on this flush; failures go to the error handler.
            let _ = self.flush();
            return;
        }

        if state.timer.is_none() {
            self.arm_timer(&mut state);
        }
    }

    /// Add an event to the buffer, handling overflow if necessary.
    fn add_entry(&self, state: &mut BatchState, event: Event) {
        state.stats.events_received += 1;

        if state.events.len() >= self.config.max_capacity {
            // Drop 10% to avoid frequent drops
            let drop_count = (state.events.len() / 10).max(1);

            warn!(
                key = %self.key,
                buffer_size = state.events.len(),
                drop_count = drop_count,
                max_capacity = self.config.max_capacity,
                "Buffer overflow: dropping oldest events"
            );

            state.events.drain(0..drop_count);
            state.stats.events_dropped += drop_count as u64;
        }

        state.events.push(event);
    }

    fn arm_timer(self: &Arc<Self>, state: &mut BatchState) {
        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let deadline = tokio::time::Instant::now() + self.config.flush_interval;
        let batch = Arc::clone(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            batch.on_timer(id);
        })
        .abort_handle();

        state.timer = Some(Timer { id, handle });
    }

    fn on_timer(self: &Arc<Self>, id: u64) {
        {
            let mut state = self.state();
            // A newer timer replaced this one, or a flush cancelled it.
            if state.timer.as_ref().map(|t| t.id) != Some(id) {
                return;
            }
            state.timer = None;

            if state.events.is_empty() {
                return;
            }
            state.stats.time_flushes += 1;
            debug!(
                key = %self.key,
                batch_size = state.events.len(),
                interval_ms = self.config.flush_interval.as_millis() as u64,
                "Flushing batch: flush interval elapsed"
            );
        }

        let _ = self.flush();
    }

    /// Send the buffered events now.
    ///
    /// Returns the in-flight flush if there is one. Otherwise swaps the
    /// buffer for an empty one, cancels the timer and starts sending on a
    /// spawned task, so the send completes even if the returned future is
    /// dropped. An empty buffer resolves immediately without a network call.
    pub fn flush(self: &Arc<Self>) -> PendingFlush {
        let mut state = self.state();

        if let Some(pending) = &state.in_flight {
            return pending.clone();
        }

        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }

        if state.events.is_empty() {
            return future::ready(Ok(IngestStatus::default())).boxed().shared();
        }

        let events = std::mem::take(&mut state.events);
        let batch = Arc::clone(self);
        let pending = async move { batch.send(events).await }.boxed().shared();
        state.in_flight = Some(pending.clone());
        drop(state);

        tokio::spawn(pending.clone());
        pending
    }

    async fn send(self: Arc<Self>, events: Vec<Event>) -> FlushResult {
        let count = events.len();
        debug!(key = %self.key, batch_size = count, "Sending batch");

        let result = self
            .sink
            .ingest_events(&self.key.dataset, &events, &self.key.options)
            .await;

        let mut state = self.state();
        state.in_flight = None;

        let outcome = match result {
            Ok(status) => {
                state.stats.events_flushed += count as u64;
                Ok(status)
            }
            Err(err) => {
                state.stats.failed_flushes += 1;
                if self.config.failure_policy == FailurePolicy::Requeue && err.is_retryable() {
                    self.requeue(&mut state, events);
                } else {
                    state.stats.events_dropped += count as u64;
                }
                Err(Arc::new(err))
            }
        };

        // Events pushed while this flush was in flight.
        let flush_again =
            outcome.is_ok() && state.events.len() >= self.config.max_batch_size;
        if !flush_again && !state.events.is_empty() && state.timer.is_none() {
            self.arm_timer(&mut state);
        }
        drop(state);

        if let Err(err) = &outcome {
            warn!(key = %self.key, batch_size = count, error = %err, "Failed to flush batch");
            (self.on_error)(&**err);
        }

        if flush_again {
            let _ = self.flush();
        }

        outcome
    }

    /// Restore failed events ahead of anything pushed since.
    fn requeue(&self, state: &mut BatchState, mut events: Vec<Event>) {
        events.append(&mut state.events);

        if events.len() > self.config.max_capacity {
            let drop_count = events.len() - self.config.max_capacity;
            warn!(
                key = %self.key,
                drop_count = drop_count,
                "Requeue overflow: dropping oldest events"
            );
            events.drain(0..drop_count);
            state.stats.events_dropped += drop_count as u64;
        }

        debug!(key = %self.key, batch_size = events.len(), "Requeued failed batch");
        state.events = events;
    }

    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    pub fn dataset(&self) -> &str {
        &self.key.dataset
    }

    /// Get the current number of buffered events.
    pub fn len(&self) -> usize {
        self.state().events.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.state().events.is_empty()
    }

    /// Whether a flush for this batch is in flight.
    pub fn is_flushing(&self) -> bool {
        self.state().in_flight.is_some()
    }

    /// Get current batch statistics.
    pub fn stats(&self) -> BatchStats {
        self.state().stats.clone()
    }

    /// Get the batch configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

/// Routes events to one [`Batch`] per dataset/options pair.
pub struct Batcher {
    config: BatchConfig,
    sink: Arc<dyn IngestSink>,
    on_error: ErrorHandler,
    batches: Mutex<HashMap<BatchKey, Arc<Batch>>>,
}

impl Batcher {
    pub fn new(config: BatchConfig, sink: Arc<dyn IngestSink>, on_error: ErrorHandler) -> Self {
        Self {
            config,
            sink,
            on_error,
            batches: Mutex::new(HashMap::new()),
        }
    }

    fn batches(&self) -> MutexGuard<'_, HashMap<BatchKey, Arc<Batch>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The batch for `dataset` and `options`, created on first use.
    pub fn batch(&self, dataset: &str, options: &IngestOptions) -> Arc<Batch> {
        let key = BatchKey::new(dataset, options);
        let mut batches = self.batches();
        Arc::clone(batches.entry(key).or_insert_with(|| {
            debug!(dataset = %dataset, "Creating batch");
            Batch::new(
                dataset,
                options.clone(),
                self.config.clone(),
                Arc::clone(&self.sink),
                Arc::clone(&self.on_error),
            )
        }))
    }

    /// Buffer events for `dataset`. Returns without waiting on I/O.
    pub fn push(
        &self,
        dataset: &str,
        events: impl IntoIterator<Item = Event>,
        options: &IngestOptions,
    ) {
        self.batch(dataset, options).push(events);
    }

    pub fn get(&self, key: &BatchKey) -> Option<Arc<Batch>> {
        self.batches().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<BatchKey> {
        self.batches().keys().cloned().collect()
    }

    /// Flush the batch with the given key. Unknown keys resolve immediately.
    pub fn flush(&self, key: &BatchKey) -> PendingFlush {
        match self.get(key) {
            Some(batch) => batch.flush(),
            None => future::ready(Ok(IngestStatus::default())).boxed().shared(),
        }
    }

    /// Flush every batch and wait until all of them settle.
    ///
    /// A failure for one key does not stop the others. If events arrived
    /// for a key while an earlier flush was in flight, that key is flushed
    /// once more.
    pub async fn flush_all(&self) -> Vec<(BatchKey, FlushResult)> {
        let batches: Vec<Arc<Batch>> = self.batches().values().cloned().collect();

        future::join_all(batches.into_iter().map(|batch| async move {
            let mut result = batch.flush().await;
            if !batch.is_empty() {
                result = batch.flush().await;
            }
            (batch.key().clone(), result)
        }))
        .await
    }
}
