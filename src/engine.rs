//! The tracking engine — queue, paced consumer loop, and public surface.
//!
//! [`TrackingView`] ties the pieces together: producers push upserts into an
//! unbounded queue (directly via [`add_item`](TrackingView::add_item) or by
//! forwarding a stream registered with [`listen`](TrackingView::listen)); a
//! single consumer task dequeues at most one record per paced tick, runs it
//! through the [`TrackedState`] pipeline, and fans the resulting structural
//! edits out over a broadcast channel.
//!
//! # Concurrency model
//!
//! The snapshot and live view are only ever mutated under one mutex, taken
//! by the consumer task per tick and by the synchronous mutators
//! ([`remove_item`](TrackingView::remove_item),
//! [`set_comparer`](TrackingView::set_comparer),
//! [`set_filter`](TrackingView::set_filter)) for the duration of one edit.
//! Slow event subscribers never block the consumer; they lag and skip ahead
//! on the broadcast channel instead.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_stream::{Stream, StreamExt};

use crate::event::ChangeEvent;
use crate::handle::{EventSubscription, ViewHandle};
use crate::pacing::PacingController;
use crate::record::{Comparer, Filter, SharedRecord, Trackable};
use crate::state::TrackedState;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Configuration and metrics
// ---------------------------------------------------------------------------

/// Tuning knobs for a [`TrackingView`].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Requested interval between consumer ticks. Zero disables pacing and
    /// the consumer drains the queue as fast as it can.
    pub processing_delay: Duration,
    /// Dead band around the requested interval inside which the pacing
    /// feedback leaves the working delay alone.
    pub delay_tolerance: Duration,
    /// Capacity of the change-event broadcast ring. Subscribers that fall
    /// further behind than this skip ahead and observe a lag error.
    pub event_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            processing_delay: Duration::from_millis(10),
            delay_tolerance: Duration::from_millis(1),
            event_capacity: 1024,
        }
    }
}

/// Point-in-time counters for one [`TrackingView`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerMetrics {
    /// Upserts pulled off the queue and applied.
    pub items_processed: u64,
    /// Structural edits broadcast to subscribers.
    pub events_emitted: u64,
    /// Paced ticks that found the queue empty.
    pub idle_ticks: u64,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

const LIFECYCLE_UNINITIALIZED: u8 = 0;
const LIFECYCLE_LISTENING: u8 = 1;
const LIFECYCLE_DISPOSED: u8 = 2;

// ---------------------------------------------------------------------------
// TrackingView
// ---------------------------------------------------------------------------

/// An incremental sorted/filtered live view over a stream of upserts.
///
/// Cheap to clone; all clones share the same engine.
pub struct TrackingView<T: Trackable> {
    inner: Arc<Inner<T>>,
}

impl<T: Trackable> Clone for TrackingView<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: Trackable> {
    state: Arc<Mutex<TrackedState<T>>>,
    queue_tx: mpsc::UnboundedSender<T>,
    /// Taken exactly once, by the first successful `subscribe`.
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
    events_tx: broadcast::Sender<ChangeEvent<T>>,
    records_tx: broadcast::Sender<SharedRecord<T>>,
    lifecycle: AtomicU8,
    consumer_started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Requested inter-tick delay in nanoseconds, read by the consumer at
    /// the top of every tick.
    requested_delay: AtomicU64,
    tolerance: Duration,
    items_processed: AtomicU64,
    events_emitted: AtomicU64,
    idle_ticks: AtomicU64,
}

impl<T: Trackable> TrackingView<T> {
    /// Creates an engine with [`TrackerConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    /// Creates an engine with explicit tuning.
    #[must_use]
    pub fn with_config(config: TrackerConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (records_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Arc::new(Mutex::new(TrackedState::new())),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                events_tx,
                records_tx,
                lifecycle: AtomicU8::new(LIFECYCLE_UNINITIALIZED),
                consumer_started: AtomicBool::new(false),
                shutdown_tx,
                shutdown_rx,
                requested_delay: AtomicU64::new(nanos_u64(config.processing_delay)),
                tolerance: config.delay_tolerance,
                items_processed: AtomicU64::new(0),
                events_emitted: AtomicU64::new(0),
                idle_ticks: AtomicU64::new(0),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Sources and lifecycle
    // -----------------------------------------------------------------------

    /// Registers an upsert source. Records are forwarded into the pending
    /// queue as the stream yields them; processing starts once
    /// [`subscribe`](Self::subscribe) is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`dispose`](Self::dispose).
    pub fn listen<S>(&self, source: S) -> Result<()>
    where
        S: Stream<Item = T> + Send + 'static,
    {
        self.ensure_not_disposed()?;
        let tx = self.inner.queue_tx.clone();
        let mut shutdown = self.inner.shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::pin!(source);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    item = source.next() => {
                        match item {
                            Some(item) => {
                                if tx.send(item).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
        let _ = self.inner.lifecycle.compare_exchange(
            LIFECYCLE_UNINITIALIZED,
            LIFECYCLE_LISTENING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Ok(())
    }

    /// Starts the consumer loop. Idempotent; every call after the first is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] before [`listen`](Self::listen) and
    /// [`Error::Disposed`] after [`dispose`](Self::dispose).
    pub fn subscribe(&self) -> Result<()> {
        match self.inner.lifecycle.load(Ordering::Acquire) {
            LIFECYCLE_DISPOSED => return Err(Error::Disposed),
            LIFECYCLE_UNINITIALIZED => return Err(Error::NotInitialized),
            _ => {}
        }
        if !self.inner.consumer_started.swap(true, Ordering::AcqRel) {
            if let Some(queue) = self.inner.queue_rx.lock().take() {
                tokio::spawn(consume(Arc::clone(&self.inner), queue));
            }
        }
        Ok(())
    }

    /// Starts the consumer loop and registers a per-record callback.
    ///
    /// `on_item` is invoked with the resident handle after each upsert is
    /// applied; `on_completed` fires once when the engine shuts down. A
    /// callback that falls behind the broadcast ring skips ahead and the
    /// missed count is logged.
    ///
    /// # Errors
    ///
    /// Same conditions as [`subscribe`](Self::subscribe).
    pub fn subscribe_with<F, C>(&self, on_item: F, on_completed: C) -> Result<()>
    where
        F: Fn(SharedRecord<T>) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        // Attach to the record feed before the consumer can start, so the
        // callback observes every processed record.
        let mut rx = self.inner.records_tx.subscribe();
        self.subscribe()?;
        let mut shutdown = self.inner.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    item = rx.recv() => match item {
                        Ok(record) => on_item(record),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "record callback lagged; skipping ahead");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            on_completed();
        });
        Ok(())
    }

    /// Shuts the engine down: the consumer, forwarders, and callbacks stop,
    /// and every mutating or subscribing call starts failing with
    /// [`Error::Disposed`]. Idempotent.
    pub fn dispose(&self) {
        self.inner
            .lifecycle
            .store(LIFECYCLE_DISPOSED, Ordering::Release);
        let _ = self.inner.shutdown_tx.send(true);
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Enqueues one upsert. The record is applied asynchronously by the
    /// consumer loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`dispose`](Self::dispose).
    pub fn add_item(&self, item: T) -> Result<()> {
        self.ensure_not_disposed()?;
        self.inner
            .queue_tx
            .send(item)
            .map_err(|_| Error::Disposed)?;
        Ok(())
    }

    /// Removes the record sharing `item`'s identity, synchronously. Returns
    /// `false` when no such record is tracked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`dispose`](Self::dispose).
    pub fn remove_item(&self, item: &T) -> Result<bool> {
        self.ensure_not_disposed()?;
        let mut state = self.inner.state.lock();
        let removed = state.remove(item);
        let events = state.take_events();
        self.inner.broadcast(events);
        Ok(removed)
    }

    /// Replaces the ordering oracle, resorting the snapshot and resetting
    /// the live view. Takes effect synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`dispose`](Self::dispose).
    pub fn set_comparer(&self, comparer: Option<Comparer<T>>) -> Result<()> {
        self.ensure_not_disposed()?;
        let mut state = self.inner.state.lock();
        state.set_comparer(comparer);
        let events = state.take_events();
        self.inner.broadcast(events);
        Ok(())
    }

    /// Replaces the visibility oracle. Takes effect synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`dispose`](Self::dispose).
    pub fn set_filter(&self, filter: Option<Filter<T>>) -> Result<()> {
        self.ensure_not_disposed()?;
        let mut state = self.inner.state.lock();
        state.set_filter(filter);
        let events = state.take_events();
        self.inner.broadcast(events);
        Ok(())
    }

    /// Requests a new target interval between consumer ticks. The consumer
    /// picks it up at the top of its next tick.
    pub fn set_processing_delay(&self, delay: Duration) {
        self.inner
            .requested_delay
            .store(nanos_u64(delay), Ordering::Relaxed);
    }

    /// The currently requested inter-tick interval.
    #[must_use]
    pub fn processing_delay(&self) -> Duration {
        Duration::from_nanos(self.inner.requested_delay.load(Ordering::Relaxed))
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Subscribes to the structural-edit feed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`dispose`](Self::dispose).
    pub fn events(&self) -> Result<EventSubscription<T>> {
        self.ensure_not_disposed()?;
        Ok(EventSubscription::new(
            self.inner.events_tx.subscribe(),
            self.inner.shutdown_rx.clone(),
        ))
    }

    /// Returns a read-only handle onto the live view.
    #[must_use]
    pub fn view(&self) -> ViewHandle<T> {
        ViewHandle::new(Arc::clone(&self.inner.state))
    }

    /// Returns a snapshot of the engine's counters.
    #[must_use]
    pub fn metrics(&self) -> TrackerMetrics {
        TrackerMetrics {
            items_processed: self.inner.items_processed.load(Ordering::Relaxed),
            events_emitted: self.inner.events_emitted.load(Ordering::Relaxed),
            idle_ticks: self.inner.idle_ticks.load(Ordering::Relaxed),
        }
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.inner.lifecycle.load(Ordering::Acquire) == LIFECYCLE_DISPOSED {
            return Err(Error::Disposed);
        }
        Ok(())
    }
}

impl<T: Trackable> Default for TrackingView<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Trackable> Inner<T> {
    fn delay_target(&self) -> Duration {
        Duration::from_nanos(self.requested_delay.load(Ordering::Relaxed))
    }

    fn broadcast(&self, events: Vec<ChangeEvent<T>>) {
        for event in events {
            self.events_emitted.fetch_add(1, Ordering::Relaxed);
            // No receivers is fine; events are only of interest when someone
            // is listening.
            let _ = self.events_tx.send(event);
        }
    }
}

fn nanos_u64(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Consumer loop
// ---------------------------------------------------------------------------

/// Dequeues at most one upsert per paced tick and applies it under the state
/// lock. Runs until shutdown.
async fn consume<T: Trackable>(inner: Arc<Inner<T>>, mut queue: mpsc::UnboundedReceiver<T>) {
    let mut shutdown = inner.shutdown_rx.clone();
    let mut pacing = PacingController::new(inner.delay_target(), inner.tolerance);
    let mut last_tick = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }
        let requested = inner.delay_target();
        if requested != pacing.target() {
            pacing.retarget(requested);
        }

        let item = if pacing.delay().is_zero() {
            tokio::select! {
                _ = shutdown.changed() => continue,
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            }
        } else {
            tokio::select! {
                _ = shutdown.changed() => continue,
                () = tokio::time::sleep(pacing.delay()) => {
                    match queue.try_recv() {
                        Ok(item) => item,
                        Err(mpsc::error::TryRecvError::Empty) => {
                            // Idle tick. The interval clock keeps running so
                            // the next processed item sees the full gap and
                            // the delay compensates.
                            inner.idle_ticks.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        Err(mpsc::error::TryRecvError::Disconnected) => break,
                    }
                }
            }
        };

        {
            let mut state = inner.state.lock();
            match state.apply(item) {
                Ok(record) => {
                    let events = state.take_events();
                    inner.items_processed.fetch_add(1, Ordering::Relaxed);
                    inner.broadcast(events);
                    let _ = inner.records_tx.send(record);
                }
                Err(err) => {
                    tracing::error!(%err, "tracking pipeline failed; stopping consumer");
                    break;
                }
            }
        }

        let now = Instant::now();
        pacing.observe(now - last_tick);
        last_tick = now;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
