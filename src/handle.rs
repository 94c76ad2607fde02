//! Read-only handles — [`ViewHandle`] onto the live view and
//! [`EventSubscription`] onto the structural-edit feed.
//!
//! Both are detached from the engine's lifecycle: a handle stays usable for
//! reads after `dispose` (it sees the final state), and a subscription keeps
//! yielding whatever was broadcast before shutdown, then reports
//! [`EventError::Closed`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::event::ChangeEvent;
use crate::record::{SharedRecord, Trackable};
use crate::state::TrackedState;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// ViewHandle
// ---------------------------------------------------------------------------

/// Read-only positional access to the live view.
///
/// Every accessor takes the state lock for the duration of one read, so a
/// handle observes each structural edit atomically but two consecutive reads
/// may straddle an edit.
pub struct ViewHandle<T: Trackable> {
    state: Arc<Mutex<TrackedState<T>>>,
}

impl<T: Trackable> Clone for ViewHandle<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Trackable> ViewHandle<T> {
    pub(crate) fn new(state: Arc<Mutex<TrackedState<T>>>) -> Self {
        Self { state }
    }

    /// Number of records currently visible.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().live_len()
    }

    /// Returns `true` when nothing is visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The resident record at live index `index`, if in bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<SharedRecord<T>> {
        self.state.lock().live_get(index)
    }

    /// The live view as a vector of resident handles, in view order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<SharedRecord<T>> {
        self.state.lock().live_records()
    }

    /// Total number of records tracked, visible or not.
    #[must_use]
    pub fn tracked_len(&self) -> usize {
        self.state.lock().snapshot_len()
    }

    /// Rejected: the live view is maintained exclusively by the engine.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::ExternalMutation`].
    pub fn insert(&self, _index: usize, _record: T) -> Result<()> {
        Err(Error::ExternalMutation)
    }

    /// Rejected: the live view is maintained exclusively by the engine.
    /// Use [`TrackingView::remove_item`](crate::TrackingView::remove_item).
    ///
    /// # Errors
    ///
    /// Always returns [`Error::ExternalMutation`].
    pub fn remove(&self, _index: usize) -> Result<()> {
        Err(Error::ExternalMutation)
    }

    /// Rejected: the live view is maintained exclusively by the engine.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::ExternalMutation`].
    pub fn move_item(&self, _from: usize, _to: usize) -> Result<()> {
        Err(Error::ExternalMutation)
    }
}

// ---------------------------------------------------------------------------
// EventSubscription
// ---------------------------------------------------------------------------

/// Errors surfaced by an [`EventSubscription`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The engine shut down and every buffered event has been delivered.
    #[error("event subscription closed")]
    Closed,

    /// The subscriber fell behind the broadcast ring and skipped ahead.
    /// Consumers mirroring the live view should re-read it from a
    /// [`ViewHandle`] after seeing this.
    #[error("event subscriber lagged behind by {0} events")]
    Lagged(u64),
}

/// A subscription to the structural-edit feed of one engine.
///
/// Events arrive in emission order. Applying them in order to an external
/// mirror keeps it identical to the live view.
pub struct EventSubscription<T> {
    rx: broadcast::Receiver<ChangeEvent<T>>,
    shutdown: watch::Receiver<bool>,
}

impl<T> EventSubscription<T> {
    pub(crate) fn new(
        rx: broadcast::Receiver<ChangeEvent<T>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { rx, shutdown }
    }

    /// Waits for the next structural edit.
    ///
    /// Edits broadcast before a shutdown are still delivered; only once the
    /// buffer is drained does this report [`EventError::Closed`].
    ///
    /// # Errors
    ///
    /// [`EventError::Lagged`] when events were missed, [`EventError::Closed`]
    /// on shutdown.
    pub async fn recv(&mut self) -> std::result::Result<ChangeEvent<T>, EventError> {
        match self.rx.try_recv() {
            Ok(event) => return Ok(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                return Err(EventError::Lagged(missed));
            }
            Err(broadcast::error::TryRecvError::Closed) => return Err(EventError::Closed),
            Err(broadcast::error::TryRecvError::Empty) => {}
        }
        if *self.shutdown.borrow() {
            return Err(EventError::Closed);
        }
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    // One last drain for edits that raced the shutdown flag.
                    if let Ok(event) = self.rx.try_recv() {
                        return Ok(event);
                    }
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Err(EventError::Closed);
                    }
                }
                event = self.rx.recv() => {
                    return match event {
                        Ok(event) => Ok(event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            Err(EventError::Lagged(missed))
                        }
                        Err(broadcast::error::RecvError::Closed) => Err(EventError::Closed),
                    };
                }
            }
        }
    }

    /// Polls for a buffered structural edit without waiting. `Ok(None)`
    /// means nothing is pending.
    ///
    /// # Errors
    ///
    /// Same conditions as [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> std::result::Result<Option<ChangeEvent<T>>, EventError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => Err(EventError::Lagged(missed)),
            Err(broadcast::error::TryRecvError::Closed) => Err(EventError::Closed),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Thing {
        id: u64,
        updated_at: i64,
    }

    impl Trackable for Thing {
        type Key = u64;

        fn key(&self) -> u64 {
            self.id
        }

        fn update_from(&mut self, other: &Self) {
            self.updated_at = other.updated_at;
        }
    }

    fn shared_state(items: &[(u64, i64)]) -> Arc<Mutex<TrackedState<Thing>>> {
        let mut state = TrackedState::new();
        for &(id, updated_at) in items {
            state.apply(Thing { id, updated_at }).unwrap();
        }
        state.take_events();
        Arc::new(Mutex::new(state))
    }

    // --- ViewHandle ---

    #[test]
    fn test_view_handle_reads() {
        let handle = ViewHandle::new(shared_state(&[(1, 10), (2, 20)]));
        assert_eq!(handle.len(), 2);
        assert!(!handle.is_empty());
        assert_eq!(handle.tracked_len(), 2);
        assert_eq!(handle.get(0).unwrap().read().id, 1);
        assert!(handle.get(5).is_none());

        let ids: Vec<u64> = handle.to_vec().iter().map(|r| r.read().id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_view_handle_rejects_mutation() {
        let handle = ViewHandle::new(shared_state(&[(1, 10)]));
        assert_eq!(
            handle.insert(0, Thing { id: 9, updated_at: 0 }),
            Err(Error::ExternalMutation)
        );
        assert_eq!(handle.remove(0), Err(Error::ExternalMutation));
        assert_eq!(handle.move_item(0, 1), Err(Error::ExternalMutation));
        // The view is untouched.
        assert_eq!(handle.len(), 1);
    }

    // --- EventSubscription ---

    #[tokio::test]
    async fn test_subscription_delivers_in_order() {
        let (tx, rx) = broadcast::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sub: EventSubscription<Thing> = EventSubscription::new(rx, shutdown_rx);

        for index in 0..3 {
            tx.send(ChangeEvent::Added {
                record: Arc::new(parking_lot::RwLock::new(Thing {
                    id: index as u64,
                    updated_at: 0,
                })),
                index,
            })
            .unwrap();
        }

        for index in 0..3 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.index(), Some(index));
        }
        assert!(sub.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscription_drains_before_reporting_closed() {
        let (tx, rx) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sub: EventSubscription<Thing> = EventSubscription::new(rx, shutdown_rx);

        tx.send(ChangeEvent::Reset).unwrap();
        shutdown_tx.send(true).unwrap();

        assert!(sub.recv().await.unwrap().is_reset());
        assert!(matches!(sub.recv().await, Err(EventError::Closed)));
    }

    #[tokio::test]
    async fn test_subscription_reports_lag() {
        let (tx, rx) = broadcast::channel(2);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sub: EventSubscription<Thing> = EventSubscription::new(rx, shutdown_rx);

        for _ in 0..5 {
            tx.send(ChangeEvent::Reset).unwrap();
        }

        assert!(matches!(sub.recv().await, Err(EventError::Lagged(3))));
        // After the lag report the subscriber is caught up to the ring.
        assert!(sub.recv().await.is_ok());
    }
}
