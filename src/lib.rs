//! # trackview
//!
//! An incremental materialized-view engine for typed records with stable
//! identity. The engine consumes an unbounded sequence of upserts and
//! continuously maintains:
//!
//! - a canonically **sorted snapshot** of every record it has ever seen, and
//! - a filtered, ordered **live view** of that snapshot, observed by
//!   subscribers as a stream of minimal structural edits
//!   (add / insert / remove / move / update-in-place / reset) rather than
//!   full reconstructions.
//!
//! Two upserts carrying the same identity collapse into a single slot that is
//! updated in place — the resident [`SharedRecord`](record::SharedRecord)
//! handle is reused, so anything downstream holding it observes the update
//! without invalidation.
//!
//! ## Architecture
//!
//! ```text
//! producers ──► pending queue ──► consumer loop ──► classifier
//!                (mpsc, paced)         │                 │
//!                                      │         snapshot mutator
//!                                      │                 │
//!                                      │        live-view synchronizer
//!                                      ▼                 │
//!                               pacing feedback   change events (broadcast)
//! ```
//!
//! The snapshot, live view, and index maps are only ever mutated from a
//! single consumer context; producers touch nothing but the queue.
//!
//! ## Example
//!
//! ```rust,ignore
//! use trackview::{TrackingView, Trackable};
//!
//! let view = TrackingView::new();
//! view.listen(source_stream)?;
//! view.subscribe()?;
//!
//! let mut events = view.events()?;
//! while let Ok(event) = events.recv().await {
//!     apply_to_ui(event);
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod engine;
mod event;
mod handle;
mod index;
mod pacing;
mod record;
mod state;

pub use engine::{TrackerConfig, TrackerMetrics, TrackingView};
pub use event::ChangeEvent;
pub use handle::{EventError, EventSubscription, ViewHandle};
pub use record::{Comparer, Filter, SharedRecord, Trackable};

/// Result type for trackview operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine's public surface.
///
/// All variants represent caller misuse rather than transient conditions;
/// none are retried internally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// `subscribe` was called before any source was registered via `listen`.
    #[error("no source has been registered; call listen() first")]
    NotInitialized,

    /// A mutating or subscribing call arrived after `dispose`.
    #[error("tracking view has been disposed")]
    Disposed,

    /// A structural edit was attempted on the live view through its public
    /// read surface. Only the engine's internal pipeline may mutate the view.
    #[error("the live view is read-only; mutations must go through the engine")]
    ExternalMutation,

    /// A cascading recalculation was asked to run over a reversed range.
    ///
    /// This is an internal invariant violation and should be unreachable;
    /// the consumer loop treats it as fatal.
    #[error("reversed recalculation range: start {start} is past end {end}")]
    ReversedRange {
        /// First snapshot index of the requested range.
        start: usize,
        /// One-past-last snapshot index of the requested range.
        end: usize,
    },
}
