//! Record contract — identity, in-place update, and the oracle signatures.
//!
//! Everything else in the crate builds on three things defined here:
//!
//! - [`Trackable`] — equality by identity plus an in-place field copy, the
//!   contract that lets two upserts of the same record collapse into one
//!   resident slot.
//! - [`SharedRecord`] — the shared handle under which residents live. The
//!   engine updates residents through this handle, so every downstream
//!   holder observes updates without the handle itself changing.
//! - [`Comparer`] / [`Filter`] — the pluggable ordering and visibility
//!   oracles. Both are optional at the engine level: no comparer means
//!   arrival order, no filter means everything is visible.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

/// Contract for records tracked by the engine.
///
/// Identity is carried by [`Key`](Trackable::Key): two records are the same
/// slot iff their keys are equal, regardless of every other field. When an
/// upsert arrives for an existing slot, the engine calls
/// [`update_from`](Trackable::update_from) on the resident instead of
/// replacing it, preserving the resident's [`SharedRecord`] handle.
///
/// # Example
///
/// ```rust
/// use trackview::Trackable;
///
/// struct Issue {
///     id: u64,
///     title: String,
///     updated_at: i64,
/// }
///
/// impl Trackable for Issue {
///     type Key = u64;
///
///     fn key(&self) -> u64 {
///         self.id
///     }
///
///     fn update_from(&mut self, other: &Self) {
///         self.title = other.title.clone();
///         self.updated_at = other.updated_at;
///     }
/// }
/// ```
pub trait Trackable: Send + Sync + 'static {
    /// Identity key. Records with equal keys occupy the same slot.
    type Key: Eq + Send;

    /// Returns this record's identity key.
    fn key(&self) -> Self::Key;

    /// Copies all non-identity fields from `other` onto `self`.
    ///
    /// Called with `other.key() == self.key()`; anything else is a
    /// programming error on the engine side, not a runtime condition
    /// implementations need to defend against.
    fn update_from(&mut self, other: &Self);
}

/// Shared handle to a resident record.
///
/// Residents are owned by the engine's snapshot and mutated only from the
/// single consumer context; external holders should take short read locks
/// and must not write through the handle.
pub type SharedRecord<T> = Arc<RwLock<T>>;

/// Ordering oracle: a total order over records.
///
/// Must not call back into the engine that invokes it.
pub type Comparer<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Visibility oracle: `(record, snapshot position, current live view) -> bool`.
///
/// The position argument makes position-dependent predicates (for example a
/// window over the first N snapshot slots) expressible; because of that, one
/// structural change can flip the visibility of unrelated records, which is
/// what the engine's cascading recalculation exists to handle.
///
/// Must not call back into the engine that invokes it, and must not take
/// write locks on the records it is handed.
pub type Filter<T> = Arc<dyn Fn(&T, usize, &[SharedRecord<T>]) -> bool + Send + Sync>;

/// Wraps an owned record into the shared handle form used by the snapshot.
pub(crate) fn share<T>(record: T) -> SharedRecord<T> {
    Arc::new(RwLock::new(record))
}
