//! Change events — the outbound notification contract.
//!
//! One [`ChangeEvent`] is emitted per structural edit applied to the live
//! view. Consumers that apply events in emission order keep any externally
//! mirrored collection exactly in sync with the live view, which is the only
//! contract a UI-binding adapter needs.

use crate::record::SharedRecord;

/// A single structural edit to the live view.
///
/// Indexes always refer to live-view positions at the moment the event was
/// emitted, so events must be applied in order.
#[derive(Debug)]
pub enum ChangeEvent<T> {
    /// A record was appended at the tail of the live view.
    Added {
        /// The resident record handle.
        record: SharedRecord<T>,
        /// Live-view index of the appended record.
        index: usize,
    },
    /// A record was inserted at an interior position; everything at or after
    /// `index` shifted up by one.
    Inserted {
        /// The resident record handle.
        record: SharedRecord<T>,
        /// Live-view index the record now occupies.
        index: usize,
    },
    /// A record was removed; everything after `index` shifted down by one.
    Removed {
        /// The resident record handle.
        record: SharedRecord<T>,
        /// Live-view index the record occupied.
        index: usize,
    },
    /// A record changed live-view position without entering or leaving.
    Moved {
        /// The resident record handle.
        record: SharedRecord<T>,
        /// Previous live-view index.
        from: usize,
        /// New live-view index.
        to: usize,
    },
    /// A visible record was updated in place; its position did not change.
    Updated {
        /// The resident record handle.
        record: SharedRecord<T>,
        /// Live-view index of the updated record.
        index: usize,
    },
    /// The whole view was invalidated; consumers should re-read it from
    /// scratch. Emitted on comparer/filter reconfiguration.
    Reset,
}

// Manual impl: SharedRecord clones are Arc clones, no T: Clone needed.
impl<T> Clone for ChangeEvent<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Added { record, index } => Self::Added {
                record: SharedRecord::clone(record),
                index: *index,
            },
            Self::Inserted { record, index } => Self::Inserted {
                record: SharedRecord::clone(record),
                index: *index,
            },
            Self::Removed { record, index } => Self::Removed {
                record: SharedRecord::clone(record),
                index: *index,
            },
            Self::Moved { record, from, to } => Self::Moved {
                record: SharedRecord::clone(record),
                from: *from,
                to: *to,
            },
            Self::Updated { record, index } => Self::Updated {
                record: SharedRecord::clone(record),
                index: *index,
            },
            Self::Reset => Self::Reset,
        }
    }
}

impl<T> ChangeEvent<T> {
    /// Returns the record this event refers to, if any.
    #[must_use]
    pub fn record(&self) -> Option<&SharedRecord<T>> {
        match self {
            Self::Added { record, .. }
            | Self::Inserted { record, .. }
            | Self::Removed { record, .. }
            | Self::Moved { record, .. }
            | Self::Updated { record, .. } => Some(record),
            Self::Reset => None,
        }
    }

    /// Returns the primary live-view index of this event, if any.
    ///
    /// For [`Moved`](Self::Moved) this is the destination index.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Added { index, .. }
            | Self::Inserted { index, .. }
            | Self::Removed { index, .. }
            | Self::Updated { index, .. } => Some(*index),
            Self::Moved { to, .. } => Some(*to),
            Self::Reset => None,
        }
    }

    /// Returns `true` for [`Reset`](Self::Reset).
    #[must_use]
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::share;
    use std::sync::Arc;

    #[test]
    fn test_event_accessors() {
        let rec = share(7u64);
        let ev = ChangeEvent::Inserted {
            record: Arc::clone(&rec),
            index: 3,
        };
        assert_eq!(ev.index(), Some(3));
        assert!(Arc::ptr_eq(ev.record().unwrap(), &rec));
        assert!(!ev.is_reset());

        let ev = ChangeEvent::Moved {
            record: rec,
            from: 1,
            to: 4,
        };
        assert_eq!(ev.index(), Some(4));

        let ev: ChangeEvent<u64> = ChangeEvent::Reset;
        assert!(ev.is_reset());
        assert_eq!(ev.index(), None);
        assert!(ev.record().is_none());
    }

    #[test]
    fn test_event_clone_shares_record() {
        let rec = share(1u64);
        let ev = ChangeEvent::Added {
            record: Arc::clone(&rec),
            index: 0,
        };
        let cloned = ev.clone();
        assert!(Arc::ptr_eq(cloned.record().unwrap(), &rec));
    }
}
