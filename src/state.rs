//! Tracked state — the sorted snapshot, the live view, and the per-record
//! pipeline that keeps them consistent.
//!
//! Every upsert flows through three stages:
//!
//! 1. **Classification** — identity lookup plus comparer probes decide
//!    whether the record updates in place, moves, inserts, or appends.
//! 2. **Snapshot mutation** — the sorted snapshot is edited; moves bubble
//!    the resident record to its new slot one adjacent swap at a time so the
//!    index maps can follow each step.
//! 3. **Live-view synchronization** — visibility is evaluated through the
//!    filter oracle and the live view is patched with minimal structural
//!    edits, cascading a visibility recalculation over the affected snapshot
//!    range because position-dependent oracles can flip records far from the
//!    original edit.
//!
//! All of this is single-writer: [`TrackedState`] is owned by the consumer
//! side of the engine and mutated under one lock. Structural edits are
//! buffered as [`ChangeEvent`]s and drained by the caller after each step.

use std::cmp::Ordering;

use crate::event::ChangeEvent;
use crate::index::ViewIndex;
use crate::record::{share, Comparer, Filter, SharedRecord, Trackable};
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// TrackedState
// ---------------------------------------------------------------------------

/// Snapshot, live view, index maps, and the configured oracles.
pub(crate) struct TrackedState<T: Trackable> {
    /// Every record ever upserted, in comparer order (arrival order when no
    /// comparer is set).
    snapshot: Vec<SharedRecord<T>>,
    /// The filtered, externally observed subset of the snapshot.
    live: Vec<SharedRecord<T>>,
    /// Bidirectional snapshot↔live position maps.
    index: ViewIndex,
    comparer: Option<Comparer<T>>,
    filter: Option<Filter<T>>,
    /// Structural edits buffered since the last drain.
    events: Vec<ChangeEvent<T>>,
}

/// Outcome of classifying one incoming record against the snapshot.
enum Action {
    /// Same identity, same slot: copy fields onto the resident.
    Update { position: usize },
    /// Same identity, different sort rank: copy fields, then bubble.
    Move { position: usize, toward_front: bool },
    /// New identity landing at an interior slot.
    Insert { position: usize },
    /// New identity landing at the tail.
    Add,
}

impl<T: Trackable> TrackedState<T> {
    pub(crate) fn new() -> Self {
        Self {
            snapshot: Vec::new(),
            live: Vec::new(),
            index: ViewIndex::new(),
            comparer: None,
            filter: None,
            events: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Upsert pipeline
    // -----------------------------------------------------------------------

    /// Applies one incoming record and returns the resident handle it
    /// collapsed into (the incoming record itself for new identities).
    pub(crate) fn apply(&mut self, incoming: T) -> Result<SharedRecord<T>> {
        match self.classify(&incoming) {
            Action::Update { position } => {
                let record = SharedRecord::clone(&self.snapshot[position]);
                record.write().update_from(&incoming);
                self.sync_update(&record, position);
                Ok(record)
            }
            Action::Move {
                position,
                toward_front,
            } => {
                let record = SharedRecord::clone(&self.snapshot[position]);
                record.write().update_from(&incoming);
                let new_position = self.bubble(position, toward_front);
                self.sync_move(&record, position, new_position)?;
                Ok(record)
            }
            Action::Insert { position } => {
                let record = share(incoming);
                self.snapshot.insert(position, SharedRecord::clone(&record));
                self.index.snapshot_inserted(position);
                self.sync_insert(&record, position);
                Ok(record)
            }
            Action::Add => {
                let record = share(incoming);
                self.snapshot.push(SharedRecord::clone(&record));
                self.sync_add(&record, self.snapshot.len() - 1);
                Ok(record)
            }
        }
    }

    fn classify(&self, incoming: &T) -> Action {
        let key = incoming.key();
        if let Some(position) = self.position_of(&key) {
            return match &self.comparer {
                None => Action::Update { position },
                Some(cmp) => match cmp(incoming, &self.snapshot[position].read()) {
                    Ordering::Equal => Action::Update { position },
                    ordering => Action::Move {
                        position,
                        toward_front: ordering == Ordering::Less,
                    },
                },
            };
        }
        match &self.comparer {
            Some(cmp) if !self.snapshot.is_empty() => {
                if cmp(&self.snapshot[0].read(), incoming) != Ordering::Less {
                    Action::Insert { position: 0 }
                } else if cmp(&self.snapshot[self.snapshot.len() - 1].read(), incoming)
                    != Ordering::Greater
                {
                    Action::Add
                } else {
                    Action::Insert {
                        position: self.binary_slot(incoming, cmp),
                    }
                }
            }
            _ => Action::Add,
        }
    }

    fn position_of(&self, key: &T::Key) -> Option<usize> {
        self.snapshot.iter().position(|r| r.read().key() == *key)
    }

    /// Binary search for the insertion slot of `incoming`, which is known to
    /// rank strictly between the snapshot's first and last records.
    ///
    /// Before widening the window, each probe peeks at one neighbor of the
    /// pivot and claims the pivot's slot when that neighbor already satisfies
    /// the ordering against `incoming`. The peek decides where records with
    /// duplicate sort keys land relative to their equal-key run, so its exact
    /// shape is part of the engine's ordering contract.
    fn binary_slot(&self, incoming: &T, cmp: &Comparer<T>) -> usize {
        let len = self.snapshot.len();
        let mut start = 0;
        let mut end = len - 1;
        while start <= end {
            let pivot = start + ((end - start) >> 1);
            match cmp(&self.snapshot[pivot].read(), incoming) {
                Ordering::Equal => return pivot,
                Ordering::Less => {
                    if pivot > 0
                        && pivot + 1 < len
                        && cmp(&self.snapshot[pivot + 1].read(), incoming) != Ordering::Less
                    {
                        return pivot;
                    }
                    start = pivot + 1;
                }
                Ordering::Greater => {
                    if pivot + 1 < len
                        && pivot > 0
                        && cmp(&self.snapshot[pivot - 1].read(), incoming) != Ordering::Greater
                    {
                        return pivot;
                    }
                    if pivot == 0 {
                        break;
                    }
                    end = pivot - 1;
                }
            }
        }
        start
    }

    /// Bubbles the record at `position` toward its new slot one adjacent
    /// swap at a time, keeping the index maps in step, and returns the final
    /// snapshot position.
    fn bubble(&mut self, position: usize, toward_front: bool) -> usize {
        let Some(cmp) = self.comparer.clone() else {
            return position;
        };
        let mut i = position;
        if toward_front {
            while i > 0
                && cmp(&self.snapshot[i].read(), &self.snapshot[i - 1].read()) == Ordering::Less
            {
                self.snapshot.swap(i - 1, i);
                self.index.snapshot_swapped(i - 1, i);
                i -= 1;
            }
        } else {
            while i + 1 < self.snapshot.len()
                && cmp(&self.snapshot[i].read(), &self.snapshot[i + 1].read()) == Ordering::Greater
            {
                self.snapshot.swap(i, i + 1);
                self.index.snapshot_swapped(i, i + 1);
                i += 1;
            }
        }
        i
    }

    // -----------------------------------------------------------------------
    // Live-view synchronization
    // -----------------------------------------------------------------------

    fn sync_add(&mut self, record: &SharedRecord<T>, position: usize) {
        // A tail append cannot change any earlier record's position, so no
        // cascade is needed.
        if self.included(record, position) {
            self.live_push(record, position);
        }
    }

    fn sync_update(&mut self, record: &SharedRecord<T>, position: usize) {
        let included = self.included(record, position);
        match (included, self.index.live_of(position)) {
            (true, Some(index)) => self.events.push(ChangeEvent::Updated {
                record: SharedRecord::clone(record),
                index,
            }),
            (true, None) => {
                let pivot = self.live_pivot(position);
                self.insert_and_recalculate(record, pivot, position, false);
            }
            (false, Some(index)) => self.remove_and_recalculate(index, position, false),
            (false, None) => {}
        }
    }

    fn sync_insert(&mut self, record: &SharedRecord<T>, position: usize) {
        let pivot = self.live_pivot(position);
        if self.included(record, position) {
            self.insert_and_recalculate(record, pivot, position, false);
        } else {
            // The new slot shifted every later record's position, which can
            // flip their visibility even though this record stays hidden.
            self.recalculate_filter(pivot, position, self.snapshot.len());
        }
    }

    fn sync_move(
        &mut self,
        record: &SharedRecord<T>,
        old_position: usize,
        position: usize,
    ) -> Result<()> {
        let included = self.included(record, position);
        let live_idx = self.index.live_of(position);
        let pivot = self.live_pivot(position);
        let start = old_position.min(position);
        let end = old_position.max(position);

        let Some(filter) = self.filter.clone() else {
            // Unfiltered: the live view mirrors the snapshot, so the move
            // maps one-to-one.
            if let Some(from) = live_idx {
                self.move_and_recalculate(from, pivot, start, end, false)?;
            }
            return Ok(());
        };

        // A position-dependent oracle can flip records far away from the
        // move. That shows up first at the live view's edges, so probe both
        // and fall back to a full rescan when either edge no longer passes.
        let perturbed = !self.live.is_empty() && {
            let last = self.live.len() - 1;
            let first_pos = self.index.snap_of(0);
            let last_pos = self.index.snap_of(last);
            !filter(&self.live[0].read(), first_pos, &self.live)
                || !filter(&self.live[last].read(), last_pos, &self.live)
        };

        match (included, live_idx) {
            (false, Some(idx)) => self.remove_and_recalculate(idx, start, perturbed),
            (true, None) => self.insert_and_recalculate(record, pivot, start, perturbed),
            (true, Some(idx)) => self.move_and_recalculate(idx, pivot, start, end, perturbed)?,
            (false, None) => {
                if perturbed {
                    self.recalculate_filter(0, 0, self.snapshot.len());
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cascading recalculation
    // -----------------------------------------------------------------------

    fn insert_and_recalculate(
        &mut self,
        record: &SharedRecord<T>,
        live_idx: usize,
        position: usize,
        rescan_all: bool,
    ) {
        self.live_insert(record, live_idx, position);
        if rescan_all {
            self.recalculate_filter(0, 0, self.snapshot.len());
        } else {
            self.recalculate_filter(live_idx + 1, position + 1, self.snapshot.len());
        }
    }

    fn remove_and_recalculate(&mut self, live_idx: usize, position: usize, rescan_all: bool) {
        self.live_remove(live_idx);
        if rescan_all {
            self.recalculate_filter(0, 0, self.snapshot.len());
        } else {
            self.recalculate_filter(live_idx, position, self.snapshot.len());
        }
    }

    fn move_and_recalculate(
        &mut self,
        from: usize,
        to: usize,
        start: usize,
        end: usize,
        rescan_all: bool,
    ) -> Result<()> {
        if start > end {
            return Err(Error::ReversedRange { start, end });
        }
        self.live_move(from, to);
        if rescan_all {
            self.recalculate_filter(0, 0, self.snapshot.len());
        } else {
            self.recalculate_filter(to + 1, start + 1, end);
        }
        Ok(())
    }

    /// Walks snapshot positions `start..end`, pulling records into or out of
    /// the live view as the oracle dictates. `live_idx` is the live cursor
    /// corresponding to `start`.
    fn recalculate_filter(&mut self, mut live_idx: usize, start: usize, end: usize) {
        if self.filter.is_none() {
            return;
        }
        for i in start..end {
            let record = SharedRecord::clone(&self.snapshot[i]);
            let current = self.index.live_of(i);
            let included = self.included(&record, i);
            match (included, current) {
                (true, Some(_)) => live_idx += 1,
                (true, None) => {
                    if live_idx >= self.live.len() {
                        self.live_push(&record, i);
                    } else {
                        self.live_insert(&record, live_idx, i);
                    }
                    live_idx += 1;
                }
                (false, Some(idx)) => self.live_remove(idx),
                (false, None) => {}
            }
        }
    }

    fn included(&self, record: &SharedRecord<T>, position: usize) -> bool {
        match &self.filter {
            None => true,
            Some(f) => f(&record.read(), position, &self.live),
        }
    }

    /// Live index just past the nearest visible predecessor of snapshot
    /// position `position`, or 0 when nothing before it is visible.
    fn live_pivot(&self, position: usize) -> usize {
        (0..position)
            .rev()
            .find_map(|i| self.index.live_of(i).map(|l| l + 1))
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Live-view primitives
    // -----------------------------------------------------------------------

    fn live_push(&mut self, record: &SharedRecord<T>, position: usize) {
        self.live.push(SharedRecord::clone(record));
        let index = self.live.len() - 1;
        self.index.live_inserted(index, position);
        self.events.push(ChangeEvent::Added {
            record: SharedRecord::clone(record),
            index,
        });
    }

    fn live_insert(&mut self, record: &SharedRecord<T>, index: usize, position: usize) {
        let index = index.min(self.live.len());
        self.live.insert(index, SharedRecord::clone(record));
        self.index.live_inserted(index, position);
        self.events.push(ChangeEvent::Inserted {
            record: SharedRecord::clone(record),
            index,
        });
    }

    fn live_remove(&mut self, index: usize) {
        let record = self.live.remove(index);
        self.index.live_removed(index);
        self.events.push(ChangeEvent::Removed { record, index });
    }

    fn live_move(&mut self, from: usize, to: usize) {
        let dest = if from < to { to - 1 } else { to };
        let record = self.live.remove(from);
        self.live.insert(dest, SharedRecord::clone(&record));
        self.index.live_moved(from, dest);
        self.events.push(ChangeEvent::Moved {
            record,
            from,
            to: dest,
        });
    }

    // -----------------------------------------------------------------------
    // Removal and reconfiguration
    // -----------------------------------------------------------------------

    /// Removes the record sharing `target`'s identity. Returns `false` when
    /// no such record is tracked.
    pub(crate) fn remove(&mut self, target: &T) -> bool {
        let key = target.key();
        let Some(position) = self.position_of(&key) else {
            return false;
        };
        let live_idx = self.index.live_of(position);
        if let Some(idx) = live_idx {
            self.live_remove(idx);
        }
        self.snapshot.remove(position);
        self.index.snapshot_removed(position);
        // A hidden record has no live index of its own; the cascade starts
        // at the slot its visible predecessor maps to.
        let cursor = live_idx.unwrap_or_else(|| self.live_pivot(position));
        self.recalculate_filter(cursor, position, self.snapshot.len());
        true
    }

    /// Replaces the ordering oracle. Setting one resorts the snapshot and
    /// rebuilds the live view behind a single `Reset`; clearing it keeps the
    /// current order (records simply stop being resorted).
    pub(crate) fn set_comparer(&mut self, comparer: Option<Comparer<T>>) {
        self.comparer = comparer;
        let Some(cmp) = self.comparer.clone() else {
            return;
        };
        self.snapshot.sort_by(|a, b| cmp(&a.read(), &b.read()));
        if self.filter.is_some() {
            self.live.clear();
            self.index.clear();
            self.events.push(ChangeEvent::Reset);
            self.recalculate_filter(0, 0, self.snapshot.len());
        } else {
            self.live = self.snapshot.clone();
            self.index.rebuild_identity(self.snapshot.len());
            self.events.push(ChangeEvent::Reset);
        }
    }

    /// Replaces the visibility oracle.
    ///
    /// Clearing the filter reveals hidden records incrementally, in snapshot
    /// order; swapping one filter for another resets the live view and
    /// refills it from scratch.
    pub(crate) fn set_filter(&mut self, filter: Option<Filter<T>>) {
        match (self.filter.take(), filter) {
            (None, None) => {}
            (Some(_), None) => {
                for i in 0..self.snapshot.len() {
                    if self.index.live_of(i).is_none() {
                        let record = SharedRecord::clone(&self.snapshot[i]);
                        // Every position before i is already visible at the
                        // matching live index, so the record lands at i.
                        if i >= self.live.len() {
                            self.live_push(&record, i);
                        } else {
                            self.live_insert(&record, i, i);
                        }
                    }
                }
            }
            (None, Some(f)) => {
                self.filter = Some(f);
                self.recalculate_filter(0, 0, self.snapshot.len());
            }
            (Some(_), Some(f)) => {
                self.live.clear();
                self.index.clear();
                self.events.push(ChangeEvent::Reset);
                self.filter = Some(f);
                self.recalculate_filter(0, 0, self.snapshot.len());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Drains the structural edits buffered since the last call.
    pub(crate) fn take_events(&mut self) -> Vec<ChangeEvent<T>> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn live_len(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn live_get(&self, index: usize) -> Option<SharedRecord<T>> {
        self.live.get(index).map(SharedRecord::clone)
    }

    pub(crate) fn live_records(&self) -> Vec<SharedRecord<T>> {
        self.live.clone()
    }

    pub(crate) fn snapshot_len(&self) -> usize {
        self.snapshot.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
