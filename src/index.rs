//! Dual index maps between snapshot positions and live-view positions.
//!
//! The synchronizer constantly needs to answer two questions in O(1):
//! "where does snapshot position `p` sit in the live view, if anywhere?" and
//! "which snapshot position does live index `l` come from?". [`ViewIndex`]
//! answers both with a pair of maps maintained incrementally on every
//! structural edit — there is no rescan fallback; a full rebuild only
//! happens on reset.
//!
//! Shift fixups iterate the live side only, so every operation is O(V) in
//! the live-view size, independent of the snapshot size.

use fxhash::FxHashMap;

/// Bidirectional snapshot↔live position index.
///
/// Invariant (between synchronizer steps): `snap_to_live` and
/// `live_to_snap` describe the same bijection — `snap_to_live[p] == l` iff
/// `live_to_snap[l] == p`. During a snapshot bubble-move the live side is
/// intentionally stale in *order* (the live view has not been reshuffled
/// yet) but the bijection itself stays correct.
#[derive(Debug, Default)]
pub(crate) struct ViewIndex {
    /// Snapshot position → live index; absent means not visible.
    snap_to_live: FxHashMap<usize, usize>,
    /// Live index → snapshot position.
    live_to_snap: Vec<usize>,
}

impl ViewIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Live index of the record at snapshot position `p`, if visible.
    pub(crate) fn live_of(&self, p: usize) -> Option<usize> {
        self.snap_to_live.get(&p).copied()
    }

    /// Snapshot position of the record at live index `l`.
    pub(crate) fn snap_of(&self, l: usize) -> usize {
        self.live_to_snap[l]
    }

    #[cfg(test)]
    pub(crate) fn live_len(&self) -> usize {
        self.live_to_snap.len()
    }

    /// Records that a snapshot slot was inserted at position `p`: every
    /// tracked snapshot position at or past `p` shifts up by one.
    pub(crate) fn snapshot_inserted(&mut self, p: usize) {
        // Remap in descending snapshot order so keys never collide.
        let mut affected: Vec<usize> = (0..self.live_to_snap.len())
            .filter(|&l| self.live_to_snap[l] >= p)
            .collect();
        affected.sort_unstable_by_key(|&l| std::cmp::Reverse(self.live_to_snap[l]));
        for l in affected {
            let old = self.live_to_snap[l];
            self.snap_to_live.remove(&old);
            self.snap_to_live.insert(old + 1, l);
            self.live_to_snap[l] = old + 1;
        }
    }

    /// Records that the snapshot slot at position `p` was removed: every
    /// tracked position past `p` shifts down by one. The slot itself must
    /// already be unmapped (removed from the live view first).
    pub(crate) fn snapshot_removed(&mut self, p: usize) {
        debug_assert!(!self.snap_to_live.contains_key(&p));
        let mut affected: Vec<usize> = (0..self.live_to_snap.len())
            .filter(|&l| self.live_to_snap[l] > p)
            .collect();
        affected.sort_unstable_by_key(|&l| self.live_to_snap[l]);
        for l in affected {
            let old = self.live_to_snap[l];
            self.snap_to_live.remove(&old);
            self.snap_to_live.insert(old - 1, l);
            self.live_to_snap[l] = old - 1;
        }
    }

    /// Records that adjacent snapshot slots `a` and `b` swapped contents.
    /// Visibility follows the records, not the positions.
    pub(crate) fn snapshot_swapped(&mut self, a: usize, b: usize) {
        let la = self.snap_to_live.remove(&a);
        let lb = self.snap_to_live.remove(&b);
        if let Some(l) = la {
            self.snap_to_live.insert(b, l);
            self.live_to_snap[l] = b;
        }
        if let Some(l) = lb {
            self.snap_to_live.insert(a, l);
            self.live_to_snap[l] = a;
        }
    }

    /// Records that the record at snapshot position `p` entered the live
    /// view at index `l`.
    pub(crate) fn live_inserted(&mut self, l: usize, p: usize) {
        self.live_to_snap.insert(l, p);
        self.reassign_from(l);
    }

    /// Records that live index `l` was removed.
    pub(crate) fn live_removed(&mut self, l: usize) {
        let p = self.live_to_snap.remove(l);
        self.snap_to_live.remove(&p);
        self.reassign_from(l);
    }

    /// Records that live index `from` was relocated to live index `dest`
    /// (already adjusted for the removal shift by the caller).
    pub(crate) fn live_moved(&mut self, from: usize, dest: usize) {
        let p = self.live_to_snap.remove(from);
        self.live_to_snap.insert(dest, p);
        self.reassign_from(from.min(dest));
    }

    /// Drops all mappings.
    pub(crate) fn clear(&mut self) {
        self.snap_to_live.clear();
        self.live_to_snap.clear();
    }

    /// Resets to the identity mapping over `n` positions (unfiltered mirror).
    pub(crate) fn rebuild_identity(&mut self, n: usize) {
        self.clear();
        self.live_to_snap.extend(0..n);
        for i in 0..n {
            self.snap_to_live.insert(i, i);
        }
    }

    /// Reassigns `snap_to_live` values for live indexes `from..`, after a
    /// live-side shift.
    fn reassign_from(&mut self, from: usize) {
        for l in from..self.live_to_snap.len() {
            self.snap_to_live.insert(self.live_to_snap[l], l);
        }
    }

    /// Checks that the two maps describe the same bijection.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        if self.snap_to_live.len() != self.live_to_snap.len() {
            return false;
        }
        self.live_to_snap
            .iter()
            .enumerate()
            .all(|(l, &p)| self.snap_to_live.get(&p) == Some(&l))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
