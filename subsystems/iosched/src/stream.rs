//! # Per-Stream Queue
//!
//! The pending descriptors of one logical submitter, viewed two ways: a
//! sector-ordered index for elevator sweeps and a FIFO for expiry. Both
//! views store handles; the descriptor records its key in each so removal
//! from both is a single [`StreamQueue::remove`].
//!
//! Also hosts the nearest-descriptor choice shared by the policies.

use alloc::collections::BTreeMap;

use crate::arena::RequestArena;
use crate::error::{ensure, InvariantViolation};
use crate::request::{RequestHandle, Sector};

// =============================================================================
// SECTOR INDEX
// =============================================================================

/// Sector-ordered index with one descriptor per start sector
#[derive(Debug, Default)]
pub struct SectorIndex {
    map: BTreeMap<Sector, RequestHandle>,
}

impl SectorIndex {
    /// Create an empty index
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Index `handle` under its start sector.
    ///
    /// Re-inserting a descriptor already indexed at the same sector is a
    /// no-op. If a *different* descriptor already occupies the sector it is
    /// returned as an alias and nothing is inserted; the caller must move the
    /// alias out (usually straight to dispatch) and retry.
    pub fn insert(&mut self, arena: &mut RequestArena, handle: RequestHandle) -> Option<RequestHandle> {
        let rq = arena.rq_mut(handle);
        let key = rq.sector;
        if rq.sort_key == Some(key) && self.map.get(&key) == Some(&handle) {
            return None;
        }
        if let Some(&alias) = self.map.get(&key) {
            if alias != handle {
                return Some(alias);
            }
        }
        if let Some(old) = rq.sort_key.replace(key) {
            if old != key && self.map.get(&old) == Some(&handle) {
                self.map.remove(&old);
            }
        }
        self.map.insert(key, handle);
        None
    }

    /// Remove `handle`; returns whether it was indexed here
    pub fn remove(&mut self, arena: &mut RequestArena, handle: RequestHandle) -> bool {
        let Some(rq) = arena.get_mut(handle) else {
            return false;
        };
        let Some(key) = rq.sort_key else {
            return false;
        };
        if self.map.get(&key) != Some(&handle) {
            return false;
        }
        rq.sort_key = None;
        self.map.remove(&key);
        true
    }

    /// Descriptor starting exactly at `sector`
    #[inline]
    pub fn find(&self, sector: Sector) -> Option<RequestHandle> {
        self.map.get(&sector).copied()
    }

    /// Lowest-sector descriptor
    #[inline]
    pub fn first(&self) -> Option<RequestHandle> {
        self.map.values().next().copied()
    }

    /// Sector-order successor of `handle`
    pub fn next(&self, arena: &RequestArena, handle: RequestHandle) -> Option<RequestHandle> {
        let key = arena.rq(handle).sort_key?;
        self.map
            .range((core::ops::Bound::Excluded(key), core::ops::Bound::Unbounded))
            .next()
            .map(|(_, &h)| h)
    }

    /// Sector-order predecessor of `handle`
    pub fn prev(&self, arena: &RequestArena, handle: RequestHandle) -> Option<RequestHandle> {
        let key = arena.rq(handle).sort_key?;
        self.map.range(..key).next_back().map(|(_, &h)| h)
    }

    /// Number of indexed descriptors
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing is indexed
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Handles in sector order
    pub fn iter(&self) -> impl Iterator<Item = RequestHandle> + '_ {
        self.map.values().copied()
    }

    /// Every entry is live and keyed by its own start sector
    pub fn check_invariants(&self, arena: &RequestArena) -> Result<(), InvariantViolation> {
        for (&key, &handle) in &self.map {
            let rq = arena.get(handle).ok_or(InvariantViolation::MissingReference)?;
            ensure(rq.sort_key == Some(key), InvariantViolation::IndexMismatch)?;
            ensure(rq.sector == key, InvariantViolation::IndexMismatch)?;
        }
        Ok(())
    }
}

// =============================================================================
// FIFO
// =============================================================================

/// Arrival-ordered list supporting removal from the middle
#[derive(Debug, Default)]
pub struct FifoList {
    map: BTreeMap<u64, RequestHandle>,
    next_seq: u64,
}

impl FifoList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Append `handle`; a descriptor already on the list keeps its place
    pub fn push_back(&mut self, arena: &mut RequestArena, handle: RequestHandle) {
        let rq = arena.rq_mut(handle);
        if let Some(seq) = rq.fifo_seq {
            if self.map.get(&seq) == Some(&handle) {
                return;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        rq.fifo_seq = Some(seq);
        self.map.insert(seq, handle);
    }

    /// Unlink `handle`; returns whether it was on this list
    pub fn remove(&mut self, arena: &mut RequestArena, handle: RequestHandle) -> bool {
        let Some(rq) = arena.get_mut(handle) else {
            return false;
        };
        let Some(seq) = rq.fifo_seq else {
            return false;
        };
        if self.map.get(&seq) != Some(&handle) {
            return false;
        }
        rq.fifo_seq = None;
        self.map.remove(&seq);
        true
    }

    /// Move `handle` into the position held by `other`, which leaves the list
    pub fn take_position(&mut self, arena: &mut RequestArena, handle: RequestHandle, other: RequestHandle) {
        let Some(seq) = arena.rq(other).fifo_seq else {
            return;
        };
        self.remove(arena, other);
        self.remove(arena, handle);
        arena.rq_mut(handle).fifo_seq = Some(seq);
        self.map.insert(seq, handle);
    }

    /// Oldest descriptor
    #[inline]
    pub fn front(&self) -> Option<RequestHandle> {
        self.map.values().next().copied()
    }

    /// Newest descriptor
    #[inline]
    pub fn back(&self) -> Option<RequestHandle> {
        self.map.values().next_back().copied()
    }

    /// Descriptor queued just before `handle`
    pub fn prev(&self, arena: &RequestArena, handle: RequestHandle) -> Option<RequestHandle> {
        let seq = arena.rq(handle).fifo_seq?;
        self.map.range(..seq).next_back().map(|(_, &h)| h)
    }

    /// Descriptor queued just after `handle`
    pub fn next(&self, arena: &RequestArena, handle: RequestHandle) -> Option<RequestHandle> {
        let seq = arena.rq(handle).fifo_seq?;
        self.map
            .range((core::ops::Bound::Excluded(seq), core::ops::Bound::Unbounded))
            .next()
            .map(|(_, &h)| h)
    }

    /// Number of descriptors
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the list is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Handles oldest first
    pub fn iter(&self) -> impl Iterator<Item = RequestHandle> + '_ {
        self.map.values().copied()
    }

    /// Every entry is live and records its own position
    pub fn check_invariants(&self, arena: &RequestArena) -> Result<(), InvariantViolation> {
        for (&seq, &handle) in &self.map {
            let rq = arena.get(handle).ok_or(InvariantViolation::MissingReference)?;
            ensure(rq.fifo_seq == Some(seq), InvariantViolation::IndexMismatch)?;
        }
        Ok(())
    }
}

// =============================================================================
// STREAM QUEUE
// =============================================================================

/// Sector index plus FIFO over the same descriptors
#[derive(Debug, Default)]
pub struct StreamQueue {
    /// Sector-ordered view
    pub sort: SectorIndex,
    /// Arrival-ordered view
    pub fifo: FifoList,
    /// Cached next descriptor to serve
    pub next_rq: Option<RequestHandle>,
}

impl StreamQueue {
    /// Create an empty stream
    pub const fn new() -> Self {
        Self {
            sort: SectorIndex::new(),
            fifo: FifoList::new(),
            next_rq: None,
        }
    }

    /// Index `handle` in both views.
    ///
    /// Returns an alias occupying the same start sector; nothing was added in
    /// that case.
    pub fn add(&mut self, arena: &mut RequestArena, handle: RequestHandle) -> Option<RequestHandle> {
        if let Some(alias) = self.sort.insert(arena, handle) {
            return Some(alias);
        }
        self.fifo.push_back(arena, handle);
        None
    }

    /// Remove `handle` from both views, clearing the cache if it pointed here
    pub fn remove(&mut self, arena: &mut RequestArena, handle: RequestHandle) {
        self.sort.remove(arena, handle);
        self.fifo.remove(arena, handle);
        if self.next_rq == Some(handle) {
            self.next_rq = None;
        }
    }

    /// Re-key `handle` in the sector view after its start sector moved.
    ///
    /// Returns an alias now colliding with the new sector, if any.
    pub fn reposition(&mut self, arena: &mut RequestArena, handle: RequestHandle) -> Option<RequestHandle> {
        self.sort.remove(arena, handle);
        self.sort.insert(arena, handle)
    }

    /// Number of pending descriptors
    #[inline]
    pub fn len(&self) -> usize {
        self.sort.len()
    }

    /// Whether nothing is pending
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sort.is_empty()
    }

    /// Both views hold the same descriptors
    pub fn check_invariants(&self, arena: &RequestArena) -> Result<(), InvariantViolation> {
        self.sort.check_invariants(arena)?;
        self.fifo.check_invariants(arena)?;
        ensure(self.sort.len() == self.fifo.len(), InvariantViolation::CountMismatch)?;
        for handle in self.fifo.iter() {
            ensure(
                self.sort.find(arena.rq(handle).sector) == Some(handle),
                InvariantViolation::IndexMismatch,
            )?;
        }
        if let Some(next) = self.next_rq {
            ensure(
                arena.get(next).and_then(|rq| rq.sort_key).is_some(),
                InvariantViolation::MissingReference,
            )?;
        }
        Ok(())
    }
}

// =============================================================================
// NEAREST DESCRIPTOR
// =============================================================================

/// Head-movement cost model for picking the nearest descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekModel {
    /// Sector the head is parked at
    pub last_sector: Sector,
    /// Furthest backward seek still allowed, in sectors
    pub back_max: Sector,
    /// Multiplier applied to backward distance
    pub back_penalty: u64,
}

/// Pick the better of two candidate positions.
///
/// Forward movement costs its distance; backward movement within
/// `back_max` costs `back_penalty` times the distance; anything further back
/// "wraps" and loses to any non-wrapping candidate. When both wrap the lower
/// sector wins, and equal costs go to the higher sector. Returns `true` when
/// `s1` is chosen.
pub fn prefer_first(model: &SeekModel, s1: Sector, s2: Sector) -> bool {
    let cost = |s: Sector| -> Option<u64> {
        if s >= model.last_sector {
            Some(s - model.last_sector)
        } else if s + model.back_max >= model.last_sector {
            Some((model.last_sector - s).saturating_mul(model.back_penalty))
        } else {
            None
        }
    };

    match (cost(s1), cost(s2)) {
        (Some(d1), Some(d2)) => {
            if d1 != d2 {
                d1 < d2
            } else {
                s1 >= s2
            }
        }
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => s1 <= s2,
    }
}

/// Choose between two optional candidates with [`prefer_first`]
pub fn choose_nearest(
    arena: &RequestArena,
    model: &SeekModel,
    rq1: Option<RequestHandle>,
    rq2: Option<RequestHandle>,
) -> Option<RequestHandle> {
    match (rq1, rq2) {
        (None, other) | (other, None) => other,
        (Some(a), Some(b)) if a == b => Some(a),
        (Some(a), Some(b)) => {
            let (ra, rb) = (arena.rq(a), arena.rq(b));
            match (ra.is_sync(), rb.is_sync()) {
                (true, false) => Some(a),
                (false, true) => Some(b),
                _ => {
                    if prefer_first(model, ra.sector, rb.sector) {
                        Some(a)
                    } else {
                        Some(b)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Bio, Request};

    fn insert(arena: &mut RequestArena, sector: u64) -> RequestHandle {
        arena
            .insert(Request::from_bio(&Bio::write(1, sector, 8), 0))
            .unwrap()
    }

    #[test]
    fn test_sector_order_navigation() {
        let mut arena = RequestArena::new(8);
        let mut index = SectorIndex::new();
        let a = insert(&mut arena, 100);
        let b = insert(&mut arena, 10);
        let c = insert(&mut arena, 50);
        for h in [a, b, c] {
            assert!(index.insert(&mut arena, h).is_none());
        }

        assert_eq!(index.first(), Some(b));
        assert_eq!(index.next(&arena, b), Some(c));
        assert_eq!(index.next(&arena, c), Some(a));
        assert_eq!(index.next(&arena, a), None);
        assert_eq!(index.prev(&arena, c), Some(b));
        index.check_invariants(&arena).unwrap();
    }

    #[test]
    fn test_reinsert_same_sector_is_noop() {
        let mut arena = RequestArena::new(8);
        let mut stream = StreamQueue::new();
        let a = insert(&mut arena, 64);
        assert!(stream.add(&mut arena, a).is_none());
        assert!(stream.add(&mut arena, a).is_none());
        assert_eq!(stream.sort.len(), 1);
        assert_eq!(stream.fifo.len(), 1);
        stream.check_invariants(&arena).unwrap();
    }

    #[test]
    fn test_alias_reported() {
        let mut arena = RequestArena::new(8);
        let mut stream = StreamQueue::new();
        let a = insert(&mut arena, 64);
        let b = insert(&mut arena, 64);
        assert!(stream.add(&mut arena, a).is_none());
        assert_eq!(stream.add(&mut arena, b), Some(a));
        assert_eq!(arena.rq(b).sort_key(), None);
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn test_remove_clears_all_positions() {
        let mut arena = RequestArena::new(8);
        let mut stream = StreamQueue::new();
        let a = insert(&mut arena, 8);
        stream.add(&mut arena, a);
        stream.next_rq = Some(a);
        stream.remove(&mut arena, a);
        assert!(stream.is_empty());
        assert!(stream.fifo.is_empty());
        assert_eq!(stream.next_rq, None);
        assert!(!arena.rq(a).is_indexed());
    }

    #[test]
    fn test_fifo_take_position() {
        let mut arena = RequestArena::new(8);
        let mut fifo = FifoList::new();
        let a = insert(&mut arena, 0);
        let b = insert(&mut arena, 8);
        let c = insert(&mut arena, 16);
        for h in [a, b, c] {
            fifo.push_back(&mut arena, h);
        }
        assert_eq!(fifo.prev(&arena, b), Some(a));
        assert_eq!(fifo.next(&arena, b), Some(c));
        assert_eq!(fifo.back(), Some(c));

        // c takes over a's slot at the head
        fifo.take_position(&mut arena, c, a);
        assert_eq!(fifo.iter().collect::<alloc::vec::Vec<_>>(), [c, b]);
        assert_eq!(fifo.prev(&arena, b), Some(c));
        fifo.check_invariants(&arena).unwrap();
    }

    #[test]
    fn test_nearest_forward_beats_penalized_back() {
        let model = SeekModel {
            last_sector: 1000,
            back_max: 1000,
            back_penalty: 2,
        };
        // 300 forward vs 200 back (cost 400)
        assert!(prefer_first(&model, 1300, 800));
        // 300 forward vs 100 back (cost 200)
        assert!(!prefer_first(&model, 1300, 900));
    }

    #[test]
    fn test_nearest_wrap_rules() {
        let model = SeekModel {
            last_sector: 10_000,
            back_max: 100,
            back_penalty: 2,
        };
        // beyond the back window always loses to a reachable position
        assert!(prefer_first(&model, 50_000, 5_000));
        assert!(!prefer_first(&model, 5_000, 50_000));
        // both wrap: lower sector first
        assert!(prefer_first(&model, 100, 5_000));
        // equal cost: higher sector
        assert!(prefer_first(&model, 10_010, 9_995));
    }

    #[test]
    fn test_choose_prefers_sync() {
        let mut arena = RequestArena::new(8);
        let sync = arena
            .insert(Request::from_bio(&Bio::read(1, 90_000, 8), 0))
            .unwrap();
        let write = insert(&mut arena, 10);
        let model = SeekModel {
            last_sector: 0,
            back_max: 0,
            back_penalty: 2,
        };
        assert_eq!(choose_nearest(&arena, &model, Some(write), Some(sync)), Some(sync));
        assert_eq!(choose_nearest(&arena, &model, None, Some(write)), Some(write));
    }
}
