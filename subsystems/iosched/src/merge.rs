//! # Merge Index
//!
//! Policy-independent merge support: the per-queue hash keyed by ending
//! sector that gives O(1) back-merge lookup, the front-merge lookup over a
//! sector-ordered index, and the geometry test every merge must pass.

use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::arena::RequestArena;
use crate::error::{ensure, InvariantViolation};
use crate::request::{Bio, Request, RequestFlags, RequestHandle, Sector};
use crate::stream::SectorIndex;

// =============================================================================
// MERGE TYPES
// =============================================================================

/// Outcome of a merge lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeType {
    /// Bio appended to the end of the descriptor
    Back,
    /// Bio prepended to the start of the descriptor
    Front,
    /// No candidate, a new descriptor is needed
    None,
}

/// Device transfer limits consulted by the geometry test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Largest descriptor in sectors
    pub max_sectors: u32,
    /// Largest scatter/gather list
    pub max_segments: u16,
}

impl QueueLimits {
    /// 512 KiB transfers, 128 segments
    pub const DEFAULT: Self = Self {
        max_sectors: 1024,
        max_segments: 128,
    };
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// =============================================================================
// GEOMETRY
// =============================================================================

/// Can `bio` be merged into `rq` at all (before checking adjacency)?
///
/// Same device, same direction, descriptor not yet started or otherwise
/// closed to merging.
pub fn rq_merge_ok(rq: &Request, bio: &Bio) -> bool {
    rq.is_mergeable()
        && !bio.flags.intersects(RequestFlags::BARRIER | RequestFlags::NOMERGE)
        && rq.dir == bio.dir
        && rq.device == bio.device
}

/// Does the merged descriptor stay within the device limits?
pub fn fits_limits(limits: &QueueLimits, sectors: u64, segments: u32) -> bool {
    sectors <= limits.max_sectors as u64 && segments <= limits.max_segments as u32
}

/// Full test for merging `bio` into `rq` as `kind`
pub fn bio_merge_fits(limits: &QueueLimits, rq: &Request, bio: &Bio, kind: MergeType) -> bool {
    let adjacent = match kind {
        MergeType::Back => rq.end_sector() == bio.sector,
        MergeType::Front => bio.end_sector() == rq.sector,
        MergeType::None => false,
    };
    adjacent
        && rq_merge_ok(rq, bio)
        && fits_limits(
            limits,
            rq.nr_sectors as u64 + bio.nr_sectors as u64,
            rq.nr_segments as u32 + bio.nr_segments as u32,
        )
}

/// Can descriptor `next` be absorbed into the contiguous `rq`?
pub fn requests_merge_fit(limits: &QueueLimits, rq: &Request, next: &Request) -> bool {
    rq.end_sector() == next.sector
        && rq.is_mergeable()
        && next.is_mergeable()
        && rq.dir == next.dir
        && rq.device == next.device
        && fits_limits(
            limits,
            rq.nr_sectors as u64 + next.nr_sectors as u64,
            rq.nr_segments as u32 + next.nr_segments as u32,
        )
}

// =============================================================================
// MERGE HASH
// =============================================================================

/// Hash of mergeable descriptors keyed by ending sector
#[derive(Debug, Default)]
pub struct MergeHash {
    buckets: HashMap<Sector, Vec<RequestHandle>>,
    len: usize,
}

impl MergeHash {
    /// Create an empty hash
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            len: 0,
        }
    }

    /// Index `handle` under its current end sector.
    ///
    /// Re-adding a descriptor already hashed under the same key is a no-op.
    pub fn add(&mut self, arena: &mut RequestArena, handle: RequestHandle) {
        let rq = arena.rq_mut(handle);
        let key = rq.end_sector();
        let current = rq.hash_key;
        match current {
            Some(old) if old == key => return,
            Some(_) => {
                self.remove(arena, handle);
                return self.add(arena, handle);
            }
            None => {}
        }
        arena.rq_mut(handle).hash_key = Some(key);
        self.buckets.entry(key).or_default().push(handle);
        self.len += 1;
    }

    /// Drop `handle` from the hash if present
    pub fn remove(&mut self, arena: &mut RequestArena, handle: RequestHandle) {
        let Some(rq) = arena.get_mut(handle) else {
            return;
        };
        let Some(key) = rq.hash_key.take() else {
            return;
        };
        self.unlink(key, handle);
    }

    /// Re-key `handle` after its end sector moved
    pub fn reposition(&mut self, arena: &mut RequestArena, handle: RequestHandle) {
        self.remove(arena, handle);
        self.add(arena, handle);
    }

    /// Find a mergeable descriptor ending at `sector`.
    ///
    /// Descriptors that stopped being mergeable are dropped from the hash on
    /// the way.
    pub fn find_back_merge(
        &mut self,
        arena: &mut RequestArena,
        sector: Sector,
    ) -> Option<RequestHandle> {
        let candidates = self.buckets.get(&sector)?.clone();
        for handle in candidates {
            if arena.rq(handle).is_mergeable() {
                return Some(handle);
            }
            self.remove(arena, handle);
        }
        None
    }

    /// Number of hashed descriptors
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is hashed
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Every hashed descriptor is live and records the key it sits under
    pub fn check_invariants(&self, arena: &RequestArena) -> Result<(), InvariantViolation> {
        let mut count = 0;
        for (&key, bucket) in &self.buckets {
            for &handle in bucket {
                let rq = arena.get(handle).ok_or(InvariantViolation::MissingReference)?;
                ensure(rq.hash_key == Some(key), InvariantViolation::IndexMismatch)?;
                count += 1;
            }
        }
        ensure(count == self.len, InvariantViolation::CountMismatch)
    }

    fn unlink(&mut self, key: Sector, handle: RequestHandle) {
        if let Some(bucket) = self.buckets.get_mut(&key) {
            if let Some(pos) = bucket.iter().position(|&h| h == handle) {
                bucket.swap_remove(pos);
                self.len -= 1;
            }
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
        }
    }
}

/// Find a descriptor in `index` starting where `bio` ends
pub fn find_front_merge(
    index: &SectorIndex,
    arena: &RequestArena,
    limits: &QueueLimits,
    bio: &Bio,
) -> Option<RequestHandle> {
    let handle = index.find(bio.end_sector())?;
    bio_merge_fits(limits, arena.rq(handle), bio, MergeType::Front).then_some(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(arena: &mut RequestArena, sector: u64, len: u32) -> RequestHandle {
        arena
            .insert(Request::from_bio(&Bio::write(1, sector, len), 0))
            .unwrap()
    }

    #[test]
    fn test_back_merge_lookup() {
        let mut arena = RequestArena::new(8);
        let mut hash = MergeHash::new();
        let a = insert(&mut arena, 0, 8);
        hash.add(&mut arena, a);

        assert_eq!(hash.find_back_merge(&mut arena, 8), Some(a));
        assert_eq!(hash.find_back_merge(&mut arena, 16), None);
        hash.check_invariants(&arena).unwrap();
    }

    #[test]
    fn test_reposition_after_growth() {
        let mut arena = RequestArena::new(8);
        let mut hash = MergeHash::new();
        let a = insert(&mut arena, 0, 8);
        hash.add(&mut arena, a);

        arena.rq_mut(a).back_merge(&Bio::write(1, 8, 8));
        hash.reposition(&mut arena, a);
        assert_eq!(hash.find_back_merge(&mut arena, 8), None);
        assert_eq!(hash.find_back_merge(&mut arena, 16), Some(a));
        assert_eq!(hash.len(), 1);
    }

    #[test]
    fn test_readd_same_key_is_noop() {
        let mut arena = RequestArena::new(8);
        let mut hash = MergeHash::new();
        let a = insert(&mut arena, 0, 8);
        hash.add(&mut arena, a);
        hash.add(&mut arena, a);
        assert_eq!(hash.len(), 1);
        hash.check_invariants(&arena).unwrap();
    }

    #[test]
    fn test_unmergeable_dropped_on_lookup() {
        let mut arena = RequestArena::new(8);
        let mut hash = MergeHash::new();
        let a = insert(&mut arena, 0, 8);
        hash.add(&mut arena, a);
        arena.rq_mut(a).flags.insert(RequestFlags::STARTED);

        assert_eq!(hash.find_back_merge(&mut arena, 8), None);
        assert!(hash.is_empty());
        assert_eq!(arena.rq(a).hash_key(), None);
    }

    #[test]
    fn test_geometry_limits() {
        let limits = QueueLimits {
            max_sectors: 16,
            max_segments: 4,
        };
        let rq = Request::from_bio(&Bio::write(1, 0, 8), 0);
        assert!(bio_merge_fits(&limits, &rq, &Bio::write(1, 8, 8), MergeType::Back));
        assert!(!bio_merge_fits(&limits, &rq, &Bio::write(1, 8, 16), MergeType::Back));
        assert!(!bio_merge_fits(&limits, &rq, &Bio::read(1, 8, 8), MergeType::Back));
        assert!(!bio_merge_fits(&limits, &rq, &Bio::write(2, 8, 8), MergeType::Back));
        assert!(!bio_merge_fits(&limits, &rq, &Bio::write(1, 8, 8).barrier(), MergeType::Back));
        assert!(!bio_merge_fits(
            &limits,
            &rq,
            &Bio::write(1, 8, 2).with_segments(4),
            MergeType::Back
        ));
    }

    #[test]
    fn test_front_merge_lookup() {
        let mut arena = RequestArena::new(8);
        let mut index = SectorIndex::new();
        let a = insert(&mut arena, 16, 8);
        assert!(index.insert(&mut arena, a).is_none());

        let limits = QueueLimits::DEFAULT;
        assert_eq!(
            find_front_merge(&index, &arena, &limits, &Bio::write(1, 8, 8)),
            Some(a)
        );
        assert_eq!(find_front_merge(&index, &arena, &limits, &Bio::write(1, 0, 8)), None);
    }
}
