//! Device-facing dispatch list.
//!
//! The FIFO the driver consumes. Policies feed it either at the tail or in
//! sector order relative to the current head boundary; barrier and requeue
//! inserts bypass the policy and go to the front or back directly.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::arena::RequestArena;
use crate::error::{ensure, InvariantViolation};
use crate::request::{RequestFlags, RequestHandle, Sector};

/// Dispatch list plus the head-position boundary used by sorted insertion
#[derive(Debug, Default)]
pub struct DispatchList {
    queue: VecDeque<RequestHandle>,
    /// End sector of the last descriptor handed to the driver
    end_sector: Sector,
    /// Descriptor that will move the boundary when the driver picks it up
    boundary_rq: Option<RequestHandle>,
}

impl DispatchList {
    /// Create an empty list
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            end_sector: 0,
            boundary_rq: None,
        }
    }

    /// Append at the tail
    pub fn add_tail(&mut self, arena: &mut RequestArena, handle: RequestHandle) {
        self.link(arena, handle);
        self.queue.push_back(handle);
    }

    /// Push at the head
    pub fn add_front(&mut self, arena: &mut RequestArena, handle: RequestHandle) {
        self.link(arena, handle);
        self.queue.push_front(handle);
    }

    /// Insert in sector order after the head boundary.
    ///
    /// Scans backwards from the tail and never moves in front of a started
    /// or barrier descriptor. Descriptors at or past the boundary sort
    /// before those that already wrapped below it.
    pub fn add_sorted(&mut self, arena: &mut RequestArena, handle: RequestHandle) {
        let sector = arena.rq(handle).sector;
        let boundary = self.end_sector;

        let mut pos = self.queue.len();
        while pos > 0 {
            let prev = arena.rq(self.queue[pos - 1]);
            if prev
                .flags
                .intersects(RequestFlags::SOFTBARRIER | RequestFlags::BARRIER | RequestFlags::STARTED)
            {
                break;
            }
            if sector >= boundary {
                if prev.sector < boundary {
                    pos -= 1;
                    continue;
                }
            } else if prev.sector >= boundary {
                break;
            }
            if sector >= prev.sector {
                break;
            }
            pos -= 1;
        }

        self.link(arena, handle);
        self.queue.insert(pos, handle);
    }

    /// Head of the list
    #[inline]
    pub fn front(&self) -> Option<RequestHandle> {
        self.queue.front().copied()
    }

    /// Tail of the list
    #[inline]
    pub fn back(&self) -> Option<RequestHandle> {
        self.queue.back().copied()
    }

    /// Unlink `handle`; returns whether it was on the list
    pub fn remove(&mut self, arena: &mut RequestArena, handle: RequestHandle) -> bool {
        let Some(pos) = self.queue.iter().position(|&h| h == handle) else {
            return false;
        };
        self.queue.remove(pos);
        if let Some(rq) = arena.get_mut(handle) {
            rq.flags.remove(RequestFlags::QUEUED);
        }
        if self.boundary_rq == Some(handle) {
            self.boundary_rq = None;
        }
        true
    }

    /// Move the head boundary to the end of `handle` as the driver takes it
    pub fn advance_boundary(&mut self, arena: &RequestArena, handle: RequestHandle) {
        if self.boundary_rq.is_none() || self.boundary_rq == Some(handle) {
            self.end_sector = arena.rq(handle).end_sector();
            self.boundary_rq = None;
        }
    }

    /// Pin the boundary to `handle` (barrier ordering)
    pub fn set_boundary(&mut self, arena: &RequestArena, handle: RequestHandle) {
        self.end_sector = arena.rq(handle).end_sector();
        self.boundary_rq = Some(handle);
    }

    /// Current head boundary
    #[inline]
    pub fn end_sector(&self) -> Sector {
        self.end_sector
    }

    /// Number of queued descriptors
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Handles in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = RequestHandle> + '_ {
        self.queue.iter().copied()
    }

    /// Snapshot of the sectors in dispatch order
    pub fn sectors(&self, arena: &RequestArena) -> Vec<Sector> {
        self.queue.iter().map(|&h| arena.rq(h).sector).collect()
    }

    /// Every entry is live, flagged as queued, and appears once
    pub fn check_invariants(&self, arena: &RequestArena) -> Result<(), InvariantViolation> {
        for (i, &handle) in self.queue.iter().enumerate() {
            let rq = arena.get(handle).ok_or(InvariantViolation::MissingReference)?;
            ensure(rq.flags.contains(RequestFlags::QUEUED), InvariantViolation::IndexMismatch)?;
            ensure(!rq.is_indexed(), InvariantViolation::DoubleInsertion)?;
            ensure(
                !self.queue.iter().skip(i + 1).any(|&h| h == handle),
                InvariantViolation::DoubleInsertion,
            )?;
        }
        Ok(())
    }

    fn link(&mut self, arena: &mut RequestArena, handle: RequestHandle) {
        let rq = arena.rq_mut(handle);
        crate::bug_on!(rq.flags.contains(RequestFlags::QUEUED), InvariantViolation::DoubleInsertion);
        crate::bug_on!(rq.is_indexed(), InvariantViolation::DoubleInsertion);
        rq.flags.insert(RequestFlags::QUEUED);
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
    fn test_sorted_insert_ascending() {
        let mut arena = RequestArena::new(8);
        let mut list = DispatchList::new();
        for sector in [300, 100, 200] {
            let h = insert(&mut arena, sector);
            list.add_sorted(&mut arena, h);
        }
        assert_eq!(list.sectors(&arena), [100, 200, 300]);
        list.check_invariants(&arena).unwrap();
    }

    #[test]
    fn test_sorted_insert_wraps_below_boundary() {
        let mut arena = RequestArena::new(8);
        let mut list = DispatchList::new();
        let head = insert(&mut arena, 992);
        list.add_tail(&mut arena, head);
        arena.rq_mut(head).flags.insert(RequestFlags::STARTED);
        list.advance_boundary(&arena, head);
        assert_eq!(list.end_sector(), 1000);

        for sector in [50, 2000, 1500] {
            let h = insert(&mut arena, sector);
            list.add_sorted(&mut arena, h);
        }
        // ahead of the head first, then the wrapped one
        assert_eq!(list.sectors(&arena), [992, 1500, 2000, 50]);
    }

    #[test]
    fn test_sorted_insert_stops_at_started() {
        let mut arena = RequestArena::new(8);
        let mut list = DispatchList::new();
        let started = insert(&mut arena, 500);
        list.add_tail(&mut arena, started);
        arena.rq_mut(started).flags.insert(RequestFlags::STARTED);

        let h = insert(&mut arena, 10);
        list.add_sorted(&mut arena, h);
        assert_eq!(list.sectors(&arena), [500, 10]);
    }

    #[test]
    fn test_remove() {
        let mut arena = RequestArena::new(8);
        let mut list = DispatchList::new();
        let a = insert(&mut arena, 0);
        list.add_front(&mut arena, a);
        assert!(list.remove(&mut arena, a));
        assert!(!list.remove(&mut arena, a));
        assert!(!arena.rq(a).flags.contains(RequestFlags::QUEUED));
    }

    #[test]
    #[should_panic]
    fn test_double_insert_is_fatal() {
        let mut arena = RequestArena::new(8);
        let mut list = DispatchList::new();
        let a = insert(&mut arena, 0);
        list.add_tail(&mut arena, a);
        list.add_tail(&mut arena, a);
    }
}
