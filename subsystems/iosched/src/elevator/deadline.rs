//! # Deadline Elevator
//!
//! One sector-sorted stream per direction, each with an expiry FIFO.
//!
//! Descriptors are dispatched in one-way sector sweeps ("batches") of up to
//! `fifo_batch` descriptors. At every batch boundary reads are preferred,
//! unless writes have been passed over `writes_starved` times in a row. Within
//! the chosen direction an expired FIFO head always goes first.
//!
//! ```text
//!            ┌──────────── batch boundary ────────────┐
//!            ▼                                        │
//!   reads? ──yes── starved >= writes_starved? ──yes── write
//!     │                    │no
//!     no                 read
//!     ▼                    │
//!   write ───────▶  FIFO head expired? ──yes──▶ head (new batch)
//!                          │no
//!                    cached next? ──yes──▶ next (same batch)
//!                          │no
//!                    lowest sector (new batch)
//! ```

use alloc::boxed::Box;

use super::{ElevatorOps, ElevatorType, ElvCtx};
use crate::arena::RequestArena;
use crate::config::{DeadlineTunables, QueueConfig};
use crate::error::{ensure, IoSchedResult, InvariantViolation};
use crate::merge::{find_front_merge, MergeType};
use crate::request::{Bio, Direction, RequestHandle, Sector};
use crate::stream::StreamQueue;
use crate::tunables::{TunableDef, TunableSet};

/// Registry entry
pub static DEADLINE: ElevatorType = ElevatorType {
    name: "deadline",
    init: deadline_init,
};

fn deadline_init(config: &QueueConfig) -> IoSchedResult<Box<dyn ElevatorOps>> {
    Ok(Box::new(Deadline::new(config.deadline)))
}

// =============================================================================
// STATE
// =============================================================================

/// Deadline policy state
#[derive(Debug)]
pub struct Deadline {
    /// Read and write streams, indexed by [`Direction::index`]
    streams: [StreamQueue; 2],
    /// Descriptors dispatched in the current batch
    batching: u64,
    /// Consecutive read batches chosen while writes were pending
    starved: u64,
    /// End of the last dispatched descriptor
    last_sector: Sector,
    tunables: DeadlineTunables,
}

impl Deadline {
    /// Create an empty policy
    pub const fn new(tunables: DeadlineTunables) -> Self {
        Self {
            streams: [StreamQueue::new(), StreamQueue::new()],
            batching: 0,
            starved: 0,
            last_sector: 0,
            tunables,
        }
    }

    /// Current tunables
    pub fn tunables(&self) -> &DeadlineTunables {
        &self.tunables
    }

    fn expire_for(&self, dir: Direction) -> u64 {
        match dir {
            Direction::Read => self.tunables.read_expire,
            Direction::Write => self.tunables.write_expire,
        }
    }

    /// Sector-index `rq`, dispatching any alias already at its sector
    fn add_rq_sorted(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle) {
        let dir = ctx.arena.rq(rq).dir.index();
        while let Some(alias) = self.streams[dir].sort.insert(ctx.arena, rq) {
            log::debug!("deadline: alias at sector {}", ctx.arena.rq(alias).sector);
            self.move_request(ctx, alias);
        }
    }

    /// Drop `rq` from both views, advancing the cached next if it pointed here
    fn remove_request(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle) {
        let stream = &mut self.streams[ctx.arena.rq(rq).dir.index()];
        let was_next = stream.next_rq == Some(rq);
        let successor = stream.sort.next(ctx.arena, rq);
        stream.remove(ctx.arena, rq);
        if was_next {
            stream.next_rq = successor;
        }
    }

    /// Hand `rq` to the dispatch list and remember where the sweep continues
    fn move_request(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle) {
        let (dir, end) = {
            let r = ctx.arena.rq(rq);
            (r.dir.index(), r.end_sector())
        };
        let successor = self.streams[dir].sort.next(ctx.arena, rq);

        self.streams[Direction::Read.index()].next_rq = None;
        self.streams[Direction::Write.index()].next_rq = None;
        self.streams[dir].next_rq = successor;
        self.last_sector = end;

        self.remove_request(ctx, rq);
        ctx.dispatch_add_tail(rq);
    }

    /// Whether the oldest descriptor of `dir` is past its deadline
    fn check_fifo(&self, ctx: &ElvCtx<'_>, dir: Direction) -> bool {
        self.streams[dir.index()]
            .fifo
            .front()
            .is_some_and(|rq| ctx.now() > ctx.arena.rq(rq).fifo_time())
    }

    fn dispatch_one(&mut self, ctx: &mut ElvCtx<'_>) -> bool {
        let reads = !self.streams[Direction::Read.index()].fifo.is_empty();
        let writes = !self.streams[Direction::Write.index()].fifo.is_empty();

        let cached = self.streams[Direction::Write.index()]
            .next_rq
            .or(self.streams[Direction::Read.index()].next_rq);
        if let Some(rq) = cached {
            if self.last_sector != ctx.arena.rq(rq).sector {
                // non-sequential, close the batch
                self.batching += self.tunables.fifo_batch;
            }
            if self.batching < self.tunables.fifo_batch {
                self.batching += 1;
                self.move_request(ctx, rq);
                return true;
            }
        }

        let dir = if reads {
            crate::bug_on!(
                self.streams[Direction::Read.index()].sort.is_empty(),
                InvariantViolation::IndexMismatch
            );
            // only batches that pass over waiting writes count
            let starve_writes = writes && {
                let starved = self.starved;
                self.starved += 1;
                starved >= self.tunables.writes_starved
            };
            if starve_writes {
                self.starved = 0;
                Direction::Write
            } else {
                Direction::Read
            }
        } else if writes {
            self.starved = 0;
            Direction::Write
        } else {
            return false;
        };

        let stream = &self.streams[dir.index()];
        let rq = if self.check_fifo(ctx, dir) {
            self.batching = 0;
            stream.fifo.front()
        } else if let Some(next) = stream.next_rq {
            Some(next)
        } else {
            // one-way sweep: restart from the lowest sector
            self.batching = 0;
            stream.sort.first()
        };
        let Some(rq) = rq else {
            crate::bug_on!(true, InvariantViolation::DispatchFromEmpty);
            return false;
        };

        self.batching += 1;
        self.move_request(ctx, rq);
        true
    }
}

// =============================================================================
// ELEVATOR OPS
// =============================================================================

impl ElevatorOps for Deadline {
    fn name(&self) -> &'static str {
        "deadline"
    }

    fn merge(&mut self, ctx: &mut ElvCtx<'_>, bio: &Bio) -> Option<RequestHandle> {
        if self.tunables.front_merges == 0 {
            return None;
        }
        find_front_merge(&self.streams[bio.dir.index()].sort, ctx.arena, ctx.limits(), bio)
    }

    fn merged(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle, kind: MergeType) {
        if kind == MergeType::Front {
            // start sector moved, re-key it
            let dir = ctx.arena.rq(rq).dir.index();
            self.streams[dir].sort.remove(ctx.arena, rq);
            self.add_rq_sorted(ctx, rq);
        }
    }

    fn merge_requests(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle, next: RequestHandle) {
        let dir = ctx.arena.rq(rq).dir.index();
        let next_fifo = ctx.arena.rq(next).fifo_time;
        if next_fifo < ctx.arena.rq(rq).fifo_time {
            // rq inherits the older deadline and FIFO slot
            self.streams[dir].fifo.take_position(ctx.arena, rq, next);
            ctx.arena.rq_mut(rq).fifo_time = next_fifo;
        }
        self.remove_request(ctx, next);
    }

    fn add_request(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle) {
        let dir = ctx.arena.rq(rq).dir;
        self.add_rq_sorted(ctx, rq);
        let expires = ctx.now() + self.expire_for(dir);
        ctx.arena.rq_mut(rq).fifo_time = expires;
        self.streams[dir.index()].fifo.push_back(ctx.arena, rq);
    }

    fn dispatch(&mut self, ctx: &mut ElvCtx<'_>, force: bool) -> usize {
        let mut count = 0;
        while self.dispatch_one(ctx) {
            count += 1;
            if !force {
                break;
            }
        }
        count
    }

    fn former_request(&self, arena: &RequestArena, rq: RequestHandle) -> Option<RequestHandle> {
        self.streams[arena.rq(rq).dir.index()].sort.prev(arena, rq)
    }

    fn latter_request(&self, arena: &RequestArena, rq: RequestHandle) -> Option<RequestHandle> {
        self.streams[arena.rq(rq).dir.index()].sort.next(arena, rq)
    }

    fn queued(&self) -> usize {
        self.streams.iter().map(StreamQueue::len).sum()
    }

    fn tunable_defs(&self) -> &'static [TunableDef] {
        DeadlineTunables::DEFS
    }

    fn tunable(&self, name: &str) -> IoSchedResult<u64> {
        self.tunables.get(name)
    }

    fn set_tunable(&mut self, name: &str, input: &str) -> IoSchedResult<u64> {
        let value = self.tunables.store_str(name, input)?;
        log::debug!("deadline: {} = {}", name, value);
        Ok(value)
    }

    fn check_invariants(&self, arena: &RequestArena) -> Result<(), InvariantViolation> {
        for (i, stream) in self.streams.iter().enumerate() {
            stream.check_invariants(arena)?;
            for rq in stream.sort.iter() {
                ensure(arena.rq(rq).dir.index() == i, InvariantViolation::IndexMismatch)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::QueueLimits;
    use crate::testing::TestQueue;

    fn deadline_queue() -> TestQueue {
        TestQueue::new(QueueConfig::with_elevator("deadline"))
    }

    #[test]
    fn test_expired_read_beats_newer_write() {
        let t = deadline_queue();
        t.queue.submit(Bio::read(1, 5000, 8)).unwrap();
        t.clock.set(500);
        t.queue.submit(Bio::write(1, 0, 8)).unwrap();
        t.clock.set(501);
        assert_eq!(t.next_sector(), Some(5000));
    }

    #[test]
    fn test_expired_fifo_head_beats_sector_order() {
        let t = deadline_queue();
        t.queue.submit(Bio::read(1, 9000, 8)).unwrap();
        t.clock.set(400);
        t.queue.submit(Bio::read(1, 100, 8)).unwrap();

        t.clock.set(501);
        assert_eq!(t.drain_sectors(), [9000, 100]);
    }

    #[test]
    fn test_unexpired_sweep_starts_lowest() {
        let t = deadline_queue();
        t.queue.submit(Bio::read(1, 9000, 8)).unwrap();
        t.queue.submit(Bio::read(1, 100, 8)).unwrap();
        assert_eq!(t.drain_sectors(), [100, 9000]);
    }

    #[test]
    fn test_writes_starved_bound() {
        let t = deadline_queue();
        for i in 1..=4 {
            t.queue.submit(Bio::read(1, i * 1000, 8)).unwrap();
        }
        t.queue.submit(Bio::write(1, 50_000, 8)).unwrap();
        // two read batches, then the write must go
        assert_eq!(t.drain_sectors(), [1000, 2000, 50_000, 3000, 4000]);
    }

    #[test]
    fn test_read_only_batches_do_not_starve_writes() {
        let t = deadline_queue();
        for sector in [1000, 2000, 3000] {
            t.queue.submit(Bio::read(1, sector, 8)).unwrap();
            assert_eq!(t.next_sector(), Some(sector));
        }

        t.queue.submit(Bio::read(1, 4000, 8)).unwrap();
        t.queue.submit(Bio::write(1, 50_000, 8)).unwrap();
        assert_eq!(t.next_sector(), Some(4000));
        assert_eq!(t.next_sector(), Some(50_000));
    }

    #[test]
    fn test_sequential_batch_continues() {
        let t = TestQueue::with_limits(
            QueueConfig::with_elevator("deadline"),
            QueueLimits {
                max_sectors: 8,
                max_segments: 128,
            },
        );
        for sector in [0, 8, 16, 24] {
            t.queue.submit(Bio::read(1, sector, 8)).unwrap();
        }
        t.queue.submit(Bio::write(1, 100_000, 8)).unwrap();
        assert_eq!(t.queue.stats().pending, 5);
        assert_eq!(t.drain_sectors(), [0, 8, 16, 24, 100_000]);
    }

    #[test]
    fn test_alias_dispatched_immediately() {
        let t = deadline_queue();
        let mut a = Bio::write(1, 64, 8);
        a.flags |= crate::request::RequestFlags::NOMERGE;
        t.queue.submit(a.clone()).unwrap();
        t.queue.submit(a).unwrap();

        let stats = t.queue.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.dispatch_list, 1);
        t.queue.check_invariants().unwrap();
    }

    #[test]
    fn test_front_merge_rekeys() {
        let t = deadline_queue();
        t.queue.submit(Bio::write(1, 16, 8)).unwrap();
        t.queue.submit(Bio::write(1, 8, 8)).unwrap();
        t.queue.submit(Bio::write(1, 0, 8)).unwrap();
        let stats = t.queue.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.front_merges, 2);
        t.queue.check_invariants().unwrap();
        assert_eq!(t.drain_sectors(), [0]);
    }

    #[test]
    fn test_front_merges_disabled() {
        let t = deadline_queue();
        assert_eq!(t.queue.set_tunable("front_merges", "0"), Ok(0));
        t.queue.submit(Bio::write(1, 16, 8)).unwrap();
        t.queue.submit(Bio::write(1, 100, 8)).unwrap();
        // ends where the second starts, but it is not the last-merge hint
        t.queue.submit(Bio::write(1, 92, 8)).unwrap();
        assert_eq!(t.queue.stats().pending, 3);
    }

    #[test]
    fn test_front_merge_through_sort_index() {
        let t = deadline_queue();
        t.queue.submit(Bio::write(1, 16, 8)).unwrap();
        t.queue.submit(Bio::write(1, 100, 8)).unwrap();
        t.queue.submit(Bio::write(1, 92, 8)).unwrap();
        assert_eq!(t.queue.stats().pending, 2);
        t.queue.check_invariants().unwrap();
    }

    #[test]
    fn test_gap_fill_merges_requests() {
        let t = deadline_queue();
        t.queue.submit(Bio::write(1, 0, 8)).unwrap();
        t.queue.submit(Bio::write(1, 16, 8)).unwrap();
        // back-merges into [0,8), which then absorbs [16,24)
        t.queue.submit(Bio::write(1, 8, 8)).unwrap();
        let stats = t.queue.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.request_merges, 1);
        t.queue.check_invariants().unwrap();
        assert_eq!(t.drain_sectors(), [0]);
    }

    #[test]
    fn test_tunables() {
        let t = deadline_queue();
        assert_eq!(t.queue.tunable("read_expire"), Ok(500));
        assert_eq!(t.queue.set_tunable("fifo_batch", "0"), Ok(1));
        assert!(t.queue.set_tunable("fifo_batch", "x").is_err());
        assert_eq!(t.queue.tunable("fifo_batch"), Ok(1));
    }
}
