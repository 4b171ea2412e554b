//! No-op elevator: a single FIFO, dispatched in arrival order.
//!
//! Only the framework's last-merge and hash back-merge lookups apply.
//! Used as the fallback when another policy fails to initialize.

use alloc::boxed::Box;

use super::{ElevatorOps, ElevatorType, ElvCtx};
use crate::arena::RequestArena;
use crate::config::QueueConfig;
use crate::error::{IoSchedError, IoSchedResult, InvariantViolation};
use crate::request::RequestHandle;
use crate::stream::FifoList;
use crate::tunables::TunableDef;

/// Registry entry
pub static NOOP: ElevatorType = ElevatorType {
    name: "noop",
    init: noop_init,
};

fn noop_init(_config: &QueueConfig) -> IoSchedResult<Box<dyn ElevatorOps>> {
    Ok(Box::new(Noop::new()))
}

/// FIFO policy state
#[derive(Debug, Default)]
pub struct Noop {
    queue: FifoList,
}

impl Noop {
    /// Create an empty policy
    pub const fn new() -> Self {
        Self {
            queue: FifoList::new(),
        }
    }
}

impl ElevatorOps for Noop {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn merge_requests(&mut self, ctx: &mut ElvCtx<'_>, _rq: RequestHandle, next: RequestHandle) {
        self.queue.remove(ctx.arena, next);
    }

    fn add_request(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle) {
        self.queue.push_back(ctx.arena, rq);
    }

    fn dispatch(&mut self, ctx: &mut ElvCtx<'_>, force: bool) -> usize {
        let mut count = 0;
        while let Some(rq) = self.queue.front() {
            self.queue.remove(ctx.arena, rq);
            ctx.dispatch_sort(rq);
            count += 1;
            if !force {
                break;
            }
        }
        count
    }

    fn former_request(&self, arena: &RequestArena, rq: RequestHandle) -> Option<RequestHandle> {
        self.queue.prev(arena, rq)
    }

    fn latter_request(&self, arena: &RequestArena, rq: RequestHandle) -> Option<RequestHandle> {
        self.queue.next(arena, rq)
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }

    fn tunable_defs(&self) -> &'static [TunableDef] {
        &[]
    }

    fn tunable(&self, _name: &str) -> IoSchedResult<u64> {
        Err(IoSchedError::UnknownTunable)
    }

    fn set_tunable(&mut self, _name: &str, _input: &str) -> IoSchedResult<u64> {
        Err(IoSchedError::UnknownTunable)
    }

    fn check_invariants(&self, arena: &RequestArena) -> Result<(), InvariantViolation> {
        self.queue.check_invariants(arena)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::QueueConfig;
    use crate::request::Bio;
    use crate::testing::TestQueue;

    #[test]
    fn test_arrival_order() {
        let t = TestQueue::new(QueueConfig::with_elevator("noop"));
        for sector in [500, 100, 300] {
            t.queue.submit(Bio::write(1, sector, 8)).unwrap();
        }
        assert_eq!(t.drain_sectors(), [500, 100, 300]);
    }

    #[test]
    fn test_no_tunables() {
        let t = TestQueue::new(QueueConfig::with_elevator("noop"));
        assert!(t.queue.tunables().is_empty());
        assert!(t.queue.tunable("quantum").is_err());
    }
}
