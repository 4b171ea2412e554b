//! CFQ per-stream queues and (submitter, device) bindings.

use alloc::sync::Arc;

use bitflags::bitflags;

use super::rings::Ring;
use crate::config::{CfqTunables, CFQ_SLICE_SCALE};
use crate::history::IoContext;
use crate::request::{
    IoClass, IoPriority, Sector, SubmitterId, Tick, ASYNC_SUBMITTER, IOPRIO_LEVELS, IOPRIO_NORM,
};
use crate::stream::StreamQueue;

/// Identifier of a CFQ queue within one policy instance
pub type QueueId = u32;

bitflags! {
    /// Queue state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueueFlags: u16 {
        /// Waiting on the idle-slice timer for the next request
        const WAIT_REQUEST  = 1 << 0;
        /// Must dispatch on the next round even if the slice ran out
        const MUST_DISPATCH = 1 << 1;
        /// FIFO expiry already honoured this slice
        const FIFO_EXPIRE   = 1 << 2;
        /// Idling is worthwhile for this queue
        const IDLE_WINDOW   = 1 << 3;
        /// Slice end was fixed by preemption before activation
        const PREEMPTED     = 1 << 4;
    }
}

// =============================================================================
// QUEUE
// =============================================================================

/// One stream of pending descriptors with its time-slice state
#[derive(Debug)]
pub struct CfqQueue {
    /// Identifier
    pub id: QueueId,
    /// Submitter key, [`ASYNC_SUBMITTER`] for the shared async class
    pub key: SubmitterId,
    /// Current priority
    pub prio: IoPriority,
    /// References from bindings and from descriptors carrying policy state
    pub refs: u32,
    /// Pending descriptors
    pub stream: StreamQueue,
    /// Descriptors allocated against this queue, per direction
    pub allocated: [u32; 2],
    /// Dispatched but not completed, `[async, sync]`
    pub on_dispatch: [u32; 2],
    /// When the current slice ends, 0 until the first dispatch
    pub slice_end: Tick,
    /// Unused slice carried over from an early expiry
    pub slice_left: Tick,
    /// When the queue last went idle with nothing in flight
    pub service_last: Tick,
    /// Ring the queue sits on, if it has pending work
    pub ring: Option<Ring>,
    /// State flags
    pub flags: QueueFlags,
}

impl CfqQueue {
    /// Create a queue for `key` at `prio`
    pub fn new(id: QueueId, key: SubmitterId, prio: IoPriority) -> Self {
        Self {
            id,
            key,
            prio: normalize(prio),
            refs: 0,
            stream: StreamQueue::new(),
            allocated: [0; 2],
            on_dispatch: [0; 2],
            slice_end: 0,
            slice_left: 0,
            service_last: 0,
            ring: None,
            flags: QueueFlags::IDLE_WINDOW,
        }
    }

    /// Serves a single synchronous submitter
    #[inline]
    pub fn is_sync(&self) -> bool {
        self.key != ASYNC_SUBMITTER
    }

    /// Real-time class
    #[inline]
    pub fn is_rt(&self) -> bool {
        self.prio.class == IoClass::RealTime
    }

    /// Idle class
    #[inline]
    pub fn is_idle_class(&self) -> bool {
        self.prio.class == IoClass::Idle
    }

    /// Level within the class
    #[inline]
    pub fn level(&self) -> usize {
        self.prio.level as usize
    }

    /// On a service ring
    #[inline]
    pub fn on_rr(&self) -> bool {
        self.ring.is_some()
    }

    /// Descriptors dispatched and not yet completed
    #[inline]
    pub fn dispatched(&self) -> u32 {
        self.on_dispatch[0] + self.on_dispatch[1]
    }

    /// Change priority, keeping idle-class queues at the lowest level
    pub fn set_priority(&mut self, prio: IoPriority) {
        self.prio = normalize(prio);
    }

    /// Nominal slice length for this queue
    pub fn prio_slice(&self, tunables: &CfqTunables) -> Tick {
        let base = if self.is_sync() {
            tunables.slice_sync
        } else {
            tunables.slice_async
        };
        prio_to_slice(base, self.prio.level)
    }

    /// Descriptors an async queue may dispatch per slice
    pub fn max_requests(&self, tunables: &CfqTunables) -> u64 {
        let base_rq = tunables.slice_async_rq;
        let lower = (IOPRIO_LEVELS - 1 - self.level()) as u64;
        2 * (base_rq + base_rq * lower)
    }

    /// FIFO expiry applied to this queue's descriptors
    pub fn fifo_expire(&self, tunables: &CfqTunables) -> Tick {
        if self.is_sync() {
            tunables.fifo_expire_sync
        } else {
            tunables.fifo_expire_async
        }
    }
}

/// Scale `base` by priority level: level 4 gets `base`, each step up or down
/// adds or removes a fifth.
pub fn prio_to_slice(base: Tick, level: u8) -> Tick {
    let step = (base / CFQ_SLICE_SCALE) as i64;
    let slice = base as i64 + step * (IOPRIO_NORM as i64 - level as i64);
    slice.max(1) as Tick
}

/// Priority a queue is filed at; idle class always sits at the lowest level
pub fn normalize(prio: IoPriority) -> IoPriority {
    if prio.class == IoClass::Idle {
        IoPriority::idle()
    } else {
        prio
    }
}

// =============================================================================
// BINDING
// =============================================================================

/// What one submitter holds on one device
#[derive(Debug)]
pub struct Binding {
    /// Shared submitter context
    pub ioc: Arc<IoContext>,
    /// `[async, sync]` queues this submitter feeds
    pub queues: [Option<QueueId>; 2],
    /// Priority the queues were filed at
    pub prio: IoPriority,
    /// Last synchronous completion
    pub last_end_request: Tick,
    /// End of the last synchronous request
    pub last_request_pos: Sector,
}

impl Binding {
    /// Fresh binding at `now`
    pub fn new(ioc: Arc<IoContext>, prio: IoPriority, now: Tick) -> Self {
        Self {
            ioc,
            queues: [None, None],
            prio,
            last_end_request: now,
            last_request_pos: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_scaling() {
        assert_eq!(prio_to_slice(100, 4), 100);
        assert_eq!(prio_to_slice(100, 0), 180);
        assert_eq!(prio_to_slice(100, 7), 40);
        assert_eq!(prio_to_slice(40, 4), 40);
        assert_eq!(prio_to_slice(40, 0), 72);
    }

    #[test]
    fn test_async_request_budget() {
        let t = CfqTunables::DEFAULT;
        let q = CfqQueue::new(1, ASYNC_SUBMITTER, IoPriority::NORMAL);
        assert!(!q.is_sync());
        assert_eq!(q.max_requests(&t), 16);
        assert_eq!(q.prio_slice(&t), 40);
        assert_eq!(q.fifo_expire(&t), 250);
    }

    #[test]
    fn test_idle_class_normalized() {
        let q = CfqQueue::new(1, 7, IoPriority::new(IoClass::Idle, 0));
        assert!(q.is_idle_class());
        assert_eq!(q.level(), IOPRIO_LEVELS - 1);
        assert!(q.flags.contains(QueueFlags::IDLE_WINDOW));
    }
}
