//! External collaborators: the device driver side and the time source.
//!
//! The elevator never talks to hardware. It learns the device limits and
//! merge capability from a [`BlockDevice`], asks it to run its request
//! function when work becomes available, and asks it to arm or cancel the
//! two scheduler timers. Timer expiry comes back through
//! [`RequestQueue::timer_expired`](crate::queue::RequestQueue::timer_expired).

use core::sync::atomic::{AtomicU64, Ordering};

use crate::merge::QueueLimits;
use crate::request::{Bio, DeviceId, Request, Tick};

/// The asynchronous timers a policy may arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// CFQ waiting for the active submitter's next request
    IdleSlice,
    /// CFQ grace period before serving the idle class
    IdleClass,
}

/// Driver side of a request queue.
///
/// `arm_timer` and `cancel_timer` are called with the queue lock held and
/// must not call back into the queue. `request_fn` is called after the lock
/// is dropped.
pub trait BlockDevice: Send + Sync {
    /// Device identity, compared against each bio's target
    fn id(&self) -> DeviceId;

    /// Transfer limits
    fn limits(&self) -> QueueLimits {
        QueueLimits::DEFAULT
    }

    /// Driver-specific veto on merging `bio` into `rq`
    fn merge_ok(&self, _rq: &Request, _bio: &Bio) -> bool {
        true
    }

    /// Work is available; the driver should pull from the queue
    fn request_fn(&self) {}

    /// Fire `kind` at tick `expires`, replacing any pending expiry
    fn arm_timer(&self, _kind: TimerKind, _expires: Tick) {}

    /// Cancel `kind` if pending
    fn cancel_timer(&self, _kind: TimerKind) {}
}

/// Monotonic tick source
pub trait Clock: Send + Sync {
    /// Current time in ticks
    fn now(&self) -> Tick;
}

/// Clock advanced by hand
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    /// Clock starting at `start`
    pub const fn new(start: Tick) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }

    /// Jump to `now`
    pub fn set(&self, now: Tick) {
        self.ticks.store(now, Ordering::SeqCst);
    }

    /// Move forward by `delta`
    pub fn advance(&self, delta: Tick) {
        self.ticks.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        self.ticks.load(Ordering::SeqCst)
    }
}
