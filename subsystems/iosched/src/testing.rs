//! Test support: a recording block device and a queue harness.
//!
//! Enabled for the crate's own tests and, through the `testing` feature, for
//! drivers that want to exercise their request function against a real
//! elevator without hardware.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::config::QueueConfig;
use crate::device::{BlockDevice, Clock, ManualClock, TimerKind};
use crate::history::IoContextRegistry;
use crate::merge::QueueLimits;
use crate::queue::RequestQueue;
use crate::request::{Bio, DeviceId, Request, Sector, Tick};

// =============================================================================
// MOCK DEVICE
// =============================================================================

/// Timer traffic seen by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Armed to fire at the given tick
    Armed(TimerKind, Tick),
    /// Cancelled
    Cancelled(TimerKind),
}

/// Block device that records what the elevator asks of it
#[derive(Debug)]
pub struct MockDevice {
    id: DeviceId,
    limits: QueueLimits,
    kicks: AtomicUsize,
    refuse_merges: AtomicBool,
    pending: Mutex<HashMap<TimerKind, Tick>>,
    events: Mutex<Vec<TimerEvent>>,
}

impl MockDevice {
    /// Device `id` with default limits
    pub fn new(id: DeviceId) -> Self {
        Self::with_limits(id, QueueLimits::DEFAULT)
    }

    /// Device `id` with explicit limits
    pub fn with_limits(id: DeviceId, limits: QueueLimits) -> Self {
        Self {
            id,
            limits,
            kicks: AtomicUsize::new(0),
            refuse_merges: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Times the request function ran
    pub fn kicks(&self) -> usize {
        self.kicks.load(Ordering::SeqCst)
    }

    /// Veto every merge
    pub fn set_refuse_merges(&self, refuse: bool) {
        self.refuse_merges.store(refuse, Ordering::SeqCst);
    }

    /// Expiry of `kind` if armed
    pub fn pending_timer(&self, kind: TimerKind) -> Option<Tick> {
        self.pending.lock().get(&kind).copied()
    }

    /// Earliest armed timer, removed as if it fired
    pub fn take_next_timer(&self) -> Option<(TimerKind, Tick)> {
        let mut pending = self.pending.lock();
        let (&kind, &expires) = pending.iter().min_by_key(|&(_, &expires)| expires)?;
        pending.remove(&kind);
        Some((kind, expires))
    }

    /// Every timer event so far, oldest first
    pub fn timer_events(&self) -> Vec<TimerEvent> {
        self.events.lock().clone()
    }
}

impl BlockDevice for MockDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn limits(&self) -> QueueLimits {
        self.limits
    }

    fn merge_ok(&self, _rq: &Request, _bio: &Bio) -> bool {
        !self.refuse_merges.load(Ordering::SeqCst)
    }

    fn request_fn(&self) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
    }

    fn arm_timer(&self, kind: TimerKind, expires: Tick) {
        self.pending.lock().insert(kind, expires);
        self.events.lock().push(TimerEvent::Armed(kind, expires));
    }

    fn cancel_timer(&self, kind: TimerKind) {
        self.pending.lock().remove(&kind);
        self.events.lock().push(TimerEvent::Cancelled(kind));
    }
}

// =============================================================================
// HARNESS
// =============================================================================

/// A queue wired to a [`MockDevice`] and a [`ManualClock`].
///
/// Each harness looks submitter contexts up in its own registry, so
/// concurrently running tests never see each other's history.
#[derive(Debug)]
pub struct TestQueue {
    /// Queue under test
    pub queue: RequestQueue,
    /// Its device
    pub device: Arc<MockDevice>,
    /// Its clock, starting at 0
    pub clock: Arc<ManualClock>,
    /// Submitter contexts seen by this queue
    pub contexts: &'static IoContextRegistry,
}

impl TestQueue {
    /// Harness on device 1 with default device limits
    pub fn new(config: QueueConfig) -> Self {
        Self::with_limits(config, QueueLimits::DEFAULT)
    }

    /// Harness on device 1 with explicit device limits
    pub fn with_limits(config: QueueConfig, limits: QueueLimits) -> Self {
        let contexts: &'static IoContextRegistry = Box::leak(Box::new(IoContextRegistry::new()));
        Self::build(1, config, limits, contexts, Arc::new(ManualClock::new(0)))
    }

    /// Harness on another device `id` sharing `self`'s clock and contexts
    pub fn second_device(&self, id: DeviceId, config: QueueConfig) -> Self {
        Self::build(id, config, QueueLimits::DEFAULT, self.contexts, self.clock.clone())
    }

    fn build(
        id: DeviceId,
        config: QueueConfig,
        limits: QueueLimits,
        contexts: &'static IoContextRegistry,
        clock: Arc<ManualClock>,
    ) -> Self {
        let device = Arc::new(MockDevice::with_limits(id, limits));
        let queue = RequestQueue::with_contexts(device.clone(), clock.clone(), config, contexts)
            .expect("no usable elevator");
        Self {
            queue,
            device,
            clock,
            contexts,
        }
    }

    /// Run one descriptor through the driver; returns its start sector
    pub fn next_sector(&self) -> Option<Sector> {
        let rq = self.queue.next_request()?;
        let sector = self.queue.with_request(rq, |r| r.sector).ok()?;
        self.queue.dequeue(rq).ok()?;
        self.queue.end_request(rq).ok()?;
        Some(sector)
    }

    /// Deliver the earliest armed timer, moving the clock up to it
    pub fn fire_next_timer(&self) -> Option<TimerKind> {
        let (kind, expires) = self.device.take_next_timer()?;
        if self.clock.now() < expires {
            self.clock.set(expires);
        }
        self.queue.timer_expired(kind);
        Some(kind)
    }

    /// Complete everything, firing timers whenever the queue waits on one
    pub fn drain_sectors(&self) -> Vec<Sector> {
        let mut sectors = Vec::new();
        loop {
            if let Some(sector) = self.next_sector() {
                sectors.push(sector);
            } else if self.fire_next_timer().is_none() {
                break;
            }
        }
        sectors
    }
}
