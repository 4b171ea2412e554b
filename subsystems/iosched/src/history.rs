//! # Submitter History
//!
//! Per-submitter I/O context shared by every device the submitter touches.
//! It carries the submitter's I/O priority and the decayed think-time and
//! seek-distance statistics that drive CFQ's idle decisions.
//!
//! Contexts are reference counted (`Arc`) and updated under their own lock,
//! so CFQ instances on different devices can sample the same submitter
//! concurrently while each keeps its own (submitter, device) binding.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use spin::{Mutex, RwLock};

use crate::request::{IoClass, IoPriority, Sector, SubmitterId, Tick};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Samples needed before a mean is trusted
pub const SAMPLE_VALID: u32 = 80;

/// Mean seek distance above which a submitter counts as seeky (sectors)
pub const SEEKY_THRESHOLD: Sector = 8 * 1024;

/// Fixed-point scale of the decayed sample counters
const SAMPLE_SCALE: u64 = 256;

// =============================================================================
// HISTORY
// =============================================================================

/// Decayed think-time and seek statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitterHistory {
    /// Decayed think-time sample weight
    pub ttime_samples: u32,
    /// Decayed think-time sum (scaled)
    pub ttime_total: u64,
    /// Mean think time in ticks
    pub ttime_mean: Tick,
    /// Decayed seek sample weight
    pub seek_samples: u32,
    /// Decayed seek distance sum (scaled)
    pub seek_total: u64,
    /// Mean seek distance in sectors
    pub seek_mean: Sector,
}

impl SubmitterHistory {
    /// Fold in the gap between the last completion and a new request.
    ///
    /// The sample is capped at `cap` so one long pause does not dominate.
    pub fn sample_think_time(&mut self, elapsed: Tick, cap: Tick) {
        let ttime = elapsed.min(cap);
        self.ttime_samples = (7 * self.ttime_samples + SAMPLE_SCALE as u32) / 8;
        self.ttime_total = (7 * self.ttime_total + SAMPLE_SCALE * ttime) / 8;
        self.ttime_mean = (self.ttime_total + 128) / self.ttime_samples as u64;
    }

    /// Fold in the distance between the previous request's end and `sector`
    pub fn sample_seek(&mut self, last_pos: Sector, sector: Sector) {
        let mut sdist = last_pos.abs_diff(sector);

        // clamp odd fragments so they do not blow up the mean
        let slack = if self.seek_samples <= 60 {
            2 * 1024 * 1024
        } else {
            2 * 1024 * 64
        };
        sdist = sdist.min(self.seek_mean.saturating_mul(4).saturating_add(slack));

        self.seek_samples = (7 * self.seek_samples + SAMPLE_SCALE as u32) / 8;
        self.seek_total = (7 * self.seek_total + SAMPLE_SCALE * sdist) / 8;
        let total = self.seek_total + (self.seek_samples as u64 / 2);
        self.seek_mean = total / self.seek_samples as u64;
    }

    /// Enough think-time samples to trust the mean
    #[inline]
    pub fn ttime_valid(&self) -> bool {
        self.ttime_samples > SAMPLE_VALID
    }

    /// Enough seek samples to trust the mean
    #[inline]
    pub fn seek_valid(&self) -> bool {
        self.seek_samples > SAMPLE_VALID
    }

    /// Submitter jumps around the disk
    #[inline]
    pub fn is_seeky(&self) -> bool {
        self.seek_valid() && self.seek_mean > SEEKY_THRESHOLD
    }
}

// =============================================================================
// IO CONTEXT
// =============================================================================

/// Shared per-submitter context
#[derive(Debug)]
pub struct IoContext {
    id: SubmitterId,
    prio: AtomicU16,
    exited: AtomicBool,
    history: Mutex<SubmitterHistory>,
}

impl IoContext {
    /// Context for `id` at the normal best-effort priority
    pub fn new(id: SubmitterId) -> Arc<Self> {
        Self::with_priority(id, IoPriority::NORMAL)
    }

    /// Context for `id` at `prio`
    pub fn with_priority(id: SubmitterId, prio: IoPriority) -> Arc<Self> {
        Arc::new(Self {
            id,
            prio: AtomicU16::new(prio.code()),
            exited: AtomicBool::new(false),
            history: Mutex::new(SubmitterHistory::default()),
        })
    }

    /// Submitter id
    #[inline]
    pub fn id(&self) -> SubmitterId {
        self.id
    }

    /// Current priority
    pub fn priority(&self) -> IoPriority {
        decode_prio(self.prio.load(Ordering::Acquire))
    }

    /// Change priority; schedulers pick it up on the next request
    pub fn set_priority(&self, prio: IoPriority) {
        self.prio.store(prio.code(), Ordering::Release);
    }

    /// Mark the submitter as gone; no scheduler should idle for it
    pub fn exit(&self) {
        self.exited.store(true, Ordering::Release);
    }

    /// Whether the submitter has exited
    #[inline]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Snapshot of the statistics
    pub fn history(&self) -> SubmitterHistory {
        *self.history.lock()
    }

    /// Update the statistics under the context lock
    pub fn update_history<R>(&self, f: impl FnOnce(&mut SubmitterHistory) -> R) -> R {
        f(&mut self.history.lock())
    }
}

fn decode_prio(code: u16) -> IoPriority {
    let class = match code >> 8 {
        1 => IoClass::RealTime,
        3 => IoClass::Idle,
        _ => IoClass::BestEffort,
    };
    IoPriority::new(class, (code & 0xff) as u8)
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Map from submitter id to its live context
#[derive(Debug, Default)]
pub struct IoContextRegistry {
    contexts: RwLock<BTreeMap<SubmitterId, Weak<IoContext>>>,
}

static GLOBAL_CONTEXTS: IoContextRegistry = IoContextRegistry::new();

impl IoContextRegistry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            contexts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Process-wide registry
    pub fn global() -> &'static Self {
        &GLOBAL_CONTEXTS
    }

    /// Live context of `id`, creating one if none exists
    pub fn get_or_create(&self, id: SubmitterId) -> Arc<IoContext> {
        if let Some(ioc) = self.lookup(id) {
            return ioc;
        }
        let mut contexts = self.contexts.write();
        if let Some(ioc) = contexts.get(&id).and_then(Weak::upgrade) {
            return ioc;
        }
        let ioc = IoContext::new(id);
        contexts.insert(id, Arc::downgrade(&ioc));
        ioc
    }

    /// Live context of `id`
    pub fn lookup(&self, id: SubmitterId) -> Option<Arc<IoContext>> {
        self.contexts.read().get(&id).and_then(Weak::upgrade)
    }

    /// Register an externally built context
    pub fn register(&self, ioc: &Arc<IoContext>) {
        self.contexts.write().insert(ioc.id(), Arc::downgrade(ioc));
    }

    /// Drop entries whose context has been freed
    pub fn prune(&self) -> usize {
        let mut contexts = self.contexts.write();
        let before = contexts.len();
        contexts.retain(|_, weak| weak.strong_count() > 0);
        before - contexts.len()
    }
}
