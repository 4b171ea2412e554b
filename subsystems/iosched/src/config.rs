//! # Queue Configuration
//!
//! Explicit configuration handed to a request queue at construction. The
//! `DEFAULT` constants are the immutable process-wide defaults; live
//! changes go through the tunable surface of the active elevator.

use static_assertions::const_assert;

use crate::request::Tick;
use crate::tunables::{TunableDef, TunableSet};

// =============================================================================
// DEADLINE
// =============================================================================

/// Deadline policy tunables (times in ticks)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineTunables {
    /// Read FIFO expiry
    pub read_expire: Tick,
    /// Write FIFO expiry
    pub write_expire: Tick,
    /// Read batches allowed before a pending write must go
    pub writes_starved: u64,
    /// Whether front merges are looked up (0/1)
    pub front_merges: u64,
    /// Descriptors per sequential batch
    pub fifo_batch: u64,
}

impl DeadlineTunables {
    /// Built-in defaults
    pub const DEFAULT: Self = Self {
        read_expire: 500,
        write_expire: 5 * 500,
        writes_starved: 2,
        front_merges: 1,
        fifo_batch: 16,
    };
}

impl Default for DeadlineTunables {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TunableSet for DeadlineTunables {
    const DEFS: &'static [TunableDef] = &[
        TunableDef::new("read_expire", 1, 60_000),
        TunableDef::new("write_expire", 1, 60_000),
        TunableDef::new("writes_starved", 0, 64),
        TunableDef::new("front_merges", 0, 1),
        TunableDef::new("fifo_batch", 1, 256),
    ];

    fn load(&self, idx: usize) -> u64 {
        match idx {
            0 => self.read_expire,
            1 => self.write_expire,
            2 => self.writes_starved,
            3 => self.front_merges,
            _ => self.fifo_batch,
        }
    }

    fn store(&mut self, idx: usize, value: u64) {
        match idx {
            0 => self.read_expire = value,
            1 => self.write_expire = value,
            2 => self.writes_starved = value,
            3 => self.front_merges = value,
            _ => self.fifo_batch = value,
        }
    }
}

// =============================================================================
// CFQ
// =============================================================================

/// CFQ policy tunables (times in ticks)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfqTunables {
    /// Descriptors dispatched from the active queue per round
    pub quantum: u64,
    /// FIFO expiry for synchronous queues
    pub fifo_expire_sync: Tick,
    /// FIFO expiry for asynchronous queues
    pub fifo_expire_async: Tick,
    /// Backward seek window in KiB
    pub back_seek_max: u64,
    /// Cost multiplier for backward seeks
    pub back_seek_penalty: u64,
    /// Base slice for synchronous queues
    pub slice_sync: Tick,
    /// Base slice for asynchronous queues
    pub slice_async: Tick,
    /// Base request budget for asynchronous slices
    pub slice_async_rq: u64,
    /// How long to wait for the next request of an idling queue (0 = never)
    pub slice_idle: Tick,
}

impl CfqTunables {
    /// Built-in defaults
    pub const DEFAULT: Self = Self {
        quantum: 4,
        fifo_expire_sync: 125,
        fifo_expire_async: 250,
        back_seek_max: 16 * 1024,
        back_seek_penalty: 2,
        slice_sync: 100,
        slice_async: 40,
        slice_async_rq: 2,
        slice_idle: 8,
    };
}

impl Default for CfqTunables {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TunableSet for CfqTunables {
    const DEFS: &'static [TunableDef] = &[
        TunableDef::new("quantum", 1, 64),
        TunableDef::new("fifo_expire_sync", 1, 60_000),
        TunableDef::new("fifo_expire_async", 1, 60_000),
        TunableDef::new("back_seek_max", 0, 1 << 30),
        TunableDef::new("back_seek_penalty", 1, 64),
        TunableDef::new("slice_sync", 1, 10_000),
        TunableDef::new("slice_async", 1, 10_000),
        TunableDef::new("slice_async_rq", 1, 64),
        TunableDef::new("slice_idle", 0, 1_000),
    ];

    fn load(&self, idx: usize) -> u64 {
        match idx {
            0 => self.quantum,
            1 => self.fifo_expire_sync,
            2 => self.fifo_expire_async,
            3 => self.back_seek_max,
            4 => self.back_seek_penalty,
            5 => self.slice_sync,
            6 => self.slice_async,
            7 => self.slice_async_rq,
            _ => self.slice_idle,
        }
    }

    fn store(&mut self, idx: usize, value: u64) {
        match idx {
            0 => self.quantum = value,
            1 => self.fifo_expire_sync = value,
            2 => self.fifo_expire_async = value,
            3 => self.back_seek_max = value,
            4 => self.back_seek_penalty = value,
            5 => self.slice_sync = value,
            6 => self.slice_async = value,
            7 => self.slice_async_rq = value,
            _ => self.slice_idle = value,
        }
    }
}

/// Grace period after the last non-idle completion before idle-class
/// queues are served. Fixed; it does not follow the slice tunables.
pub const CFQ_IDLE_GRACE: Tick = 100;

/// Divisor of the per-level slice scaling
pub const CFQ_SLICE_SCALE: u64 = 5;

// =============================================================================
// QUEUE
// =============================================================================

/// Configuration of one request queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Elevator attached at construction
    pub elevator: &'static str,
    /// Elevator used when the requested one fails to initialize
    pub fallback: &'static str,
    /// Maximum live descriptors
    pub nr_requests: usize,
    /// Initial deadline tunables
    pub deadline: DeadlineTunables,
    /// Initial CFQ tunables
    pub cfq: CfqTunables,
}

impl QueueConfig {
    /// Built-in defaults: CFQ, falling back to noop
    pub const DEFAULT: Self = Self {
        elevator: "cfq",
        fallback: "noop",
        nr_requests: 128,
        deadline: DeadlineTunables::DEFAULT,
        cfq: CfqTunables::DEFAULT,
    };

    /// Defaults with a different elevator
    pub const fn with_elevator(elevator: &'static str) -> Self {
        let mut config = Self::DEFAULT;
        config.elevator = elevator;
        config
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

const_assert!(DeadlineTunables::DEFAULT.write_expire == 5 * DeadlineTunables::DEFAULT.read_expire);
const_assert!(CfqTunables::DEFAULT.slice_idle < CfqTunables::DEFAULT.slice_async);
const_assert!(QueueConfig::DEFAULT.nr_requests > 0);
