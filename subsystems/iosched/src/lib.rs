//! # Helix Block I/O Scheduler
//!
//! Decides in what order pending block requests are handed to a device
//! driver. A shared framework (merge index, dispatch list, driver lifecycle,
//! run-time switching) hosts pluggable scheduling policies.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                            REQUEST QUEUE                              │
//! │   submit ─▶ merge lookup ─▶ admission ─▶ dispatch list ─▶ driver      │
//! │               │  (last-merge, hash)                                   │
//! ├───────────────┼───────────────────────────────────────────────────────┤
//! │               ▼             ELEVATOR OPS                              │
//! │  ┌───────────────┐  ┌──────────────────────┐  ┌───────────────────┐   │
//! │  │     noop      │  │       deadline       │  │        cfq        │   │
//! │  │   one FIFO    │  │ read/write streams,  │  │ per-submitter     │   │
//! │  │               │  │ batches, expiry      │  │ queues on service │   │
//! │  │               │  │                      │  │ rings, slices     │   │
//! │  └───────────────┘  └──────────────────────┘  └───────────────────┘   │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │   request arena  │  sector index + FIFO  │  submitter history         │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Policies
//!
//! | Policy | Guarantees |
//! |--------|------------|
//! | `noop` | arrival order, merging only |
//! | `deadline` | every request served within its direction's expiry, writes never starved |
//! | `cfq` | round-robin time slices per submitter and priority, idling for synchronous streams |
//!
//! ## Usage
//!
//! ```rust,ignore
//! let queue = RequestQueue::new(device, clock, QueueConfig::DEFAULT)?;
//! queue.submit(Bio::read(dev, 2048, 8).with_submitter(pid))?;
//!
//! // request function
//! while let Some(rq) = queue.next_request() {
//!     queue.dequeue(rq)?;
//!     issue(rq);
//! }
//!
//! // completion
//! queue.end_request(rq)?;
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

// =============================================================================
// EXTERNAL DEPENDENCIES
// =============================================================================

extern crate alloc;

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Error types and invariant checks
pub mod error;

/// Descriptors and bios
pub mod request;

/// Generation-checked descriptor storage
pub mod arena;

/// Merge geometry and the back-merge hash
pub mod merge;

/// Sector index, FIFO and per-stream queues
pub mod stream;

/// Device-facing dispatch list
pub mod dispatch;

/// Per-submitter think-time and seek history
pub mod history;

/// Named, bounded tunables
pub mod tunables;

/// Queue configuration and defaults
pub mod config;

/// Device and clock collaborators
pub mod device;

/// Policy interface, registry and built-in policies
pub mod elevator;

/// The request queue
pub mod queue;

/// Mock device and queue harness
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use config::{CfqTunables, DeadlineTunables, QueueConfig};
pub use device::{BlockDevice, Clock, ManualClock, TimerKind};
pub use elevator::{
    elevator_names, register_elevator, unregister_elevator, ElevatorOps, ElevatorType, ElvCtx,
    InsertPosition,
};
pub use error::{InvariantViolation, IoSchedError, IoSchedResult};
pub use history::{IoContext, IoContextRegistry, SubmitterHistory};
pub use merge::{MergeType, QueueLimits};
pub use queue::{QueueStats, RequestQueue, SubmitOutcome};
pub use request::{
    Bio, DeviceId, Direction, IoClass, IoPriority, Request, RequestFlags, RequestHandle, Sector,
    SubmitterId, Tick,
};
