//! # Elevator Policies
//!
//! The capability interface every scheduling policy implements, the context
//! handed to policy callbacks, and the registry of available policies.
//!
//! ## Call Flow
//!
//! ```text
//!  submit(bio) ──▶ merge? ──yes──▶ merged()/merge_requests()
//!                    │
//!                    no
//!                    ▼
//!              set_request() ──▶ add_request()      (policy admission)
//!
//!  driver ──▶ next_request() ──▶ dispatch() ──▶ dispatch list ──▶ activate()
//!                                                   │
//!  driver ──▶ end_request() ──▶ completed() ──▶ put_request() ──▶ freed
//! ```
//!
//! Every callback runs under the request-queue lock.

pub mod cfq;
pub mod deadline;
pub mod noop;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::arena::RequestArena;
use crate::config::QueueConfig;
use crate::device::{BlockDevice, TimerKind};
use crate::dispatch::DispatchList;
use crate::error::{IoSchedError, IoSchedResult, InvariantViolation};
use crate::history::{IoContext, IoContextRegistry};
use crate::merge::{MergeHash, MergeType, QueueLimits};
use crate::request::{Bio, RequestHandle, Sector, SubmitterId, Tick};
use crate::tunables::TunableDef;

// =============================================================================
// INSERT POSITION
// =============================================================================

/// Where a descriptor enters the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    /// Through the policy's admission algorithm
    Sorted,
    /// Head of the dispatch list, bypassing the policy
    Front,
    /// Tail of the dispatch list after draining the policy
    Back,
    /// Head of the dispatch list after an error or requeue
    Requeue,
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Queue state lent to a policy for the duration of one callback
pub struct ElvCtx<'a> {
    /// Descriptor storage
    pub arena: &'a mut RequestArena,
    pub(crate) hash: &'a mut MergeHash,
    pub(crate) dispatch: &'a mut DispatchList,
    pub(crate) last_merge: &'a mut Option<RequestHandle>,
    pub(crate) device: &'a dyn BlockDevice,
    pub(crate) contexts: &'a IoContextRegistry,
    pub(crate) limits: QueueLimits,
    pub(crate) now: Tick,
    pub(crate) kick: &'a mut bool,
}

impl<'a> ElvCtx<'a> {
    /// Current time
    #[inline]
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Device transfer limits
    #[inline]
    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    /// Context of `submitter`, shared with every other device it uses
    pub fn io_context(&self, submitter: SubmitterId) -> Arc<IoContext> {
        self.contexts.get_or_create(submitter)
    }

    /// Move `handle` to the dispatch list in sector order.
    ///
    /// The descriptor must already be out of the policy's own indexes.
    pub fn dispatch_sort(&mut self, handle: RequestHandle) {
        self.retire(handle);
        self.dispatch.add_sorted(self.arena, handle);
        log::trace!("iosched: dispatch sorted sector {}", self.arena.rq(handle).sector);
    }

    /// Move `handle` to the tail of the dispatch list and make it the new
    /// head boundary
    pub fn dispatch_add_tail(&mut self, handle: RequestHandle) {
        self.retire(handle);
        self.dispatch.add_tail(self.arena, handle);
        self.dispatch.set_boundary(self.arena, handle);
        log::trace!("iosched: dispatch tail sector {}", self.arena.rq(handle).sector);
    }

    /// Arm a scheduler timer
    pub fn arm_timer(&self, kind: TimerKind, expires: Tick) {
        self.device.arm_timer(kind, expires);
    }

    /// Cancel a scheduler timer
    pub fn cancel_timer(&self, kind: TimerKind) {
        self.device.cancel_timer(kind);
    }

    /// Ask for the driver to be kicked once the lock is released
    pub fn schedule_dispatch(&mut self) {
        *self.kick = true;
    }

    /// End sector of the descriptor at the tail of the dispatch list
    pub fn dispatch_tail_end(&self) -> Option<Sector> {
        self.dispatch.back().map(|h| self.arena.rq(h).end_sector())
    }

    fn retire(&mut self, handle: RequestHandle) {
        if *self.last_merge == Some(handle) {
            *self.last_merge = None;
        }
        self.hash.remove(self.arena, handle);
    }
}

// =============================================================================
// POLICY INTERFACE
// =============================================================================

/// A pluggable scheduling policy
pub trait ElevatorOps: Send {
    /// Registered name
    fn name(&self) -> &'static str;

    /// Front-merge candidate for `bio` (back merges use the shared hash)
    fn merge(&mut self, _ctx: &mut ElvCtx<'_>, _bio: &Bio) -> Option<RequestHandle> {
        None
    }

    /// Policy veto on merging `bio` into `rq`
    fn allow_merge(&self, _arena: &RequestArena, _rq: RequestHandle, _bio: &Bio) -> bool {
        true
    }

    /// `rq` grew by a bio merge of `kind`
    fn merged(&mut self, _ctx: &mut ElvCtx<'_>, _rq: RequestHandle, _kind: MergeType) {}

    /// `rq` absorbed `next`; drop `next` from the policy
    fn merge_requests(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle, next: RequestHandle);

    /// Admit a new descriptor
    fn add_request(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle);

    /// Move work to the dispatch list; `force` drains everything
    fn dispatch(&mut self, ctx: &mut ElvCtx<'_>, force: bool) -> usize;

    /// Driver picked up `rq`
    fn activate(&mut self, _ctx: &mut ElvCtx<'_>, _rq: RequestHandle) {}

    /// Driver gave `rq` back unstarted
    fn deactivate(&mut self, _ctx: &mut ElvCtx<'_>, _rq: RequestHandle) {}

    /// Driver finished `rq`
    fn completed(&mut self, _ctx: &mut ElvCtx<'_>, _rq: RequestHandle) {}

    /// Sector-order predecessor among pending descriptors
    fn former_request(&self, _arena: &RequestArena, _rq: RequestHandle) -> Option<RequestHandle> {
        None
    }

    /// Sector-order successor among pending descriptors
    fn latter_request(&self, _arena: &RequestArena, _rq: RequestHandle) -> Option<RequestHandle> {
        None
    }

    /// Attach per-descriptor state; may refuse under exhaustion
    fn set_request(&mut self, _ctx: &mut ElvCtx<'_>, _rq: RequestHandle) -> IoSchedResult<()> {
        Ok(())
    }

    /// Release per-descriptor state
    fn put_request(&mut self, _ctx: &mut ElvCtx<'_>, _rq: RequestHandle) {}

    /// A timer armed by this policy fired
    fn timer_expired(&mut self, _ctx: &mut ElvCtx<'_>, _kind: TimerKind) {}

    /// The submitter went away; drop whatever the policy keeps for it
    fn exit_submitter(&mut self, _ctx: &mut ElvCtx<'_>, _submitter: SubmitterId) {}

    /// Descriptors held by the policy
    fn queued(&self) -> usize;

    /// Nothing held
    fn is_empty(&self) -> bool {
        self.queued() == 0
    }

    /// Tear down; called after a forced drain
    fn exit(&mut self, _ctx: &mut ElvCtx<'_>) {}

    /// Tunable table
    fn tunable_defs(&self) -> &'static [TunableDef];

    /// Read a tunable
    fn tunable(&self, name: &str) -> IoSchedResult<u64>;

    /// Write a tunable from decimal text
    fn set_tunable(&mut self, name: &str, input: &str) -> IoSchedResult<u64>;

    /// Internal consistency check
    fn check_invariants(&self, _arena: &RequestArena) -> Result<(), InvariantViolation> {
        Ok(())
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Policy constructor
pub type ElevatorInit = fn(&QueueConfig) -> IoSchedResult<Box<dyn ElevatorOps>>;

/// A registered policy
#[derive(Debug)]
pub struct ElevatorType {
    /// Name used for lookup and switching
    pub name: &'static str,
    /// Constructor
    pub init: ElevatorInit,
}

/// Built-in policies
pub static BUILTIN_ELEVATORS: [&ElevatorType; 3] = [&noop::NOOP, &deadline::DEADLINE, &cfq::CFQ];

static REGISTERED: RwLock<Vec<&'static ElevatorType>> = RwLock::new(Vec::new());

/// Make an additional policy available by name
pub fn register_elevator(elevator: &'static ElevatorType) -> IoSchedResult<()> {
    if find_elevator(elevator.name).is_some() {
        return Err(IoSchedError::AlreadyRegistered);
    }
    REGISTERED.write().push(elevator);
    log::info!("iosched: registered elevator '{}'", elevator.name);
    Ok(())
}

/// Remove a policy added with [`register_elevator`]
pub fn unregister_elevator(name: &str) -> bool {
    let mut registered = REGISTERED.write();
    let before = registered.len();
    registered.retain(|e| e.name != name);
    before != registered.len()
}

/// Look up a policy by name
pub fn find_elevator(name: &str) -> Option<&'static ElevatorType> {
    BUILTIN_ELEVATORS
        .iter()
        .copied()
        .find(|e| e.name == name)
        .or_else(|| REGISTERED.read().iter().copied().find(|e| e.name == name))
}

/// Names of every available policy
pub fn elevator_names() -> Vec<&'static str> {
    BUILTIN_ELEVATORS
        .iter()
        .map(|e| e.name)
        .chain(REGISTERED.read().iter().map(|e| e.name))
        .collect()
}

/// Construct the policy called `name`
pub fn init_elevator(name: &str, config: &QueueConfig) -> IoSchedResult<Box<dyn ElevatorOps>> {
    let elevator = find_elevator(name).ok_or(IoSchedError::UnknownElevator)?;
    (elevator.init)(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_init(_config: &QueueConfig) -> IoSchedResult<Box<dyn ElevatorOps>> {
        Err(IoSchedError::Exhausted)
    }

    static BROKEN: ElevatorType = ElevatorType {
        name: "registry-test-broken",
        init: failing_init,
    };

    #[test]
    fn test_builtins_present() {
        let names = elevator_names();
        for name in ["noop", "deadline", "cfq"] {
            assert!(names.contains(&name));
            let elv = init_elevator(name, &QueueConfig::DEFAULT).unwrap();
            assert_eq!(elv.name(), name);
            assert!(elv.is_empty());
        }
    }

    #[test]
    fn test_register_and_unregister() {
        register_elevator(&BROKEN).unwrap();
        assert_eq!(register_elevator(&BROKEN), Err(IoSchedError::AlreadyRegistered));
        assert!(find_elevator("registry-test-broken").is_some());
        assert!(init_elevator("registry-test-broken", &QueueConfig::DEFAULT).is_err());
        assert!(unregister_elevator("registry-test-broken"));
        assert!(find_elevator("registry-test-broken").is_none());
    }

    #[test]
    fn test_unknown_elevator() {
        assert_eq!(
            init_elevator("anticipatory", &QueueConfig::DEFAULT).err(),
            Some(IoSchedError::UnknownElevator)
        );
    }
}
