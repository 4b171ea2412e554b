//! # Request Queue
//!
//! The policy-independent half of the elevator: merge lookup, descriptor
//! admission, the dispatch list, the driver lifecycle and run-time policy
//! switching. One [`RequestQueue`] exists per block device.
//!
//! ## Locking
//!
//! All state sits behind one `spin::Mutex`, held for the whole of each public
//! operation. Policies ask for the driver to be kicked through
//! [`ElvCtx::schedule_dispatch`]; the kick runs after the lock is dropped so
//! the driver can call straight back into the queue.
//!
//! ## Descriptor Lifecycle
//!
//! ```text
//!  submit ──▶ pending (policy) ──▶ dispatch list ──▶ in flight ──▶ freed
//!               │                    ▲    │ next_request  dequeue    end_request
//!               └── merged away      │    ▼
//!                                    └── requeue
//! ```
//!
//! At every point `live = pending + dispatch list + in flight`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arena::RequestArena;
use crate::config::QueueConfig;
use crate::device::{BlockDevice, Clock, TimerKind};
use crate::dispatch::DispatchList;
use crate::elevator::{init_elevator, ElevatorOps, ElvCtx, InsertPosition};
use crate::error::{ensure, IoSchedError, IoSchedResult, InvariantViolation};
use crate::history::IoContextRegistry;
use crate::merge::{bio_merge_fits, requests_merge_fit, MergeHash, MergeType, QueueLimits};
use crate::request::{Bio, Request, RequestFlags, RequestHandle, SubmitterId, Tick};

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// What happened to a submitted bio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Merged into an existing descriptor
    Merged(RequestHandle),
    /// Became a new descriptor
    Queued(RequestHandle),
}

impl SubmitOutcome {
    /// Descriptor now carrying the bio
    pub fn handle(self) -> RequestHandle {
        match self {
            Self::Merged(h) | Self::Queued(h) => h,
        }
    }
}

/// Queue counters and occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Bios submitted
    pub submitted: u64,
    /// Bios appended to an existing descriptor
    pub back_merges: u64,
    /// Bios prepended to an existing descriptor
    pub front_merges: u64,
    /// Descriptors absorbed by a neighbour
    pub request_merges: u64,
    /// Descriptors handed to the driver for the first time
    pub dispatched: u64,
    /// Descriptors completed
    pub completed: u64,
    /// Descriptors given back by the driver
    pub requeued: u64,
    /// Submissions refused for lack of descriptors
    pub exhausted: u64,
    /// Policy switches
    pub switches: u64,
    /// Held by the policy
    pub pending: usize,
    /// On the dispatch list
    pub dispatch_list: usize,
    /// Taken off the dispatch list and not completed
    pub in_flight: usize,
    /// Live descriptors
    pub allocated: usize,
}

// =============================================================================
// INNER STATE
// =============================================================================

/// Per-call environment: who to talk to, when, and whether to kick
struct Env<'a> {
    device: &'a dyn BlockDevice,
    contexts: &'a IoContextRegistry,
    now: Tick,
    kick: bool,
}

struct QueueInner {
    arena: RequestArena,
    hash: MergeHash,
    dispatch: DispatchList,
    last_merge: Option<RequestHandle>,
    elevator: Box<dyn ElevatorOps>,
    in_flight: usize,
    config: QueueConfig,
    limits: QueueLimits,
    stats: QueueStats,
}

impl QueueInner {
    /// Split into the policy and the context it operates on
    fn parts<'a>(&'a mut self, env: &'a mut Env<'_>) -> (&'a mut Box<dyn ElevatorOps>, ElvCtx<'a>) {
        let ctx = ElvCtx {
            arena: &mut self.arena,
            hash: &mut self.hash,
            dispatch: &mut self.dispatch,
            last_merge: &mut self.last_merge,
            device: env.device,
            contexts: env.contexts,
            limits: self.limits,
            now: env.now,
            kick: &mut env.kick,
        };
        (&mut self.elevator, ctx)
    }

    // =========================================================================
    // MERGING
    // =========================================================================

    fn merge_allowed(&self, env: &Env<'_>, rq: RequestHandle, bio: &Bio, kind: MergeType) -> bool {
        let request = self.arena.rq(rq);
        bio_merge_fits(&self.limits, request, bio, kind)
            && self.elevator.allow_merge(&self.arena, rq, bio)
            && env.device.merge_ok(request, bio)
    }

    /// Find a descriptor `bio` can join
    fn find_merge(&mut self, env: &mut Env<'_>, bio: &Bio) -> Option<(RequestHandle, MergeType)> {
        if let Some(last) = self.last_merge.filter(|&h| self.arena.contains(h)) {
            let rq = self.arena.rq(last);
            let kind = if rq.end_sector() == bio.sector {
                MergeType::Back
            } else if bio.end_sector() == rq.sector {
                MergeType::Front
            } else {
                MergeType::None
            };
            if kind != MergeType::None && self.merge_allowed(env, last, bio, kind) {
                return Some((last, kind));
            }
        }

        if let Some(rq) = self.hash.find_back_merge(&mut self.arena, bio.sector) {
            if self.merge_allowed(env, rq, bio, MergeType::Back) {
                return Some((rq, MergeType::Back));
            }
        }

        let candidate = {
            let (elevator, mut ctx) = self.parts(env);
            elevator.merge(&mut ctx, bio)
        };
        candidate
            .filter(|&rq| self.merge_allowed(env, rq, bio, MergeType::Front))
            .map(|rq| (rq, MergeType::Front))
    }

    /// Apply a bio merge; returns the descriptor that ends up holding the bio
    fn apply_merge(&mut self, env: &mut Env<'_>, rq: RequestHandle, kind: MergeType, bio: &Bio) -> RequestHandle {
        match kind {
            MergeType::Back => {
                self.arena.rq_mut(rq).back_merge(bio);
                self.stats.back_merges += 1;
            }
            MergeType::Front => {
                self.arena.rq_mut(rq).front_merge(bio);
                self.stats.front_merges += 1;
            }
            MergeType::None => return rq,
        }
        self.hash.reposition(&mut self.arena, rq);
        {
            let (elevator, mut ctx) = self.parts(env);
            elevator.merged(&mut ctx, rq, kind);
        }
        self.last_merge = Some(rq);

        // the grown descriptor may now touch its neighbour
        match kind {
            MergeType::Back => {
                if let Some(next) = self.elevator.latter_request(&self.arena, rq) {
                    self.attempt_merge(env, rq, next);
                }
                rq
            }
            _ => {
                if let Some(prev) = self.elevator.former_request(&self.arena, rq) {
                    if self.attempt_merge(env, prev, rq) {
                        return prev;
                    }
                }
                rq
            }
        }
    }

    /// Absorb `next` into the contiguous `rq`
    fn attempt_merge(&mut self, env: &mut Env<'_>, rq: RequestHandle, next: RequestHandle) -> bool {
        if !requests_merge_fit(&self.limits, self.arena.rq(rq), self.arena.rq(next)) {
            return false;
        }
        {
            let (elevator, mut ctx) = self.parts(env);
            elevator.merge_requests(&mut ctx, rq, next);
        }
        self.hash.remove(&mut self.arena, next);
        if self.last_merge == Some(next) {
            self.last_merge = None;
        }
        if self.arena.rq(next).flags.contains(RequestFlags::ELVPRIV) {
            let (elevator, mut ctx) = self.parts(env);
            elevator.put_request(&mut ctx, next);
        }
        let Some(absorbed) = self.arena.remove(next) else {
            crate::bug_on!(true, InvariantViolation::MissingReference);
            return false;
        };
        self.arena.rq_mut(rq).absorb(&absorbed);
        self.hash.reposition(&mut self.arena, rq);
        self.last_merge = Some(rq);
        self.stats.request_merges += 1;
        true
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    fn submit(&mut self, env: &mut Env<'_>, bio: Bio) -> IoSchedResult<SubmitOutcome> {
        self.stats.submitted += 1;

        if let Some((rq, kind)) = self.find_merge(env, &bio) {
            let survivor = self.apply_merge(env, rq, kind, &bio);
            return Ok(SubmitOutcome::Merged(survivor));
        }

        let handle = match self.arena.insert(Request::from_bio(&bio, env.now)) {
            Ok(handle) => handle,
            Err(err) => {
                self.stats.exhausted += 1;
                log::debug!("iosched: no free descriptor for sector {}", bio.sector);
                return Err(err);
            }
        };

        let attached = {
            let (elevator, mut ctx) = self.parts(env);
            elevator.set_request(&mut ctx, handle)
        };
        if let Err(err) = attached {
            self.arena.remove(handle);
            self.stats.exhausted += 1;
            return Err(err);
        }
        self.arena.rq_mut(handle).flags.insert(RequestFlags::ELVPRIV);

        let position = if bio.flags.contains(RequestFlags::BARRIER) {
            InsertPosition::Back
        } else {
            InsertPosition::Sorted
        };
        self.insert(env, handle, position);
        env.kick = true;
        Ok(SubmitOutcome::Queued(handle))
    }

    fn insert(&mut self, env: &mut Env<'_>, rq: RequestHandle, mut position: InsertPosition) {
        let flags = self.arena.rq(rq).flags;
        if position == InsertPosition::Sorted {
            if flags.intersects(RequestFlags::BARRIER | RequestFlags::SOFTBARRIER) {
                position = InsertPosition::Back;
            } else if !flags.contains(RequestFlags::ELVPRIV) {
                position = InsertPosition::Back;
            }
        }

        match position {
            InsertPosition::Front | InsertPosition::Requeue => {
                self.arena.rq_mut(rq).flags.insert(RequestFlags::SOFTBARRIER);
                self.dispatch.add_front(&mut self.arena, rq);
            }
            InsertPosition::Back => {
                self.arena.rq_mut(rq).flags.insert(RequestFlags::SOFTBARRIER);
                self.drain_elevator(env);
                self.dispatch.add_tail(&mut self.arena, rq);
                self.dispatch.set_boundary(&self.arena, rq);
                env.kick = true;
            }
            InsertPosition::Sorted => {
                let request = self.arena.rq_mut(rq);
                request.flags.insert(RequestFlags::SORTED);
                if request.is_mergeable() {
                    self.hash.add(&mut self.arena, rq);
                    if self.last_merge.is_none() {
                        self.last_merge = Some(rq);
                    }
                }
                let (elevator, mut ctx) = self.parts(env);
                elevator.add_request(&mut ctx, rq);
            }
        }
    }

    /// Move everything the policy holds onto the dispatch list
    fn drain_elevator(&mut self, env: &mut Env<'_>) {
        let mut drained = 0;
        loop {
            let (elevator, mut ctx) = self.parts(env);
            let moved = elevator.dispatch(&mut ctx, true);
            if moved == 0 {
                break;
            }
            drained += moved;
        }
        if !self.elevator.is_empty() {
            log::error!(
                "iosched: {} still holds {} after drain",
                self.elevator.name(),
                self.elevator.queued()
            );
        }
        if drained > 0 {
            log::trace!("iosched: drained {} from {}", drained, self.elevator.name());
        }
    }

    fn dispatch(&mut self, env: &mut Env<'_>, force: bool) -> usize {
        let (elevator, mut ctx) = self.parts(env);
        elevator.dispatch(&mut ctx, force)
    }

    // =========================================================================
    // DRIVER LIFECYCLE
    // =========================================================================

    fn next_request(&mut self, env: &mut Env<'_>) -> Option<RequestHandle> {
        loop {
            if let Some(rq) = self.dispatch.front() {
                let request = self.arena.rq_mut(rq);
                if !request.is_started() {
                    let activate = request
                        .flags
                        .contains(RequestFlags::SORTED | RequestFlags::ELVPRIV);
                    request.flags.insert(RequestFlags::STARTED);
                    if activate {
                        let (elevator, mut ctx) = self.parts(env);
                        elevator.activate(&mut ctx, rq);
                    }
                    self.dispatch.advance_boundary(&self.arena, rq);
                    self.stats.dispatched += 1;
                }
                return Some(rq);
            }
            if self.dispatch(env, false) == 0 {
                return None;
            }
        }
    }

    fn dequeue(&mut self, rq: RequestHandle) -> IoSchedResult<()> {
        let started = self.arena.get(rq).ok_or(IoSchedError::StaleHandle)?.is_started();
        if !self.dispatch.remove(&mut self.arena, rq) {
            return Err(IoSchedError::Busy);
        }
        if started {
            self.in_flight += 1;
        }
        Ok(())
    }

    fn end_request(&mut self, env: &mut Env<'_>, rq: RequestHandle) -> IoSchedResult<()> {
        let request = self.arena.get(rq).ok_or(IoSchedError::StaleHandle)?;
        if request.is_indexed() {
            // still owned by the policy
            return Err(IoSchedError::Busy);
        }
        let flags = request.flags;

        if flags.contains(RequestFlags::QUEUED) {
            self.dispatch.remove(&mut self.arena, rq);
        } else if flags.contains(RequestFlags::STARTED) {
            crate::bug_on!(self.in_flight == 0, InvariantViolation::CountMismatch);
            self.in_flight -= 1;
        }

        let (elevator, mut ctx) = self.parts(env);
        if flags.contains(RequestFlags::STARTED | RequestFlags::SORTED | RequestFlags::ELVPRIV) {
            elevator.completed(&mut ctx, rq);
        }
        if flags.contains(RequestFlags::ELVPRIV) {
            elevator.put_request(&mut ctx, rq);
        }

        if self.last_merge == Some(rq) {
            self.last_merge = None;
        }
        self.arena.remove(rq);
        self.stats.completed += 1;
        Ok(())
    }

    fn requeue(&mut self, env: &mut Env<'_>, rq: RequestHandle) -> IoSchedResult<()> {
        let flags = self.arena.get(rq).ok_or(IoSchedError::StaleHandle)?.flags;
        if flags.contains(RequestFlags::QUEUED) {
            self.dispatch.remove(&mut self.arena, rq);
        } else if flags.contains(RequestFlags::STARTED) {
            crate::bug_on!(self.in_flight == 0, InvariantViolation::CountMismatch);
            self.in_flight -= 1;
        } else {
            return Err(IoSchedError::Busy);
        }

        self.unstart(env, rq, flags);
        self.insert(env, rq, InsertPosition::Requeue);
        self.stats.requeued += 1;
        env.kick = true;
        Ok(())
    }

    /// Withdraw the driver's claim on a started descriptor
    fn unstart(&mut self, env: &mut Env<'_>, rq: RequestHandle, flags: RequestFlags) {
        if flags.contains(RequestFlags::STARTED | RequestFlags::SORTED | RequestFlags::ELVPRIV) {
            let (elevator, mut ctx) = self.parts(env);
            elevator.deactivate(&mut ctx, rq);
        }
        self.arena.rq_mut(rq).flags.remove(RequestFlags::STARTED);
    }

    /// Put back a descriptor the caller holds outside every list
    fn reinsert(
        &mut self,
        env: &mut Env<'_>,
        rq: RequestHandle,
        position: InsertPosition,
    ) -> IoSchedResult<()> {
        let request = self.arena.get(rq).ok_or(IoSchedError::StaleHandle)?;
        let flags = request.flags;
        if request.is_indexed() || flags.contains(RequestFlags::QUEUED) {
            return Err(IoSchedError::Busy);
        }
        if !flags.contains(RequestFlags::STARTED) {
            self.insert(env, rq, position);
            return Ok(());
        }

        // in flight: back onto the dispatch list only
        crate::bug_on!(self.in_flight == 0, InvariantViolation::CountMismatch);
        self.in_flight -= 1;
        self.unstart(env, rq, flags);
        let position = match position {
            InsertPosition::Sorted => InsertPosition::Requeue,
            other => other,
        };
        self.insert(env, rq, position);
        self.stats.requeued += 1;
        env.kick = true;
        Ok(())
    }

    // =========================================================================
    // POLICY SWITCH
    // =========================================================================

    fn switch_elevator(&mut self, env: &mut Env<'_>, name: &str) -> IoSchedResult<()> {
        let new = init_elevator(name, &self.config).map_err(|err| {
            log::warn!("iosched: cannot switch to '{}': {}", name, err);
            err
        })?;

        self.drain_elevator(env);
        for rq in self.arena.handles() {
            if self.arena.rq(rq).flags.contains(RequestFlags::ELVPRIV) {
                let (elevator, mut ctx) = self.parts(env);
                elevator.put_request(&mut ctx, rq);
                self.arena.rq_mut(rq).flags.remove(RequestFlags::ELVPRIV);
            }
        }
        {
            let (elevator, mut ctx) = self.parts(env);
            elevator.exit(&mut ctx);
        }

        let old = core::mem::replace(&mut self.elevator, new);
        self.last_merge = None;
        self.stats.switches += 1;
        env.kick = true;
        log::info!(
            "iosched: device {} switched elevator '{}' -> '{}'",
            env.device.id(),
            old.name(),
            self.elevator.name()
        );
        Ok(())
    }

    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.hash.check_invariants(&self.arena)?;
        self.dispatch.check_invariants(&self.arena)?;
        self.elevator.check_invariants(&self.arena)?;
        if let Some(last) = self.last_merge {
            ensure(self.arena.contains(last), InvariantViolation::MissingReference)?;
        }
        ensure(
            self.arena.len() == self.elevator.queued() + self.dispatch.len() + self.in_flight,
            InvariantViolation::CountMismatch,
        )
    }
}

// =============================================================================
// REQUEST QUEUE
// =============================================================================

/// Elevator-managed request queue of one block device
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    device: Arc<dyn BlockDevice>,
    clock: Arc<dyn Clock>,
    contexts: &'static IoContextRegistry,
}

impl RequestQueue {
    /// Create a queue running `config.elevator`.
    ///
    /// If that elevator fails to initialize, `config.fallback` is used
    /// instead; only when both fail is an error returned.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> IoSchedResult<Self> {
        Self::with_contexts(device, clock, config, IoContextRegistry::global())
    }

    /// Like [`new`](Self::new), looking submitter contexts up in `contexts`
    /// instead of the process-wide registry
    pub fn with_contexts(
        device: Arc<dyn BlockDevice>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
        contexts: &'static IoContextRegistry,
    ) -> IoSchedResult<Self> {
        let elevator = match init_elevator(config.elevator, &config) {
            Ok(elevator) => elevator,
            Err(err) => {
                log::warn!(
                    "iosched: elevator '{}' unavailable ({}), falling back to '{}'",
                    config.elevator,
                    err,
                    config.fallback
                );
                init_elevator(config.fallback, &config)?
            }
        };
        log::info!("iosched: device {} using elevator '{}'", device.id(), elevator.name());

        let inner = QueueInner {
            arena: RequestArena::new(config.nr_requests),
            hash: MergeHash::new(),
            dispatch: DispatchList::new(),
            last_merge: None,
            elevator,
            in_flight: 0,
            config,
            limits: device.limits(),
            stats: QueueStats::default(),
        };
        Ok(Self {
            inner: Mutex::new(inner),
            device,
            clock,
            contexts,
        })
    }

    /// Run `f` under the queue lock, kicking the driver afterwards if asked
    fn locked<R>(&self, f: impl FnOnce(&mut QueueInner, &mut Env<'_>) -> R) -> R {
        let mut env = Env {
            device: self.device.as_ref(),
            contexts: self.contexts,
            now: self.clock.now(),
            kick: false,
        };
        let result = f(&mut self.inner.lock(), &mut env);
        if env.kick {
            self.device.request_fn();
        }
        result
    }

    /// Merge `bio` into a pending descriptor or queue a new one.
    ///
    /// Fails with [`IoSchedError::Exhausted`] when no descriptor is free;
    /// the caller retries after completions.
    pub fn submit(&self, bio: Bio) -> IoSchedResult<SubmitOutcome> {
        self.locked(|inner, env| inner.submit(env, bio))
    }

    /// Find a descriptor `bio` could join, without changing anything
    pub fn merge(&self, bio: &Bio) -> Option<(RequestHandle, MergeType)> {
        self.locked(|inner, env| inner.find_merge(env, bio))
    }

    /// Re-insert a descriptor the caller owns at `position`.
    ///
    /// A descriptor taken by the driver is accounted as requeued; it goes
    /// back to the dispatch list, never through the policy again.
    pub fn insert(&self, rq: RequestHandle, position: InsertPosition) -> IoSchedResult<()> {
        self.locked(|inner, env| inner.reinsert(env, rq, position))
    }

    /// Ask the policy to move work to the dispatch list; `force` drains it
    pub fn dispatch(&self, force: bool) -> usize {
        self.locked(|inner, env| inner.dispatch(env, force))
    }

    /// Head of the dispatch list, filling it from the policy when empty.
    ///
    /// Marks the descriptor started; it stays on the list until
    /// [`dequeue`](Self::dequeue)d.
    pub fn next_request(&self) -> Option<RequestHandle> {
        self.locked(|inner, env| inner.next_request(env))
    }

    /// Take a descriptor off the dispatch list for the driver
    pub fn dequeue(&self, rq: RequestHandle) -> IoSchedResult<()> {
        self.locked(|inner, _| inner.dequeue(rq))
    }

    /// The driver finished `rq`; the descriptor is freed
    pub fn end_request(&self, rq: RequestHandle) -> IoSchedResult<()> {
        self.locked(|inner, env| inner.end_request(env, rq))
    }

    /// The driver gives `rq` back; it goes to the head of the dispatch list
    pub fn requeue(&self, rq: RequestHandle) -> IoSchedResult<()> {
        self.locked(|inner, env| inner.requeue(env, rq))
    }

    /// Deliver a scheduler timer
    pub fn timer_expired(&self, kind: TimerKind) {
        self.locked(|inner, env| {
            let (elevator, mut ctx) = inner.parts(env);
            elevator.timer_expired(&mut ctx, kind);
        })
    }

    /// Forget whatever the policy keeps for `submitter`
    pub fn exit_submitter(&self, submitter: SubmitterId) {
        self.locked(|inner, env| {
            let (elevator, mut ctx) = inner.parts(env);
            elevator.exit_submitter(&mut ctx, submitter);
        })
    }

    /// Replace the policy at run time.
    ///
    /// The old policy is drained onto the dispatch list and detached from
    /// every live descriptor before the swap. On failure the old policy stays.
    pub fn switch_elevator(&self, name: &str) -> IoSchedResult<()> {
        self.locked(|inner, env| inner.switch_elevator(env, name))
    }

    /// Name of the running policy
    pub fn elevator_name(&self) -> &'static str {
        self.inner.lock().elevator.name()
    }

    /// Read a policy tunable
    pub fn tunable(&self, name: &str) -> IoSchedResult<u64> {
        self.inner.lock().elevator.tunable(name)
    }

    /// Write a policy tunable from decimal text; returns the stored value
    pub fn set_tunable(&self, name: &str, input: &str) -> IoSchedResult<u64> {
        let mut inner = self.inner.lock();
        inner.elevator.set_tunable(name, input).map_err(|err| {
            log::warn!("iosched: rejected {}={:?}: {}", name, input, err);
            err
        })
    }

    /// Every tunable of the running policy with its value
    pub fn tunables(&self) -> Vec<(&'static str, u64)> {
        let inner = self.inner.lock();
        inner
            .elevator
            .tunable_defs()
            .iter()
            .filter_map(|def| inner.elevator.tunable(def.name).ok().map(|v| (def.name, v)))
            .collect()
    }

    /// Change the descriptor limit
    pub fn set_nr_requests(&self, nr_requests: usize) {
        let mut inner = self.inner.lock();
        inner.arena.set_capacity(nr_requests);
        inner.config.nr_requests = nr_requests;
    }

    /// Look at a live descriptor
    pub fn with_request<R>(&self, rq: RequestHandle, f: impl FnOnce(&Request) -> R) -> IoSchedResult<R> {
        let inner = self.inner.lock();
        inner.arena.get(rq).map(f).ok_or(IoSchedError::StaleHandle)
    }

    /// Counters and occupancy
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            pending: inner.elevator.queued(),
            dispatch_list: inner.dispatch.len(),
            in_flight: inner.in_flight,
            allocated: inner.arena.len(),
            ..inner.stats
        }
    }

    /// Full consistency check of the queue and its policy
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.inner.lock().check_invariants()
    }
}

impl core::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("device", &self.device.id())
            .field("elevator", &self.elevator_name())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevator::{register_elevator, unregister_elevator, ElevatorType};
    use crate::testing::TestQueue;

    const POLICIES: [&str; 3] = ["noop", "deadline", "cfq"];

    #[test]
    fn test_sequential_coalescing() {
        for name in POLICIES {
            let t = TestQueue::new(QueueConfig::with_elevator(name));
            let first = t.queue.submit(Bio::write(1, 0, 8)).unwrap();
            assert!(matches!(first, SubmitOutcome::Queued(_)));
            for sector in [8, 16] {
                let outcome = t.queue.submit(Bio::write(1, sector, 8)).unwrap();
                assert_eq!(outcome, SubmitOutcome::Merged(first.handle()));
            }

            let range = t.queue.with_request(first.handle(), |rq| (rq.sector, rq.nr_sectors));
            assert_eq!(range, Ok((0, 24)), "{}", name);
            let stats = t.queue.stats();
            assert_eq!(stats.pending, 1);
            assert_eq!(stats.back_merges, 2);
            t.queue.check_invariants().unwrap();
            assert_eq!(t.drain_sectors(), [0]);
        }
    }

    #[test]
    fn test_front_merge_found() {
        for name in POLICIES {
            let t = TestQueue::new(QueueConfig::with_elevator(name));
            t.queue.submit(Bio::write(1, 100, 8)).unwrap();
            assert_eq!(
                t.queue.merge(&Bio::write(1, 92, 8)).map(|(_, kind)| kind),
                Some(MergeType::Front)
            );
            assert_eq!(
                t.queue.merge(&Bio::write(1, 108, 8)).map(|(_, kind)| kind),
                Some(MergeType::Back)
            );
            assert!(t.queue.merge(&Bio::read(1, 108, 8)).is_none());
            assert!(t.queue.merge(&Bio::write(2, 108, 8)).is_none());
        }
    }

    #[test]
    fn test_device_veto() {
        let t = TestQueue::new(QueueConfig::with_elevator("deadline"));
        t.device.set_refuse_merges(true);
        t.queue.submit(Bio::write(1, 0, 8)).unwrap();
        t.queue.submit(Bio::write(1, 8, 8)).unwrap();
        assert_eq!(t.queue.stats().pending, 2);
    }

    #[test]
    fn test_conservation_through_lifecycle() {
        for name in POLICIES {
            let t = TestQueue::new(QueueConfig::with_elevator(name));
            for (i, submitter) in [3, 4, 5, 3, 4].into_iter().enumerate() {
                let sector = 1000 * i as u64;
                t.queue.submit(Bio::read(1, sector, 8).with_submitter(submitter)).unwrap();
                t.queue.submit(Bio::write(1, sector + 500, 8)).unwrap();
            }
            t.queue.check_invariants().unwrap();
            assert_eq!(t.queue.stats().allocated, 10);

            let rq = t.queue.next_request().unwrap();
            t.queue.check_invariants().unwrap();
            t.queue.dequeue(rq).unwrap();
            assert_eq!(t.queue.stats().in_flight, 1);
            t.queue.check_invariants().unwrap();
            t.queue.end_request(rq).unwrap();
            t.queue.check_invariants().unwrap();

            let rest = t.drain_sectors();
            assert_eq!(rest.len(), 9, "{}", name);
            let stats = t.queue.stats();
            assert_eq!(stats.allocated, 0);
            assert_eq!(stats.completed, 10);
            t.queue.check_invariants().unwrap();
        }
    }

    #[test]
    fn test_stale_handle() {
        let t = TestQueue::new(QueueConfig::with_elevator("noop"));
        let h = t.queue.submit(Bio::write(1, 0, 8)).unwrap().handle();
        // still pending in the policy
        assert_eq!(t.queue.end_request(h), Err(IoSchedError::Busy));
        assert_eq!(t.queue.next_request(), Some(h));
        t.queue.dequeue(h).unwrap();
        t.queue.end_request(h).unwrap();
        assert_eq!(t.queue.end_request(h), Err(IoSchedError::StaleHandle));
        assert_eq!(t.queue.dequeue(h), Err(IoSchedError::StaleHandle));
    }

    #[test]
    fn test_requeue_goes_first() {
        let t = TestQueue::new(QueueConfig::with_elevator("deadline"));
        t.queue.submit(Bio::write(1, 100, 8)).unwrap();
        t.queue.submit(Bio::write(1, 900, 8)).unwrap();
        let rq = t.queue.next_request().unwrap();
        t.queue.dequeue(rq).unwrap();
        t.queue.requeue(rq).unwrap();
        t.queue.check_invariants().unwrap();

        assert_eq!(t.queue.next_request(), Some(rq));
        assert_eq!(t.queue.stats().requeued, 1);
        assert_eq!(t.drain_sectors(), [100, 900]);
    }

    #[test]
    fn test_insert_in_flight_requeues() {
        let t = TestQueue::new(QueueConfig::with_elevator("deadline"));
        t.queue.submit(Bio::write(1, 100, 8)).unwrap();
        let rq = t.queue.next_request().unwrap();
        assert_eq!(t.queue.insert(rq, InsertPosition::Requeue), Err(IoSchedError::Busy));

        t.queue.dequeue(rq).unwrap();
        t.queue.insert(rq, InsertPosition::Requeue).unwrap();
        let stats = t.queue.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.dispatch_list, 1);
        assert_eq!(stats.requeued, 1);
        t.queue.check_invariants().unwrap();
        assert_eq!(t.drain_sectors(), [100]);
    }

    #[test]
    fn test_insert_positions_after_dispatch() {
        let cases: [(InsertPosition, [u64; 2]); 3] = [
            (InsertPosition::Front, [100, 900]),
            (InsertPosition::Back, [900, 100]),
            (InsertPosition::Sorted, [100, 900]),
        ];
        for (position, expected) in cases {
            let t = TestQueue::new(QueueConfig::with_elevator("deadline"));
            t.queue.submit(Bio::write(1, 100, 8)).unwrap();
            t.queue.submit(Bio::write(1, 900, 8)).unwrap();
            let rq = t.queue.next_request().unwrap();
            t.queue.dequeue(rq).unwrap();

            t.queue.insert(rq, position).unwrap();
            t.queue.check_invariants().unwrap();
            assert_eq!(t.queue.stats().in_flight, 0);
            assert_eq!(t.drain_sectors(), expected, "{:?}", position);
            t.queue.check_invariants().unwrap();
        }
    }

    #[test]
    fn test_insert_in_flight_cfq_accounting() {
        let t = TestQueue::new(QueueConfig::with_elevator("cfq"));
        t.queue.submit(Bio::read(1, 0, 8).with_submitter(4)).unwrap();
        let rq = t.queue.next_request().unwrap();
        t.queue.dequeue(rq).unwrap();
        t.queue.insert(rq, InsertPosition::Sorted).unwrap();
        t.queue.check_invariants().unwrap();
        assert_eq!(t.queue.stats().pending, 0);
        assert_eq!(t.drain_sectors(), [0]);
        t.queue.check_invariants().unwrap();
    }

    #[test]
    fn test_barrier_not_passed() {
        let t = TestQueue::new(QueueConfig::with_elevator("deadline"));
        t.queue.submit(Bio::write(1, 100, 8)).unwrap();
        t.queue.submit(Bio::write(1, 200, 8)).unwrap();
        t.queue.submit(Bio::write(1, 50, 8).barrier()).unwrap();
        // drained ahead of the barrier
        assert_eq!(t.queue.stats().pending, 0);
        t.queue.submit(Bio::write(1, 10, 8)).unwrap();
        // a barrier never absorbs anything
        t.queue.submit(Bio::write(1, 58, 8)).unwrap();
        t.queue.check_invariants().unwrap();
        assert_eq!(t.drain_sectors(), [100, 200, 50, 10, 58]);
    }

    #[test]
    fn test_exhaustion_and_retry() {
        let mut config = QueueConfig::with_elevator("deadline");
        config.nr_requests = 2;
        let t = TestQueue::new(config);
        t.queue.submit(Bio::write(1, 0, 8)).unwrap();
        t.queue.submit(Bio::write(1, 100, 8)).unwrap();
        let err = t.queue.submit(Bio::write(1, 200, 8)).unwrap_err();
        assert_eq!(err, IoSchedError::Exhausted);
        assert!(err.is_retryable());
        // merges need no descriptor
        t.queue.submit(Bio::write(1, 8, 8)).unwrap();
        assert_eq!(t.queue.stats().exhausted, 1);

        assert!(t.next_sector().is_some());
        t.queue.submit(Bio::write(1, 200, 8)).unwrap();
        t.queue.set_nr_requests(1);
        assert!(t.queue.submit(Bio::write(1, 300, 8)).is_err());
        t.queue.check_invariants().unwrap();
    }

    #[test]
    fn test_switch_drains_and_detaches() {
        let t = TestQueue::new(QueueConfig::with_elevator("cfq"));
        for submitter in 1..=3 {
            t.queue
                .submit(Bio::read(1, submitter as u64 * 1000, 8).with_submitter(submitter))
                .unwrap();
        }
        t.queue.submit(Bio::write(1, 7000, 8)).unwrap();
        let in_flight = t.queue.next_request().unwrap();
        t.queue.dequeue(in_flight).unwrap();

        t.queue.switch_elevator("deadline").unwrap();
        assert_eq!(t.queue.elevator_name(), "deadline");
        let stats = t.queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.dispatch_list, 3);
        assert_eq!(stats.switches, 1);
        t.queue.check_invariants().unwrap();

        // completions of descriptors admitted by the old policy
        t.queue.end_request(in_flight).unwrap();
        t.queue.submit(Bio::write(1, 1, 8)).unwrap();
        assert_eq!(t.drain_sectors().len(), 4);
        t.queue.check_invariants().unwrap();
        assert!(t.device.kicks() > 0);
    }

    #[test]
    fn test_switch_to_unknown_keeps_policy() {
        let t = TestQueue::new(QueueConfig::with_elevator("deadline"));
        t.queue.submit(Bio::write(1, 0, 8)).unwrap();
        assert_eq!(
            t.queue.switch_elevator("anticipatory"),
            Err(IoSchedError::UnknownElevator)
        );
        assert_eq!(t.queue.elevator_name(), "deadline");
        assert_eq!(t.queue.stats().pending, 1);
    }

    fn refusing_init(_config: &QueueConfig) -> IoSchedResult<Box<dyn ElevatorOps>> {
        Err(IoSchedError::InitFailed)
    }

    static REFUSING: ElevatorType = ElevatorType {
        name: "queue-test-refusing",
        init: refusing_init,
    };

    #[test]
    fn test_init_failure_falls_back() {
        register_elevator(&REFUSING).unwrap();
        let t = TestQueue::new(QueueConfig::with_elevator("queue-test-refusing"));
        assert_eq!(t.queue.elevator_name(), "noop");
        unregister_elevator("queue-test-refusing");

        let mut config = QueueConfig::with_elevator("missing");
        config.fallback = "also-missing";
        let device = Arc::new(crate::testing::MockDevice::new(1));
        let clock = Arc::new(crate::device::ManualClock::new(0));
        assert!(RequestQueue::new(device, clock, config).is_err());
    }

    #[test]
    fn test_tunables_listed() {
        let t = TestQueue::new(QueueConfig::with_elevator("cfq"));
        let tunables = t.queue.tunables();
        assert_eq!(tunables.len(), 9);
        assert!(tunables.contains(&("slice_idle", 8)));
        assert_eq!(t.queue.set_tunable("slice_idle", "abc"), Err(IoSchedError::InvalidTunableValue));
        assert_eq!(t.queue.set_tunable("nope", "1"), Err(IoSchedError::UnknownTunable));
        assert_eq!(t.queue.tunable("slice_idle"), Ok(8));
    }
}
