//! # Completely Fair Queueing
//!
//! Every synchronous submitter gets its own queue; asynchronous I/O shares
//! one queue per priority. Queues take turns holding a time slice, during
//! which only they dispatch:
//!
//! 1. The active queue dispatches up to `quantum` descriptors per round,
//!    an expired FIFO head first (once per slice), else the descriptor
//!    nearest the head.
//! 2. When a synchronous queue runs dry but its submitter is likely to
//!    issue more I/O soon (short think time, not seeky), the policy idles
//!    for up to `slice_idle` rather than rotating.
//! 3. On expiry the next queue comes from the current round, then the next
//!    best-effort level, then queues still waiting on completions, then
//!    the idle class after a grace period.
//! 4. A synchronous arrival preempts an asynchronous or idle-class active
//!    queue and starts at once with half a nominal slice.

pub mod queue;
pub mod rings;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;

use self::queue::{Binding, CfqQueue, QueueFlags, QueueId};
use self::rings::{Ring, ServiceRings};
use super::{ElevatorOps, ElevatorType, ElvCtx};
use crate::arena::RequestArena;
use crate::config::{CfqTunables, QueueConfig, CFQ_IDLE_GRACE};
use crate::device::TimerKind;
use crate::error::{ensure, IoSchedResult, InvariantViolation};
use crate::merge::{find_front_merge, MergeType};
use crate::request::{Bio, IoPriority, RequestHandle, Sector, SubmitterId, Tick, ASYNC_SUBMITTER};
use crate::stream::{choose_nearest, SeekModel};
use crate::tunables::{TunableDef, TunableSet};

/// Registry entry
pub static CFQ: ElevatorType = ElevatorType {
    name: "cfq",
    init: cfq_init,
};

fn cfq_init(config: &QueueConfig) -> IoSchedResult<Box<dyn ElevatorOps>> {
    Ok(Box::new(Cfq::new(config.cfq)))
}

#[cold]
fn missing_queue(id: QueueId) -> ! {
    log::error!("cfq: no queue {}", id);
    panic!("iosched: {}", InvariantViolation::MissingReference)
}

// =============================================================================
// STATE
// =============================================================================

/// CFQ policy state for one device
#[derive(Debug)]
pub struct Cfq {
    queues: BTreeMap<QueueId, CfqQueue>,
    /// Shared async queue per priority
    async_queues: HashMap<u16, QueueId>,
    bindings: BTreeMap<SubmitterId, Binding>,
    rings: ServiceRings,
    active: Option<QueueId>,
    /// Submitter of the first descriptor dispatched in the current slice
    active_binding: Option<SubmitterId>,
    /// Queues on a ring
    busy_queues: usize,
    /// Activated and not yet completed or deactivated
    rq_in_driver: usize,
    /// Dispatched from the active queue this slice
    dispatch_slice: u64,
    last_sector: Sector,
    last_end_request: Tick,
    next_id: QueueId,
    idle_slice_armed: bool,
    idle_class_armed: bool,
    tunables: CfqTunables,
}

impl Cfq {
    /// Create an empty policy
    pub fn new(tunables: CfqTunables) -> Self {
        Self {
            queues: BTreeMap::new(),
            async_queues: HashMap::new(),
            bindings: BTreeMap::new(),
            rings: ServiceRings::new(),
            active: None,
            active_binding: None,
            busy_queues: 0,
            rq_in_driver: 0,
            dispatch_slice: 0,
            last_sector: 0,
            last_end_request: 0,
            next_id: 1,
            idle_slice_armed: false,
            idle_class_armed: false,
            tunables,
        }
    }

    /// Current tunables
    pub fn tunables(&self) -> &CfqTunables {
        &self.tunables
    }

    fn q(&self, id: QueueId) -> &CfqQueue {
        match self.queues.get(&id) {
            Some(q) => q,
            None => missing_queue(id),
        }
    }

    fn q_mut(&mut self, id: QueueId) -> &mut CfqQueue {
        match self.queues.get_mut(&id) {
            Some(q) => q,
            None => missing_queue(id),
        }
    }

    fn seek_model(&self) -> SeekModel {
        SeekModel {
            last_sector: self.last_sector,
            // KiB to sectors
            back_max: self.tunables.back_seek_max * 2,
            back_penalty: self.tunables.back_seek_penalty,
        }
    }

    fn stream_of(arena: &RequestArena, rq: RequestHandle) -> QueueId {
        match arena.rq(rq).stream {
            Some(id) => id,
            None => missing_queue(0),
        }
    }

    // =========================================================================
    // QUEUE LOOKUP AND LIFETIME
    // =========================================================================

    /// Queue a bio would be filed on, if it exists yet
    fn queue_for_bio(&self, bio: &Bio) -> Option<QueueId> {
        if bio.is_sync() && bio.submitter != ASYNC_SUBMITTER {
            self.bindings.get(&bio.submitter).and_then(|b| b.queues[1])
        } else {
            let prio = queue::normalize(bio.effective_priority());
            self.async_queues.get(&prio.code()).copied()
        }
    }

    fn alloc_queue(&mut self, key: SubmitterId, prio: IoPriority) -> QueueId {
        while self.queues.contains_key(&self.next_id) || self.next_id == 0 {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.queues.insert(id, CfqQueue::new(id, key, prio));
        log::debug!("cfq: new queue {} for submitter {} ({:?})", id, key, prio);
        id
    }

    fn async_queue(&mut self, prio: IoPriority) -> QueueId {
        let code = queue::normalize(prio).code();
        if let Some(&id) = self.async_queues.get(&code) {
            return id;
        }
        let id = self.alloc_queue(ASYNC_SUBMITTER, prio);
        self.async_queues.insert(code, id);
        id
    }

    fn put_queue(&mut self, ctx: &mut ElvCtx<'_>, id: QueueId) {
        let q = self.q_mut(id);
        crate::bug_on!(q.refs == 0, InvariantViolation::MissingReference);
        q.refs -= 1;
        if q.refs > 0 {
            return;
        }
        crate::bug_on!(!q.stream.is_empty(), InvariantViolation::TeardownNotEmpty);

        if self.active == Some(id) {
            self.slice_expired(ctx, false);
        }
        let q = self.q(id);
        let (ring, sync, code) = (q.ring, q.is_sync(), q.prio.code());
        if let Some(ring) = ring {
            self.rings.remove(ring, id);
            self.busy_queues -= 1;
        }
        if !sync {
            if self.async_queues.get(&code) == Some(&id) {
                self.async_queues.remove(&code);
            }
        }
        self.queues.remove(&id);
        log::debug!("cfq: freed queue {}", id);
    }

    /// Point the binding's slot at `id`, taking a reference for it
    fn bind_queue(&mut self, submitter: SubmitterId, slot: usize, id: QueueId) {
        if let Some(binding) = self.bindings.get_mut(&submitter) {
            binding.queues[slot] = Some(id);
            self.q_mut(id).refs += 1;
        }
    }

    /// React to a priority change on `submitter`'s context
    fn change_priority(&mut self, ctx: &mut ElvCtx<'_>, submitter: SubmitterId, prio: IoPriority) {
        let Some(binding) = self.bindings.get_mut(&submitter) else {
            return;
        };
        binding.prio = prio;
        let [async_q, sync_q] = binding.queues;

        // async I/O moves to the shared queue of the new priority
        if let Some(old) = async_q {
            binding.queues[0] = None;
            self.put_queue(ctx, old);
        }
        if let Some(id) = sync_q {
            let q = self.q_mut(id);
            q.set_priority(prio);
            if q.on_rr() && self.active != Some(id) {
                self.resort_rr_list(id, false);
            }
        }
        log::debug!("cfq: submitter {} now {:?}", submitter, prio);
    }

    // =========================================================================
    // RINGS
    // =========================================================================

    fn add_rr(&mut self, id: QueueId) {
        crate::bug_on!(self.q(id).on_rr(), InvariantViolation::RingMembership);
        self.busy_queues += 1;
        self.resort_rr_list(id, false);
    }

    fn del_rr(&mut self, id: QueueId) {
        let q = self.q_mut(id);
        let Some(ring) = q.ring.take() else {
            crate::bug_on!(true, InvariantViolation::RingMembership);
            return;
        };
        self.rings.remove(ring, id);
        self.busy_queues -= 1;
    }

    /// (Re)file `id` on the ring its class and state call for
    fn resort_rr_list(&mut self, id: QueueId, preempted: bool) {
        let q = self.q(id);
        let target = if q.is_rt() {
            Ring::Current
        } else if q.is_idle_class() {
            Ring::Idle
        } else if q.dispatched() > 0 {
            // finish in-flight work before being picked again
            Ring::Busy
        } else {
            Ring::Level(q.prio.level)
        };
        let (service_last, current) = (q.service_last, q.ring);
        if let Some(ring) = current {
            self.rings.remove(ring, id);
        }

        if preempted {
            self.rings.push_front(target, id);
        } else {
            match target {
                Ring::Busy => self.rings.push_back(target, id),
                Ring::Current => {
                    // real-time ahead of best-effort, behind the active head
                    let pos = self
                        .rings
                        .iter(Ring::Current)
                        .take_while(|&other| Some(other) == self.active || self.q(other).is_rt())
                        .count();
                    self.rings.insert_at(target, pos, id);
                }
                _ => {
                    let members: Vec<QueueId> = self.rings.iter(target).collect();
                    let mut pos = members.len();
                    while pos > 0 {
                        let other = self.q(members[pos - 1]);
                        if other.service_last == 0 || other.service_last < service_last {
                            break;
                        }
                        pos -= 1;
                    }
                    self.rings.insert_at(target, pos, id);
                }
            }
        }
        self.q_mut(id).ring = Some(target);
    }

    // =========================================================================
    // REQUEST INDEXING
    // =========================================================================

    /// Sector-index `rq` on queue `id`, dispatching any alias first
    fn add_rq_rb(&mut self, ctx: &mut ElvCtx<'_>, id: QueueId, rq: RequestHandle) {
        while let Some(alias) = self.q_mut(id).stream.sort.insert(ctx.arena, rq) {
            log::debug!("cfq: alias at sector {}", ctx.arena.rq(alias).sector);
            self.dispatch_insert(ctx, alias);
        }
        if !self.q(id).on_rr() {
            self.add_rr(id);
        }
        let model = self.seek_model();
        let q = self.q_mut(id);
        q.stream.next_rq = choose_nearest(ctx.arena, &model, q.stream.next_rq, Some(rq));
    }

    /// Best successor once `last` leaves queue `id`
    fn find_next_rq(&self, arena: &RequestArena, id: QueueId, last: RequestHandle) -> Option<RequestHandle> {
        let sort = &self.q(id).stream.sort;
        let prev = sort.prev(arena, last);
        let next = sort
            .next(arena, last)
            .or_else(|| sort.first().filter(|&first| first != last));
        choose_nearest(arena, &self.seek_model(), next, prev)
    }

    fn remove_request(&mut self, ctx: &mut ElvCtx<'_>, id: QueueId, rq: RequestHandle) {
        let successor = if self.q(id).stream.next_rq == Some(rq) {
            Some(self.find_next_rq(ctx.arena, id, rq))
        } else {
            None
        };
        let q = self.q_mut(id);
        q.stream.remove(ctx.arena, rq);
        if let Some(next) = successor {
            q.stream.next_rq = next;
        }
        if q.on_rr() && q.stream.is_empty() {
            self.del_rr(id);
        }
    }

    /// Move `rq` from its queue to the dispatch list
    fn dispatch_insert(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle) {
        let id = Self::stream_of(ctx.arena, rq);
        let sync = ctx.arena.rq(rq).is_sync() as usize;
        self.remove_request(ctx, id, rq);
        self.q_mut(id).on_dispatch[sync] += 1;
        ctx.dispatch_sort(rq);
        if let Some(end) = ctx.dispatch_tail_end() {
            self.last_sector = end;
        }
    }

    // =========================================================================
    // SLICES
    // =========================================================================

    fn schedule_dispatch(&self, ctx: &mut ElvCtx<'_>) {
        if self.busy_queues > 0 {
            ctx.schedule_dispatch();
        }
    }

    fn cancel_idle_slice(&mut self, ctx: &mut ElvCtx<'_>) -> bool {
        if !self.idle_slice_armed {
            return false;
        }
        self.idle_slice_armed = false;
        ctx.cancel_timer(TimerKind::IdleSlice);
        true
    }

    fn arm_idle_class(&mut self, ctx: &mut ElvCtx<'_>, expires: Tick) {
        self.idle_class_armed = true;
        ctx.arm_timer(TimerKind::IdleClass, expires);
    }

    /// End the active queue's slice, saving what is left of it
    fn slice_expired(&mut self, ctx: &mut ElvCtx<'_>, preempted: bool) {
        self.dispatch_slice = 0;
        let Some(id) = self.active else {
            return;
        };
        if self.q(id).flags.contains(QueueFlags::WAIT_REQUEST) {
            self.cancel_idle_slice(ctx);
        }

        let now = ctx.now();
        let q = self.q_mut(id);
        q.flags
            .remove(QueueFlags::MUST_DISPATCH | QueueFlags::WAIT_REQUEST | QueueFlags::PREEMPTED);
        q.slice_left = q.slice_end.saturating_sub(now);
        let on_rr = q.on_rr();
        log::trace!("cfq: queue {} expired, {} left", id, q.slice_left);

        self.active = None;
        self.active_binding = None;
        if on_rr {
            self.resort_rr_list(id, preempted);
        }
    }

    fn next_prio_level(&mut self) -> bool {
        let Some((_, moved)) = self.rings.next_prio_level() else {
            return false;
        };
        for id in moved {
            self.q_mut(id).ring = Some(Ring::Current);
        }
        true
    }

    /// Pick the next queue to serve and start its slice
    fn set_active_queue(&mut self, ctx: &mut ElvCtx<'_>) -> Option<QueueId> {
        let now = ctx.now();
        let id = if !self.rings.is_empty(Ring::Current) || self.next_prio_level() {
            self.rings.head(Ring::Current)
        } else if !self.rings.is_empty(Ring::Busy) {
            self.rings.head(Ring::Busy)
        } else if !self.rings.is_empty(Ring::Idle) {
            let end = self.last_end_request + CFQ_IDLE_GRACE;
            if now < end {
                self.arm_idle_class(ctx, end);
                None
            } else {
                self.rings.head(Ring::Idle)
            }
        } else {
            None
        };

        if let Some(id) = id {
            let q = self.q_mut(id);
            q.slice_end = if q.flags.contains(QueueFlags::PREEMPTED) {
                now + q.slice_left
            } else {
                0
            };
            q.slice_left = 0;
            q.flags.remove(QueueFlags::FIFO_EXPIRE | QueueFlags::PREEMPTED);
            log::trace!("cfq: queue {} active", id);
        }
        self.active = id;
        id
    }

    /// Idle the active queue waiting for its submitter; `true` if armed
    fn arm_slice_timer(&mut self, ctx: &mut ElvCtx<'_>, id: QueueId) -> bool {
        let slice_idle = self.tunables.slice_idle;
        if slice_idle == 0 || !self.q(id).flags.contains(QueueFlags::IDLE_WINDOW) {
            return false;
        }
        let Some(binding) = self.active_binding.and_then(|s| self.bindings.get(&s)) else {
            return false;
        };
        if binding.ioc.has_exited() {
            return false;
        }
        if self.idle_slice_armed {
            return true;
        }
        let seeky = binding.ioc.history().is_seeky();

        let now = ctx.now();
        let q = self.q_mut(id);
        q.flags.insert(QueueFlags::MUST_DISPATCH | QueueFlags::WAIT_REQUEST);
        let mut sl = if q.slice_end == 0 {
            slice_idle
        } else {
            q.slice_end.saturating_sub(now).min(slice_idle)
        };
        if seeky {
            sl = sl.min(2);
        }
        let expires = now + sl.max(1);
        self.idle_slice_armed = true;
        ctx.arm_timer(TimerKind::IdleSlice, expires);
        log::trace!("cfq: queue {} idling until {}", id, expires);
        true
    }

    /// Queue to dispatch from now, or `None` to wait
    fn select_queue(&mut self, ctx: &mut ElvCtx<'_>) -> Option<QueueId> {
        if let Some(id) = self.active {
            let q = self.q(id);
            let expired = q.slice_end != 0 && ctx.now() > q.slice_end;
            if q.flags.contains(QueueFlags::MUST_DISPATCH) || !expired {
                if !q.stream.is_empty() {
                    return Some(id);
                }
                if q.dispatched() > 0 {
                    return None;
                }
                if q.is_sync() && self.arm_slice_timer(ctx, id) {
                    return None;
                }
            }
            self.slice_expired(ctx, false);
        }
        self.set_active_queue(ctx)
    }

    /// FIFO head if it expired and the FIFO was not yet honoured this slice
    fn check_fifo(&mut self, ctx: &ElvCtx<'_>, id: QueueId) -> Option<RequestHandle> {
        let now = ctx.now();
        let q = self.q_mut(id);
        if q.flags.contains(QueueFlags::FIFO_EXPIRE) {
            return None;
        }
        let head = q.stream.fifo.front()?;
        if now > ctx.arena.rq(head).fifo_time() {
            q.flags.insert(QueueFlags::FIFO_EXPIRE);
            return Some(head);
        }
        None
    }

    fn dispatch_from(&mut self, ctx: &mut ElvCtx<'_>, id: QueueId, max: usize) -> usize {
        crate::bug_on!(self.q(id).stream.is_empty(), InvariantViolation::DispatchFromEmpty);

        let mut dispatched = 0;
        loop {
            let Some(rq) = self.check_fifo(ctx, id).or(self.q(id).stream.next_rq) else {
                crate::bug_on!(true, InvariantViolation::DispatchFromEmpty);
                break;
            };
            let submitter = ctx.arena.rq(rq).submitter;
            self.dispatch_insert(ctx, rq);
            self.dispatch_slice += 1;
            dispatched += 1;
            if self.active_binding.is_none() {
                self.active_binding = Some(submitter);
            }
            if self.q(id).stream.is_empty() || dispatched >= max {
                break;
            }
        }

        let now = ctx.now();
        let slice = self.q(id).prio_slice(&self.tunables);
        let max_rq = self.q(id).max_requests(&self.tunables);
        let used = self.dispatch_slice;
        let q = self.q_mut(id);
        if q.slice_end == 0 {
            q.slice_end = now + slice;
        }
        // async queues get a request budget, idle ones a single request
        if (!q.is_sync() && used >= max_rq) || q.is_idle_class() {
            self.slice_expired(ctx, false);
        }
        dispatched
    }

    fn forced_dispatch(&mut self, ctx: &mut ElvCtx<'_>) -> usize {
        let mut count = 0;
        for (_, id) in self.rings.all() {
            loop {
                let q = self.q(id);
                let Some(rq) = q.stream.next_rq.or_else(|| q.stream.sort.first()) else {
                    break;
                };
                self.dispatch_insert(ctx, rq);
                count += 1;
            }
            crate::bug_on!(!self.q(id).stream.fifo.is_empty(), InvariantViolation::TeardownNotEmpty);
        }
        self.slice_expired(ctx, false);
        crate::bug_on!(self.busy_queues != 0, InvariantViolation::CountMismatch);
        count
    }

    // =========================================================================
    // ARRIVAL
    // =========================================================================

    fn should_preempt(&self, arena: &RequestArena, new_id: QueueId, rq: RequestHandle) -> bool {
        let new = self.q(new_id);
        if new.is_idle_class() {
            return false;
        }
        // an idle disk dispatches the newcomer without preempting
        let Some(active) = self.active else {
            return false;
        };
        let current = self.q(active);
        if current.is_idle_class() {
            return true;
        }
        if new.slice_left != 0 && new.slice_left < self.tunables.slice_idle {
            return false;
        }
        arena.rq(rq).is_sync() && !current.is_sync()
    }

    fn preempt_queue(&mut self, ctx: &mut ElvCtx<'_>, id: QueueId) {
        self.slice_expired(ctx, true);

        let slice = self.q(id).prio_slice(&self.tunables);
        let q = self.q_mut(id);
        if q.slice_left == 0 {
            q.slice_left = slice / 2;
        }
        q.flags.insert(QueueFlags::PREEMPTED);
        let Some(ring) = q.ring else {
            crate::bug_on!(true, InvariantViolation::RingMembership);
            return;
        };
        q.ring = Some(Ring::Current);
        self.rings.remove(ring, id);
        self.rings.push_front(Ring::Current, id);
        log::debug!("cfq: queue {} preempts", id);
    }

    fn update_submitter(&mut self, ctx: &ElvCtx<'_>, id: QueueId, rq: RequestHandle) {
        let now = ctx.now();
        let slice_idle = self.tunables.slice_idle;
        let (submitter, sector, end) = {
            let r = ctx.arena.rq(rq);
            (r.submitter, r.sector, r.end_sector())
        };
        let Some(binding) = self.bindings.get_mut(&submitter) else {
            return;
        };

        let elapsed = now.saturating_sub(binding.last_end_request);
        let last_pos = binding.last_request_pos;
        let history = binding.ioc.update_history(|h| {
            h.sample_think_time(elapsed, 2 * slice_idle);
            h.sample_seek(last_pos, sector);
            *h
        });
        let exited = binding.ioc.has_exited();
        binding.last_request_pos = end;

        let q = self.q_mut(id);
        let mut enable = q.flags.contains(QueueFlags::IDLE_WINDOW);
        if exited || slice_idle == 0 || history.is_seeky() {
            enable = false;
        } else if history.ttime_valid() {
            enable = history.ttime_mean <= slice_idle;
        }
        q.flags.set(QueueFlags::IDLE_WINDOW, enable);
    }

    fn rq_enqueued(&mut self, ctx: &mut ElvCtx<'_>, id: QueueId, rq: RequestHandle) {
        let (sync, submitter) = {
            let r = ctx.arena.rq(rq);
            (r.is_sync(), r.submitter)
        };

        if !sync {
            // a submitter we are idling for went async: stop waiting
            if self.active_binding == Some(submitter) && self.cancel_idle_slice(ctx) {
                self.slice_expired(ctx, false);
                self.schedule_dispatch(ctx);
            }
            return;
        }

        self.update_submitter(ctx, id, rq);

        if self.active == Some(id) {
            if self.q(id).flags.contains(QueueFlags::WAIT_REQUEST) {
                self.q_mut(id).flags.insert(QueueFlags::MUST_DISPATCH);
                self.cancel_idle_slice(ctx);
                ctx.schedule_dispatch();
            }
        } else if self.should_preempt(ctx.arena, id, rq) {
            self.preempt_queue(ctx, id);
            self.q_mut(id).flags.insert(QueueFlags::MUST_DISPATCH);
            ctx.schedule_dispatch();
        }
    }
}

// =============================================================================
// ELEVATOR OPS
// =============================================================================

impl ElevatorOps for Cfq {
    fn name(&self) -> &'static str {
        "cfq"
    }

    fn merge(&mut self, ctx: &mut ElvCtx<'_>, bio: &Bio) -> Option<RequestHandle> {
        let id = self.queue_for_bio(bio)?;
        find_front_merge(&self.q(id).stream.sort, ctx.arena, ctx.limits(), bio)
    }

    fn allow_merge(&self, arena: &RequestArena, rq: RequestHandle, bio: &Bio) -> bool {
        let rq = arena.rq(rq);
        if bio.is_sync() && !rq.is_sync() {
            return false;
        }
        rq.stream.is_some() && self.queue_for_bio(bio) == rq.stream
    }

    fn merged(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle, kind: MergeType) {
        if kind == MergeType::Front {
            let id = Self::stream_of(ctx.arena, rq);
            self.q_mut(id).stream.sort.remove(ctx.arena, rq);
            self.add_rq_rb(ctx, id, rq);
        }
    }

    fn merge_requests(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle, next: RequestHandle) {
        let id = Self::stream_of(ctx.arena, next);
        let next_fifo = ctx.arena.rq(next).fifo_time;
        if next_fifo < ctx.arena.rq(rq).fifo_time && Self::stream_of(ctx.arena, rq) == id {
            self.q_mut(id).stream.fifo.take_position(ctx.arena, rq, next);
            ctx.arena.rq_mut(rq).fifo_time = next_fifo;
        }
        self.remove_request(ctx, id, next);
    }

    fn add_request(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle) {
        let id = Self::stream_of(ctx.arena, rq);
        self.add_rq_rb(ctx, id, rq);
        let expires = ctx.now() + self.q(id).fifo_expire(&self.tunables);
        ctx.arena.rq_mut(rq).fifo_time = expires;
        self.q_mut(id).stream.fifo.push_back(ctx.arena, rq);
        self.rq_enqueued(ctx, id, rq);
    }

    fn dispatch(&mut self, ctx: &mut ElvCtx<'_>, force: bool) -> usize {
        if self.busy_queues == 0 {
            return 0;
        }
        if force {
            return self.forced_dispatch(ctx);
        }
        let Some(id) = self.select_queue(ctx) else {
            return 0;
        };
        self.q_mut(id)
            .flags
            .remove(QueueFlags::MUST_DISPATCH | QueueFlags::WAIT_REQUEST);
        self.cancel_idle_slice(ctx);

        let max = if self.q(id).is_idle_class() {
            1
        } else {
            self.tunables.quantum as usize
        };
        self.dispatch_from(ctx, id, max)
    }

    fn activate(&mut self, _ctx: &mut ElvCtx<'_>, _rq: RequestHandle) {
        self.rq_in_driver += 1;
    }

    fn deactivate(&mut self, _ctx: &mut ElvCtx<'_>, _rq: RequestHandle) {
        self.rq_in_driver = self.rq_in_driver.saturating_sub(1);
    }

    fn completed(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle) {
        let now = ctx.now();
        let (id, sync, submitter) = {
            let r = ctx.arena.rq(rq);
            let Some(id) = r.stream else {
                return;
            };
            (id, r.is_sync(), r.submitter)
        };

        if self.rq_in_driver == 0 {
            log::warn!("cfq: completion with nothing in the driver");
        }
        self.rq_in_driver = self.rq_in_driver.saturating_sub(1);

        let active = self.active == Some(id);
        let q = self.q_mut(id);
        q.on_dispatch[sync as usize] = q.on_dispatch[sync as usize].saturating_sub(1);
        if !q.is_idle_class() {
            self.last_end_request = now;
        }
        let q = self.q_mut(id);
        if q.dispatched() == 0 && q.on_rr() && !active {
            q.service_last = now;
            self.resort_rr_list(id, false);
        }

        if sync {
            if let Some(binding) = self.bindings.get_mut(&submitter) {
                binding.last_end_request = now;
            }
        }

        if active {
            let q = self.q(id);
            if q.slice_end != 0 && now > q.slice_end {
                self.slice_expired(ctx, false);
                self.schedule_dispatch(ctx);
            } else if sync && q.stream.is_empty() && !self.arm_slice_timer(ctx, id) {
                self.schedule_dispatch(ctx);
            }
        }
    }

    fn former_request(&self, arena: &RequestArena, rq: RequestHandle) -> Option<RequestHandle> {
        let id = arena.rq(rq).stream?;
        self.queues.get(&id)?.stream.sort.prev(arena, rq)
    }

    fn latter_request(&self, arena: &RequestArena, rq: RequestHandle) -> Option<RequestHandle> {
        let id = arena.rq(rq).stream?;
        self.queues.get(&id)?.stream.sort.next(arena, rq)
    }

    fn set_request(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle) -> IoSchedResult<()> {
        let now = ctx.now();
        let (submitter, sync, prio, ioc, dir) = {
            let r = ctx.arena.rq(rq);
            (r.submitter, r.is_sync(), r.prio, r.ioc.clone(), r.dir.index())
        };

        match self.bindings.get_mut(&submitter) {
            Some(binding) => {
                if let Some(ioc) = ioc {
                    if !Arc::ptr_eq(&binding.ioc, &ioc) {
                        binding.ioc = ioc;
                    }
                }
                if binding.prio != prio {
                    self.change_priority(ctx, submitter, prio);
                }
            }
            None => {
                let ioc = ioc.unwrap_or_else(|| ctx.io_context(submitter));
                self.bindings.insert(submitter, Binding::new(ioc, prio, now));
            }
        }

        let is_sync_queue = sync && submitter != ASYNC_SUBMITTER;
        let slot = is_sync_queue as usize;
        let existing = self.bindings.get(&submitter).and_then(|b| b.queues[slot]);
        let id = match existing {
            Some(id) => id,
            None => {
                let id = if is_sync_queue {
                    self.alloc_queue(submitter, prio)
                } else {
                    self.async_queue(prio)
                };
                self.bind_queue(submitter, slot, id);
                id
            }
        };

        let q = self.q_mut(id);
        q.refs += 1;
        q.allocated[dir] += 1;
        ctx.arena.rq_mut(rq).stream = Some(id);
        Ok(())
    }

    fn put_request(&mut self, ctx: &mut ElvCtx<'_>, rq: RequestHandle) {
        let (stream, dir) = {
            let r = ctx.arena.rq_mut(rq);
            (r.stream.take(), r.dir.index())
        };
        let Some(id) = stream else {
            return;
        };
        let q = self.q_mut(id);
        crate::bug_on!(q.allocated[dir] == 0, InvariantViolation::CountMismatch);
        q.allocated[dir] -= 1;
        self.put_queue(ctx, id);
    }

    fn timer_expired(&mut self, ctx: &mut ElvCtx<'_>, kind: TimerKind) {
        let now = ctx.now();
        match kind {
            TimerKind::IdleSlice => {
                if !self.idle_slice_armed {
                    return;
                }
                self.idle_slice_armed = false;
                if let Some(id) = self.active {
                    let q = self.q(id);
                    let expired = q.slice_end != 0 && now > q.slice_end;
                    if !expired {
                        // nobody else wants the disk, keep waiting
                        if self.busy_queues == 0 {
                            return;
                        }
                        if !q.stream.is_empty() {
                            self.q_mut(id).flags.insert(QueueFlags::MUST_DISPATCH);
                            self.schedule_dispatch(ctx);
                            return;
                        }
                    }
                }
                self.slice_expired(ctx, false);
                self.schedule_dispatch(ctx);
            }
            TimerKind::IdleClass => {
                if !self.idle_class_armed {
                    return;
                }
                self.idle_class_armed = false;
                let end = self.last_end_request + CFQ_IDLE_GRACE;
                if now < end {
                    self.arm_idle_class(ctx, end);
                } else {
                    self.schedule_dispatch(ctx);
                }
            }
        }
    }

    fn exit_submitter(&mut self, ctx: &mut ElvCtx<'_>, submitter: SubmitterId) {
        let Some(binding) = self.bindings.remove(&submitter) else {
            return;
        };
        if self.active_binding == Some(submitter) {
            self.active_binding = None;
        }
        for id in binding.queues.into_iter().flatten() {
            if self.active == Some(id) {
                self.slice_expired(ctx, false);
                self.schedule_dispatch(ctx);
            }
            self.put_queue(ctx, id);
        }
        log::debug!("cfq: submitter {} unbound", submitter);
    }

    fn queued(&self) -> usize {
        self.queues.values().map(|q| q.stream.len()).sum()
    }

    fn exit(&mut self, ctx: &mut ElvCtx<'_>) {
        self.slice_expired(ctx, false);
        self.cancel_idle_slice(ctx);
        if self.idle_class_armed {
            self.idle_class_armed = false;
            ctx.cancel_timer(TimerKind::IdleClass);
        }
        for q in self.queues.values() {
            crate::bug_on!(!q.stream.is_empty(), InvariantViolation::TeardownNotEmpty);
        }
        self.bindings.clear();
        self.async_queues.clear();
        self.queues.clear();
        self.busy_queues = 0;
    }

    fn tunable_defs(&self) -> &'static [TunableDef] {
        CfqTunables::DEFS
    }

    fn tunable(&self, name: &str) -> IoSchedResult<u64> {
        self.tunables.get(name)
    }

    fn set_tunable(&mut self, name: &str, input: &str) -> IoSchedResult<u64> {
        let value = self.tunables.store_str(name, input)?;
        log::debug!("cfq: {} = {}", name, value);
        Ok(value)
    }

    fn check_invariants(&self, arena: &RequestArena) -> Result<(), InvariantViolation> {
        let mut on_rr = 0;
        for (&id, q) in &self.queues {
            q.stream.check_invariants(arena)?;
            for rq in q.stream.sort.iter() {
                ensure(arena.rq(rq).stream == Some(id), InvariantViolation::IndexMismatch)?;
            }
            ensure(q.on_rr() == !q.stream.is_empty(), InvariantViolation::RingMembership)?;
            if let Some(ring) = q.ring {
                let hits = self.rings.iter(ring).filter(|&other| other == id).count();
                ensure(hits == 1, InvariantViolation::RingMembership)?;
                on_rr += 1;
            }

            let bound = self
                .bindings
                .values()
                .flat_map(|b| b.queues.iter())
                .filter(|slot| **slot == Some(id))
                .count() as u32;
            ensure(
                q.refs == bound + q.allocated[0] + q.allocated[1],
                InvariantViolation::CountMismatch,
            )?;
        }
        ensure(on_rr == self.busy_queues, InvariantViolation::CountMismatch)?;
        ensure(self.rings.len() == on_rr, InvariantViolation::RingMembership)?;
        if let Some(active) = self.active {
            ensure(self.queues.contains_key(&active), InvariantViolation::MissingReference)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::IoContext;
    use crate::testing::{TestQueue, TimerEvent};

    fn cfq_queue() -> TestQueue {
        TestQueue::new(QueueConfig::with_elevator("cfq"))
    }

    #[test]
    fn test_sync_arrival_preempts_async_slice() {
        let t = cfq_queue();
        for i in 0..10 {
            t.queue.submit(Bio::write(1, i * 100, 8).with_submitter(5)).unwrap();
        }
        for expected in [0, 100, 200, 300] {
            assert_eq!(t.next_sector(), Some(expected));
        }

        t.clock.set(5);
        t.queue.submit(Bio::read(1, 50_000, 8).with_submitter(7)).unwrap();
        t.queue.check_invariants().unwrap();
        assert_eq!(t.next_sector(), Some(50_000));

        // the preempted async queue resumes where it left off
        assert_eq!(t.drain_sectors(), [400, 500, 600, 700, 800, 900]);
        t.queue.check_invariants().unwrap();
    }

    #[test]
    fn test_idle_window_armed_and_cancelled() {
        let t = cfq_queue();
        t.queue.submit(Bio::read(1, 0, 8).with_submitter(3)).unwrap();
        assert_eq!(t.next_sector(), Some(0));
        assert_eq!(t.device.pending_timer(TimerKind::IdleSlice), Some(8));
        assert!(t.queue.next_request().is_none());

        t.clock.set(3);
        t.queue.submit(Bio::read(1, 8, 8).with_submitter(3)).unwrap();
        assert_eq!(t.device.pending_timer(TimerKind::IdleSlice), None);
        assert!(t
            .device
            .timer_events()
            .contains(&TimerEvent::Cancelled(TimerKind::IdleSlice)));
        assert_eq!(t.next_sector(), Some(8));
    }

    #[test]
    fn test_slice_idle_zero_disables_idling() {
        let t = cfq_queue();
        assert_eq!(t.queue.set_tunable("slice_idle", "0"), Ok(0));
        t.queue.submit(Bio::read(1, 0, 8).with_submitter(3)).unwrap();
        assert_eq!(t.next_sector(), Some(0));
        assert_eq!(t.device.pending_timer(TimerKind::IdleSlice), None);
    }

    #[test]
    fn test_idle_class_waits_for_grace() {
        let t = cfq_queue();
        let bio = Bio::read(1, 0, 8)
            .with_submitter(9)
            .with_priority(IoPriority::idle());
        t.queue.submit(bio).unwrap();

        assert!(t.queue.next_request().is_none());
        assert_eq!(t.device.pending_timer(TimerKind::IdleClass), Some(CFQ_IDLE_GRACE));

        let kicks = t.device.kicks();
        assert_eq!(t.fire_next_timer(), Some(TimerKind::IdleClass));
        assert!(t.device.kicks() > kicks);
        assert_eq!(t.next_sector(), Some(0));
    }

    #[test]
    fn test_round_robin_between_equal_submitters() {
        let t = cfq_queue();
        for submitter in 1..=3u32 {
            for i in 0..8 {
                let sector = submitter as u64 * 1_000_000 + i * 1000;
                t.queue.submit(Bio::read(1, sector, 8).with_submitter(submitter)).unwrap();
            }
        }

        let mut order = Vec::new();
        loop {
            if let Some(rq) = t.queue.next_request() {
                order.push(t.queue.with_request(rq, |r| r.submitter).unwrap());
                t.queue.dequeue(rq).unwrap();
                t.queue.end_request(rq).unwrap();
                t.clock.advance(30);
            } else if t.fire_next_timer().is_none() {
                break;
            }
        }
        assert_eq!(order.len(), 24);
        order.dedup();
        assert_eq!(order, [1, 2, 3, 1, 2, 3]);
        t.queue.check_invariants().unwrap();
    }

    #[test]
    fn test_no_merge_across_submitters() {
        let t = cfq_queue();
        t.queue.submit(Bio::read(1, 0, 8).with_submitter(1)).unwrap();
        t.queue.submit(Bio::read(1, 8, 8).with_submitter(2)).unwrap();
        assert_eq!(t.queue.stats().pending, 2);
        t.queue.submit(Bio::read(1, 16, 8).with_submitter(2)).unwrap();
        assert_eq!(t.queue.stats().pending, 2);

        // sync I/O never joins an async descriptor
        t.queue.submit(Bio::write(1, 100, 8)).unwrap();
        t.queue.submit(Bio::write(1, 108, 8).sync().with_submitter(1)).unwrap();
        assert_eq!(t.queue.stats().pending, 4);
        t.queue.check_invariants().unwrap();
    }

    #[test]
    fn test_priority_change_refiles_queue() {
        let t = cfq_queue();
        t.queue.submit(Bio::read(1, 0, 8).with_submitter(8)).unwrap();
        let ioc = IoContext::new(4);
        t.queue.submit(Bio::read(1, 5000, 8).with_context(ioc.clone())).unwrap();

        ioc.set_priority(IoPriority::realtime(0));
        t.queue.submit(Bio::read(1, 9000, 8).with_context(ioc)).unwrap();
        t.queue.check_invariants().unwrap();

        assert_eq!(t.next_sector(), Some(5000));
        assert_eq!(t.next_sector(), Some(9000));
        assert_eq!(t.drain_sectors(), [0]);
    }

    #[test]
    fn test_history_shared_across_devices() {
        let first = cfq_queue();
        let second = first.second_device(2, QueueConfig::with_elevator("cfq"));

        first.queue.submit(Bio::read(1, 0, 8).with_submitter(12)).unwrap();
        let ioc = first.contexts.lookup(12).unwrap();
        assert_eq!(ioc.history().seek_samples, 32);

        second.queue.submit(Bio::read(2, 5000, 8).with_submitter(12)).unwrap();
        assert!(Arc::ptr_eq(&ioc, &second.contexts.lookup(12).unwrap()));
        assert_eq!(ioc.history().seek_samples, 60);
        assert_eq!(ioc.history().ttime_samples, 60);
    }

    #[test]
    fn test_exit_submitter_releases_queue() {
        let t = cfq_queue();
        t.queue.submit(Bio::read(1, 0, 8).with_submitter(6)).unwrap();
        assert_eq!(t.next_sector(), Some(0));
        assert!(t.device.pending_timer(TimerKind::IdleSlice).is_some());

        t.queue.exit_submitter(6);
        assert_eq!(t.device.pending_timer(TimerKind::IdleSlice), None);
        t.queue.check_invariants().unwrap();

        t.queue.submit(Bio::read(1, 64, 8).with_submitter(6)).unwrap();
        assert_eq!(t.drain_sectors(), [64]);
    }

    #[test]
    fn test_forced_dispatch_drains_every_ring() {
        let t = cfq_queue();
        for submitter in 1..=3u32 {
            t.queue
                .submit(Bio::read(1, submitter as u64 * 4096, 8).with_submitter(submitter))
                .unwrap();
        }
        t.queue.submit(Bio::write(1, 100_000, 8)).unwrap();
        let idle = Bio::read(1, 200_000, 8)
            .with_submitter(11)
            .with_priority(IoPriority::idle());
        t.queue.submit(idle).unwrap();

        assert_eq!(t.queue.dispatch(true), 5);
        let stats = t.queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.dispatch_list, 5);
        t.queue.check_invariants().unwrap();
        assert_eq!(t.drain_sectors().len(), 5);
    }

    #[test]
    fn test_tunables_clamped() {
        let t = cfq_queue();
        assert_eq!(t.queue.set_tunable("quantum", "0"), Ok(1));
        assert_eq!(t.queue.set_tunable("slice_sync", "250"), Ok(250));
        assert_eq!(t.queue.tunable("slice_sync"), Ok(250));
        assert_eq!(t.queue.tunable("read_expire"), Err(crate::error::IoSchedError::UnknownTunable));
    }
}
