//! The multi-queue scheduler.
//!
//! Four queues, drained in a fixed phase order per pass: Changes commit staged
//! source values and mark subscribers; Updates re-run marked memos and
//! observers; Disposes tear down roots scheduled for teardown. Effects are
//! held back until every eager queue has settled, then run render-effects
//! first and after-effects second, FIFO within each bucket. Writes made during
//! the effects phase start another round of passes.
//!
//! A pass in which new work ran is a tick. An observer's `age` records the
//! tick it was last marked in, which makes re-marks within a tick no-ops.
//!
//! The marking protocol has three kernels. `stale` is a committed change:
//! the node will recompute. `pending` is a maybe: some equality-bearing
//! ancestor upstream recomputes this tick and may or may not change.
//! `stale_pending` is the commit half of the decision - the ancestor really
//! changed, so pending nodes downgrade to stale. The decline half is implicit:
//! a pending mark whose every dep resolved without a commit simply evaporates.

use tracing::{debug, trace};

use crate::arena::{ObserverId, SourceId};
use crate::error::ReactiveError;
use crate::observer::{self, DeferKind, ObserverKind, State};
use crate::runtime::Runtime;
use crate::scope;
use crate::source;
use crate::tasks;

/// Hard cap on scheduler passes inside one `run_queues`.
pub(crate) const RUNAWAY_CAP: u64 = 100_000;

/// Append-only queue whose logical size resets on flush, keeping the backing
/// allocation warm across passes.
pub(crate) struct Queue<T: Copy> {
    items: Vec<T>,
    len: usize,
}

impl<T: Copy> Queue<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, value: T) {
        if self.len < self.items.len() {
            self.items[self.len] = value;
        } else {
            self.items.push(value);
        }
        self.len += 1;
    }

    pub(crate) fn get(&self, index: usize) -> Option<T> {
        if index < self.len {
            Some(self.items[index])
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn reset(&mut self) {
        self.len = 0;
    }

    pub(crate) fn drain_all(&mut self) -> Vec<T> {
        let out = self.items[..self.len].to_vec();
        self.len = 0;
        out
    }
}

// --- marking kernels ------------------------------------------------------

/// Committed change: `id` will recompute this tick.
pub(crate) fn stale(rt: &Runtime, id: ObserverId) {
    let tick = rt.tick.get();
    {
        let mut observers = rt.observers.borrow_mut();
        let Some(slot) = observers.get_mut(id.0) else {
            return;
        };
        if slot.state.contains(State::DISPOSED) {
            return;
        }
        if slot.state.contains(State::STALE) && slot.age == tick {
            return;
        }
        slot.state.insert(State::STALE);
        slot.age = tick;
    }
    trace!(observer = ?id, "marked stale");
    schedule(rt, id);
    prepare_downstream(rt, id, false);
}

/// Maybe-change: an equality-bearing ancestor recomputes this tick.
pub(crate) fn pending(rt: &Runtime, id: ObserverId) {
    let ancestor = rt
        .pending_ancestor
        .get()
        .expect("pending mark outside a maybe scope");
    let tick = rt.tick.get();
    {
        let mut observers = rt.observers.borrow_mut();
        let Some(slot) = observers.get_mut(id.0) else {
            return;
        };
        if slot.state.contains(State::DISPOSED) {
            return;
        }
        slot.state.insert(State::PENDING);
        slot.pending_deps.push(ancestor);
        slot.age = tick;
    }
    trace!(observer = ?id, ?ancestor, "marked pending");
    schedule(rt, id);
    prepare_downstream(rt, id, true);
}

/// Commit a maybe: the ancestor really changed.
pub(crate) fn stale_pending(rt: &Runtime, id: ObserverId) {
    let tick = rt.tick.get();
    let propagate = {
        let mut observers = rt.observers.borrow_mut();
        let Some(slot) = observers.get_mut(id.0) else {
            return;
        };
        if slot.state.contains(State::DISPOSED) {
            return;
        }
        if slot.state.contains(State::PENDING) {
            slot.state.insert(State::STALE);
        }
        if slot.age < tick {
            slot.age = tick;
        }
        // a node without its own equality passes the commit straight through
        slot.equals.is_none()
    };
    if propagate {
        for downstream in downstream_of(rt, id) {
            stale_pending(rt, downstream);
        }
    }
}

fn downstream_of(rt: &Runtime, id: ObserverId) -> smallvec::SmallVec<[ObserverId; 8]> {
    rt.observers
        .borrow()
        .get(id.0)
        .map(|slot| slot.sub.collect())
        .unwrap_or_default()
}

fn owned_of(rt: &Runtime, id: ObserverId) -> Vec<ObserverId> {
    rt.observers
        .borrow()
        .get(id.0)
        .map(|slot| slot.owned.clone())
        .unwrap_or_default()
}

/// The recompute of `id` will hard-dispose this subtree; stop it from doing
/// any further work in the meantime.
fn condemn_recursive(rt: &Runtime, id: ObserverId) {
    observer::modify_state(rt, id, |state| state.insert(State::DISPOSED));
    for child in owned_of(rt, id) {
        condemn_recursive(rt, child);
    }
}

fn mark_pending_disposal_recursive(rt: &Runtime, id: ObserverId) {
    observer::modify_state(rt, id, |state| state.insert(State::PENDING_DISPOSAL));
    for child in owned_of(rt, id) {
        mark_pending_disposal_recursive(rt, child);
    }
}

/// Propagate a mark below `id`: condemn or soft-mark its owned subtree, then
/// mark the observers subscribed to it. Downstream of an equality-bearing
/// node the marks are maybes, issued with that node installed as the pending
/// ancestor.
fn prepare_downstream(rt: &Runtime, id: ObserverId, is_pending: bool) {
    for child in owned_of(rt, id) {
        if is_pending {
            mark_pending_disposal_recursive(rt, child);
        } else {
            condemn_recursive(rt, child);
        }
    }

    let downstream = downstream_of(rt, id);
    if downstream.is_empty() {
        return;
    }
    if observer::has_equality(rt, id) {
        let prev = rt.pending_ancestor.replace(Some(id));
        for d in downstream {
            pending(rt, d);
        }
        rt.pending_ancestor.set(prev);
    } else if is_pending {
        for d in downstream {
            pending(rt, d);
        }
    } else {
        for d in downstream {
            stale(rt, d);
        }
    }
}

/// Enqueue a marked node into the queue its kind runs in. Computeds are
/// lazy and never scheduled; deferred observers go through the task layer.
fn schedule(rt: &Runtime, id: ObserverId) {
    let (kind, defer) = {
        let observers = rt.observers.borrow();
        let Some(slot) = observers.get(id.0) else {
            return;
        };
        (slot.kind, slot.defer)
    };

    if let Some(defer) = defer {
        match defer {
            DeferKind::Asap => {
                rt.asap_observers.borrow_mut().push(id);
                tasks::ensure_asap_dispatch(rt);
            }
            DeferKind::Frame => {
                rt.frame_observers.borrow_mut().push(id);
                tasks::ensure_frame_dispatch(rt);
            }
        }
        return;
    }

    match kind {
        ObserverKind::RenderEffect | ObserverKind::AfterEffect => {
            rt.effects.borrow_mut().push(id)
        }
        ObserverKind::Memo | ObserverKind::Observer => rt.updates.borrow_mut().push(id),
        ObserverKind::Computed | ObserverKind::Root | ObserverKind::RemountableRoot => {}
    }
}

// --- the drain ------------------------------------------------------------

fn has_eager_work(rt: &Runtime) -> bool {
    rt.changes.borrow().len() > 0
        || rt.updates.borrow().len() > 0
        || rt.disposes.borrow().len() > 0
}

fn drain_changes(rt: &Runtime) {
    let mut i = 0;
    loop {
        let entry = rt.changes.borrow().get(i);
        let Some(id) = entry else { break };
        i += 1;
        if let Some(subscribers) = source::commit_source(rt, id) {
            for observer in subscribers {
                stale(rt, observer);
            }
        }
    }
    rt.changes.borrow_mut().reset();
}

fn drain_updates(rt: &Runtime) {
    let mut i = 0;
    loop {
        let entry = rt.updates.borrow().get(i);
        let Some(id) = entry else { break };
        i += 1;
        observer::update(rt, id);
    }
    rt.updates.borrow_mut().reset();
}

fn drain_disposes(rt: &Runtime) {
    let mut i = 0;
    loop {
        let entry = rt.disposes.borrow().get(i);
        let Some(id) = entry else { break };
        i += 1;
        scope::dispose_observer(rt, id);
    }
    rt.disposes.borrow_mut().reset();
}

fn run_effect_batch(rt: &Runtime, batch: &[ObserverId]) {
    // render effects flush before any after-effect, FIFO inside each bucket
    for &id in batch {
        if observer::observer_kind(rt, id) == Some(ObserverKind::RenderEffect) {
            observer::update(rt, id);
        }
    }
    for &id in batch {
        if observer::observer_kind(rt, id) == Some(ObserverKind::AfterEffect) {
            observer::update(rt, id);
        }
    }
}

/// Drain every queue to empty. No-op when already running or batching; the
/// outermost caller picks the work up.
pub(crate) fn run_queues(rt: &Runtime) {
    if rt.running.get() || rt.batch_depth.get() > 0 {
        return;
    }
    rt.running.set(true);
    debug!("scheduler pass starting");

    let mut deferred_effects: Vec<ObserverId> = Vec::new();
    let mut passes: u64 = 0;

    loop {
        while has_eager_work(rt) {
            passes += 1;
            if passes > 1 {
                rt.tick.set(rt.tick.get() + 1);
            }
            if passes > RUNAWAY_CAP {
                rt.changes.borrow_mut().reset();
                rt.updates.borrow_mut().reset();
                rt.disposes.borrow_mut().reset();
                rt.effects.borrow_mut().reset();
                rt.running.set(false);
                scope::route_error(rt, rt.owner.get(), &ReactiveError::RunawayClock(RUNAWAY_CAP));
                return;
            }
            drain_changes(rt);
            drain_updates(rt);
            drain_disposes(rt);
            if rt.effects.borrow().len() > 0 && has_eager_work(rt) {
                // effects are not interleaved with eager updates; park them
                deferred_effects.extend(rt.effects.borrow_mut().drain_all());
            }
        }

        let mut batch = std::mem::take(&mut deferred_effects);
        batch.extend(rt.effects.borrow_mut().drain_all());
        if batch.is_empty() {
            break;
        }
        // effect rounds count against the same cap as eager passes
        passes += 1;
        if passes > RUNAWAY_CAP {
            rt.effects.borrow_mut().reset();
            rt.running.set(false);
            scope::route_error(rt, rt.owner.get(), &ReactiveError::RunawayClock(RUNAWAY_CAP));
            return;
        }
        run_effect_batch(rt, &batch);

        // effect-phase writes start another round; the pass loop advances the
        // tick as it picks the work up
        if !has_eager_work(rt) && rt.effects.borrow().len() == 0 {
            break;
        }
    }

    rt.running.set(false);
    debug_assert!(!has_eager_work(rt) && rt.effects.borrow().len() == 0);
    debug!("scheduler pass settled");
}

/// Current scheduler tick. Mostly interesting to tests.
pub fn current_tick() -> u64 {
    crate::runtime::with_runtime(|rt| rt.tick.get())
}
