//! Observer nodes: memos, computeds, effects and roots.
//!
//! One record serves every kind. A memo is an eager computation exposing a
//! cached value; a computed is the same but lazy; an observer is an eager
//! computation in the update phase with no downstream; render- and
//! after-effects run in the late effects phase; roots carry no computation and
//! exist purely as owners.
//!
//! The state word drives the marking protocol. A node marked `STALE` will
//! recompute. A node marked `PENDING` has an equality-bearing ancestor that
//! *might* change; it records one pending dep per such mark and recomputes
//! only if at least one ancestor commits. `PENDING_DISPOSAL` means the node's
//! owner might recompute and take it down; the owner's decision resolves it
//! either way.

use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

use crate::arena::{ObserverId, SourceId};
use crate::error::ReactiveError;
use crate::runtime::{with_runtime, Runtime};
use crate::scheduler;
use crate::scope::{self, Disposer};
use crate::source::{Equality, ErasedEquals};
use crate::subscription::{connect, disconnect_all, SourceRef, Subscription};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct State: u8 {
        const STALE = 1;
        const PENDING = 2;
        const PENDING_DISPOSAL = 4;
        const RUNNING = 8;
        const DISPOSED = 16;

        /// Anything that makes a cached value untrustworthy until resolved.
        const LIFTABLE =
            Self::STALE.bits() | Self::PENDING.bits() | Self::PENDING_DISPOSAL.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserverKind {
    Memo,
    Observer,
    RenderEffect,
    AfterEffect,
    Computed,
    Root,
    RemountableRoot,
}

impl ObserverKind {
    pub(crate) fn is_root(self) -> bool {
        matches!(self, ObserverKind::Root | ObserverKind::RemountableRoot)
    }
}

/// Which task queue a deferred observer re-runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferKind {
    Asap,
    Frame,
}

/// The computation. `None` result means the run was abandoned (suspension or
/// a routed error); the node keeps its previous value.
pub(crate) type ComputeFn = Rc<dyn Fn(Option<Rc<dyn Any>>) -> Option<Rc<dyn Any>>>;

pub(crate) struct ObserverSlot {
    pub(crate) kind: ObserverKind,
    pub(crate) state: State,
    pub(crate) compute: Option<ComputeFn>,
    pub(crate) value: Option<Rc<dyn Any>>,
    pub(crate) equals: ErasedEquals,
    /// Tick this node was last marked in; re-marks within a tick are no-ops.
    pub(crate) age: u64,
    pub(crate) owner: Option<ObserverId>,
    pub(crate) owned: Vec<ObserverId>,
    pub(crate) owned_sources: Vec<SourceId>,
    pub(crate) cleanups: Vec<Box<dyn FnOnce(bool)>>,
    pub(crate) error_handlers: Vec<Rc<dyn Fn(&ReactiveError)>>,
    pub(crate) contexts: FxHashMap<u64, Rc<dyn Any>>,
    pub(crate) source1: Option<SourceRef>,
    pub(crate) source1_slot: i32,
    pub(crate) sources: SmallVec<[SourceRef; 4]>,
    pub(crate) source_slots: SmallVec<[i32; 4]>,
    /// One entry per unresolved "maybe" mark from an equality-bearing
    /// ancestor; the cursor counts how many have resolved.
    pub(crate) pending_deps: Vec<ObserverId>,
    pub(crate) pending_cursor: usize,
    pub(crate) sub: Subscription,
    pub(crate) defer: Option<DeferKind>,
    /// Setup closure of a remountable root, retained across unmounts.
    pub(crate) remount: Option<Rc<dyn Fn(Disposer)>>,
}

impl ObserverSlot {
    pub(crate) fn new(kind: ObserverKind, owner: Option<ObserverId>) -> Self {
        Self {
            kind,
            state: State::empty(),
            compute: None,
            value: None,
            equals: None,
            age: 0,
            owner,
            owned: Vec::new(),
            owned_sources: Vec::new(),
            cleanups: Vec::new(),
            error_handlers: Vec::new(),
            contexts: FxHashMap::default(),
            source1: None,
            source1_slot: -1,
            sources: SmallVec::new(),
            source_slots: SmallVec::new(),
            pending_deps: Vec::new(),
            pending_cursor: 0,
            sub: Subscription::default(),
            defer: None,
            remount: None,
        }
    }
}

// --- small slot accessors -------------------------------------------------

pub(crate) fn observer_state(rt: &Runtime, id: ObserverId) -> Option<State> {
    rt.observers.borrow().get(id.0).map(|slot| slot.state)
}

pub(crate) fn modify_state(rt: &Runtime, id: ObserverId, f: impl FnOnce(&mut State)) {
    if let Some(slot) = rt.observers.borrow_mut().get_mut(id.0) {
        f(&mut slot.state);
    }
}

pub(crate) fn observer_kind(rt: &Runtime, id: ObserverId) -> Option<ObserverKind> {
    rt.observers.borrow().get(id.0).map(|slot| slot.kind)
}

pub(crate) fn owner_of(rt: &Runtime, id: ObserverId) -> Option<ObserverId> {
    rt.observers.borrow().get(id.0).and_then(|slot| slot.owner)
}

pub(crate) fn has_equality(rt: &Runtime, id: ObserverId) -> bool {
    rt.observers
        .borrow()
        .get(id.0)
        .map(|slot| slot.equals.is_some())
        .unwrap_or(false)
}

fn downstream_of(rt: &Runtime, id: ObserverId) -> SmallVec<[ObserverId; 8]> {
    rt.observers
        .borrow()
        .get(id.0)
        .map(|slot| slot.sub.collect())
        .unwrap_or_default()
}

// --- construction ---------------------------------------------------------

pub(crate) struct NodeInit {
    pub kind: ObserverKind,
    pub compute: Option<ComputeFn>,
    pub initial: Option<Rc<dyn Any>>,
    pub equals: ErasedEquals,
    pub defer: Option<DeferKind>,
}

pub(crate) fn create_node(rt: &Runtime, init: NodeInit) -> ObserverId {
    let owner = if init.kind.is_root() {
        rt.owner.get()
    } else {
        Some(scope::ensure_owner(rt))
    };

    let mut slot = ObserverSlot::new(init.kind, owner);
    slot.value = init.initial;
    slot.equals = init.equals;
    slot.defer = init.defer;
    let lazy = init.kind == ObserverKind::Computed;
    if lazy {
        // a computed defers its first run until first read
        slot.state = State::STALE;
    }
    slot.compute = init.compute;
    let has_compute = slot.compute.is_some();
    let kind = slot.kind;

    let id = ObserverId(rt.observers.borrow_mut().insert(slot));
    if let Some(owner) = owner {
        if let Some(owner_slot) = rt.observers.borrow_mut().get_mut(owner.0) {
            owner_slot.owned.push(id);
        }
    }
    trace!(observer = ?id, ?kind, "created");

    if has_compute && !lazy && !kind.is_root() {
        run_observer(rt, id);
    }
    id
}

// --- execution ------------------------------------------------------------

/// Re-run a node's computation: soft-dispose its previous run, collect a fresh
/// dependency set, commit the new value. Returns whether the value changed
/// under the node's equality.
pub(crate) fn run_observer(rt: &Runtime, id: ObserverId) -> bool {
    let (compute, prev_value, equals, cleanups, owned, owned_sources) = {
        let mut observers = rt.observers.borrow_mut();
        let Some(slot) = observers.get_mut(id.0) else {
            return false;
        };
        if slot.state.contains(State::DISPOSED) {
            return false;
        }
        let Some(compute) = slot.compute.clone() else {
            return false;
        };
        (
            compute,
            slot.value.clone(),
            slot.equals.clone(),
            std::mem::take(&mut slot.cleanups),
            std::mem::take(&mut slot.owned),
            std::mem::take(&mut slot.owned_sources),
        )
    };

    // soft disposal of the previous run: own cleanups see final=false, nodes
    // created by the previous run go away for good
    for cleanup in cleanups {
        cleanup(false);
    }
    for child in owned {
        scope::dispose_observer(rt, child);
    }
    for source in owned_sources {
        scope::dispose_source(rt, source);
    }
    disconnect_all(rt, id);

    let prev_listener = rt.listener.replace(Some(id));
    let prev_owner = rt.owner.replace(Some(id));
    let prev_abort = rt.abort_run.replace(false);
    modify_state(rt, id, |state| state.insert(State::RUNNING));

    let result = compute(prev_value.clone());

    modify_state(rt, id, |state| state.remove(State::RUNNING));
    let aborted = rt.abort_run.replace(prev_abort);
    rt.listener.set(prev_listener);
    rt.owner.set(prev_owner);

    match result {
        Some(value) if !aborted => {
            let changed = match (&equals, &prev_value) {
                (Some(eq), Some(prev)) => !eq(&**prev, &*value),
                _ => true,
            };
            if let Some(slot) = rt.observers.borrow_mut().get_mut(id.0) {
                slot.value = Some(value);
            }
            changed
        }
        // abandoned run: the previous committed value stands
        _ => false,
    }
}

fn resolve_stale(rt: &Runtime, id: ObserverId) {
    modify_state(rt, id, |state| state.remove(State::STALE));
    let changed = run_observer(rt, id);
    if changed && has_equality(rt, id) {
        // commit the maybes issued downstream when this node was marked
        for downstream in downstream_of(rt, id) {
            scheduler::stale_pending(rt, downstream);
        }
    }
}

fn clear_pending_disposal(rt: &Runtime, id: ObserverId) {
    let owned: Vec<ObserverId> = rt
        .observers
        .borrow()
        .get(id.0)
        .map(|slot| slot.owned.clone())
        .unwrap_or_default();
    for child in owned {
        modify_state(rt, child, |state| state.remove(State::PENDING_DISPOSAL));
        clear_pending_disposal(rt, child);
    }
}

/// Scheduled entry point: one call consumes one mark.
pub(crate) fn update(rt: &Runtime, id: ObserverId) {
    let Some(state) = observer_state(rt, id) else {
        return;
    };
    if state.contains(State::DISPOSED) {
        return;
    }

    if state.contains(State::PENDING) {
        // drop the dep at the cursor; the last mark standing decides
        let resolved = {
            let mut observers = rt.observers.borrow_mut();
            let Some(slot) = observers.get_mut(id.0) else {
                return;
            };
            slot.pending_cursor += 1;
            slot.pending_cursor >= slot.pending_deps.len()
        };
        if !resolved {
            return;
        }
        // eager ancestors decided earlier in the queue; lazy ones have not
        // run at all and need a push before we can decline
        let ancestors: Vec<ObserverId> = rt
            .observers
            .borrow()
            .get(id.0)
            .map(|slot| slot.pending_deps.clone())
            .unwrap_or_default();
        for ancestor in ancestors {
            update_if_necessary(rt, ancestor);
        }
        {
            let mut observers = rt.observers.borrow_mut();
            if let Some(slot) = observers.get_mut(id.0) {
                slot.state.remove(State::PENDING);
                slot.pending_deps.clear();
                slot.pending_cursor = 0;
            }
        }
        let Some(state) = observer_state(rt, id) else {
            return;
        };
        if !state.contains(State::STALE) {
            // every maybe declined; release anything marked for soft disposal
            modify_state(rt, id, |s| s.remove(State::PENDING_DISPOSAL));
            clear_pending_disposal(rt, id);
            return;
        }
    }

    let Some(state) = observer_state(rt, id) else {
        return;
    };
    if state.contains(State::STALE) {
        if state.contains(State::PENDING_DISPOSAL) {
            // the owner may still take this node down; force its decision
            if let Some(owner) = owner_of(rt, id) {
                update_if_necessary(rt, owner);
            }
            match observer_state(rt, id) {
                Some(state) if !state.contains(State::DISPOSED) => {}
                _ => return,
            }
        }
        resolve_stale(rt, id);
    }
}

/// Lift: make a node's value current right now, resolving pending ancestors
/// first. Used by reads of marked memos/computeds and by the owner-decision
/// path above.
pub(crate) fn update_if_necessary(rt: &Runtime, id: ObserverId) {
    let Some(state) = observer_state(rt, id) else {
        return;
    };
    if state.contains(State::DISPOSED) || !state.intersects(State::LIFTABLE) {
        return;
    }

    if state.contains(State::PENDING) {
        let ancestors: Vec<ObserverId> = {
            let observers = rt.observers.borrow();
            let Some(slot) = observers.get(id.0) else {
                return;
            };
            slot.pending_deps[slot.pending_cursor..].to_vec()
        };
        // resolving an ancestor that really changed turns our PENDING into
        // STALE via stale_pending
        for ancestor in ancestors {
            update_if_necessary(rt, ancestor);
        }
        let mut observers = rt.observers.borrow_mut();
        if let Some(slot) = observers.get_mut(id.0) {
            slot.state.remove(State::PENDING);
            slot.pending_deps.clear();
            slot.pending_cursor = 0;
        }
    }

    let Some(state) = observer_state(rt, id) else {
        return;
    };
    if state.contains(State::DISPOSED) {
        return;
    }
    if state.contains(State::PENDING_DISPOSAL) {
        if let Some(owner) = owner_of(rt, id) {
            update_if_necessary(rt, owner);
        }
        match observer_state(rt, id) {
            Some(state) if !state.contains(State::DISPOSED) => {}
            _ => return,
        }
    }
    let Some(state) = observer_state(rt, id) else {
        return;
    };
    if state.contains(State::STALE) {
        resolve_stale(rt, id);
    }
}

/// Tracked read of a memo/computed value.
pub(crate) fn read_observer(rt: &Runtime, id: ObserverId) -> Option<Rc<dyn Any>> {
    let state = {
        let observers = rt.observers.borrow();
        observers
            .get(id.0)
            .map(|slot| slot.state)
            .expect("read of a disposed memo")
    };

    if state.contains(State::RUNNING) {
        scope::route_error(rt, Some(id), &ReactiveError::CircularDependency);
        rt.abort_run.set(true);
        return rt.observers.borrow().get(id.0).and_then(|s| s.value.clone());
    }

    if state.intersects(State::LIFTABLE) {
        update_if_necessary(rt, id);
    }

    if let Some(listener) = rt.listener.get() {
        if listener != id {
            connect(rt, SourceRef::Observer(id), listener);
        }
    }

    rt.observers.borrow().get(id.0).and_then(|s| s.value.clone())
}

// --- public handles -------------------------------------------------------

fn downcast<T: 'static>(value: &Rc<dyn Any>) -> &T {
    value
        .downcast_ref::<T>()
        .expect("memo value read at the wrong type")
}

/// A cached eager computation.
pub struct Memo<T: 'static> {
    pub(crate) id: ObserverId,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Memo<T> {}

impl<T: 'static> Memo<T> {
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        crate::untrack(|| self.get())
    }

    pub fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        let value = with_runtime(|rt| read_observer(rt, self.id))
            .expect("memo has no value: its first run never completed");
        f(downcast::<T>(&value))
    }
}

impl<T: 'static> std::fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Memo").field(&self.id).finish()
    }
}

/// A cached lazy computation: first run happens at first read.
pub struct Computed<T: 'static> {
    pub(crate) id: ObserverId,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Computed<T> {}

impl<T: 'static> Computed<T> {
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    pub fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        let value = with_runtime(|rt| read_observer(rt, self.id))
            .expect("computed has no value: its first run never completed");
        f(downcast::<T>(&value))
    }
}

fn erased_compute<T: 'static>(f: impl Fn(Option<&T>) -> T + 'static) -> ComputeFn {
    Rc::new(move |prev: Option<Rc<dyn Any>>| {
        let prev_ref = prev.as_ref().and_then(|p| p.downcast_ref::<T>());
        Some(Rc::new(f(prev_ref)) as Rc<dyn Any>)
    })
}

fn erased_compute_mut<T: 'static>(f: impl FnMut(Option<&T>) -> T + 'static) -> ComputeFn {
    let f = std::cell::RefCell::new(f);
    Rc::new(move |prev: Option<Rc<dyn Any>>| {
        let prev_ref = prev.as_ref().and_then(|p| p.downcast_ref::<T>());
        Some(Rc::new((f.borrow_mut())(prev_ref)) as Rc<dyn Any>)
    })
}

/// Create an eager cached computation comparing results by `PartialEq`.
pub fn create_memo<T: PartialEq + 'static>(f: impl Fn() -> T + 'static) -> Memo<T> {
    create_memo_with(move |_| f(), None, Equality::by_value())
}

/// Create an eager cached computation with explicit seed and equality. The
/// closure receives the previous value.
pub fn create_memo_with<T: 'static>(
    f: impl Fn(Option<&T>) -> T + 'static,
    initial: Option<T>,
    equality: Equality<T>,
) -> Memo<T> {
    let id = with_runtime(|rt| {
        create_node(
            rt,
            NodeInit {
                kind: ObserverKind::Memo,
                compute: Some(erased_compute(f)),
                initial: initial.map(|v| Rc::new(v) as Rc<dyn Any>),
                equals: equality.erase(),
                defer: None,
            },
        )
    });
    Memo {
        id,
        _marker: PhantomData,
    }
}

/// Create a lazy cached computation comparing results by `PartialEq`.
pub fn create_computed<T: PartialEq + 'static>(f: impl Fn() -> T + 'static) -> Computed<T> {
    create_computed_with(move |_| f(), None, Equality::by_value())
}

pub fn create_computed_with<T: 'static>(
    f: impl Fn(Option<&T>) -> T + 'static,
    initial: Option<T>,
    equality: Equality<T>,
) -> Computed<T> {
    let id = with_runtime(|rt| {
        create_node(
            rt,
            NodeInit {
                kind: ObserverKind::Computed,
                compute: Some(erased_compute(f)),
                initial: initial.map(|v| Rc::new(v) as Rc<dyn Any>),
                equals: equality.erase(),
                defer: None,
            },
        )
    });
    Computed {
        id,
        _marker: PhantomData,
    }
}

pub(crate) fn create_reaction(
    kind: ObserverKind,
    defer: Option<DeferKind>,
    f: impl FnMut() + 'static,
) {
    let mut f = f;
    let compute = erased_compute_mut(move |_: Option<&()>| f());
    with_runtime(|rt| {
        create_node(
            rt,
            NodeInit {
                kind,
                compute: Some(compute),
                initial: None,
                equals: None,
                defer,
            },
        )
    });
}

/// An eager reaction: runs once now, re-runs in the update phase whenever a
/// dependency changes.
pub fn create_observer(f: impl FnMut() + 'static) {
    create_reaction(ObserverKind::Observer, None, f);
}

/// An effect that runs in the effects phase, before all after-effects.
pub fn create_render_effect(f: impl FnMut() + 'static) {
    create_reaction(ObserverKind::RenderEffect, None, f);
}

/// An effect that runs in the effects phase, after all render effects.
pub fn create_after_effect(f: impl FnMut() + 'static) {
    create_reaction(ObserverKind::AfterEffect, None, f);
}

/// Run `f` without collecting dependencies.
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    with_runtime(|rt| {
        let prev = rt.listener.replace(None);
        let out = f();
        rt.listener.set(prev);
        out
    })
}

/// Whether a tracking context is active.
pub fn is_tracking() -> bool {
    with_runtime(|rt| rt.listener.get().is_some())
}

/// Collect every write inside `f` into a single scheduler flush.
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    with_runtime(|rt| {
        rt.batch_depth.set(rt.batch_depth.get() + 1);
        let out = f();
        rt.batch_depth.set(rt.batch_depth.get() - 1);
        if rt.batch_depth.get() == 0 && !rt.running.get() {
            scheduler::run_queues(rt);
        }
        out
    })
}
