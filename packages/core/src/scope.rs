//! The owner tree: scopes, roots, cleanups, contexts and error routing.
//!
//! Every reactive node is created under an owner. Disposing an owner takes its
//! whole subtree with it, depth-first post-order, firing each node's cleanups
//! with `final = true`. A computation that re-runs performs the soft version
//! on itself first: its own cleanups fire with `final = false` and everything
//! it created last run is disposed for good.
//!
//! Context values live on owners and are found by walking the owner chain.
//! Error handlers ride the same chain: an error raised in a computation
//! unwinds owner by owner until a handler takes it, and panics out of the
//! runtime if none does.

use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{trace, warn};

use crate::arena::{ObserverId, SourceId};
use crate::error::ReactiveError;
use crate::observer::{ObserverKind, ObserverSlot, State};
use crate::runtime::{with_runtime, Runtime};
use crate::scheduler;
use crate::subscription::disconnect_all;

// --- owners ---------------------------------------------------------------

/// Handle to an owner scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub(crate) id: ObserverId,
}

impl Owner {
    pub fn is_disposed(&self) -> bool {
        with_runtime(|rt| !rt.observers.borrow().contains(self.id.0))
    }
}

/// Disposes a root created with [`create_root`] and friends.
#[derive(Debug, Clone)]
pub struct Disposer {
    pub(crate) id: ObserverId,
}

impl Disposer {
    pub fn dispose(&self) {
        with_runtime(|rt| {
            if rt.unowned_root.get() == Some(self.id) {
                route_error(rt, rt.owner.get(), &ReactiveError::DisposedUnowned);
                return;
            }
            rt.disposes.borrow_mut().push(self.id);
            if !rt.running.get() && rt.batch_depth.get() == 0 {
                scheduler::run_queues(rt);
            }
        });
    }
}

/// The owner new nodes currently attach to.
pub fn current_owner() -> Option<Owner> {
    with_runtime(|rt| rt.owner.get().map(|id| Owner { id }))
}

/// Current owner, or the implicit unowned root when nothing is in scope.
pub(crate) fn ensure_owner(rt: &Runtime) -> ObserverId {
    if let Some(owner) = rt.owner.get() {
        return owner;
    }
    if let Some(root) = rt.unowned_root.get() {
        if rt.observers.borrow().contains(root.0) {
            return root;
        }
    }
    let id = ObserverId(
        rt.observers
            .borrow_mut()
            .insert(ObserverSlot::new(ObserverKind::Root, None)),
    );
    rt.unowned_root.set(Some(id));
    trace!(root = ?id, "created unowned root");
    id
}

/// Run `f` with `owner` as both owner and (cleared) tracking context.
pub(crate) fn with_owner_untracked<T>(
    rt: &Runtime,
    owner: Option<ObserverId>,
    f: impl FnOnce() -> T,
) -> T {
    let prev_owner = rt.owner.replace(owner);
    let prev_listener = rt.listener.replace(None);
    let out = f();
    rt.listener.set(prev_listener);
    rt.owner.set(prev_owner);
    out
}

// --- disposal -------------------------------------------------------------

/// Tear a node down for good: owned subtree first, then own cleanups with
/// `final = true`, then unlink and free the slot.
pub(crate) fn dispose_observer(rt: &Runtime, id: ObserverId) {
    let parts = {
        let mut observers = rt.observers.borrow_mut();
        let Some(slot) = observers.get_mut(id.0) else {
            return;
        };
        slot.state.insert(State::DISPOSED);
        slot.compute = None;
        (
            std::mem::take(&mut slot.owned),
            std::mem::take(&mut slot.owned_sources),
            std::mem::take(&mut slot.cleanups),
            slot.owner,
        )
    };
    let (owned, owned_sources, cleanups, owner) = parts;

    for child in owned {
        dispose_observer(rt, child);
    }
    for source in owned_sources {
        dispose_source(rt, source);
    }
    for cleanup in cleanups {
        cleanup(true);
    }
    disconnect_all(rt, id);

    if let Some(owner) = owner {
        if let Some(owner_slot) = rt.observers.borrow_mut().get_mut(owner.0) {
            owner_slot.owned.retain(|c| *c != id);
        }
    }
    rt.observers.borrow_mut().remove(id.0);
    trace!(observer = ?id, "disposed");
}

pub(crate) fn dispose_source(rt: &Runtime, id: SourceId) {
    rt.sources.borrow_mut().remove(id.0);
}

// --- cleanups, error handlers ---------------------------------------------

/// Register a cleanup on the current owner. It runs exactly once: with
/// `final = false` right before the owning computation re-runs, or with
/// `final = true` when the owner is disposed.
pub fn on_cleanup(f: impl FnOnce(bool) + 'static) {
    with_runtime(|rt| {
        let owner = ensure_owner(rt);
        if let Some(slot) = rt.observers.borrow_mut().get_mut(owner.0) {
            slot.cleanups.push(Box::new(f));
        }
    });
}

/// Install an error handler on the current owner. Errors raised by nested
/// computations route to the nearest handler up the owner chain.
pub fn on_error(f: impl Fn(&ReactiveError) + 'static) {
    with_runtime(|rt| {
        let owner = ensure_owner(rt);
        if let Some(slot) = rt.observers.borrow_mut().get_mut(owner.0) {
            slot.error_handlers.push(Rc::new(f));
        }
    });
}

/// Run `f` once after the current computation's results reach the effects
/// phase, without tracking anything it reads.
pub fn on_mount(f: impl FnOnce() + 'static) {
    let mut f = Some(f);
    crate::observer::create_render_effect(move || {
        if let Some(f) = f.take() {
            crate::observer::untrack(f);
        }
    });
}

/// Report a failure from inside a computation or cleanup. Routes to the
/// nearest error handler and abandons the run in flight; the computation's
/// previous committed value stands.
pub fn throw_error(message: impl Into<String>) {
    let error = ReactiveError::Host(message.into());
    with_runtime(|rt| {
        route_error(rt, rt.owner.get(), &error);
        if rt.listener.get().is_some() {
            rt.abort_run.set(true);
        }
    });
}

/// Walk the owner chain looking for handlers; panic at the host boundary if
/// nobody takes the error.
pub(crate) fn route_error(rt: &Runtime, from: Option<ObserverId>, error: &ReactiveError) {
    let mut cursor = from
        .or_else(|| rt.owner.get())
        .or_else(|| rt.unowned_root.get());
    while let Some(id) = cursor {
        let (handlers, owner) = {
            let observers = rt.observers.borrow();
            match observers.get(id.0) {
                Some(slot) => (slot.error_handlers.clone(), slot.owner),
                None => break,
            }
        };
        if !handlers.is_empty() {
            trace!(observer = ?id, %error, "error handled");
            for handler in &handlers {
                handler(error);
            }
            return;
        }
        cursor = owner;
    }
    panic!("unhandled reactive error: {error}");
}

// --- contexts -------------------------------------------------------------

static NEXT_CONTEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// An opaque, typed key into the owner-scoped context store.
pub struct ContextKey<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ContextKey<T> {}

/// Mint a fresh context key. Two keys never collide, even for the same type.
pub fn create_context_key<T>() -> ContextKey<T> {
    ContextKey {
        id: NEXT_CONTEXT_KEY.fetch_add(1, Ordering::Relaxed),
        _marker: PhantomData,
    }
}

pub(crate) fn provide_context_raw(rt: &Runtime, key: u64, value: Rc<dyn Any>) {
    let owner = ensure_owner(rt);
    if let Some(slot) = rt.observers.borrow_mut().get_mut(owner.0) {
        slot.contexts.insert(key, value);
    }
}

pub(crate) fn use_context_raw(rt: &Runtime, key: u64) -> Option<Rc<dyn Any>> {
    let mut cursor = rt.owner.get();
    while let Some(id) = cursor {
        let observers = rt.observers.borrow();
        let slot = observers.get(id.0)?;
        if let Some(value) = slot.contexts.get(&key) {
            return Some(value.clone());
        }
        cursor = slot.owner;
    }
    None
}

/// Store `value` under `key` on the current owner.
pub fn provide_context<T: 'static>(key: ContextKey<T>, value: T) {
    with_runtime(|rt| provide_context_raw(rt, key.id, Rc::new(value)));
}

/// Look `key` up on the current owner and its ancestors.
pub fn use_context<T: 'static>(key: ContextKey<T>) -> Option<Rc<T>> {
    with_runtime(|rt| use_context_raw(rt, key.id))
        .and_then(|value| value.downcast::<T>().ok())
}

// --- roots ----------------------------------------------------------------

fn create_root_node(rt: &Runtime, kind: ObserverKind, owner: Option<ObserverId>) -> ObserverId {
    let id = ObserverId(
        rt.observers
            .borrow_mut()
            .insert(ObserverSlot::new(kind, owner)),
    );
    if let Some(owner) = owner {
        if let Some(owner_slot) = rt.observers.borrow_mut().get_mut(owner.0) {
            owner_slot.owned.push(id);
        }
    }
    id
}

/// Create a root scope and run `f` under it, untracked. The root nests under
/// the current owner if one is in scope, so disposing an app tears its nested
/// roots down too.
pub fn create_root<T>(f: impl FnOnce(Disposer) -> T) -> T {
    with_runtime(|rt| {
        let id = create_root_node(rt, ObserverKind::Root, rt.owner.get());
        with_owner_untracked(rt, Some(id), || f(Disposer { id }))
    })
}

/// Create a child root under an explicit owner; used by the list projections
/// so entries survive re-runs of the projection itself.
pub(crate) fn create_child_root(rt: &Runtime, owner: ObserverId) -> ObserverId {
    create_root_node(rt, ObserverKind::Root, Some(owner))
}

/// Create the top-level scope of an application.
///
/// `app_init` runs under the fresh root before `f`, giving the embedding a
/// place to seed app-wide context. `detached_owner` re-parents the root, for
/// embeddings that juggle multiple mounts.
pub fn create_app_root<T>(
    f: impl FnOnce(Disposer) -> T,
    app_init: Option<Box<dyn FnOnce()>>,
    detached_owner: Option<Owner>,
) -> T {
    with_runtime(|rt| {
        let parent = detached_owner.map(|o| o.id).or_else(|| rt.owner.get());
        let id = create_root_node(rt, ObserverKind::Root, parent);
        with_owner_untracked(rt, Some(id), || {
            if let Some(init) = app_init {
                init();
            }
            f(Disposer { id })
        })
    })
}

/// Create a root that can be unmounted and mounted again. The setup closure
/// is retained across unmounts; disposing the root drops it for good.
pub fn create_remountable_root(f: impl Fn(Disposer) + 'static) -> Owner {
    with_runtime(|rt| {
        let id = create_root_node(rt, ObserverKind::RemountableRoot, rt.owner.get());
        let setup: Rc<dyn Fn(Disposer)> = Rc::new(f);
        if let Some(slot) = rt.observers.borrow_mut().get_mut(id.0) {
            slot.remount = Some(setup.clone());
        }
        with_owner_untracked(rt, Some(id), || setup(Disposer { id }));
        Owner { id }
    })
}

/// Soft-unmount a remountable root: cleanups fire with `final = false`, the
/// subtree created by the last mount is disposed, the setup closure survives.
pub fn unmount(owner: &Owner) {
    with_runtime(|rt| {
        let parts = {
            let mut observers = rt.observers.borrow_mut();
            let Some(slot) = observers.get_mut(owner.id.0) else {
                return;
            };
            if slot.kind != ObserverKind::RemountableRoot {
                warn!(owner = ?owner.id, "unmount of a non-remountable owner ignored");
                return;
            }
            (
                std::mem::take(&mut slot.owned),
                std::mem::take(&mut slot.owned_sources),
                std::mem::take(&mut slot.cleanups),
            )
        };
        let (owned, owned_sources, cleanups) = parts;
        for child in owned {
            dispose_observer(rt, child);
        }
        for source in owned_sources {
            dispose_source(rt, source);
        }
        for cleanup in cleanups {
            cleanup(false);
        }
    });
}

/// Run a remountable root's setup closure again.
pub fn remount(owner: &Owner) {
    with_runtime(|rt| {
        let setup = {
            let observers = rt.observers.borrow();
            observers.get(owner.id.0).and_then(|slot| slot.remount.clone())
        };
        match setup {
            Some(setup) => {
                with_owner_untracked(rt, Some(owner.id), || setup(Disposer { id: owner.id }))
            }
            None => warn!(owner = ?owner.id, "remount of a non-remountable owner ignored"),
        }
    });
}
