//! Writable source cells.
//!
//! A signal is a value slot plus a staging slot. Writes never touch the
//! committed value directly: they stage the next value and enqueue the source
//! into the Changes queue, which commits and marks subscribers in the next
//! scheduler pass. Outside a scheduler run a write with subscribers flushes
//! synchronously before returning, so plain imperative code still sees its
//! effects settle immediately.
//!
//! Locks defer propagation: while a source is locked, writes keep staging but
//! subscribers only ever observe the committed value. Unlocking the last lock
//! commits whatever is staged. The task pipeline uses this to make several
//! asynchronous writes land as one change.

use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::trace;

use crate::arena::SourceId;
use crate::runtime::{with_runtime, Runtime};
use crate::scheduler;
use crate::scope::ensure_owner;
use crate::subscription::{connect, SourceRef, Subscription};

/// Type-erased equality predicate. `None` means "never equal": every write
/// propagates.
pub(crate) type ErasedEquals = Option<Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>>;

/// Equality predicate carried by a source, memo or computed.
///
/// There is no "unset" state: a node either has a predicate or is explicitly
/// never-equal, which disables the short-circuit end to end.
pub struct Equality<T>(pub(crate) Option<Rc<dyn Fn(&T, &T) -> bool>>);

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: 'static> Equality<T> {
    /// Every write counts as a change.
    pub fn never() -> Self {
        Self(None)
    }

    pub fn with(f: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self(Some(Rc::new(f)))
    }

    /// Compare by `PartialEq`. This is the default used by the plain
    /// constructors.
    pub fn by_value() -> Self
    where
        T: PartialEq,
    {
        Self::with(|a, b| a == b)
    }

    pub(crate) fn erase(self) -> ErasedEquals {
        self.0.map(|f| {
            Rc::new(move |a: &dyn Any, b: &dyn Any| {
                match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                    (Some(a), Some(b)) => f(a, b),
                    _ => false,
                }
            }) as Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>
        })
    }
}

pub(crate) struct SourceSlot {
    pub(crate) value: Rc<dyn Any>,
    /// Staged next value. `None` means nothing staged; a staged value of any
    /// kind (including a user-level "empty") is `Some`, so the two states
    /// cannot be confused.
    pub(crate) staged: Option<Rc<dyn Any>>,
    /// Present in the Changes queue. Kept as a flag on the slot so duplicate
    /// enqueues and lock-time removal are O(1).
    pub(crate) queued: bool,
    pub(crate) locks: u32,
    pub(crate) equals: ErasedEquals,
    pub(crate) sub: Subscription,
}

pub(crate) fn create_source(rt: &Runtime, value: Rc<dyn Any>, equals: ErasedEquals) -> SourceId {
    let id = SourceId(rt.sources.borrow_mut().insert(SourceSlot {
        value,
        staged: None,
        queued: false,
        locks: 0,
        equals,
        sub: Subscription::default(),
    }));
    let owner = ensure_owner(rt);
    if let Some(slot) = rt.observers.borrow_mut().get_mut(owner.0) {
        slot.owned_sources.push(id);
    }
    id
}

pub(crate) fn read_source(rt: &Runtime, id: SourceId) -> Rc<dyn Any> {
    if let Some(listener) = rt.listener.get() {
        connect(rt, SourceRef::Source(id), listener);
    }
    rt.sources
        .borrow()
        .get(id.0)
        .map(|slot| slot.value.clone())
        .expect("read of a disposed signal")
}

fn enqueue_change(rt: &Runtime, id: SourceId, slot: &mut SourceSlot) {
    if !slot.queued {
        slot.queued = true;
        rt.changes.borrow_mut().push(id);
    }
}

pub(crate) fn write_source(
    rt: &Runtime,
    id: SourceId,
    produce: impl FnOnce(&Rc<dyn Any>) -> Rc<dyn Any>,
) {
    let (base, equals) = {
        let sources = rt.sources.borrow();
        let Some(slot) = sources.get(id.0) else {
            return;
        };
        let base = slot.staged.clone().unwrap_or_else(|| slot.value.clone());
        (base, slot.equals.clone())
    };

    let next = produce(&base);
    if let Some(eq) = &equals {
        if eq(&*base, &*next) {
            return;
        }
    }

    let flush = {
        let mut sources = rt.sources.borrow_mut();
        let Some(slot) = sources.get_mut(id.0) else {
            return;
        };
        slot.staged = Some(next);
        if slot.locks > 0 {
            // staged value sticks around; propagation waits for unlock
            false
        } else if rt.running.get() || rt.batch_depth.get() > 0 {
            enqueue_change(rt, id, slot);
            false
        } else if !slot.sub.is_empty() {
            enqueue_change(rt, id, slot);
            true
        } else {
            // no one is listening; commit in place
            slot.value = slot.staged.take().expect("value staged above");
            false
        }
    };

    if flush {
        scheduler::run_queues(rt);
    }
}

/// Commit the staged value of a queued source. Returns the observers to mark,
/// or `None` if the entry was stale (dequeued by a lock, or already drained).
pub(crate) fn commit_source(
    rt: &Runtime,
    id: SourceId,
) -> Option<smallvec::SmallVec<[crate::arena::ObserverId; 8]>> {
    let mut sources = rt.sources.borrow_mut();
    let slot = sources.get_mut(id.0)?;
    if !slot.queued || slot.locks > 0 {
        return None;
    }
    slot.queued = false;
    let staged = slot.staged.take()?;
    slot.value = staged;
    trace!(source = ?id, "committed staged value");
    Some(slot.sub.collect())
}

pub(crate) fn lock_source(rt: &Runtime, id: SourceId) {
    let mut sources = rt.sources.borrow_mut();
    if let Some(slot) = sources.get_mut(id.0) {
        slot.locks += 1;
        // a queued entry is withdrawn; the staged value stays put
        slot.queued = false;
    }
}

pub(crate) fn unlock_source(rt: &Runtime, id: SourceId) {
    let flush = {
        let mut sources = rt.sources.borrow_mut();
        let Some(slot) = sources.get_mut(id.0) else {
            return;
        };
        debug_assert!(slot.locks > 0, "unbalanced unlock");
        slot.locks = slot.locks.saturating_sub(1);
        if slot.locks == 0 && slot.staged.is_some() {
            enqueue_change(rt, id, slot);
            !rt.running.get() && rt.batch_depth.get() == 0
        } else {
            false
        }
    };
    if flush {
        scheduler::run_queues(rt);
    }
}

fn downcast<T: 'static>(value: &Rc<dyn Any>) -> &T {
    value
        .downcast_ref::<T>()
        .expect("signal value read at the wrong type")
}

/// A writable reactive cell.
///
/// Handles are `Copy` indices into the runtime's source arena; the value
/// itself lives with the runtime and is dropped when the owning scope is
/// disposed. Reading through a handle after that panics, the same way reading
/// a dropped signal does in the frameworks this runtime descends from.
pub struct Signal<T: 'static> {
    pub(crate) id: SourceId,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Signal<T> {}

impl<T: 'static> Signal<T> {
    /// Read the committed value, subscribing the running observer if any.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Read without subscribing, regardless of tracking context.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        crate::untrack(|| self.get())
    }

    /// Run `f` against the committed value, subscribing the running observer.
    pub fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        let value = with_runtime(|rt| read_source(rt, self.id));
        f(downcast::<T>(&value))
    }

    pub fn set(&self, value: T) {
        with_runtime(|rt| write_source(rt, self.id, move |_| Rc::new(value)));
    }

    /// Write computed from the current committed-or-staged value.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        with_runtime(|rt| write_source(rt, self.id, move |base| Rc::new(f(downcast::<T>(base)))));
    }

    /// Split into read and write halves.
    pub fn split(&self) -> (ReadSignal<T>, WriteSignal<T>) {
        (
            ReadSignal {
                id: self.id,
                _marker: PhantomData,
            },
            WriteSignal {
                id: self.id,
                _marker: PhantomData,
            },
        )
    }

    /// Defer propagation of writes until the matching [`unlock`](Self::unlock).
    ///
    /// Locks are counted; any number of writes between lock and unlock
    /// collapse into a single commit.
    pub fn lock(&self) {
        with_runtime(|rt| lock_source(rt, self.id));
    }

    pub fn unlock(&self) {
        with_runtime(|rt| unlock_source(rt, self.id));
    }

    /// Arena handle of this signal, for lock lists in task pipelines.
    pub fn id(&self) -> SourceId {
        self.id
    }
}

impl Signal<bool> {
    pub fn toggle(&self) {
        self.update(|v| !v);
    }
}

impl<T: 'static> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Signal").field(&self.id).finish()
    }
}

/// Read half of a signal.
pub struct ReadSignal<T: 'static> {
    pub(crate) id: SourceId,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ReadSignal<T> {}

impl<T: 'static> ReadSignal<T> {
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
        let value = with_runtime(|rt| read_source(rt, self.id));
        f(downcast::<T>(&value))
    }
}

/// Write half of a signal.
pub struct WriteSignal<T: 'static> {
    pub(crate) id: SourceId,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for WriteSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for WriteSignal<T> {}

impl<T: 'static> WriteSignal<T> {
    pub fn set(&self, value: T) {
        with_runtime(|rt| write_source(rt, self.id, move |_| Rc::new(value)));
    }

    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        with_runtime(|rt| write_source(rt, self.id, move |base| Rc::new(f(downcast::<T>(base)))));
    }
}

/// Create a signal comparing writes by `PartialEq`.
pub fn create_signal<T: PartialEq + 'static>(initial: T) -> Signal<T> {
    create_signal_with(initial, Equality::by_value())
}

/// Create a signal with an explicit equality predicate.
pub fn create_signal_with<T: 'static>(initial: T, equality: Equality<T>) -> Signal<T> {
    let id = with_runtime(|rt| create_source(rt, Rc::new(initial), equality.erase()));
    Signal {
        id,
        _marker: PhantomData,
    }
}

/// Create a signal and immediately split it into read and write halves.
pub fn create_signal_pair<T: PartialEq + 'static>(initial: T) -> (ReadSignal<T>, WriteSignal<T>) {
    create_signal(initial).split()
}
