//! The runtime: one value owning the whole reactive graph.
//!
//! The source lineage of this design kept the scheduler state in ambient
//! module-level globals. Here it is a single [`Runtime`] value - arenas,
//! queues, the tick clock, the tracking cells and the async layer - reachable
//! through a thread-local stack so that the public free functions
//! (`create_signal`, `batch`, ...) resolve to "the runtime of the current
//! thread" without the caller threading it everywhere.
//!
//! There is no cross-thread sharing: the runtime is built from `Rc`, `Cell`
//! and `RefCell` and never leaves its thread. Multi-worker deployments run one
//! runtime per worker and talk through messages.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::arena::{Arena, ObserverId, SourceId};
use crate::host::{FrameHandle, HostClock, ManualClock};
use crate::observer::ObserverSlot;
use crate::scheduler::Queue;
use crate::source::SourceSlot;
use crate::tasks::{TaskId, TaskSlot, Timeline};

thread_local! {
    static RUNTIMES: RefCell<Vec<Rc<Runtime>>> = RefCell::new(vec![]);
}

pub(crate) struct Runtime {
    pub(crate) sources: RefCell<Arena<SourceSlot>>,
    pub(crate) observers: RefCell<Arena<ObserverSlot>>,

    /// Observer currently collecting dependencies, if any.
    pub(crate) listener: Cell<Option<ObserverId>>,
    /// Owner new nodes and cleanups attach to.
    pub(crate) owner: Cell<Option<ObserverId>>,
    /// Nearest equality-bearing ancestor while marking downstream; observers
    /// marked under it record a "maybe" dependency instead of a commit.
    pub(crate) pending_ancestor: Cell<Option<ObserverId>>,

    pub(crate) tick: Cell<u64>,
    pub(crate) running: Cell<bool>,
    pub(crate) batch_depth: Cell<u32>,
    /// Raised by `suspend`/`throw_error` to abandon the computation in
    /// flight; the observer keeps its previous value.
    pub(crate) abort_run: Cell<bool>,

    pub(crate) changes: RefCell<Queue<SourceId>>,
    pub(crate) updates: RefCell<Queue<ObserverId>>,
    pub(crate) disposes: RefCell<Queue<ObserverId>>,
    pub(crate) effects: RefCell<Queue<ObserverId>>,

    /// Lazily created root that owns top-level nodes. It cannot be disposed.
    pub(crate) unowned_root: Cell<Option<ObserverId>>,

    // --- async layer ---
    pub(crate) clock: RefCell<Rc<dyn HostClock>>,
    pub(crate) tasks: RefCell<Arena<TaskSlot>>,
    pub(crate) asap_queue: RefCell<Vec<TaskId>>,
    pub(crate) asap_scheduled: Cell<bool>,
    pub(crate) frame_queue: RefCell<Vec<TaskId>>,
    pub(crate) frame_handle: Cell<Option<FrameHandle>>,
    pub(crate) timeline: RefCell<Timeline>,
    /// Observers whose re-runs are deferred through the microtask queue.
    pub(crate) asap_observers: RefCell<Vec<ObserverId>>,
    /// Observers whose re-runs are deferred to the next frame.
    pub(crate) frame_observers: RefCell<Vec<ObserverId>>,
}

impl Runtime {
    pub(crate) fn new() -> Rc<Self> {
        // nothing fires behind the embedder's back until a real clock is
        // installed; the manual clock just queues
        let clock: Rc<dyn HostClock> = ManualClock::new();
        Rc::new(Self {
            sources: RefCell::new(Arena::with_capacity(64)),
            observers: RefCell::new(Arena::with_capacity(64)),
            listener: Cell::new(None),
            owner: Cell::new(None),
            pending_ancestor: Cell::new(None),
            tick: Cell::new(0),
            running: Cell::new(false),
            batch_depth: Cell::new(0),
            abort_run: Cell::new(false),
            changes: RefCell::new(Queue::new()),
            updates: RefCell::new(Queue::new()),
            disposes: RefCell::new(Queue::new()),
            effects: RefCell::new(Queue::new()),
            unowned_root: Cell::new(None),
            clock: RefCell::new(clock),
            tasks: RefCell::new(Arena::with_capacity(16)),
            asap_queue: RefCell::new(Vec::new()),
            asap_scheduled: Cell::new(false),
            frame_queue: RefCell::new(Vec::new()),
            frame_handle: Cell::new(None),
            timeline: RefCell::new(Timeline::new()),
            asap_observers: RefCell::new(Vec::new()),
            frame_observers: RefCell::new(Vec::new()),
        })
    }
}

/// The runtime of the current thread, creating one on first use.
pub(crate) fn current_runtime() -> Rc<Runtime> {
    RUNTIMES.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(runtime) = stack.last() {
            runtime.clone()
        } else {
            let runtime = Runtime::new();
            stack.push(runtime.clone());
            runtime
        }
    })
}

/// Run `f` against the current runtime.
pub(crate) fn with_runtime<R>(f: impl FnOnce(&Runtime) -> R) -> R {
    let runtime = current_runtime();
    f(&runtime)
}

/// Replace the host clock of the current runtime.
///
/// Embedders call this once at startup with a clock bridging their event
/// loop; tests install a [`ManualClock`] and pump it explicitly.
pub fn set_host_clock(clock: Rc<dyn HostClock>) {
    with_runtime(|rt| *rt.clock.borrow_mut() = clock);
}

/// A guard that makes `runtime` the current one until dropped.
///
/// Used by embedders that drive several independent graphs on one thread;
/// most programs never touch it and live on the implicit default runtime.
pub struct RuntimeGuard(());

impl RuntimeGuard {
    pub(crate) fn new(runtime: Rc<Runtime>) -> Self {
        RUNTIMES.with(|stack| stack.borrow_mut().push(runtime));
        Self(())
    }
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        RUNTIMES.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Create a fresh, isolated runtime and enter it.
///
/// Mostly useful in tests: each test gets its own graph, queues and clock
/// regardless of what else ran on the thread.
pub fn enter_fresh_runtime() -> RuntimeGuard {
    RuntimeGuard::new(Runtime::new())
}
