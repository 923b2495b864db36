//! The task layer: microtasks, frames, the timeline and action pipelines.
//!
//! Work scheduled here lands back in the scheduler as ordinary writes, with
//! one guarantee layered on top: everything dispatched to the same sink within
//! one synchronous execution frame runs inside a single scheduler batch. The
//! first asap task of a frame schedules exactly one host microtask; everyone
//! else piles into the queue it will drain. Frames work the same way against
//! the host's animation frame, and the timeline keeps a single host timer
//! armed for its earliest deadline.
//!
//! A task is an explicit state machine: a source, an ordered list of actions,
//! a cursor, and the locks the running action holds. Actions may lock sources
//! for their duration so that several writes commit as one change. There are
//! no hidden coroutines; producer-sourced futures are polled right here with
//! an `Rc` waker that re-enqueues the task on wake.

use std::any::Any;
use std::collections::BinaryHeap;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use futures_util::future::LocalBoxFuture;
use tracing::trace;

use crate::arena::{ObserverId, RawId, SourceId};
use crate::error::ReactiveError;
use crate::host::TimerHandle;
use crate::observer::{self, DeferKind, ObserverKind};
use crate::runtime::{current_runtime, with_runtime, Runtime};
use crate::scheduler;
use crate::scope;
use crate::source::{self, create_signal_with, Equality, ReadSignal};

/// Handle to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) RawId);

/// What a producer source handed back.
pub enum Produced {
    Value(Rc<dyn Any>),
    Future(LocalBoxFuture<'static, Rc<dyn Any>>),
}

/// Where a task's first step runs.
pub enum TaskSource {
    /// Next microtask, coalesced with every other asap task of this frame.
    Asap,
    /// Next animation frame, coalesced likewise.
    Frame,
    /// `ms` milliseconds from now on the timeline.
    Delay(f64),
    /// Call the function now; a returned value dispatches into the microtask
    /// queue, a returned future is awaited and its output dispatched there.
    Producer(Box<dyn FnOnce() -> Produced>),
}

/// One step of a pipeline: a value transform plus the sources it locks while
/// running.
#[derive(Clone)]
pub struct Action {
    pub(crate) run: Rc<dyn Fn(Rc<dyn Any>) -> Result<Rc<dyn Any>, &'static str>>,
    pub(crate) locks: Vec<SourceId>,
}

impl Action {
    pub fn new<V: 'static, W: 'static>(f: impl Fn(&V) -> W + 'static) -> Self {
        Self {
            run: Rc::new(move |value: Rc<dyn Any>| match value.downcast_ref::<V>() {
                Some(v) => Ok(Rc::new(f(v)) as Rc<dyn Any>),
                None => Err("action input type does not match the pipeline value"),
            }),
            locks: Vec::new(),
        }
    }

    /// Lock `sources` for the duration of this action. Writes they receive
    /// while locked commit together when the action finishes.
    pub fn locking(mut self, sources: &[SourceId]) -> Self {
        self.locks.extend_from_slice(sources);
        self
    }
}

/// Shorthand for [`Action::new`].
pub fn action<V: 'static, W: 'static>(f: impl Fn(&V) -> W + 'static) -> Action {
    Action::new(f)
}

pub(crate) struct TaskSlot {
    pub(crate) actions: Vec<Action>,
    pub(crate) cursor: usize,
    pub(crate) value: Rc<dyn Any>,
    pub(crate) future: Option<LocalBoxFuture<'static, Rc<dyn Any>>>,
    pub(crate) on_complete: Option<Box<dyn FnOnce(Rc<dyn Any>)>>,
    pub(crate) owner: Option<ObserverId>,
}

// --- timeline -------------------------------------------------------------

struct TimelineEntry {
    deadline: f64,
    seq: u64,
    task: TaskId,
}

impl PartialEq for TimelineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimelineEntry {}
impl PartialOrd for TimelineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimelineEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert for earliest-first
        other
            .deadline
            .total_cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Delayed tasks keyed by wall time, sharing one host timer that is always
/// armed for the earliest due entry.
pub(crate) struct Timeline {
    heap: BinaryHeap<TimelineEntry>,
    timer: Option<TimerHandle>,
    timer_deadline: f64,
    seq: u64,
}

impl Timeline {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            timer: None,
            timer_deadline: f64::INFINITY,
            seq: 0,
        }
    }
}

fn schedule_delay(rt: &Runtime, task: TaskId, ms: f64) {
    let deadline = rt.clock.borrow().now() + ms.max(0.0);
    {
        let mut timeline = rt.timeline.borrow_mut();
        let seq = timeline.seq;
        timeline.seq += 1;
        timeline.heap.push(TimelineEntry {
            deadline,
            seq,
            task,
        });
    }
    arm_timer(rt);
}

fn arm_timer(rt: &Runtime) {
    let (next, stale_handle) = {
        let mut timeline = rt.timeline.borrow_mut();
        let next = timeline.heap.peek().map(|entry| entry.deadline);
        match next {
            Some(deadline) if timeline.timer.is_none() || deadline < timeline.timer_deadline => {
                let stale = timeline.timer.take();
                timeline.timer_deadline = deadline;
                (Some(deadline), stale)
            }
            _ => (None, None),
        }
    };
    let clock = rt.clock.borrow().clone();
    if let Some(handle) = stale_handle {
        clock.cancel_timeout(handle);
    }
    let Some(deadline) = next else { return };
    let weak = Rc::downgrade(&current_runtime());
    let delay = (deadline - clock.now()).max(0.0);
    let handle = clock.schedule_timeout(
        delay,
        Box::new(move || {
            if let Some(rt) = weak.upgrade() {
                fire_timeline(&rt);
            }
        }),
    );
    rt.timeline.borrow_mut().timer = Some(handle);
}

fn fire_timeline(rt: &Runtime) {
    let now = rt.clock.borrow().now();
    let due: Vec<TaskId> = {
        let mut timeline = rt.timeline.borrow_mut();
        timeline.timer = None;
        timeline.timer_deadline = f64::INFINITY;
        let mut due = Vec::new();
        while timeline
            .heap
            .peek()
            .map(|entry| entry.deadline <= now)
            .unwrap_or(false)
        {
            due.push(timeline.heap.pop().expect("peeked entry").task);
        }
        due
    };
    run_batch(rt, due, Vec::new());
    arm_timer(rt);
}

// --- dispatch queues ------------------------------------------------------

fn push_asap_task(rt: &Runtime, task: TaskId) {
    rt.asap_queue.borrow_mut().push(task);
    ensure_asap_dispatch(rt);
}

/// Arrange for the asap queue to drain after the current synchronous frame.
/// At most one host microtask is in flight at a time.
pub(crate) fn ensure_asap_dispatch(rt: &Runtime) {
    if rt.asap_scheduled.get() {
        return;
    }
    rt.asap_scheduled.set(true);
    let weak = Rc::downgrade(&current_runtime());
    let clock = rt.clock.borrow().clone();
    clock.schedule_microtask(Box::new(move || {
        if let Some(rt) = weak.upgrade() {
            drain_asap(&rt);
        }
    }));
}

pub(crate) fn ensure_frame_dispatch(rt: &Runtime) {
    if rt.frame_handle.get().is_some() {
        return;
    }
    let weak = Rc::downgrade(&current_runtime());
    let clock = rt.clock.borrow().clone();
    let handle = clock.schedule_frame(Box::new(move || {
        if let Some(rt) = weak.upgrade() {
            rt.frame_handle.set(None);
            let tasks = std::mem::take(&mut *rt.frame_queue.borrow_mut());
            let observers = std::mem::take(&mut *rt.frame_observers.borrow_mut());
            run_batch(&rt, tasks, observers);
        }
    }));
    rt.frame_handle.set(Some(handle));
}

fn drain_asap(rt: &Runtime) {
    rt.asap_scheduled.set(false);
    let tasks = std::mem::take(&mut *rt.asap_queue.borrow_mut());
    let observers = std::mem::take(&mut *rt.asap_observers.borrow_mut());
    trace!(tasks = tasks.len(), observers = observers.len(), "asap drain");
    run_batch(rt, tasks, observers);
}

/// Run task steps and deferred observers under one scheduler batch, so every
/// write they make lands in the same flush.
fn run_batch(rt: &Runtime, tasks: Vec<TaskId>, observers: Vec<ObserverId>) {
    if tasks.is_empty() && observers.is_empty() {
        return;
    }
    rt.batch_depth.set(rt.batch_depth.get() + 1);
    for task in tasks {
        run_task_step(rt, task);
    }
    for observer in observers {
        observer::update(rt, observer);
    }
    rt.batch_depth.set(rt.batch_depth.get() - 1);
    if rt.batch_depth.get() == 0 && !rt.running.get() {
        scheduler::run_queues(rt);
    }
}

// --- futures --------------------------------------------------------------

struct TaskWaker {
    task: TaskId,
    runtime: Weak<Runtime>,
}

impl TaskWaker {
    fn wake(&self) {
        if let Some(rt) = self.runtime.upgrade() {
            push_asap_task(&rt, self.task);
        }
    }
}

// Hand-rolled Rc waker: these futures never leave the runtime's thread, and
// the vtable upholds the refcount discipline Waker::clone/drop expect.
const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

unsafe fn clone_raw(data: *const ()) -> RawWaker {
    let rc = Rc::from_raw(data as *const TaskWaker);
    let cloned = rc.clone();
    std::mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake_raw(data: *const ()) {
    let rc = Rc::from_raw(data as *const TaskWaker);
    rc.wake();
}

unsafe fn wake_by_ref_raw(data: *const ()) {
    let rc = Rc::from_raw(data as *const TaskWaker);
    rc.wake();
    std::mem::forget(rc);
}

unsafe fn drop_raw(data: *const ()) {
    drop(Rc::from_raw(data as *const TaskWaker));
}

fn make_waker(task: TaskId) -> Waker {
    let waker = Rc::new(TaskWaker {
        task,
        runtime: Rc::downgrade(&current_runtime()),
    });
    unsafe { Waker::from_raw(RawWaker::new(Rc::into_raw(waker) as *const (), &VTABLE)) }
}

// --- execution ------------------------------------------------------------

fn run_task_step(rt: &Runtime, id: TaskId) {
    // resolve the producer future first, if one is pending
    let future = {
        let mut tasks = rt.tasks.borrow_mut();
        match tasks.get_mut(id.0) {
            Some(slot) => slot.future.take(),
            None => return,
        }
    };
    if let Some(mut future) = future {
        let waker = make_waker(id);
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => {
                if let Some(slot) = rt.tasks.borrow_mut().get_mut(id.0) {
                    slot.value = value;
                }
            }
            Poll::Pending => {
                if let Some(slot) = rt.tasks.borrow_mut().get_mut(id.0) {
                    slot.future = Some(future);
                }
                return;
            }
        }
    }

    let step = {
        let tasks = rt.tasks.borrow();
        match tasks.get(id.0) {
            Some(slot) if slot.cursor < slot.actions.len() => {
                Some((slot.actions[slot.cursor].clone(), slot.value.clone()))
            }
            Some(_) => None,
            None => return,
        }
    };

    let Some((action, value)) = step else {
        complete_task(rt, id);
        return;
    };

    for lock in &action.locks {
        source::lock_source(rt, *lock);
    }
    let result = (action.run)(value);
    for lock in &action.locks {
        source::unlock_source(rt, *lock);
    }

    match result {
        Ok(value) => {
            let done = {
                let mut tasks = rt.tasks.borrow_mut();
                let Some(slot) = tasks.get_mut(id.0) else {
                    return;
                };
                slot.value = value;
                slot.cursor += 1;
                slot.cursor >= slot.actions.len()
            };
            if done {
                complete_task(rt, id);
            } else {
                // chained actions ride the microtask queue regardless of the
                // original source, so pipelines coalesce with other asap work
                push_asap_task(rt, id);
            }
        }
        Err(message) => {
            let owner = rt.tasks.borrow().get(id.0).and_then(|slot| slot.owner);
            let removed = rt.tasks.borrow_mut().remove(id.0);
            drop(removed);
            scope::route_error(rt, owner, &ReactiveError::InvalidTaskSource(message));
        }
    }
}

fn complete_task(rt: &Runtime, id: TaskId) {
    let slot = rt.tasks.borrow_mut().remove(id.0);
    if let Some(slot) = slot {
        if let Some(on_complete) = slot.on_complete {
            on_complete(slot.value);
        }
    }
}

fn cancel_task(rt: &Runtime, id: TaskId) {
    rt.tasks.borrow_mut().remove(id.0);
}

/// Handle to a scheduled pipeline. The owning scope cancels the pipeline on
/// disposal; [`cancel`](Self::cancel) does it explicitly.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
}

impl TaskHandle {
    /// Abandon the remaining actions of the pipeline.
    pub fn cancel(&self) {
        with_runtime(|rt| cancel_task(rt, self.id));
    }
}

pub(crate) fn create_task_raw(
    rt: &Runtime,
    source: TaskSource,
    actions: Vec<Action>,
    initial: Rc<dyn Any>,
    on_complete: Option<Box<dyn FnOnce(Rc<dyn Any>)>>,
) -> TaskHandle {
    let owner = rt.owner.get();
    let id = TaskId(rt.tasks.borrow_mut().insert(TaskSlot {
        actions,
        cursor: 0,
        value: initial,
        future: None,
        on_complete,
        owner,
    }));

    match source {
        TaskSource::Asap => push_asap_task(rt, id),
        TaskSource::Frame => {
            rt.frame_queue.borrow_mut().push(id);
            ensure_frame_dispatch(rt);
        }
        TaskSource::Delay(ms) => schedule_delay(rt, id, ms),
        TaskSource::Producer(producer) => match producer() {
            Produced::Value(value) => {
                if let Some(slot) = rt.tasks.borrow_mut().get_mut(id.0) {
                    slot.value = value;
                }
                push_asap_task(rt, id);
            }
            Produced::Future(future) => {
                if let Some(slot) = rt.tasks.borrow_mut().get_mut(id.0) {
                    slot.future = Some(future);
                }
                push_asap_task(rt, id);
            }
        },
    }

    // the owner tree is the destructor: a disposed scope cancels its tasks
    let handle = TaskHandle { id };
    let for_cleanup = handle.clone();
    scope::with_owner_untracked(rt, owner, || {
        crate::scope::on_cleanup(move |_| for_cleanup.cancel());
    });
    handle
}

/// Schedule a pipeline of actions. `initial` seeds the value flowing into the
/// first action; producer sources overwrite it with what they produce.
pub fn create_task<T: 'static>(
    source: TaskSource,
    actions: Vec<Action>,
    initial: Option<T>,
) -> TaskHandle {
    with_runtime(|rt| {
        let seed: Rc<dyn Any> = match initial {
            Some(value) => Rc::new(value),
            None => Rc::new(()),
        };
        create_task_raw(rt, source, actions, seed, None)
    })
}

/// Values emitted by [`await_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskValue<T> {
    Waiting,
    Ready(T),
}

impl<T> TaskValue<T> {
    pub fn ready(&self) -> Option<&T> {
        match self {
            TaskValue::Ready(value) => Some(value),
            TaskValue::Waiting => None,
        }
    }
}

/// Schedule a pipeline and get a readable that emits [`TaskValue::Waiting`]
/// until the pipeline completes, then the final value.
pub fn await_task<T: Clone + 'static>(
    source: TaskSource,
    actions: Vec<Action>,
) -> ReadSignal<TaskValue<T>> {
    with_runtime(|rt| {
        let signal = create_signal_with(TaskValue::<T>::Waiting, Equality::never());
        let on_complete: Box<dyn FnOnce(Rc<dyn Any>)> = Box::new(move |value: Rc<dyn Any>| {
            match value.downcast_ref::<T>() {
                Some(v) => signal.set(TaskValue::Ready(v.clone())),
                None => crate::scope::throw_error("task pipeline produced the wrong type"),
            }
        });
        create_task_raw(rt, source, actions, Rc::new(()), Some(on_complete));
        signal.split().0
    })
}

/// [`await_task`] that additionally registers with the enclosing suspense
/// boundary and aborts the computation in flight, so the boundary shows its
/// fallback until the pipeline lands.
pub fn suspended_task<T: Clone + 'static>(
    source: TaskSource,
    actions: Vec<Action>,
) -> ReadSignal<TaskValue<T>> {
    with_runtime(|rt| {
        let boundary = crate::suspense::enclosing_boundary(rt);
        if let Some(boundary) = &boundary {
            crate::suspense::begin_pending(boundary);
        }
        let signal = create_signal_with(TaskValue::<T>::Waiting, Equality::never());
        let registered = boundary.clone();
        let on_complete: Box<dyn FnOnce(Rc<dyn Any>)> = Box::new(move |value: Rc<dyn Any>| {
            match value.downcast_ref::<T>() {
                Some(v) => signal.set(TaskValue::Ready(v.clone())),
                None => crate::scope::throw_error("task pipeline produced the wrong type"),
            }
            if let Some(boundary) = registered {
                crate::suspense::end_pending(&boundary);
            }
        });
        create_task_raw(rt, source, actions, Rc::new(()), Some(on_complete));
        if boundary.is_some() {
            rt.abort_run.set(true);
        }
        signal.split().0
    })
}

/// Which dispatch queue a deferred observer re-runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Defer {
    Asap,
    Frame,
}

impl Defer {
    fn kind(self) -> DeferKind {
        match self {
            Defer::Asap => DeferKind::Asap,
            Defer::Frame => DeferKind::Frame,
        }
    }
}

/// An observer whose re-runs are deferred through the task queues instead of
/// running in the scheduler pass that marked it.
pub fn task_observer(defer: Defer, f: impl FnMut() + 'static) {
    observer::create_reaction(ObserverKind::Observer, Some(defer.kind()), f);
}

pub fn task_effect(defer: Defer, f: impl FnMut() + 'static) {
    observer::create_reaction(ObserverKind::AfterEffect, Some(defer.kind()), f);
}

pub fn task_render_effect(defer: Defer, f: impl FnMut() + 'static) {
    observer::create_reaction(ObserverKind::RenderEffect, Some(defer.kind()), f);
}
