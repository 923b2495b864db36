//! The host clock boundary.
//!
//! The task runtime never talks to a concrete event loop. Everything it needs
//! from the outside world - a monotonic clock, a microtask hook, an animation
//! frame hook and a one-shot timer - comes through [`HostClock`]. A browser
//! embedding maps these onto `queueMicrotask`/`requestAnimationFrame`/
//! `setTimeout`; native embeddings map them onto their own loop.
//!
//! [`ManualClock`] is the in-crate reference host: virtual time, explicit
//! pumping. It is what the test suites drive, and it doubles as the default
//! clock of a fresh runtime so that nothing fires behind the embedder's back.

use std::cell::RefCell;
use std::rc::Rc;

/// Opaque handle for a scheduled animation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle(pub u64);

/// Opaque handle for a scheduled one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(pub u64);

/// What the async layer requires from the embedding.
pub trait HostClock {
    /// Monotonic milliseconds. Only differences are meaningful.
    fn now(&self) -> f64;

    /// Run `f` after the current synchronous execution frame completes.
    fn schedule_microtask(&self, f: Box<dyn FnOnce()>);

    /// Run `f` on the next animation frame.
    fn schedule_frame(&self, f: Box<dyn FnOnce()>) -> FrameHandle;

    fn cancel_frame(&self, handle: FrameHandle);

    /// Run `f` once, `ms` milliseconds from now.
    fn schedule_timeout(&self, ms: f64, f: Box<dyn FnOnce()>) -> TimerHandle;

    fn cancel_timeout(&self, handle: TimerHandle);
}

struct PendingTimer {
    handle: u64,
    deadline: f64,
    callback: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct ManualClockState {
    now: f64,
    next_handle: u64,
    microtasks: Vec<Box<dyn FnOnce()>>,
    frames: Vec<(u64, Box<dyn FnOnce()>)>,
    timers: Vec<PendingTimer>,
}

/// A deterministic [`HostClock`] with virtual time.
///
/// Nothing runs until the owner pumps it: [`run_microtasks`](Self::run_microtasks)
/// drains the microtask queue, [`fire_frame`](Self::fire_frame) fires every
/// pending animation frame, and [`advance`](Self::advance) moves virtual time
/// forward, firing due timers in deadline order. Timer callbacks see the
/// microtask queue drained after each firing, matching host event loop
/// semantics.
#[derive(Default)]
pub struct ManualClock {
    state: RefCell<ManualClockState>,
}

impl ManualClock {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Drain the microtask queue, including microtasks scheduled while
    /// draining. Returns the number of callbacks run.
    pub fn run_microtasks(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch = std::mem::take(&mut self.state.borrow_mut().microtasks);
            if batch.is_empty() {
                return ran;
            }
            ran += batch.len();
            for task in batch {
                task();
            }
        }
    }

    /// Fire every pending animation frame callback, then drain microtasks.
    pub fn fire_frame(&self) -> usize {
        let batch = std::mem::take(&mut self.state.borrow_mut().frames);
        let ran = batch.len();
        for (_, callback) in batch {
            callback();
        }
        self.run_microtasks();
        ran
    }

    /// Advance virtual time by `ms`, firing due timers in deadline order.
    pub fn advance(&self, ms: f64) {
        let target = self.state.borrow().now + ms;
        loop {
            let due = {
                let mut state = self.state.borrow_mut();
                let next = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.deadline <= target)
                    .min_by(|(_, a), (_, b)| a.deadline.total_cmp(&b.deadline))
                    .map(|(i, _)| i);
                match next {
                    Some(i) => {
                        let timer = state.timers.remove(i);
                        state.now = state.now.max(timer.deadline);
                        Some(timer.callback)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };
            match due {
                Some(callback) => {
                    callback();
                    self.run_microtasks();
                }
                None => return,
            }
        }
    }

    /// Number of microtasks currently queued.
    pub fn pending_microtasks(&self) -> usize {
        self.state.borrow().microtasks.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> f64 {
        self.state.borrow().now
    }

    fn schedule_microtask(&self, f: Box<dyn FnOnce()>) {
        self.state.borrow_mut().microtasks.push(f);
    }

    fn schedule_frame(&self, f: Box<dyn FnOnce()>) -> FrameHandle {
        let mut state = self.state.borrow_mut();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.frames.push((handle, f));
        FrameHandle(handle)
    }

    fn cancel_frame(&self, handle: FrameHandle) {
        self.state.borrow_mut().frames.retain(|(h, _)| *h != handle.0);
    }

    fn schedule_timeout(&self, ms: f64, f: Box<dyn FnOnce()>) -> TimerHandle {
        let mut state = self.state.borrow_mut();
        state.next_handle += 1;
        let handle = state.next_handle;
        let deadline = state.now + ms;
        state.timers.push(PendingTimer {
            handle,
            deadline,
            callback: f,
        });
        TimerHandle(handle)
    }

    fn cancel_timeout(&self, handle: TimerHandle) {
        self.state.borrow_mut().timers.retain(|t| t.handle != handle.0);
    }
}
