//! Suspense boundaries.
//!
//! A boundary owns a pending count. While the count is above zero the
//! boundary reads as suspended and consumers see the fallback computation;
//! when the last pending registration resolves, the content computation is
//! marked stale and re-run. The swap to the fallback is synchronous: the
//! `is_suspended` signal flips in the same flush that registered the pending
//! work, so no mixed output is ever observable.
//!
//! Suspension is a tagged abort, not an unwind. `suspend` registers the
//! pending work, raises the runtime's abort flag and returns a [`Suspended`]
//! marker; the computation in flight is abandoned and keeps its previous
//! value (or none, on the first run - the boundary covers that case by
//! serving the fallback).

use std::any::Any;
use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::Rc;

use futures_util::FutureExt;
use tracing::trace;

use crate::arena::ObserverId;
use crate::error::{ReactiveError, Suspended};
use crate::observer::{self, create_memo_with, Memo, State};
use crate::runtime::{with_runtime, Runtime};
use crate::scheduler;
use crate::scope::{self, ensure_owner};
use crate::source::{create_signal, Equality, Signal};
use crate::tasks::{create_task_raw, Produced, TaskSource};

/// Context slot the nearest boundary is published under.
pub(crate) const SUSPENSE_CONTEXT: u64 = 0;

pub(crate) struct SuspenseBoundary {
    pending: Cell<u32>,
    is_suspended: Signal<bool>,
    error: Signal<Option<String>>,
    content: Cell<Option<ObserverId>>,
}

pub(crate) fn enclosing_boundary(rt: &Runtime) -> Option<Rc<SuspenseBoundary>> {
    scope::use_context_raw(rt, SUSPENSE_CONTEXT)
        .and_then(|value| value.downcast::<SuspenseBoundary>().ok())
}

pub(crate) fn begin_pending(boundary: &Rc<SuspenseBoundary>) {
    let count = boundary.pending.get() + 1;
    boundary.pending.set(count);
    trace!(count, "suspense pending");
    if count == 1 {
        boundary.is_suspended.set(true);
    }
}

pub(crate) fn end_pending(boundary: &Rc<SuspenseBoundary>) {
    let count = boundary.pending.get().saturating_sub(1);
    boundary.pending.set(count);
    trace!(count, "suspense resolved");
    if count == 0 {
        boundary.is_suspended.set(false);
        if let Some(content) = boundary.content.get() {
            with_runtime(|rt| {
                // a count reaching zero mid-recompute needs no dispatch; the
                // run in flight commits fresh output on its own
                let running = observer::observer_state(rt, content)
                    .map(|state| state.contains(State::RUNNING))
                    .unwrap_or(false);
                if !running {
                    scheduler::stale(rt, content);
                    if !rt.running.get() && rt.batch_depth.get() == 0 {
                        crate::scheduler::run_queues(rt);
                    }
                }
            });
        }
    }
}

/// A boundary pairing a content computation with a fallback.
pub struct Suspense<T: 'static> {
    content: Memo<T>,
    fallback: Memo<T>,
    boundary: Rc<SuspenseBoundary>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Clone for Suspense<T> {
    fn clone(&self) -> Self {
        Self {
            content: self.content,
            fallback: self.fallback,
            boundary: self.boundary.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + 'static> Suspense<T> {
    /// The boundary's current output: the content value, or the fallback
    /// while pending work is outstanding (or before the content's first
    /// successful run).
    pub fn get(&self) -> T {
        if self.boundary.is_suspended.get() {
            return self.fallback.get();
        }
        let value = with_runtime(|rt| observer::read_observer(rt, self.content.id));
        match value {
            Some(value) => value
                .downcast_ref::<T>()
                .expect("suspense content read at the wrong type")
                .clone(),
            None => self.fallback.get(),
        }
    }

    /// Whether pending work is outstanding. Tracked.
    pub fn is_suspended(&self) -> bool {
        self.boundary.is_suspended.get()
    }

    /// The last error reported through [`suspend_result`]. Tracked.
    pub fn error(&self) -> Option<String> {
        self.boundary.error.get()
    }
}

/// Create a suspense boundary around `content`, serving `fallback` while the
/// content's asynchronous dependencies are outstanding.
pub fn create_suspense<T: Clone + 'static>(
    content: impl Fn() -> T + 'static,
    fallback: impl Fn() -> T + 'static,
) -> Suspense<T> {
    with_runtime(|rt| {
        let scope_id = scope::create_child_root(rt, ensure_owner(rt));
        scope::with_owner_untracked(rt, Some(scope_id), || {
            let boundary = Rc::new(SuspenseBoundary {
                pending: Cell::new(0),
                is_suspended: create_signal(false),
                error: create_signal(None::<String>),
                content: Cell::new(None),
            });
            scope::provide_context_raw(
                rt,
                SUSPENSE_CONTEXT,
                boundary.clone() as Rc<dyn Any>,
            );

            // the content memo lives under this scope so suspend() finds the
            // boundary on the owner chain
            let content_memo = create_memo_with(move |_| content(), None, Equality::never());
            boundary.content.set(Some(content_memo.id));
            let fallback_memo = create_memo_with(move |_| fallback(), None, Equality::never());

            Suspense {
                content: content_memo,
                fallback: fallback_memo,
                boundary,
                _marker: PhantomData,
            }
        })
    })
}

/// Register asynchronous work with the nearest suspense boundary and abandon
/// the computation in flight. The boundary re-runs the content computation
/// once every registered future has resolved.
///
/// Outside a suspense boundary this degrades into a routed host failure.
pub fn suspend(future: impl Future<Output = ()> + 'static) -> Suspended {
    suspend_result(async move {
        future.await;
        Ok(())
    })
}

/// [`suspend`] for work that can fail: an `Err` lands in the boundary's
/// error signal and still resolves the pending registration.
pub fn suspend_result(future: impl Future<Output = Result<(), String>> + 'static) -> Suspended {
    with_runtime(|rt| {
        let Some(boundary) = enclosing_boundary(rt) else {
            scope::route_error(
                rt,
                rt.owner.get(),
                &ReactiveError::Host("suspension outside a suspense boundary".into()),
            );
            return Suspended;
        };

        begin_pending(&boundary);

        // a registration resolves exactly once: through completion, or by
        // withdrawal when the registering run is replaced or disposed first
        let resolved = Rc::new(Cell::new(false));
        let resolved_on_cleanup = resolved.clone();
        let boundary_on_cleanup = boundary.clone();
        crate::scope::on_cleanup(move |_| {
            if !resolved_on_cleanup.replace(true) {
                end_pending(&boundary_on_cleanup);
            }
        });

        let wrapped = async move {
            let outcome = future.await;
            Rc::new(outcome) as Rc<dyn Any>
        };
        let on_complete: Box<dyn FnOnce(Rc<dyn Any>)> = {
            let boundary = boundary.clone();
            Box::new(move |value: Rc<dyn Any>| {
                if resolved.replace(true) {
                    return; // withdrawn by a newer run
                }
                if let Some(Err(message)) = value.downcast_ref::<Result<(), String>>() {
                    boundary.error.set(Some(message.clone()));
                }
                end_pending(&boundary);
            })
        };
        create_task_raw(
            rt,
            TaskSource::Producer(Box::new(move || Produced::Future(wrapped.boxed_local()))),
            Vec::new(),
            Rc::new(()),
            Some(on_complete),
        );

        rt.abort_run.set(true);
        Suspended
    })
}
