//! Task layer: coalescing, pipelines, the timeline, locks and futures.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use filament_core::*;

type Log<T> = Rc<RefCell<Vec<T>>>;

fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

fn clocked() -> (RuntimeGuard, Rc<ManualClock>) {
    let guard = enter_fresh_runtime();
    let clock = ManualClock::new();
    set_host_clock(clock.clone());
    (guard, clock)
}

#[test]
fn asap_tasks_in_one_frame_share_one_microtask_and_one_batch() {
    let (_guard, clock) = clocked();
    let a = create_signal(0);
    let b = create_signal(0);
    let c = create_signal(0);
    let runs = Rc::new(Cell::new(0));

    let counter = runs.clone();
    create_observer(move || {
        a.get();
        b.get();
        c.get();
        counter.set(counter.get() + 1);
    });
    assert_eq!(runs.get(), 1);

    create_task(
        TaskSource::Asap,
        vec![action(move |_: &()| a.set(1))],
        None::<()>,
    );
    create_task(
        TaskSource::Asap,
        vec![action(move |_: &()| b.set(2))],
        None::<()>,
    );
    create_task(
        TaskSource::Asap,
        vec![action(move |_: &()| c.set(3))],
        None::<()>,
    );

    // one host microtask dispatch for the whole frame
    assert_eq!(clock.pending_microtasks(), 1);
    assert_eq!(runs.get(), 1, "nothing runs before the microtask");

    clock.run_microtasks();
    // three writes, one scheduler batch, one update
    assert_eq!(runs.get(), 2);
    assert_eq!((a.get(), b.get(), c.get()), (1, 2, 3));
}

#[test]
fn separate_observers_each_update_once_in_the_shared_batch() {
    let (_guard, clock) = clocked();
    let a = create_signal(0);
    let b = create_signal(0);
    let runs = Rc::new(Cell::new(0));

    let counter = runs.clone();
    create_observer(move || {
        a.get();
        counter.set(counter.get() + 1);
    });
    let counter = runs.clone();
    create_observer(move || {
        b.get();
        counter.set(counter.get() + 1);
    });
    assert_eq!(runs.get(), 2);

    create_task(TaskSource::Asap, vec![action(move |_: &()| a.set(1))], None::<()>);
    create_task(TaskSource::Asap, vec![action(move |_: &()| b.set(1))], None::<()>);
    clock.run_microtasks();
    assert_eq!(runs.get(), 4);
}

#[test]
fn pipeline_threads_the_value_through_actions() {
    let (_guard, clock) = clocked();
    let result = await_task::<i32>(
        TaskSource::Asap,
        vec![
            action(|_: &()| 3),
            action(|v: &i32| v + 1),
            action(|v: &i32| v * 2),
        ],
    );
    assert_eq!(result.get(), TaskValue::Waiting);

    clock.run_microtasks();
    assert_eq!(result.get(), TaskValue::Ready(8));
}

#[test]
fn frame_tasks_coalesce_on_the_next_frame() {
    let (_guard, clock) = clocked();
    let a = create_signal(0);
    let b = create_signal(0);
    let runs = Rc::new(Cell::new(0));

    let counter = runs.clone();
    create_observer(move || {
        a.get();
        b.get();
        counter.set(counter.get() + 1);
    });

    create_task(TaskSource::Frame, vec![action(move |_: &()| a.set(1))], None::<()>);
    create_task(TaskSource::Frame, vec![action(move |_: &()| b.set(1))], None::<()>);
    assert_eq!(runs.get(), 1);

    clock.fire_frame();
    assert_eq!(runs.get(), 2, "both frame tasks ran in one batch");
}

#[test]
fn timeline_keeps_a_single_timer_armed() {
    let (_guard, clock) = clocked();
    let fired = log::<&'static str>();

    let sink = fired.clone();
    create_task(
        TaskSource::Delay(10.0),
        vec![action(move |_: &()| sink.borrow_mut().push("slow"))],
        None::<()>,
    );
    let sink = fired.clone();
    create_task(
        TaskSource::Delay(5.0),
        vec![action(move |_: &()| sink.borrow_mut().push("fast"))],
        None::<()>,
    );

    // both entries share one host timer, armed for the earliest deadline
    assert_eq!(clock.pending_timers(), 1);

    clock.advance(7.0);
    assert_eq!(*fired.borrow(), vec!["fast"]);
    assert_eq!(clock.pending_timers(), 1, "re-armed for the later deadline");

    clock.advance(5.0);
    assert_eq!(*fired.borrow(), vec!["fast", "slow"]);
    assert_eq!(clock.pending_timers(), 0);
}

#[test]
fn locked_writes_inside_an_action_commit_at_action_end() {
    let (_guard, clock) = clocked();
    let x = create_signal(0);
    let seen = log::<i32>();
    let observed_inside = Rc::new(Cell::new(-1));

    let sink = seen.clone();
    create_observer(move || sink.borrow_mut().push(x.get()));

    let inside = observed_inside.clone();
    create_task(
        TaskSource::Asap,
        vec![action(move |_: &()| {
            x.set(1);
            x.set(2);
            // the pending value is invisible while the lock is held
            inside.set(x.get_untracked());
        })
        .locking(&[x.id()])],
        None::<()>,
    );

    clock.run_microtasks();
    assert_eq!(observed_inside.get(), 0);
    assert_eq!(x.get(), 2);
    assert_eq!(*seen.borrow(), vec![0, 2], "one commit for the whole action");
}

#[test]
fn cancelled_task_never_runs() {
    let (_guard, clock) = clocked();
    let ran = Rc::new(Cell::new(false));

    let flag = ran.clone();
    let handle = create_task(
        TaskSource::Asap,
        vec![action(move |_: &()| flag.set(true))],
        None::<()>,
    );
    handle.cancel();
    clock.run_microtasks();
    assert!(!ran.get());
}

#[test]
fn disposing_the_owner_cancels_its_tasks() {
    let (_guard, clock) = clocked();
    let ran = Rc::new(Cell::new(false));

    let disposer = create_root(|dispose| {
        let flag = ran.clone();
        create_task(
            TaskSource::Asap,
            vec![action(move |_: &()| flag.set(true))],
            None::<()>,
        );
        dispose
    });
    disposer.dispose();
    clock.run_microtasks();
    assert!(!ran.get());
}

// a future completed by an external call, waking the stored waker
#[derive(Clone, Default)]
struct OneShot {
    state: Rc<RefCell<(bool, Option<Waker>)>>,
}

impl OneShot {
    fn complete(&self) {
        let waker = {
            let mut state = self.state.borrow_mut();
            state.0 = true;
            state.1.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl Future for OneShot {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.borrow_mut();
        if state.0 {
            Poll::Ready(())
        } else {
            state.1 = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[test]
fn producer_future_resolves_into_the_microtask_queue() {
    let (_guard, clock) = clocked();
    let oneshot = OneShot::default();
    let trigger = oneshot.clone();

    let result = await_task::<i32>(
        TaskSource::Producer(Box::new(move || {
            let oneshot = oneshot.clone();
            Produced::Future(Box::pin(async move {
                oneshot.await;
                Rc::new(21i32) as Rc<dyn std::any::Any>
            }))
        })),
        vec![action(|v: &i32| v * 2)],
    );

    clock.run_microtasks();
    assert_eq!(result.get(), TaskValue::Waiting, "future still pending");

    trigger.complete();
    // the wake re-enqueued the task as a microtask
    assert_eq!(clock.pending_microtasks(), 1);
    clock.run_microtasks();
    assert_eq!(result.get(), TaskValue::Ready(42));
}

#[test]
fn producer_value_dispatches_as_asap() {
    let (_guard, clock) = clocked();
    let result = await_task::<i32>(
        TaskSource::Producer(Box::new(|| Produced::Value(Rc::new(5i32)))),
        vec![action(|v: &i32| v + 1)],
    );
    assert_eq!(result.get(), TaskValue::Waiting);
    clock.run_microtasks();
    assert_eq!(result.get(), TaskValue::Ready(6));
}

#[test]
fn deferred_observer_reruns_on_the_microtask_queue() {
    let (_guard, clock) = clocked();
    let x = create_signal(0);
    let seen = log::<i32>();

    let sink = seen.clone();
    task_observer(Defer::Asap, move || sink.borrow_mut().push(x.get()));
    assert_eq!(*seen.borrow(), vec![0], "initial run is synchronous");

    x.set(1);
    // the re-run waits for the microtask instead of the marking flush
    assert_eq!(*seen.borrow(), vec![0]);
    clock.run_microtasks();
    assert_eq!(*seen.borrow(), vec![0, 1]);
}

#[test]
fn mismatched_action_input_routes_invalid_task_source() {
    let (_guard, clock) = clocked();
    let caught = log::<String>();

    create_root(|_| {
        let sink = caught.clone();
        on_error(move |e| sink.borrow_mut().push(e.to_string()));
        // pipeline carries (), the action expects a String
        create_task(
            TaskSource::Asap,
            vec![action(|v: &String| v.len())],
            None::<()>,
        );
    });
    clock.run_microtasks();
    assert_eq!(caught.borrow().len(), 1);
    assert!(caught.borrow()[0].contains("invalid task source"));
}
