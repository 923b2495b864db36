//! Suspense boundaries: synchronous fallback swap, content re-run on resolve.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use filament_core::*;

fn clocked() -> (RuntimeGuard, Rc<ManualClock>) {
    let guard = enter_fresh_runtime();
    let clock = ManualClock::new();
    set_host_clock(clock.clone());
    (guard, clock)
}

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
fn fallback_shows_until_the_data_lands() {
    let (_guard, clock) = clocked();
    let data = create_signal(None::<i32>);
    let pending = OneShot::default();

    let waiter = pending.clone();
    let boundary = create_suspense(
        move || match data.get() {
            Some(v) => format!("data:{v}"),
            None => {
                suspend(waiter.clone());
                String::new()
            }
        },
        || "loading".to_string(),
    );

    // swapped synchronously at registration
    assert!(boundary.is_suspended());
    assert_eq!(boundary.get(), "loading");

    // deliver the data after 10 virtual milliseconds
    let trigger = pending.clone();
    create_task(
        TaskSource::Delay(10.0),
        vec![action(move |_: &()| {
            data.set(Some(7));
            trigger.complete();
        })],
        None::<()>,
    );

    clock.advance(5.0);
    assert!(boundary.is_suspended(), "nothing resolves before the timer");
    assert_eq!(boundary.get(), "loading");

    clock.advance(5.0);
    assert!(!boundary.is_suspended());
    assert_eq!(boundary.get(), "data:7");
}

#[test]
fn renders_are_never_mixed_while_pending() {
    let (_guard, clock) = clocked();
    let data = create_signal(None::<&'static str>);
    let pending = OneShot::default();
    let frames: Rc<RefCell<Vec<String>>> = Default::default();

    let waiter = pending.clone();
    let boundary = create_suspense(
        move || match data.get() {
            Some(v) => v.to_string(),
            None => {
                suspend(waiter.clone());
                String::new()
            }
        },
        || "fallback".to_string(),
    );

    let sink = frames.clone();
    let view = boundary.clone();
    create_render_effect(move || sink.borrow_mut().push(view.get()));
    assert_eq!(*frames.borrow(), vec!["fallback".to_string()]);

    data.set(Some("ready"));
    pending.complete();
    clock.run_microtasks();

    let frames = frames.borrow();
    assert_eq!(frames.last().unwrap(), "ready");
    // every observed frame is either the fallback or the final content
    assert!(frames.iter().all(|f| f == "fallback" || f == "ready"));
}

#[test]
fn boundary_stays_suspended_until_every_registration_resolves() {
    let (_guard, clock) = clocked();
    let user = create_signal(None::<&'static str>);
    let posts = create_signal(None::<&'static str>);
    let user_pending = OneShot::default();
    let posts_pending = OneShot::default();

    let (a, b) = (user_pending.clone(), posts_pending.clone());
    let boundary = create_suspense(
        move || {
            let mut parts = Vec::new();
            match user.get() {
                Some(v) => parts.push(v),
                None => {
                    suspend(a.clone());
                }
            }
            match posts.get() {
                Some(v) => parts.push(v),
                None => {
                    suspend(b.clone());
                }
            }
            parts.join("+")
        },
        || "waiting".to_string(),
    );
    assert!(boundary.is_suspended());

    user.set(Some("user"));
    user_pending.complete();
    clock.run_microtasks();
    assert!(boundary.is_suspended(), "one registration still outstanding");

    posts.set(Some("posts"));
    posts_pending.complete();
    clock.run_microtasks();
    assert!(!boundary.is_suspended());
    assert_eq!(boundary.get(), "user+posts");
}

#[test]
fn suspend_errors_land_in_the_error_signal() {
    let (_guard, clock) = clocked();
    let attempted = Rc::new(std::cell::Cell::new(false));

    let gate = attempted.clone();
    let boundary = create_suspense(
        move || {
            if !gate.replace(true) {
                suspend_result(async { Err::<(), String>("fetch failed".into()) });
                return String::new();
            }
            "content".to_string()
        },
        || "waiting".to_string(),
    );
    assert_eq!(boundary.error(), None);

    clock.run_microtasks();
    assert_eq!(boundary.error(), Some("fetch failed".to_string()));
    assert!(!boundary.is_suspended(), "errors still resolve the pending count");
    assert_eq!(boundary.get(), "content");
}
