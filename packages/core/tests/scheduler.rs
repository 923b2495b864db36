//! Phase ordering, tick behavior and the runaway guard.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use filament_core::*;

type Log = Rc<RefCell<Vec<&'static str>>>;

fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

#[test]
fn updates_run_before_any_effect() {
    let _guard = enter_fresh_runtime();
    let x = create_signal(0);
    let order = log();

    let sink = order.clone();
    create_observer(move || {
        x.get();
        sink.borrow_mut().push("update");
    });
    let sink = order.clone();
    create_render_effect(move || {
        x.get();
        sink.borrow_mut().push("render");
    });
    let sink = order.clone();
    create_after_effect(move || {
        x.get();
        sink.borrow_mut().push("after");
    });

    order.borrow_mut().clear();
    x.set(1);
    assert_eq!(*order.borrow(), vec!["update", "render", "after"]);
}

#[test]
fn render_effects_flush_before_after_effects_regardless_of_creation_order() {
    let _guard = enter_fresh_runtime();
    let x = create_signal(0);
    let order = log();

    let sink = order.clone();
    create_after_effect(move || {
        x.get();
        sink.borrow_mut().push("after");
    });
    let sink = order.clone();
    create_render_effect(move || {
        x.get();
        sink.borrow_mut().push("render");
    });

    order.borrow_mut().clear();
    x.set(1);
    assert_eq!(*order.borrow(), vec!["render", "after"]);
}

#[test]
fn effect_phase_writes_start_another_round() {
    let _guard = enter_fresh_runtime();
    let x = create_signal(0);
    let y = create_signal(0);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let sink = seen.clone();
    create_observer(move || sink.borrow_mut().push(y.get()));

    create_render_effect(move || {
        if x.get() == 1 {
            y.set(10);
        }
    });

    x.set(1);
    // the effect's write was processed in a follow-up round of the same flush
    assert_eq!(*seen.borrow(), vec![0, 10]);
}

#[test]
fn ticks_advance_across_rounds() {
    let _guard = enter_fresh_runtime();
    let x = create_signal(0);
    let y = create_signal(0);
    create_observer(move || {
        y.get();
    });
    create_render_effect(move || {
        if x.get() == 1 {
            y.set(1);
        }
    });

    let before = current_tick();
    x.set(1);
    assert!(current_tick() > before);
}

#[test]
fn empty_flush_is_a_no_op() {
    let _guard = enter_fresh_runtime();
    let before = current_tick();
    batch(|| {});
    batch(|| {});
    assert_eq!(current_tick(), before);
}

#[test]
fn nested_batches_flush_once_at_the_outermost_exit() {
    let _guard = enter_fresh_runtime();
    let x = create_signal(0);
    let runs = Rc::new(Cell::new(0));

    let counter = runs.clone();
    create_observer(move || {
        x.get();
        counter.set(counter.get() + 1);
    });

    batch(|| {
        x.set(1);
        batch(|| {
            x.set(2);
        });
        // inner batch exit must not flush
        assert_eq!(runs.get(), 1);
    });
    assert_eq!(runs.get(), 2);
    assert_eq!(x.get(), 2);
}

#[test]
fn writes_during_updates_are_queued_not_recursive() {
    let _guard = enter_fresh_runtime();
    let x = create_signal(0);
    let y = create_signal(0);
    let depth = Rc::new(Cell::new(0u32));
    let max_depth = Rc::new(Cell::new(0u32));

    let d = depth.clone();
    let m = max_depth.clone();
    create_observer(move || {
        d.set(d.get() + 1);
        m.set(m.get().max(d.get()));
        let v = x.get();
        if v == 1 {
            // a write from inside a run must not recurse into us
            y.set(1);
        }
        d.set(d.get() - 1);
    });
    let d = depth.clone();
    let m = max_depth.clone();
    create_observer(move || {
        y.get();
        d.set(d.get() + 1);
        m.set(m.get().max(d.get()));
        d.set(d.get() - 1);
    });

    x.set(1);
    assert_eq!(max_depth.get(), 1, "no reentrant computation runs");
    assert_eq!(y.get(), 1);
}

#[test]
#[should_panic(expected = "passes without settling")]
fn runaway_feedback_loop_trips_the_clock_guard() {
    let _guard = enter_fresh_runtime();
    let x = create_signal_with(0u64, Equality::never());
    create_render_effect(move || {
        let v = x.get();
        x.set(v + 1);
    });
    // the initial run's write starts a flush that never settles
    x.set(1);
}
