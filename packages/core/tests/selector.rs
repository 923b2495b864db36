//! Selectors and dependency-restricted reactions.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use filament_core::*;

#[test]
fn selector_wakes_only_the_keys_that_flipped() {
    let _guard = enter_fresh_runtime();
    let selected = create_signal(1u32);
    let selector = create_selector(move || selected.get());
    let wakes: Rc<RefCell<Vec<(u32, bool)>>> = Default::default();

    // three rows, each watching its own key
    for key in 1..=3u32 {
        let selector = selector.clone();
        let sink = wakes.clone();
        create_observer(move || {
            let on = selector.selected(key);
            sink.borrow_mut().push((key, on));
        });
    }
    assert_eq!(*wakes.borrow(), vec![(1, true), (2, false), (3, false)]);

    wakes.borrow_mut().clear();
    selected.set(3);
    // only rows 1 and 3 re-ran
    let mut woken = wakes.borrow().clone();
    woken.sort();
    assert_eq!(woken, vec![(1, false), (3, true)]);
}

#[test]
fn selector_with_predicate_matches_ranges() {
    let _guard = enter_fresh_runtime();
    let cursor = create_signal(5u32);
    // a key matches a whole decade
    let selector = create_selector_with(move || cursor.get(), |key, value| value / 10 == *key);

    assert!(selector.selected(0));
    assert!(!selector.selected(1));

    cursor.set(17);
    assert!(!selector.selected(0));
    assert!(selector.selected(1));
}

#[test]
fn watch_tracks_only_its_deps() {
    let _guard = enter_fresh_runtime();
    let dep = create_signal(1);
    let free = create_signal(10);
    let calls: Rc<RefCell<Vec<(i32, Option<i32>)>>> = Default::default();

    let sink = calls.clone();
    watch(
        move || dep.get(),
        move |value, previous| {
            // reading `free` here must not subscribe
            let _ = free.get();
            sink.borrow_mut().push((*value, previous.copied()));
        },
        false,
    );
    assert_eq!(*calls.borrow(), vec![(1, None)]);

    free.set(11);
    assert_eq!(calls.borrow().len(), 1, "body reads are untracked");

    dep.set(2);
    assert_eq!(*calls.borrow(), vec![(1, None), (2, Some(1))]);
}

#[test]
fn deferred_watch_skips_the_first_run() {
    let _guard = enter_fresh_runtime();
    let dep = create_signal(1);
    let calls = Rc::new(Cell::new(0));

    let counter = calls.clone();
    watch(
        move || dep.get(),
        move |_, previous| {
            assert!(previous.is_some(), "deferred watch always has a previous");
            counter.set(counter.get() + 1);
        },
        true,
    );
    assert_eq!(calls.get(), 0);

    dep.set(2);
    assert_eq!(calls.get(), 1);
}
