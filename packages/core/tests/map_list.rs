//! Keyed and indexed list projections: identity, indices, pools, fallback.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use filament_core::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Item {
    id: u32,
}

fn items(ids: &[u32]) -> Vec<Item> {
    ids.iter().map(|&id| Item { id }).collect()
}

#[test]
fn keyed_reorder_reuses_every_entry() {
    let _guard = enter_fresh_runtime();
    let list = create_signal(items(&[1, 2, 3]));
    let constructed = Rc::new(Cell::new(0));
    let cleaned: Rc<RefCell<Vec<u32>>> = Default::default();

    let built = constructed.clone();
    let graves = cleaned.clone();
    let mapped = map_keyed(
        move || list.get(),
        move |item, index| {
            built.set(built.get() + 1);
            let id = item.id;
            let graves = graves.clone();
            on_cleanup(move |_| graves.borrow_mut().push(id));
            (id, index)
        },
        MapOptions::default(),
    );

    let initial = mapped.get();
    assert_eq!(constructed.get(), 3);
    assert_eq!(
        initial.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    list.set(items(&[3, 1, 2]));
    let reordered = mapped.get();

    // no entry was rebuilt, none was torn down
    assert_eq!(constructed.get(), 3);
    assert!(cleaned.borrow().is_empty());
    assert_eq!(
        reordered.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        vec![3, 1, 2]
    );
    // every index signal reads the entry's new position
    for (position, (_, index)) in reordered.iter().enumerate() {
        assert_eq!(index.get(), position);
    }
    // the same entries moved: id 1 now reads 1, id 2 reads 2, id 3 reads 0
    let index_of = |wanted: u32| {
        reordered
            .iter()
            .find(|(id, _)| *id == wanted)
            .map(|(_, index)| index.get())
            .unwrap()
    };
    assert_eq!((index_of(1), index_of(2), index_of(3)), (1, 2, 0));
}

#[test]
fn keyed_removal_runs_cleanups() {
    let _guard = enter_fresh_runtime();
    let list = create_signal(items(&[1, 2, 3]));
    let cleaned: Rc<RefCell<Vec<u32>>> = Default::default();

    let graves = cleaned.clone();
    let mapped = map_keyed(
        move || list.get(),
        move |item, _| {
            let id = item.id;
            let graves = graves.clone();
            on_cleanup(move |_| graves.borrow_mut().push(id));
            id
        },
        MapOptions::default(),
    );
    assert_eq!(mapped.get(), vec![1, 2, 3]);

    list.set(items(&[1, 3]));
    assert_eq!(mapped.get(), vec![1, 3]);
    assert_eq!(*cleaned.borrow(), vec![2]);
}

#[test]
fn keyed_handles_duplicate_values() {
    let _guard = enter_fresh_runtime();
    let list = create_signal(vec![1, 1, 2]);
    let constructed = Rc::new(Cell::new(0));

    let built = constructed.clone();
    let mapped = map_keyed(
        move || list.get(),
        move |value, _| {
            built.set(built.get() + 1);
            *value
        },
        MapOptions::default(),
    );
    assert_eq!(mapped.get(), vec![1, 1, 2]);
    assert_eq!(constructed.get(), 3);

    list.set(vec![2, 1, 1]);
    assert_eq!(mapped.get(), vec![2, 1, 1]);
    assert_eq!(constructed.get(), 3, "duplicates are matched one to one");
}

#[test]
fn keyed_pool_revives_removed_entries() {
    let _guard = enter_fresh_runtime();
    let list = create_signal(items(&[1, 2]));
    let constructed = Rc::new(Cell::new(0));
    let cleaned = Rc::new(Cell::new(0));

    let built = constructed.clone();
    let graves = cleaned.clone();
    let mapped = map_keyed(
        move || list.get(),
        move |item, _| {
            built.set(built.get() + 1);
            let graves = graves.clone();
            on_cleanup(move |_| graves.set(graves.get() + 1));
            item.id
        },
        MapOptions {
            pool: true,
            ..MapOptions::default()
        },
    );
    assert_eq!(mapped.get(), vec![1, 2]);

    list.set(items(&[1]));
    assert_eq!(cleaned.get(), 0, "pooled entries keep their scope alive");

    list.set(items(&[1, 2]));
    assert_eq!(mapped.get(), vec![1, 2]);
    assert_eq!(constructed.get(), 2, "entry for id 2 came from the pool");
}

#[test]
fn keyed_pool_evicts_past_the_limit() {
    let _guard = enter_fresh_runtime();
    let list = create_signal(items(&[1, 2, 3]));
    let cleaned = Rc::new(Cell::new(0));

    let graves = cleaned.clone();
    let _mapped = map_keyed(
        move || list.get(),
        move |item, _| {
            let graves = graves.clone();
            on_cleanup(move |_| graves.set(graves.get() + 1));
            item.id
        },
        MapOptions {
            pool: true,
            pool_limit: 1,
            ..MapOptions::default()
        },
    );

    list.set(items(&[]));
    // three retired, one seat in the pool
    assert_eq!(cleaned.get(), 2);
}

#[test]
fn keyed_fallback_fills_the_empty_list() {
    let _guard = enter_fresh_runtime();
    let list = create_signal(items(&[]));
    let fallback_cleaned = Rc::new(Cell::new(0));

    let graves = fallback_cleaned.clone();
    let mapped = map_keyed(
        move || list.get(),
        |item, _| item.id,
        MapOptions {
            fallback: Some(Rc::new(move || {
                let graves = graves.clone();
                on_cleanup(move |_| graves.set(graves.get() + 1));
                0
            })),
            ..MapOptions::default()
        },
    );
    assert_eq!(mapped.get(), vec![0]);

    list.set(items(&[9]));
    assert_eq!(mapped.get(), vec![9]);
    assert_eq!(fallback_cleaned.get(), 1, "fallback scope went down");

    list.set(items(&[]));
    assert_eq!(mapped.get(), vec![0], "fallback returns when the list empties");
}

#[test]
fn indexed_prefix_keeps_identity_and_tail_shrinks() {
    let _guard = enter_fresh_runtime();
    let list = create_signal(vec![10, 20, 30]);
    let constructed = Rc::new(Cell::new(0));
    let cleaned = Rc::new(Cell::new(0));

    let built = constructed.clone();
    let graves = cleaned.clone();
    let mapped = map_indexed(
        move || list.get(),
        move |value, index| {
            built.set(built.get() + 1);
            let graves = graves.clone();
            on_cleanup(move |_| graves.set(graves.get() + 1));
            (index, value)
        },
        MapOptions::default(),
    );

    let entries = mapped.get();
    assert_eq!(constructed.get(), 3);
    assert_eq!(entries[1].1.get(), 20);

    // value change at an existing position: no construction, no disposal
    list.set(vec![10, 25, 30]);
    assert_eq!(constructed.get(), 3);
    assert_eq!(cleaned.get(), 0);
    assert_eq!(mapped.get()[1].1.get(), 25);

    // growth happens only at the tail
    list.set(vec![10, 25, 30, 40]);
    assert_eq!(constructed.get(), 4);

    // shrink disposes only the tail
    list.set(vec![10, 25]);
    assert_eq!(cleaned.get(), 2);
    assert_eq!(constructed.get(), 4);
}

#[test]
fn indexed_entries_see_value_updates_reactively() {
    let _guard = enter_fresh_runtime();
    let list = create_signal(vec![1, 2]);
    let observed: Rc<RefCell<Vec<i32>>> = Default::default();

    let sink = observed.clone();
    let _mapped = map_indexed(
        move || list.get(),
        move |value, index| {
            if index == 0 {
                let sink = sink.clone();
                create_observer(move || sink.borrow_mut().push(value.get()));
            }
            index
        },
        MapOptions::default(),
    );
    assert_eq!(*observed.borrow(), vec![1]);

    list.set(vec![5, 2]);
    assert_eq!(*observed.borrow(), vec![1, 5]);
}
