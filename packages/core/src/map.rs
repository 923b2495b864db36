//! Memoized list projections.
//!
//! Both operators project a list source into a list of mapped entries and
//! keep the projection stable across updates: an input that survives an
//! update keeps its mapped entry, its per-entry scope and its cleanups.
//!
//! `map_keyed` matches entries by value identity - the mapper receives the
//! (stable) value and a reactive index. `map_indexed` matches by position -
//! the mapper receives a reactive value and the (stable) index - so additions
//! and removals only ever happen at the tail. Keyed is the right choice when
//! entries move; indexed when they are positional slots.
//!
//! Retired entries can optionally be stashed in a pool instead of disposed,
//! and revived by a later insertion of an equal value (keyed) or at the same
//! position (indexed). The pool evicts its oldest entry past `pool_limit`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::hash::Hash;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::arena::ObserverId;
use crate::observer::{create_memo_with, untrack, Memo};
use crate::runtime::{with_runtime, Runtime};
use crate::scope::{self, ensure_owner};
use crate::source::{create_signal, Equality, ReadSignal, Signal};

/// Default cap on pooled entries per projection.
pub const DEFAULT_POOL_LIMIT: usize = 500;

/// Options shared by [`map_keyed`] and [`map_indexed`].
pub struct MapOptions<U> {
    /// Produced (under its own scope) when the input list is empty.
    pub fallback: Option<Rc<dyn Fn() -> U>>,
    /// Stash retired entries for reuse instead of disposing them.
    pub pool: bool,
    pub pool_limit: usize,
}

impl<U> Default for MapOptions<U> {
    fn default() -> Self {
        Self {
            fallback: None,
            pool: false,
            pool_limit: DEFAULT_POOL_LIMIT,
        }
    }
}

struct KeyedEntry<U> {
    mapped: U,
    root: ObserverId,
    index: Signal<usize>,
}

struct KeyedState<T, U> {
    items: Vec<T>,
    entries: Vec<KeyedEntry<U>>,
    fallback_root: Option<ObserverId>,
    fallback_value: Option<U>,
    pool: FxHashMap<T, Vec<KeyedEntry<U>>>,
    pool_order: VecDeque<T>,
    pool_size: usize,
}

fn dispose_entry<U>(rt: &Runtime, entry: KeyedEntry<U>) {
    scope::dispose_observer(rt, entry.root);
}

fn retire_keyed<T: Clone + Eq + Hash, U>(
    rt: &Runtime,
    state: &mut KeyedState<T, U>,
    pool: bool,
    pool_limit: usize,
    item: T,
    entry: KeyedEntry<U>,
) {
    if !pool {
        dispose_entry(rt, entry);
        return;
    }
    state.pool.entry(item.clone()).or_default().push(entry);
    state.pool_order.push_back(item);
    state.pool_size += 1;
    while state.pool_size > pool_limit {
        let Some(oldest) = state.pool_order.pop_front() else {
            break;
        };
        let mut emptied = false;
        if let Some(bucket) = state.pool.get_mut(&oldest) {
            if let Some(evicted) = bucket.pop() {
                dispose_entry(rt, evicted);
                state.pool_size -= 1;
            }
            emptied = bucket.is_empty();
        }
        if emptied {
            state.pool.remove(&oldest);
        }
    }
}

fn make_keyed_entry<T: Clone + Eq + Hash + 'static, U: 'static>(
    rt: &Runtime,
    state: &mut KeyedState<T, U>,
    container: ObserverId,
    map_fn: &Rc<dyn Fn(&T, ReadSignal<usize>) -> U>,
    item: &T,
    index: usize,
) -> KeyedEntry<U> {
    if let Some(bucket) = state.pool.get_mut(item) {
        if let Some(entry) = bucket.pop() {
            if bucket.is_empty() {
                state.pool.remove(item);
            }
            state.pool_size -= 1;
            entry.index.set(index);
            trace!(index, "revived pooled entry");
            return entry;
        }
    }
    let root = scope::create_child_root(rt, container);
    scope::with_owner_untracked(rt, Some(root), || {
        let index_signal = create_signal(index);
        let mapped = map_fn(item, index_signal.split().0);
        KeyedEntry {
            mapped,
            root,
            index: index_signal,
        }
    })
}

/// Project `list` into mapped entries matched by value identity.
///
/// The mapper runs once per distinct surviving value, under a scope of its
/// own; reordering inputs moves entries without re-running the mapper, and
/// each entry's index signal tracks its current position.
pub fn map_keyed<T, U>(
    list: impl Fn() -> Vec<T> + 'static,
    map_fn: impl Fn(&T, ReadSignal<usize>) -> U + 'static,
    options: MapOptions<U>,
) -> Memo<Vec<U>>
where
    T: Clone + Eq + Hash + 'static,
    U: Clone + 'static,
{
    let MapOptions {
        fallback,
        pool,
        pool_limit,
    } = options;
    let map_fn: Rc<dyn Fn(&T, ReadSignal<usize>) -> U> = Rc::new(map_fn);
    let container = with_runtime(|rt| scope::create_child_root(rt, ensure_owner(rt)));
    let state = Rc::new(RefCell::new(KeyedState::<T, U> {
        items: Vec::new(),
        entries: Vec::new(),
        fallback_root: None,
        fallback_value: None,
        pool: FxHashMap::default(),
        pool_order: VecDeque::new(),
        pool_size: 0,
    }));

    create_memo_with(
        move |_| {
            let new_items = list();
            let state = state.clone();
            let map_fn = map_fn.clone();
            let fallback = fallback.clone();
            untrack(move || {
                with_runtime(|rt| {
                    let mut st = state.borrow_mut();
                    reconcile_keyed(rt, &mut st, container, &map_fn, &new_items, pool, pool_limit);
                    if st.entries.is_empty() {
                        if let Some(fallback) = &fallback {
                            return vec![ensure_fallback(rt, &mut st, container, fallback)];
                        }
                    }
                    st.entries.iter().map(|e| e.mapped.clone()).collect()
                })
            })
        },
        None,
        Equality::never(),
    )
}

fn ensure_fallback<T, U: Clone>(
    rt: &Runtime,
    state: &mut KeyedState<T, U>,
    container: ObserverId,
    fallback: &Rc<dyn Fn() -> U>,
) -> U {
    if let Some(value) = &state.fallback_value {
        return value.clone();
    }
    let root = scope::create_child_root(rt, container);
    let value = scope::with_owner_untracked(rt, Some(root), || fallback());
    state.fallback_root = Some(root);
    state.fallback_value = Some(value.clone());
    value
}

fn drop_fallback<T, U>(rt: &Runtime, state: &mut KeyedState<T, U>) {
    if let Some(root) = state.fallback_root.take() {
        scope::dispose_observer(rt, root);
    }
    state.fallback_value = None;
}

fn reconcile_keyed<T, U>(
    rt: &Runtime,
    st: &mut KeyedState<T, U>,
    container: ObserverId,
    map_fn: &Rc<dyn Fn(&T, ReadSignal<usize>) -> U>,
    new_items: &[T],
    pool: bool,
    pool_limit: usize,
) where
    T: Clone + Eq + Hash + 'static,
    U: 'static,
{
    if !new_items.is_empty() {
        drop_fallback(rt, st);
    }

    // trivial shapes
    if new_items.is_empty() {
        let items = std::mem::take(&mut st.items);
        let entries = std::mem::take(&mut st.entries);
        for (item, entry) in items.into_iter().zip(entries) {
            retire_keyed(rt, st, pool, pool_limit, item, entry);
        }
        return;
    }
    if st.items.is_empty() {
        for (index, item) in new_items.iter().enumerate() {
            let entry = make_keyed_entry(rt, st, container, map_fn, item, index);
            st.entries.push(entry);
        }
        st.items = new_items.to_vec();
        return;
    }

    // four-edge pass: matching prefixes and suffixes stay put, fully crossed
    // ends swap in place
    let mut start = 0;
    let mut old_end = st.items.len();
    let mut new_end = new_items.len();
    loop {
        while start < old_end && start < new_end && st.items[start] == new_items[start] {
            start += 1;
        }
        while old_end > start
            && new_end > start
            && st.items[old_end - 1] == new_items[new_end - 1]
        {
            old_end -= 1;
            new_end -= 1;
        }
        if old_end - start >= 2
            && new_end - start >= 2
            && st.items[start] == new_items[new_end - 1]
            && st.items[old_end - 1] == new_items[start]
        {
            st.items.swap(start, old_end - 1);
            st.entries.swap(start, old_end - 1);
            start += 1;
            old_end -= 1;
            new_end -= 1;
            continue;
        }
        break;
    }

    if start == old_end && start == new_end {
        refresh_indices(st);
        return;
    }

    // general case over the unresolved middle: a value -> position map with a
    // next-duplicate chain matches survivors, everything else retires
    let new_mid = &new_items[start..new_end];
    let mut next_dup: Vec<usize> = vec![usize::MAX; new_mid.len()];
    let mut head: FxHashMap<T, usize> = FxHashMap::default();
    for j in (0..new_mid.len()).rev() {
        if let Some(previous) = head.insert(new_mid[j].clone(), j) {
            next_dup[j] = previous;
        }
    }

    let old_items: Vec<T> = st.items.drain(start..old_end).collect();
    let old_entries: Vec<KeyedEntry<U>> = st.entries.drain(start..old_end).collect();
    let mut matched: Vec<Option<KeyedEntry<U>>> = new_mid.iter().map(|_| None).collect();
    for (item, entry) in old_items.into_iter().zip(old_entries) {
        match head.get(&item).copied() {
            Some(j) => {
                matched[j] = Some(entry);
                if next_dup[j] == usize::MAX {
                    head.remove(&item);
                } else {
                    head.insert(item, next_dup[j]);
                }
            }
            None => retire_keyed(rt, st, pool, pool_limit, item, entry),
        }
    }

    let mut resolved: Vec<KeyedEntry<U>> = Vec::with_capacity(new_mid.len());
    for (j, item) in new_mid.iter().enumerate() {
        match matched[j].take() {
            Some(entry) => resolved.push(entry),
            None => resolved.push(make_keyed_entry(rt, st, container, map_fn, item, start + j)),
        }
    }

    st.entries.splice(start..start, resolved);
    st.items.splice(start..start, new_mid.iter().cloned());
    debug_assert_eq!(st.items.len(), new_items.len());
    debug_assert!(st.items == new_items);

    refresh_indices(st);
}

fn refresh_indices<T, U>(st: &KeyedState<T, U>) {
    // index signals are equality-filtered, so only moved entries propagate
    for (index, entry) in st.entries.iter().enumerate() {
        entry.index.set(index);
    }
}

// --- indexed --------------------------------------------------------------

struct IndexedEntry<T: 'static, U> {
    mapped: U,
    root: ObserverId,
    value: Signal<T>,
}

struct IndexedState<T: 'static, U> {
    entries: Vec<IndexedEntry<T, U>>,
    fallback_root: Option<ObserverId>,
    fallback_value: Option<U>,
    pool: FxHashMap<usize, IndexedEntry<T, U>>,
    pool_order: VecDeque<usize>,
}

/// Project `list` into mapped entries matched by position.
///
/// Positions are stable: existing entries only see their value signal update,
/// and entries are created or disposed at the tail alone.
pub fn map_indexed<T, U>(
    list: impl Fn() -> Vec<T> + 'static,
    map_fn: impl Fn(ReadSignal<T>, usize) -> U + 'static,
    options: MapOptions<U>,
) -> Memo<Vec<U>>
where
    T: Clone + PartialEq + 'static,
    U: Clone + 'static,
{
    let MapOptions {
        fallback,
        pool,
        pool_limit,
    } = options;
    let map_fn: Rc<dyn Fn(ReadSignal<T>, usize) -> U> = Rc::new(map_fn);
    let container = with_runtime(|rt| scope::create_child_root(rt, ensure_owner(rt)));
    let state = Rc::new(RefCell::new(IndexedState::<T, U> {
        entries: Vec::new(),
        fallback_root: None,
        fallback_value: None,
        pool: FxHashMap::default(),
        pool_order: VecDeque::new(),
    }));

    create_memo_with(
        move |_| {
            let new_items = list();
            let state = state.clone();
            let map_fn = map_fn.clone();
            let fallback = fallback.clone();
            untrack(move || {
                with_runtime(|rt| {
                    let mut st = state.borrow_mut();

                    if !new_items.is_empty() {
                        if let Some(root) = st.fallback_root.take() {
                            scope::dispose_observer(rt, root);
                        }
                        st.fallback_value = None;
                    }

                    let common = st.entries.len().min(new_items.len());
                    for (index, item) in new_items[..common].iter().enumerate() {
                        // value signals are PartialEq-filtered: unchanged
                        // positions stay quiet
                        st.entries[index].value.set(item.clone());
                    }

                    // grow the tail
                    for (index, item) in new_items.iter().enumerate().skip(common) {
                        let entry = if let Some(pooled) = st.pool.remove(&index) {
                            pooled.value.set(item.clone());
                            pooled
                        } else {
                            let root = scope::create_child_root(rt, container);
                            scope::with_owner_untracked(rt, Some(root), || {
                                let value_signal = create_signal(item.clone());
                                let mapped = map_fn(value_signal.split().0, index);
                                IndexedEntry {
                                    mapped,
                                    root,
                                    value: value_signal,
                                }
                            })
                        };
                        st.entries.push(entry);
                    }

                    // shrink the tail
                    while st.entries.len() > new_items.len() {
                        let index = st.entries.len() - 1;
                        let entry = st.entries.pop().expect("tail entry");
                        if pool {
                            st.pool.insert(index, entry);
                            st.pool_order.push_back(index);
                            while st.pool_order.len() > pool_limit {
                                let Some(oldest) = st.pool_order.pop_front() else {
                                    break;
                                };
                                if let Some(evicted) = st.pool.remove(&oldest) {
                                    scope::dispose_observer(rt, evicted.root);
                                }
                            }
                        } else {
                            scope::dispose_observer(rt, entry.root);
                        }
                    }

                    if st.entries.is_empty() {
                        if let Some(fallback) = &fallback {
                            if st.fallback_value.is_none() {
                                let root = scope::create_child_root(rt, container);
                                let value =
                                    scope::with_owner_untracked(rt, Some(root), || fallback());
                                st.fallback_root = Some(root);
                                st.fallback_value = Some(value);
                            }
                            return vec![st.fallback_value.clone().expect("fallback built above")];
                        }
                    }
                    st.entries.iter().map(|e| e.mapped.clone()).collect()
                })
            })
        },
        None,
        Equality::never(),
    )
}
