//! Keyed selection and dependency-restricted reactions.
//!
//! `create_selector` turns one frequently-changing source into per-key
//! boolean signals, so a list of rows asking "am I the selected one?" wakes
//! only the two rows whose answer changed instead of every row on every
//! change. When the source value oscillates within a single flush, both the
//! previously-matching and the next-matching key are updated unconditionally.

use std::cell::RefCell;
use std::hash::Hash;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::arena::ObserverId;
use crate::observer::{create_observer, untrack};
use crate::runtime::with_runtime;
use crate::scope::{self, ensure_owner};
use crate::source::{create_signal, Signal};

type MatchFn<K> = Rc<dyn Fn(&K, &K) -> bool>;

/// Per-key membership view over a single source.
pub struct Selector<K: Clone + Eq + Hash + 'static> {
    keys: Rc<RefCell<FxHashMap<K, Signal<bool>>>>,
    current: Rc<RefCell<Option<K>>>,
    matches: MatchFn<K>,
    owner: ObserverId,
}

impl<K: Clone + Eq + Hash + 'static> Clone for Selector<K> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            current: self.current.clone(),
            matches: self.matches.clone(),
            owner: self.owner,
        }
    }
}

impl<K: Clone + Eq + Hash + 'static> Selector<K> {
    /// Whether `key` currently matches the source. Tracked: the caller
    /// re-runs only when the answer for this key flips.
    pub fn selected(&self, key: K) -> bool {
        let signal = {
            let mut keys = self.keys.borrow_mut();
            match keys.get(&key) {
                Some(signal) => *signal,
                None => {
                    let initial = self
                        .current
                        .borrow()
                        .as_ref()
                        .map(|value| (self.matches)(&key, value))
                        .unwrap_or(false);
                    // key signals belong to the selector, not to whichever
                    // row happened to ask first
                    let signal = with_runtime(|rt| {
                        scope::with_owner_untracked(rt, Some(self.owner), || {
                            create_signal(initial)
                        })
                    });
                    keys.insert(key, signal);
                    signal
                }
            }
        };
        signal.get()
    }
}

/// Create a selector over `source`.
pub fn create_selector<K: Clone + Eq + Hash + 'static>(
    source: impl Fn() -> K + 'static,
) -> Selector<K> {
    let owner = with_runtime(ensure_owner);
    let keys: Rc<RefCell<FxHashMap<K, Signal<bool>>>> = Default::default();
    let current: Rc<RefCell<Option<K>>> = Default::default();

    let selector = Selector {
        keys: keys.clone(),
        current: current.clone(),
        matches: Rc::new(|key: &K, value: &K| key == value),
        owner,
    };

    create_observer(move || {
        let value = source();
        untrack(|| {
            let previous = current.borrow_mut().replace(value.clone());
            if previous.as_ref() == Some(&value) {
                return;
            }
            let keys = keys.borrow();
            if let Some(previous) = previous {
                if let Some(signal) = keys.get(&previous) {
                    signal.set(false);
                }
            }
            if let Some(signal) = keys.get(&value) {
                signal.set(true);
            }
        });
    });

    selector
}

/// [`create_selector`] with a custom match predicate instead of key equality.
///
/// With an arbitrary predicate a change can flip any number of keys, so every
/// registered key is re-evaluated against the new value on each change; the
/// per-key signals still keep quiet rows quiet.
pub fn create_selector_with<K: Clone + Eq + Hash + 'static>(
    source: impl Fn() -> K + 'static,
    matches: impl Fn(&K, &K) -> bool + 'static,
) -> Selector<K> {
    let owner = with_runtime(ensure_owner);
    let keys: Rc<RefCell<FxHashMap<K, Signal<bool>>>> = Default::default();
    let current: Rc<RefCell<Option<K>>> = Default::default();
    let matches: MatchFn<K> = Rc::new(matches);

    let selector = Selector {
        keys: keys.clone(),
        current: current.clone(),
        matches: matches.clone(),
        owner,
    };

    create_observer(move || {
        let value = source();
        untrack(|| {
            *current.borrow_mut() = Some(value.clone());
            for (key, signal) in keys.borrow().iter() {
                signal.set(matches(key, &value));
            }
        });
    });

    selector
}

/// Run `f` whenever `deps` produces a new value, without tracking anything
/// `f` itself reads. With `defer` the first run only records the value.
pub fn watch<D: 'static>(
    deps: impl Fn() -> D + 'static,
    f: impl FnMut(&D, Option<&D>) + 'static,
    defer: bool,
) {
    let mut previous: Option<D> = None;
    let mut first = true;
    let mut f = f;
    create_observer(move || {
        let value = deps();
        untrack(|| {
            let skip = first && defer;
            first = false;
            if !skip {
                f(&value, previous.as_ref());
            }
            previous = Some(value);
        });
    });
}
