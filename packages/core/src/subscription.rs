//! Bipartite links between sources and their observers.
//!
//! Each side of an edge stores the index of the mirror entry on the other
//! side, so removal is O(1): swap the departing entry with the last one and
//! patch the moved entry's back-index. The first edge on either side lives in
//! a scalar slot encoded as `-1`; the rest live in parallel vectors. Most
//! observers have one or two dependencies, so the scalar slot keeps the common
//! case allocation-free.

use smallvec::SmallVec;

use crate::arena::{ObserverId, SourceId};
use crate::runtime::Runtime;

/// Upstream end of an edge: either a writable source or an observer that
/// exposes a cached value (memo / computed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceRef {
    Source(SourceId),
    Observer(ObserverId),
}

/// Downstream bookkeeping attached to every source, memo and computed.
#[derive(Default)]
pub(crate) struct Subscription {
    /// First observer, with its back-index (-1 = the observer's scalar slot).
    pub(crate) primary: Option<(ObserverId, i32)>,
    pub(crate) observers: Vec<ObserverId>,
    pub(crate) slots: Vec<i32>,
}

impl Subscription {
    pub(crate) fn is_empty(&self) -> bool {
        self.primary.is_none() && self.observers.is_empty()
    }

    pub(crate) fn collect(&self) -> SmallVec<[ObserverId; 8]> {
        let mut out = SmallVec::new();
        if let Some((observer, _)) = self.primary {
            out.push(observer);
        }
        out.extend(self.observers.iter().copied());
        out
    }
}

fn with_sub_mut<R>(
    rt: &Runtime,
    sref: SourceRef,
    f: impl FnOnce(&mut Subscription) -> R,
) -> Option<R> {
    match sref {
        SourceRef::Source(id) => rt.sources.borrow_mut().get_mut(id.0).map(|s| f(&mut s.sub)),
        SourceRef::Observer(id) => rt
            .observers
            .borrow_mut()
            .get_mut(id.0)
            .map(|o| f(&mut o.sub)),
    }
}

/// Attach `observer` to the subscription of `sref`, recording matching slot
/// indices on both sides.
pub(crate) fn connect(rt: &Runtime, sref: SourceRef, observer: ObserverId) {
    // Re-reading the same cell first is the common hot path; skip it cheaply.
    let observer_pos: i32 = {
        let observers = rt.observers.borrow();
        let Some(slot) = observers.get(observer.0) else {
            return;
        };
        if slot.source1 == Some(sref) {
            return;
        }
        if slot.source1.is_none() {
            -1
        } else {
            slot.sources.len() as i32
        }
    };

    let sub_pos = with_sub_mut(rt, sref, |sub| {
        let pos: i32 = if sub.primary.is_none() {
            -1
        } else {
            sub.observers.len() as i32
        };
        if pos == -1 {
            sub.primary = Some((observer, observer_pos));
        } else {
            sub.observers.push(observer);
            sub.slots.push(observer_pos);
        }
        pos
    });
    let Some(sub_pos) = sub_pos else { return };

    let mut observers = rt.observers.borrow_mut();
    let Some(slot) = observers.get_mut(observer.0) else {
        return;
    };
    if observer_pos == -1 {
        slot.source1 = Some(sref);
        slot.source1_slot = sub_pos;
    } else {
        slot.sources.push(sref);
        slot.source_slots.push(sub_pos);
    }
}

/// Remove the edge `sref -> observer` given the observer-side back-index into
/// the subscription. Patches the back-index of whichever entry got swapped
/// into the vacated position.
fn remove_edge(rt: &Runtime, sref: SourceRef, sub_slot: i32, observer: ObserverId) {
    let fixup = with_sub_mut(rt, sref, |sub| {
        if sub_slot == -1 {
            debug_assert!(matches!(sub.primary, Some((o, _)) if o == observer));
            sub.primary = None;
            None
        } else {
            let idx = sub_slot as usize;
            if idx >= sub.observers.len() || sub.observers[idx] != observer {
                // the upstream node was rebuilt under us; nothing to unlink
                return None;
            }
            sub.observers.swap_remove(idx);
            sub.slots.swap_remove(idx);
            if idx < sub.observers.len() {
                Some((sub.observers[idx], sub.slots[idx], idx as i32))
            } else {
                None
            }
        }
    })
    .flatten();

    if let Some((moved, moved_pos, new_index)) = fixup {
        let mut observers = rt.observers.borrow_mut();
        if let Some(slot) = observers.get_mut(moved.0) {
            if moved_pos == -1 {
                slot.source1_slot = new_index;
            } else if let Some(entry) = slot.source_slots.get_mut(moved_pos as usize) {
                *entry = new_index;
            }
        }
    }
}

/// Detach `observer` from every source it currently reads.
pub(crate) fn disconnect_all(rt: &Runtime, observer: ObserverId) {
    let edges: SmallVec<[(SourceRef, i32); 4]> = {
        let mut observers = rt.observers.borrow_mut();
        let Some(slot) = observers.get_mut(observer.0) else {
            return;
        };
        let mut edges = SmallVec::new();
        if let Some(sref) = slot.source1.take() {
            edges.push((sref, slot.source1_slot));
            slot.source1_slot = -1;
        }
        edges.extend(slot.sources.drain(..).zip(slot.source_slots.drain(..)));
        edges
    };
    for (sref, slot) in edges {
        remove_edge(rt, sref, slot, observer);
    }
}

/// Walk every edge in the graph and panic if any back-index does not lead
/// back to its originating entry. Debugging aid; the integration tests lean
/// on it to pin the slot encoding down.
pub fn check_subscription_bijection() {
    crate::runtime::with_runtime(|rt| {
        let observers = rt.observers.borrow();
        let sources = rt.sources.borrow();

        let observer_entry = |id: ObserverId, pos: i32| -> Option<(SourceRef, i32)> {
            let slot = observers.get(id.0)?;
            if pos == -1 {
                slot.source1.map(|s| (s, slot.source1_slot))
            } else {
                let idx = pos as usize;
                Some((*slot.sources.get(idx)?, *slot.source_slots.get(idx)?))
            }
        };

        let check_sub = |sref: SourceRef, sub: &Subscription| {
            let mut entries: Vec<(ObserverId, i32, i32)> = Vec::new();
            if let Some((o, pos)) = sub.primary {
                entries.push((o, pos, -1));
            }
            for (i, (&o, &pos)) in sub.observers.iter().zip(sub.slots.iter()).enumerate() {
                entries.push((o, pos, i as i32));
            }
            for (observer, pos, own_index) in entries {
                let Some((back_sref, back_index)) = observer_entry(observer, pos) else {
                    panic!("subscription points at a missing observer entry");
                };
                assert!(
                    back_sref == sref && back_index == own_index,
                    "slot indices do not form a bijection: expected ({sref:?}, {own_index}), \
                     found ({back_sref:?}, {back_index})"
                );
            }
        };

        for (id, slot) in sources.iter_ids() {
            check_sub(SourceRef::Source(SourceId(id)), &slot.sub);
        }
        for (id, slot) in observers.iter_ids() {
            check_sub(SourceRef::Observer(ObserverId(id)), &slot.sub);
        }
    });
}
