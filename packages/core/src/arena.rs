//! Generation-checked slab arenas for reactive nodes.
//!
//! Sources and observers form a cyclic graph (owner ↔ owned, source ↔
//! observer), so they live in arenas and refer to each other by index. Slab
//! slots are reused after disposal; every slot carries a generation counter
//! and every handle carries the generation it was minted with, so a handle
//! that outlives its node is detected instead of silently reading whatever
//! moved into the slot.

use slab::Slab;

/// Raw `(index, generation)` pair shared by all handle types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RawId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Handle to a writable source cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub(crate) RawId);

/// Handle to an observer node (memo, effect, root, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) RawId);

struct Entry<T> {
    generation: u32,
    value: T,
}

pub(crate) struct Arena<T> {
    slots: Slab<Entry<T>>,
    // bumped every time a slot is vacated so reused slots mint fresh handles
    next_generation: u32,
}

impl<T> Arena<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            next_generation: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> RawId {
        let generation = self.next_generation;
        let index = self.slots.insert(Entry { generation, value }) as u32;
        RawId { index, generation }
    }

    pub(crate) fn get(&self, id: RawId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .map(|entry| &entry.value)
    }

    pub(crate) fn get_mut(&mut self, id: RawId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .map(|entry| &mut entry.value)
    }

    pub(crate) fn contains(&self, id: RawId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn remove(&mut self, id: RawId) -> Option<T> {
        match self.slots.get(id.index as usize) {
            Some(entry) if entry.generation == id.generation => {
                self.next_generation = self.next_generation.wrapping_add(1);
                Some(self.slots.remove(id.index as usize).value)
            }
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn iter_ids(&self) -> impl Iterator<Item = (RawId, &T)> {
        self.slots.iter().map(|(index, entry)| {
            (
                RawId {
                    index: index as u32,
                    generation: entry.generation,
                },
                &entry.value,
            )
        })
    }
}
