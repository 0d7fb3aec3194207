//! Generational arena of shared objects.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed handle into an [`Arena`]. A handle to a removed object never
/// resolves to a newer object that reuses the slot.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the handle into a single word.
    pub fn to_raw(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`Handle::to_raw`].
    pub fn from_raw(raw: u64) -> Self {
        Self::new(raw as u32, (raw >> 32) as u32)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_raw().hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

/// Slot arena owning `Arc<T>` objects.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Stores `value`, reusing a free slot when one exists.
    pub fn insert(&mut self, value: Arc<T>) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    /// Object behind `handle`, unless it was removed.
    pub fn get(&self, handle: Handle<T>) -> Option<Arc<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.clone())
    }

    /// True while `handle` resolves.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Removes the object and retires the handle.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<Arc<T>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    /// Live objects.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no object is live.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live objects with their handles, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &Arc<T>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert(Arc::new(10u32));
        let b = arena.insert(Arc::new(20u32));
        assert_eq!(arena.len(), 2);
        assert_eq!(*arena.get(a).unwrap(), 10);
        assert_eq!(*arena.remove(b).unwrap(), 20);
        assert!(arena.get(b).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_stale_handle_does_not_alias() {
        let mut arena = Arena::new();
        let old = arena.insert(Arc::new("old"));
        arena.remove(old);
        let new = arena.insert(Arc::new("new"));
        assert_eq!(old.index(), new.index());
        assert!(arena.get(old).is_none());
        assert!(arena.remove(old).is_none());
        assert_eq!(*arena.get(new).unwrap(), "new");
    }

    #[test]
    fn test_raw_round_trip() {
        let handle: Handle<u8> = Handle::new(7, 3);
        assert_eq!(Handle::<u8>::from_raw(handle.to_raw()), handle);
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut arena = Arena::new();
        let a = arena.insert(Arc::new(1));
        let _b = arena.insert(Arc::new(2));
        arena.remove(a);
        let values: Vec<i32> = arena.iter().map(|(_, v)| **v).collect();
        assert_eq!(values, vec![2]);
        assert!(!arena.is_empty());
    }
}
