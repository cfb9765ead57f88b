//! Index arenas for kernel objects
//!
//! Objects refer to each other by typed generational ids instead of
//! pointers, so a stale id held past an object's lifetime resolves to
//! nothing rather than to whatever reused the slot.

use serde::{Deserialize, Serialize};

pub trait ArenaKey: Copy + Eq {
    fn from_parts(index: u32, generation: u32) -> Self;
    fn index(self) -> u32;
    fn generation(self) -> u32;
}

macro_rules! arena_key {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {$(
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl ArenaKey for $name {
            #[inline]
            fn from_parts(index: u32, generation: u32) -> Self {
                $name { index, generation }
            }

            #[inline]
            fn index(self) -> u32 {
                self.index
            }

            #[inline]
            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}.{}", stringify!($name), self.index, self.generation)
            }
        }
    )*};
}

arena_key!(
    /// Kernel thread
    ThreadId,
    /// Kernel process
    ProcessId,
    /// Event pair (writable and readable ends share one object)
    EventId,
    /// IPC session pair
    SessionId,
    /// IPC port pair
    PortId,
);

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct Arena<K, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _key: std::marker::PhantomData<K>,
}

impl<K: ArenaKey, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, T> Arena<K, T> {
    pub fn new() -> Self {
        Arena { slots: Vec::new(), free: Vec::new(), len: 0, _key: std::marker::PhantomData }
    }

    pub fn insert(&mut self, value: T) -> K {
        self.insert_with(|_| value)
    }

    /// Insert a value that needs to know its own id
    pub fn insert_with(&mut self, f: impl FnOnce(K) -> T) -> K {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let key = K::from_parts(index, slot.generation);
            slot.value = Some(f(key));
            return key;
        }
        let index = self.slots.len() as u32;
        let key = K::from_parts(index, 0);
        self.slots.push(Slot { generation: 0, value: Some(f(key)) });
        key
    }

    pub fn get(&self, key: K) -> Option<&T> {
        self.slots
            .get(key.index() as usize)
            .filter(|slot| slot.generation == key.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.slots
            .get_mut(key.index() as usize)
            .filter(|slot| slot.generation == key.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: K) -> Option<T> {
        let slot = self.slots.get_mut(key.index() as usize)?;
        if slot.generation != key.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index());
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|v| (K::from_parts(i as u32, slot.generation), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let generation = slot.generation;
            slot.value.as_mut().map(|v| (K::from_parts(i as u32, generation), v))
        })
    }

    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(k, _)| k).collect()
    }
}

/// Signalable event
#[derive(Debug)]
pub struct KEvent {
    pub owner: ProcessId,
    pub signaled: bool,
    /// Open handles to either end
    pub refs: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_key_misses() {
        let mut arena: Arena<EventId, u32> = Arena::new();
        let a = arena.insert(1);
        assert_eq!(arena.remove(a), Some(1));
        let b = arena.insert(2);
        assert_eq!(a.index(), b.index());
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&2));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_insert_with_sees_own_key() {
        let mut arena: Arena<ThreadId, ThreadId> = Arena::new();
        let key = arena.insert_with(|k| k);
        assert_eq!(arena.get(key), Some(&key));
    }
}
