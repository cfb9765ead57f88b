//! Per-process handle table
//!
//! A handle packs a slot index in bits 0-14 and a linear id in bits 15-29.
//! The linear id changes on every allocation, so a closed handle never
//! resolves to a later object in the same slot.

use super::object::{EventId, PortId, ProcessId, SessionId, ThreadId};
use super::result::KernelError;

/// Always refers to the calling thread
pub const CURRENT_THREAD: u32 = 0xFFFF_8000;
/// Always refers to the calling process
pub const CURRENT_PROCESS: u32 = 0xFFFF_8001;

const INDEX_BITS: u32 = 15;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const MAX_LINEAR_ID: u16 = 0x7FFF;

/// Kernel object a handle refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KObjectRef {
    Thread(ThreadId),
    Process(ProcessId),
    WritableEvent(EventId),
    ReadableEvent(EventId),
    ClientSession(SessionId),
    ServerSession(SessionId),
    ServerPort(PortId),
    ClientPort(PortId),
}

#[derive(Clone, Copy)]
struct Entry {
    linear_id: u16,
    object: KObjectRef,
}

pub struct HandleTable {
    entries: Vec<Option<Entry>>,
    free: Vec<u32>,
    capacity: usize,
    count: usize,
    next_linear_id: u16,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        HandleTable {
            entries: Vec::new(),
            free: Vec::new(),
            capacity: capacity.min(INDEX_MASK as usize),
            count: 0,
            next_linear_id: 1,
        }
    }

    pub fn add(&mut self, object: KObjectRef) -> Result<u32, KernelError> {
        if self.count >= self.capacity {
            return Err(KernelError::OutOfHandles);
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(None);
                (self.entries.len() - 1) as u32
            }
        };
        let linear_id = self.next_linear_id;
        self.next_linear_id = if linear_id >= MAX_LINEAR_ID { 1 } else { linear_id + 1 };
        self.entries[index as usize] = Some(Entry { linear_id, object });
        self.count += 1;
        Ok(((linear_id as u32) << INDEX_BITS) | index)
    }

    fn slot(&self, handle: u32) -> Option<usize> {
        let index = (handle & INDEX_MASK) as usize;
        let linear_id = (handle >> INDEX_BITS) as u16;
        if handle >> 30 != 0 || linear_id == 0 {
            return None;
        }
        match self.entries.get(index)? {
            Some(entry) if entry.linear_id == linear_id => Some(index),
            _ => None,
        }
    }

    pub fn get(&self, handle: u32) -> Option<KObjectRef> {
        self.slot(handle).and_then(|i| self.entries[i].map(|e| e.object))
    }

    pub fn remove(&mut self, handle: u32) -> Option<KObjectRef> {
        let index = self.slot(handle)?;
        let entry = self.entries[index].take()?;
        self.free.push(index as u32);
        self.count -= 1;
        Some(entry.object)
    }

    /// Handle currently naming `object`, if any
    pub fn find(&self, object: KObjectRef) -> Option<u32> {
        self.entries.iter().enumerate().find_map(|(i, e)| match e {
            Some(e) if e.object == object => Some(((e.linear_id as u32) << INDEX_BITS) | i as u32),
            _ => None,
        })
    }

    /// Empty the table, returning every object that was open
    pub fn drain(&mut self) -> Vec<KObjectRef> {
        let objects = self.entries.iter_mut().filter_map(|e| e.take()).map(|e| e.object).collect();
        self.entries.clear();
        self.free.clear();
        self.count = 0;
        objects
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::object::Arena;

    fn event() -> KObjectRef {
        let mut arena: Arena<EventId, ()> = Arena::new();
        KObjectRef::ReadableEvent(arena.insert(()))
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut table = HandleTable::new(8);
        let obj = event();
        let h = table.add(obj).unwrap();
        assert_ne!(h, 0);
        assert_eq!(table.get(h), Some(obj));
        assert_eq!(table.remove(h), Some(obj));
        let h2 = table.add(obj).unwrap();
        // Same slot, new linear id
        assert_eq!(h & INDEX_MASK, h2 & INDEX_MASK);
        assert_ne!(h, h2);
        assert_eq!(table.get(h), None);
        assert_eq!(table.remove(h), None);
        assert_eq!(table.get(h2), Some(obj));
    }

    #[test]
    fn test_capacity() {
        let mut table = HandleTable::new(2);
        let obj = event();
        table.add(obj).unwrap();
        let h = table.add(obj).unwrap();
        assert_eq!(table.add(obj), Err(KernelError::OutOfHandles));
        table.remove(h);
        assert!(table.add(obj).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_pseudo_handles_do_not_resolve() {
        let mut table = HandleTable::new(4);
        table.add(event()).unwrap();
        assert_eq!(table.get(CURRENT_THREAD), None);
        assert_eq!(table.get(CURRENT_PROCESS), None);
        assert_eq!(table.get(0), None);
    }

    #[test]
    fn test_find_and_drain() {
        let mut table = HandleTable::new(4);
        let mut threads: Arena<ThreadId, ()> = Arena::new();
        let t = KObjectRef::Thread(threads.insert(()));
        let h = table.add(t).unwrap();
        assert_eq!(table.find(t), Some(h));
        assert_eq!(table.drain(), vec![t]);
        assert!(table.is_empty());
    }
}
