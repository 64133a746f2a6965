use crate::identity::Identity;

/// Stable handle to a queue slot.
///
/// The generation is bumped every time a slot is freed, so a handle held
/// across a removal can never dereference a recycled slot; all queue
/// operations reject stale handles instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    prev: Option<u32>,
    next: Option<u32>,
    identity: Option<Identity>,
}

/// Recency order of cache entries, most recently used at the front.
///
/// A doubly-linked list threaded through a slot arena: entries store their
/// [`SlotId`] so the cache gets O(1) move-to-front and O(1) removal without
/// holding raw iterators into the container.
pub struct EvictionQueue {
    slots: Vec<Slot>,
    head: Option<u32>,
    tail: Option<u32>,
    free: Vec<u32>,
    len: usize,
}

impl Default for EvictionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionQueue {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            tail: None,
            free: Vec::new(),
            len: 0,
        }
    }

    fn slot(&self, id: SlotId) -> Option<&Slot> {
        let slot = self.slots.get(id.index as usize)?;
        (slot.generation == id.generation && slot.identity.is_some()).then_some(slot)
    }

    fn link_front(&mut self, index: u32) {
        let old_head = self.head;
        let slot = &mut self.slots[index as usize];
        slot.prev = None;
        slot.next = old_head;
        match old_head {
            Some(h) => self.slots[h as usize].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
    }

    fn link_back(&mut self, index: u32) {
        let old_tail = self.tail;
        let slot = &mut self.slots[index as usize];
        slot.next = None;
        slot.prev = old_tail;
        match old_tail {
            Some(t) => self.slots[t as usize].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let slot = &self.slots[index as usize];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
    }

    pub fn push_front(&mut self, identity: Identity) -> SlotId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    prev: None,
                    next: None,
                    identity: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.slots[index as usize].generation;
        self.slots[index as usize].identity = Some(identity);
        self.link_front(index);
        self.len += 1;
        SlotId { index, generation }
    }

    pub fn remove(&mut self, id: SlotId) -> Option<Identity> {
        self.slot(id)?;
        self.unlink(id.index);
        let slot = &mut self.slots[id.index as usize];
        let identity = slot.identity.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.prev = None;
        slot.next = None;
        self.free.push(id.index);
        self.len -= 1;
        identity
    }

    pub fn move_to_front(&mut self, id: SlotId) -> bool {
        if self.slot(id).is_none() {
            return false;
        }
        self.unlink(id.index);
        self.link_front(id.index);
        true
    }

    pub fn move_to_back(&mut self, id: SlotId) -> bool {
        if self.slot(id).is_none() {
            return false;
        }
        self.unlink(id.index);
        self.link_back(id.index);
        true
    }

    /// Least recently used slot.
    pub fn back(&self) -> Option<SlotId> {
        self.tail.map(|index| SlotId {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// One step from `id` toward the most recently used end.
    pub fn toward_front(&self, id: SlotId) -> Option<SlotId> {
        let slot = self.slot(id)?;
        slot.prev.map(|index| SlotId {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    pub fn get(&self, id: SlotId) -> Option<&Identity> {
        self.slot(id)?.identity.as_ref()
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.slot(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Front (MRU) to back (LRU).
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            queue: self,
            current: self.head,
        }
    }
}

pub struct Iter<'a> {
    queue: &'a EvictionQueue,
    current: Option<u32>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Identity;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.current?;
        let slot = &self.queue.slots[index as usize];
        self.current = slot.next;
        slot.identity.as_ref()
    }
}
