use std::sync::Mutex;

use crate::hash::hash32;

/// Shard count of each table. The shard index is `hash32(key) % HASH_SHARDS`.
pub(crate) const HASH_SHARDS: usize = 65_536;

/// Sentinel slot index: "no slot".
pub(crate) const NIL: u32 = u32::MAX;

/// Intrusive list linkage, as slot indices within one shard's arena.
/// A detached node points to itself.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Link {
    pub next: u32,
    pub prev: u32,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            next: NIL,
            prev: NIL,
        }
    }
}

pub(crate) trait Node {
    fn link(&self) -> &Link;
    fn link_mut(&mut self) -> &mut Link;
}

/// Generation-checked reference to a call entry. Holding one accounts a
/// reference on the entry; a recycled slot bumps its generation so stale
/// handles simply fail to resolve.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct CallHandle {
    pub shard: u32,
    pub slot: u32,
    pub gen: u32,
}

/// Generation-checked reference to a registration binding.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct RegHandle {
    pub shard: u32,
    pub slot: u32,
    pub gen: u32,
}

struct Slot<T> {
    gen: u32,
    val: Option<T>,
}

/// One shard's storage: a slot arena with an intrusive doubly-linked
/// list threaded through it. Slots are reused LIFO; each reuse bumps the
/// slot generation. The arena itself is not synchronized; the owning
/// shard mutex is.
pub(crate) struct Arena<T: Node> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: u32,
    /// Entries currently linked into the list.
    pub count: u32,
}

impl<T: Node> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            count: 0,
        }
    }

    /// Store `val` in a slot and link it at the list head. Returns the
    /// slot index and its generation.
    pub(crate) fn insert_head(&mut self, val: T) -> (u32, u32) {
        let idx = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize].val = Some(val);
                i
            }
            None => {
                self.slots.push(Slot { gen: 0, val: Some(val) });
                (self.slots.len() - 1) as u32
            }
        };

        let old_head = self.head;
        {
            let link = self.at_mut(idx).link_mut();
            link.next = old_head;
            link.prev = NIL;
        }
        if old_head != NIL {
            self.at_mut(old_head).link_mut().prev = idx;
        }
        self.head = idx;
        self.count += 1;

        (idx, self.slots[idx as usize].gen)
    }

    /// Detach a slot from the list. The node is left pointing at itself,
    /// the conventional detached shape.
    pub(crate) fn unlink(&mut self, idx: u32) {
        let Link { next, prev } = *self.at(idx).link();
        debug_assert!(next != idx, "unlink of a detached slot");

        if prev != NIL {
            self.at_mut(prev).link_mut().next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.at_mut(next).link_mut().prev = prev;
        }

        let link = self.at_mut(idx).link_mut();
        link.next = idx;
        link.prev = idx;
        self.count -= 1;
    }

    pub(crate) fn is_linked(&self, idx: u32) -> bool {
        self.at(idx).link().next != idx
    }

    /// Recycle a slot, bumping its generation, and hand the value back
    /// so the caller can return its buffers outside the shard lock.
    pub(crate) fn free_slot(&mut self, idx: u32) -> T {
        debug_assert!(!self.is_linked(idx), "freeing a linked slot");
        let slot = &mut self.slots[idx as usize];
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(idx);
        match slot.val.take() {
            Some(v) => v,
            None => panic!("double free of arena slot {idx}"),
        }
    }

    pub(crate) fn gen_of(&self, idx: u32) -> u32 {
        self.slots[idx as usize].gen
    }

    /// Resolve a (slot, generation) pair; stale generations get None.
    pub(crate) fn get_mut(&mut self, idx: u32, gen: u32) -> Option<&mut T> {
        let slot = self.slots.get_mut(idx as usize)?;
        if slot.gen != gen {
            return None;
        }
        slot.val.as_mut()
    }

    /// Direct slot access; the index must name an occupied slot.
    pub(crate) fn at(&self, idx: u32) -> &T {
        match self.slots[idx as usize].val.as_ref() {
            Some(v) => v,
            None => panic!("access to a freed arena slot {idx}"),
        }
    }

    pub(crate) fn at_mut(&mut self, idx: u32) -> &mut T {
        match self.slots[idx as usize].val.as_mut() {
            Some(v) => v,
            None => panic!("access to a freed arena slot {idx}"),
        }
    }

    /// Indices of linked slots, list order (most recently inserted
    /// first). Collected, so the caller may mutate while walking.
    pub(crate) fn list_indices(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.count as usize);
        let mut i = self.head;
        while i != NIL {
            out.push(i);
            i = self.at(i).link().next;
        }
        out
    }
}

/// Aggregated table occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub entries: u64,
    /// Smallest / largest per-shard entry count, for skew diagnostics.
    pub shard_min: u32,
    pub shard_max: u32,
}

/// A sharded table: a fixed array of mutex-protected arenas.
pub(crate) struct Table<T: Node> {
    pub shards: Box<[Mutex<Arena<T>>]>,
}

impl<T: Node> Table<T> {
    pub(crate) fn new() -> Self {
        let shards: Vec<_> = (0..HASH_SHARDS).map(|_| Mutex::new(Arena::new())).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn shard_idx(key: &[u8]) -> usize {
        hash32(key) as usize % HASH_SHARDS
    }

    pub(crate) fn stats(&self) -> TableStats {
        let mut s = TableStats {
            shard_min: u32::MAX,
            ..Default::default()
        };
        for shard in self.shards.iter() {
            let count = shard.lock().unwrap().count;
            s.entries += count as u64;
            s.shard_min = s.shard_min.min(count);
            s.shard_max = s.shard_max.max(count);
        }
        s
    }
}
