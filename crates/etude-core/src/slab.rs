// src/slab.rs

/// Most slots a slab can hold. Indices must stay clear of the reactor's
/// reserved tokens, whose low 32 bits are all ones or all ones but the last.
pub const MAX_CAPACITY: usize = u32::MAX as usize - 1;

/// Stable handle to a slab slot. The generation is bumped every time the
/// slot is freed, so an id held past its connection's lifetime (a late
/// epoll event, a timer) no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub index: u32,
    pub generation: u32,
}

impl ConnId {
    /// Pack into the 64-bit epoll user data.
    #[inline(always)]
    pub fn token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    #[inline(always)]
    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Free { next: Option<usize> },
    Occupied(T),
}

struct Entry<T> {
    generation: u32,
    slot: Slot<T>,
}

/// Fixed-capacity table with an intrusive free list.
///
/// Slots are created lazily up to `capacity`; freed slots are reused LIFO.
pub struct ConnectionSlab<T> {
    entries: Vec<Entry<T>>,
    head_free: Option<usize>,
    active_count: usize,
    capacity: usize,
}

impl<T> ConnectionSlab<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= MAX_CAPACITY, "slab capacity must fit in a u32 index");
        Self {
            entries: Vec::new(),
            head_free: None,
            active_count: 0,
            capacity,
        }
    }

    /// O(1) allocation. `make` receives the id the value will live under.
    /// Returns `None` when the slab is full.
    pub fn allocate(&mut self, make: impl FnOnce(ConnId) -> T) -> Option<ConnId> {
        let index = match self.head_free {
            Some(index) => index,
            None if self.entries.len() < self.capacity => {
                self.entries.push(Entry {
                    generation: 0,
                    slot: Slot::Free { next: None },
                });
                self.entries.len() - 1
            }
            None => return None,
        };

        let entry = &mut self.entries[index];
        let Slot::Free { next } = entry.slot else {
            unreachable!("free list points at an occupied slot");
        };
        self.head_free = next;

        let id = ConnId {
            index: index as u32,
            generation: entry.generation,
        };
        entry.slot = Slot::Occupied(make(id));
        self.active_count += 1;
        Some(id)
    }

    /// O(1) deallocation. Returns the value if `id` was still live.
    pub fn remove(&mut self, id: ConnId) -> Option<T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation || matches!(entry.slot, Slot::Free { .. }) {
            return None;
        }

        let old = std::mem::replace(
            &mut entry.slot,
            Slot::Free {
                next: self.head_free,
            },
        );
        entry.generation = entry.generation.wrapping_add(1);
        self.head_free = Some(id.index as usize);
        self.active_count -= 1;

        match old {
            Slot::Occupied(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    #[inline(always)]
    pub fn get(&self, id: ConnId) -> Option<&T> {
        match self.entries.get(id.index as usize)? {
            Entry {
                generation,
                slot: Slot::Occupied(value),
            } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut T> {
        match self.entries.get_mut(id.index as usize)? {
            Entry {
                generation,
                slot: Slot::Occupied(value),
            } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Ids of every live slot.
    pub fn ids(&self) -> Vec<ConnId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e.slot, Slot::Occupied(_)))
            .map(|(i, e)| ConnId {
                index: i as u32,
                generation: e.generation,
            })
            .collect()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
