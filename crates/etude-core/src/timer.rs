// src/timer.rs
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

/// Action run when a timer expires. Receives the owner's context mutably, so
/// the callback never needs a reference back into the heap itself.
pub type TimerCallback<C> = Box<dyn FnOnce(&mut C)>;

struct TimerEntry<K, C> {
    id: K,
    expiry: Instant,
    callback: TimerCallback<C>,
}

/// Indexed binary min-heap of expiry instants.
///
/// `index` maps every id to its current slot in `heap`, so adjusting or
/// cancelling an arbitrary timer is O(log n) instead of a linear scan.
pub struct TimerHeap<K, C> {
    heap: Vec<TimerEntry<K, C>>,
    index: HashMap<K, usize>,
}

impl<K, C> TimerHeap<K, C>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: K) -> bool {
        self.index.contains_key(&id)
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.first().map(|e| e.expiry)
    }

    /// Schedule `callback` for `id` at `expiry`. An id that is already
    /// scheduled has both its expiry and its callback replaced.
    pub fn insert(&mut self, id: K, expiry: Instant, callback: TimerCallback<C>) {
        if let Some(&i) = self.index.get(&id) {
            let entry = &mut self.heap[i];
            entry.expiry = expiry;
            entry.callback = callback;
            self.resift(i);
            return;
        }

        let i = self.heap.len();
        self.heap.push(TimerEntry {
            id,
            expiry,
            callback,
        });
        self.index.insert(id, i);
        self.sift_up(i);
    }

    /// Move an existing timer to a new expiry. Returns false if `id` is not
    /// scheduled.
    pub fn adjust(&mut self, id: K, expiry: Instant) -> bool {
        let Some(&i) = self.index.get(&id) else {
            return false;
        };
        self.heap[i].expiry = expiry;
        self.resift(i);
        true
    }

    /// Drop the timer for `id` without running its callback.
    pub fn cancel(&mut self, id: K) -> bool {
        let Some(&i) = self.index.get(&id) else {
            return false;
        };
        drop(self.remove_at(i));
        true
    }

    /// Pop and run every timer with `expiry <= now`, earliest first.
    /// Returns how many fired.
    pub fn sweep(&mut self, now: Instant, ctx: &mut C) -> usize {
        let mut fired = 0;
        while self.heap.first().is_some_and(|e| e.expiry <= now) {
            let entry = self.remove_at(0);
            (entry.callback)(ctx);
            fired += 1;
        }
        fired
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn remove_at(&mut self, i: usize) -> TimerEntry<K, C> {
        let last = self.heap.len() - 1;
        if i != last {
            self.swap(i, last);
        }
        let entry = match self.heap.pop() {
            Some(entry) => entry,
            None => unreachable!("remove_at on empty heap"),
        };
        self.index.remove(&entry.id);
        if i < self.heap.len() {
            self.resift(i);
        }
        entry
    }

    fn resift(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) -> bool {
        let start = i;
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expiry <= self.heap[i].expiry {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
        i != start
    }

    fn sift_down(&mut self, mut i: usize) -> bool {
        let start = i;
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.heap[right].expiry < self.heap[left].expiry {
                right
            } else {
                left
            };
            if self.heap[i].expiry <= self.heap[child].expiry {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i != start
    }

    #[inline]
    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id, a);
        self.index.insert(self.heap[b].id, b);
    }
}

impl<K, C> Default for TimerHeap<K, C>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
