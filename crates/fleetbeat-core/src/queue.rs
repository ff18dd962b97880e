//! Growable ring buffer.
//!
//! Never drops an entry: a full buffer doubles its capacity instead of
//! overwriting. Not synchronised; wrap it in a lock to share it.

/// FIFO ring buffer over a slot vector.
///
/// Invariants: `len <= capacity`, `head < capacity` (or `head == 0` when the
/// capacity is zero), and the `len` slots starting at `head` (wrapping) are
/// exactly the queued entries in enqueue order.
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: empty_slots(capacity),
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index of the oldest entry in the backing store.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Append at the tail, doubling the capacity first when full.
    pub fn enqueue(&mut self, item: T) {
        if self.len == self.capacity() {
            let grown = (self.capacity() * 2).max(1);
            self.relocate(grown);
        }
        let tail = (self.head + self.len) % self.capacity();
        debug_assert!(self.slots[tail].is_none());
        self.slots[tail] = Some(item);
        self.len += 1;
    }

    /// Remove and return the oldest entry.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }

    /// Drop every entry. Capacity is unchanged.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }

    /// Change capacity to `capacity`, or to `len` if that is larger. Entries
    /// are kept and moved to start at index 0.
    pub fn resize(&mut self, capacity: usize) {
        self.relocate(capacity.max(self.len));
    }

    /// Remove every entry in FIFO order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(item) = self.dequeue() {
            out.push(item);
        }
        out
    }

    fn relocate(&mut self, capacity: usize) {
        let mut slots = empty_slots(capacity);
        let old_capacity = self.capacity();
        for (i, slot) in slots.iter_mut().enumerate().take(self.len) {
            *slot = self.slots[(self.head + i) % old_capacity].take();
        }
        self.slots = slots;
        self.head = 0;
    }
}

fn empty_slots<T>(capacity: usize) -> Vec<Option<T>> {
    std::iter::repeat_with(|| None).take(capacity).collect()
}
