//! Fixed-capacity FIFO that overwrites its oldest element when full.

/// Index-based ring buffer (array + head + len).
#[derive(Debug, Clone)]
pub struct Ring<T> {
    // ---
    slots: Vec<Option<T>>,

    /// Index of the oldest element
    head: usize,

    len: usize,
}

impl<T> Ring<T> {
    // ---
    /// Creates a ring holding at most `capacity` elements (at least 1).
    pub fn new(capacity: usize) -> Self {
        // ---
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `value`, evicting and returning the oldest one when full.
    pub fn push_back(&mut self, value: T) -> Option<T> {
        // ---
        let capacity = self.capacity();
        if self.len < capacity {
            let idx = (self.head + self.len) % capacity;
            self.slots[idx] = Some(value);
            self.len += 1;
            return None;
        }

        let evicted = self.slots[self.head].replace(value);
        self.head = (self.head + 1) % capacity;
        evicted
    }

    /// Most recently pushed element.
    pub fn last(&self) -> Option<&T> {
        // ---
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.len - 1) % self.capacity();
        self.slots[idx].as_ref()
    }

    /// Iterates from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        // ---
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % capacity].as_ref())
    }

    pub fn clear(&mut self) {
        // ---
        self.slots.iter_mut().for_each(|s| *s = None);
        self.head = 0;
        self.len = 0;
    }
}
