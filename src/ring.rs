/// Fixed-capacity circular buffer addressed by slot index.
///
/// Slots are stable for the lifetime of an element: the slot returned by
/// [`RingBuffer::push_back`] keeps addressing the same element until it is
/// popped from the front.
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be > 0");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
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

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Slot holding the oldest element.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Slot the next pushed element will occupy.
    pub fn tail(&self) -> usize {
        (self.head + self.len) % self.slots.len()
    }

    /// Appends an element, returning its slot or handing the element back when full.
    pub fn push_back(&mut self, item: T) -> Result<usize, T> {
        if self.is_full() {
            return Err(item);
        }
        let slot = self.tail();
        self.slots[slot] = Some(item);
        self.len += 1;
        Ok(slot)
    }

    pub fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        item
    }

    pub fn front(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    /// Whether `slot` currently lies inside the active window.
    pub fn contains_slot(&self, slot: usize) -> bool {
        let cap = self.slots.len();
        slot < cap && (slot + cap - self.head) % cap < self.len
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        if !self.contains_slot(slot) {
            return None;
        }
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        if !self.contains_slot(slot) {
            return None;
        }
        self.slots[slot].as_mut()
    }

    /// Iterates `(slot, element)` pairs from the head towards the tail.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.iter_from(self.head)
    }

    /// Like [`RingBuffer::iter`] but starting at `slot`; empty when `slot` is
    /// outside the active window.
    pub fn iter_from(&self, slot: usize) -> impl Iterator<Item = (usize, &T)> + '_ {
        let cap = self.slots.len();
        let start = if self.contains_slot(slot) {
            (slot + cap - self.head) % cap
        } else {
            self.len
        };
        (start..self.len).filter_map(move |step| {
            let slot = (self.head + step) % cap;
            self.slots[slot].as_ref().map(|item| (slot, item))
        })
    }

    /// Drops every element, returning them in FIFO order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(item) = self.pop_front() {
            drained.push(item);
        }
        drained
    }
}
