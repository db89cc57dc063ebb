/// Opaque handle into a [`Slab`]; stale handles never resolve to a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlabHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct SlabEntry<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity arena with a free-index stack.
#[derive(Debug)]
pub struct Slab<T> {
    entries: Vec<SlabEntry<T>>,
    free: Vec<u32>,
}

impl<T> Slab<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "slab capacity must be > 0");
        let capacity = capacity.min(u32::MAX as usize);
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || SlabEntry {
            generation: 0,
            value: None,
        });
        // Lowest index on top so allocation order is deterministic.
        let free = (0..capacity as u32).rev().collect();
        Self { entries, free }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Stores `value`, handing it back when every slot is taken.
    pub fn insert(&mut self, value: T) -> Result<SlabHandle, T> {
        let Some(index) = self.free.pop() else {
            return Err(value);
        };
        let entry = &mut self.entries[index as usize];
        entry.value = Some(value);
        Ok(SlabHandle {
            index,
            generation: entry.generation,
        })
    }

    pub fn get(&self, handle: SlabHandle) -> Option<&T> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: SlabHandle) -> Option<&mut T> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    pub fn remove(&mut self, handle: SlabHandle) -> Option<T> {
        let entry = self.entries.get_mut(handle.index as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(value)
    }

    /// Iterates live entries with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (SlabHandle, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry.value.as_ref().map(|value| {
                (
                    SlabHandle {
                        index: index as u32,
                        generation: entry.generation,
                    },
                    value,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_freed_slots_with_new_generation() {
        let mut slab = Slab::with_capacity(2);
        let a = slab.insert("a").unwrap();
        let b = slab.insert("b").unwrap();
        assert!(slab.is_full());
        assert_eq!(slab.insert("c"), Err("c"));
        assert_eq!(slab.remove(a), Some("a"));
        let c = slab.insert("c").unwrap();
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.get(c), Some(&"c"));
        assert_eq!(slab.get(b), Some(&"b"));
        assert_eq!(slab.len(), 2);
    }

    #[test]
    fn stale_handles_cannot_remove_new_occupant() {
        let mut slab = Slab::with_capacity(1);
        let first = slab.insert(1).unwrap();
        slab.remove(first);
        let second = slab.insert(2).unwrap();
        assert_eq!(slab.remove(first), None);
        assert_eq!(slab.get(second), Some(&2));
    }
}
