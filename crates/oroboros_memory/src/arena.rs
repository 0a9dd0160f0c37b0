//! # Generational Arena
//!
//! Slot storage addressed by generation-checked indices.
//!
//! Pools keep their slabs here and size-class allocators keep their raw
//! blocks here. Removing a value and releasing the memory it owns are two
//! separate steps: `remove` hands the value back to the caller, who decides
//! what to do with its buffers.
//!
//! ```text
//! slots:     [ gen 3: Some(a) | gen 1: None | gen 7: Some(b) ]
//! free_list: [ 1 ]
//! ```
//!
//! A stale index (its generation is behind the slot's) never resolves.

/// Index into an [`Arena`], packing a slot index and its generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaIndex {
    index: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Returns the slot index.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the generation the slot had when the value was inserted.
    #[inline]
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generation-checked slot storage.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    /// Free slot indices, reused last-in first-out.
    free_list: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// Returns the number of live values.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no values are live.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores a value and returns its index.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return ArenaIndex {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ArenaIndex {
            index,
            generation: 0,
        }
    }

    /// Removes a value. Returns None if the index is stale.
    pub fn remove(&mut self, idx: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(idx.index as usize)?;
        if slot.generation != idx.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(idx.index);
        self.len -= 1;
        Some(value)
    }

    /// Gets a reference to a live value.
    #[inline]
    #[must_use]
    pub fn get(&self, idx: ArenaIndex) -> Option<&T> {
        let slot = self.slots.get(idx.index as usize)?;
        if slot.generation == idx.generation {
            slot.value.as_ref()
        } else {
            None
        }
    }

    /// Gets a mutable reference to a live value.
    #[inline]
    pub fn get_mut(&mut self, idx: ArenaIndex) -> Option<&mut T> {
        let slot = self.slots.get_mut(idx.index as usize)?;
        if slot.generation == idx.generation {
            slot.value.as_mut()
        } else {
            None
        }
    }

    /// Returns true if the index resolves to a live value.
    #[inline]
    #[must_use]
    pub fn contains(&self, idx: ArenaIndex) -> bool {
        self.get(idx).is_some()
    }

    /// Removes every value, invalidating all outstanding indices.
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(u32::try_from(index).unwrap_or(u32::MAX));
                drained.push(value);
            }
        }
        self.len = 0;
        drained
    }

    /// Iterates over all live values.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    ArenaIndex {
                        index: u32::try_from(index).unwrap_or(u32::MAX),
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}
