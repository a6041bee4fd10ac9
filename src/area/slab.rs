//! Generational slab - stable indices with stale-handle detection

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Vector of slots reused through a free list
#[derive(Debug)]
pub(crate) struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Slab<T> {
    /// Store a value, returning its (index, generation)
    pub(crate) fn insert(&mut self, value: T) -> (u32, u32) {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none());
            slot.value = Some(value);
            (index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            (index, 0)
        }
    }

    pub(crate) fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        Some(value)
    }

    #[inline]
    pub(crate) fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_ref())
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        self.slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_mut())
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Live entries with their (index, generation)
    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, u32, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (index as u32, slot.generation, value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_slot_invalidates_old_handle() {
        let mut slab = Slab::default();
        let (index, generation) = slab.insert("first");
        assert_eq!(slab.remove(index, generation), Some("first"));

        let (index2, generation2) = slab.insert("second");
        assert_eq!(index2, index);
        assert_ne!(generation2, generation);
        assert!(slab.get(index, generation).is_none());
        assert_eq!(slab.get(index2, generation2), Some(&"second"));
    }

    #[test]
    fn double_remove_is_rejected() {
        let mut slab = Slab::default();
        let (index, generation) = slab.insert(7);
        assert!(slab.remove(index, generation).is_some());
        assert!(slab.remove(index, generation).is_none());
        assert_eq!(slab.len(), 0);
    }

    #[test]
    fn iter_skips_free_slots() {
        let mut slab = Slab::default();
        let a = slab.insert(1);
        let _b = slab.insert(2);
        slab.remove(a.0, a.1);
        let values: Vec<_> = slab.iter().map(|(_, _, v)| *v).collect();
        assert_eq!(values, vec![2]);
    }
}
