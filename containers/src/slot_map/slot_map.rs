use crate::error::ContainerErrors;
use crate::prelude::{DefaultSlot, SlotWithGeneration};

/// Proxy index of a slot whose generations are exhausted. It is never handed out again
const RETIRED: u64 = 0xFFFFFFFF;

/// Dense slot map. Elements live contiguously in `data`, while handles address an
/// indirection slot which records where the element currently sits and which generation
/// it belongs to.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotMap<T, S: SlotWithGeneration = DefaultSlot<T>> {
    // u64 is a reference back to the proxy slot index
    pub(crate) data: Vec<(T, u64)>,
    pub(crate) slots: Vec<S>,
    pub(crate) free_list: Vec<u64>,
}

impl<T, S: SlotWithGeneration> Default for SlotMap<T, S> {
    fn default() -> Self {
        Self {
            data: Default::default(),
            slots: Default::default(),
            free_list: Default::default(),
        }
    }
}

impl<T, S: SlotWithGeneration> SlotMap<T, S> {
    pub fn insert(&mut self, element: T) -> S {
        // find the next free slot for indirect
        let free_slot_index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.slots.push(S::new_with_gen(0, 0));
                (self.slots.len() - 1) as u64
            }
        };
        let data_index = self.data.len() as u64;
        let free_slot = &mut self.slots[free_slot_index as usize];
        // update index the inner slot will point to
        free_slot.set_id(data_index);
        let generation = free_slot.generation();
        self.data.push((element, free_slot_index));

        S::new_with_gen(free_slot_index, generation)
    }

    /// Resolve a handle to the index of its element inside `data`
    fn resolve(&self, slot: &S) -> Result<usize, ContainerErrors> {
        let proxy_slot = self
            .slots
            .get(slot.id() as usize)
            .ok_or(ContainerErrors::NonexistentSlot)?;
        if proxy_slot.id() == RETIRED {
            return Err(ContainerErrors::NonexistentSlot);
        }
        if proxy_slot.generation() != slot.generation() {
            return Err(ContainerErrors::GenerationMismatch);
        }
        Ok(proxy_slot.id() as usize)
    }

    pub fn remove(&mut self, slot: S) -> Result<T, ContainerErrors> {
        let data_index = self.resolve(&slot)?;
        // increment generation so outstanding handles go stale
        let proxy_slot = &mut self.slots[slot.id() as usize];
        let exhausted = proxy_slot.generation() >= S::MAX_GENERATION;
        if !exhausted {
            proxy_slot.set_generation(proxy_slot.generation() + 1);
        }

        // swap with the last so the removed element can be popped
        let last_index = self.data.len() - 1;
        if data_index != last_index {
            self.data.swap(last_index, data_index);
            // since we swapped, we must update the indirect to point to the new data index
            let swapped_proxy = self.data[data_index].1;
            self.slots[swapped_proxy as usize].set_id(data_index as u64);
        }
        let (element, _) = self
            .data
            .pop()
            .ok_or(ContainerErrors::NonexistentSlot)?;
        if exhausted {
            self.slots[slot.id() as usize].set_id(RETIRED);
        } else {
            self.free_list.push(slot.id());
        }
        Ok(element)
    }

    pub fn get(&self, slot: S) -> Option<&T> {
        self.resolve(&slot)
            .ok()
            .and_then(|index| self.data.get(index))
            .map(|data| &data.0)
    }

    pub fn get_mut(&mut self, slot: S) -> Option<&mut T> {
        let index = self.resolve(&slot).ok()?;
        self.data.get_mut(index).map(|data| &mut data.0)
    }

    pub fn contains(&self, slot: S) -> bool {
        self.resolve(&slot).is_ok()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Rebuild the live handle addressing proxy slot `proxy_index`
    fn handle_at(&self, proxy_index: u64) -> S {
        S::new_with_gen(proxy_index, self.slots[proxy_index as usize].generation())
    }

    /// Iterate over every live element alongside the handle which addresses it
    pub fn iter(&self) -> impl Iterator<Item = (S, &T)> + '_ {
        self.data
            .iter()
            .map(|(element, proxy)| (self.handle_at(*proxy), element))
    }

    /// Live handles, in storage order
    pub fn handles(&self) -> Vec<S> {
        self.data
            .iter()
            .map(|(_, proxy)| self.handle_at(*proxy))
            .collect()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.data.iter_mut().map(|(element, _)| element)
    }
}
