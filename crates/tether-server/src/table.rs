//! Generation-checked object table.
//!
//! One table per object type maps `(id, generation)` handles coming off the
//! wire to server records. The table is an arena of slots indexed by
//! `id - 1`: a slot remembers the generation of its current (or last)
//! occupant, so a stale handle can never alias a reused id, and every lookup
//! fails closed — invalid id, wrong generation, and vacant slot all come back
//! as "not found".

use tether_wire::ObjectHandle;

/// Upper bound on wire-supplied ids; keeps a hostile client from making the
/// arena allocate gigabytes by sending one huge id.
pub const MAX_OBJECT_ID: u32 = 1 << 20;

enum SlotState<T> {
    Vacant,
    Occupied { value: T, refs: u32 },
}

struct Slot<T> {
    /// Generation of the current occupant; once the slot is vacated, the
    /// smallest generation the next occupant may carry.
    generation: u32,
    state: SlotState<T>,
}

pub struct ObjectTable<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Default for ObjectTable<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> ObjectTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `value` to `handle` with one strong reference. Used both for
    /// wire-driven creation and for injection of pre-existing objects; fails
    /// if the id is out of range, already live, or the generation would step
    /// backwards behind one this table has already seen for the id.
    pub fn insert(&mut self, handle: ObjectHandle, value: T) -> bool {
        if handle.id == 0 || handle.id > MAX_OBJECT_ID {
            return false;
        }
        let index = (handle.id - 1) as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || Slot {
                generation: 0,
                state: SlotState::Vacant,
            });
        }
        let slot = &mut self.slots[index];
        match slot.state {
            SlotState::Occupied { .. } => false,
            SlotState::Vacant => {
                if handle.generation < slot.generation {
                    return false;
                }
                slot.generation = handle.generation;
                slot.state = SlotState::Occupied { value, refs: 1 };
                true
            }
        }
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&T> {
        let slot = self.slot(handle)?;
        match &slot.state {
            SlotState::Occupied { value, .. } => Some(value),
            SlotState::Vacant => None,
        }
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut T> {
        let index = self.live_index(handle)?;
        match &mut self.slots[index].state {
            SlotState::Occupied { value, .. } => Some(value),
            SlotState::Vacant => None,
        }
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn add_ref(&mut self, handle: ObjectHandle) -> bool {
        let Some(index) = self.live_index(handle) else {
            return false;
        };
        match &mut self.slots[index].state {
            SlotState::Occupied { refs, .. } => {
                *refs += 1;
                true
            }
            SlotState::Vacant => false,
        }
    }

    /// Drops one strong reference. Returns the value only when the last
    /// reference is gone — the caller issues exactly one backend teardown off
    /// that. The vacated slot's generation is bumped so the released handle
    /// can never resolve again.
    pub fn release(&mut self, handle: ObjectHandle) -> Option<Option<T>> {
        let index = self.live_index(handle)?;
        let slot = &mut self.slots[index];
        match &mut slot.state {
            SlotState::Occupied { refs, .. } if *refs > 1 => {
                *refs -= 1;
                Some(None)
            }
            SlotState::Occupied { .. } => {
                let state = std::mem::replace(&mut slot.state, SlotState::Vacant);
                slot.generation = slot.generation.wrapping_add(1);
                match state {
                    SlotState::Occupied { value, .. } => Some(Some(value)),
                    SlotState::Vacant => unreachable!(),
                }
            }
            SlotState::Vacant => None,
        }
    }

    /// Vacates every slot, returning the values (disconnect teardown).
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        for slot in &mut self.slots {
            let state = std::mem::replace(&mut slot.state, SlotState::Vacant);
            if let SlotState::Occupied { value, .. } = state {
                slot.generation = slot.generation.wrapping_add(1);
                values.push(value);
            }
        }
        values
    }

    fn slot(&self, handle: ObjectHandle) -> Option<&Slot<T>> {
        let index = handle.id.checked_sub(1)? as usize;
        let slot = self.slots.get(index)?;
        (slot.generation == handle.generation).then_some(slot)
    }

    fn live_index(&self, handle: ObjectHandle) -> Option<usize> {
        let index = handle.id.checked_sub(1)? as usize;
        let slot = self.slots.get(index)?;
        if slot.generation != handle.generation {
            return None;
        }
        matches!(slot.state, SlotState::Occupied { .. }).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_fails_closed() {
        let mut table = ObjectTable::new();
        let old = ObjectHandle::new(1, 0);
        assert!(table.insert(old, "a"));
        assert_eq!(table.release(old), Some(Some("a")));
        assert_eq!(table.get(old), None);

        // The client reuses the id with a bumped generation.
        let new = ObjectHandle::new(1, 1);
        assert!(table.insert(new, "b"));
        assert_eq!(table.get(old), None, "stale handle must not alias");
        assert_eq!(table.get(new), Some(&"b"));
    }

    #[test]
    fn regressed_generation_cannot_reoccupy_a_slot() {
        let mut table = ObjectTable::new();
        assert!(table.insert(ObjectHandle::new(1, 3), "a"));
        table.release(ObjectHandle::new(1, 3));
        assert!(!table.insert(ObjectHandle::new(1, 2), "b"));
        assert!(!table.insert(ObjectHandle::new(1, 3), "b"));
        assert!(table.insert(ObjectHandle::new(1, 4), "b"));
    }

    #[test]
    fn refcounts_release_value_exactly_once() {
        let mut table = ObjectTable::new();
        let h = ObjectHandle::new(2, 0);
        assert!(table.insert(h, "x"));
        assert!(table.add_ref(h));
        assert_eq!(table.release(h), Some(None));
        assert_eq!(table.release(h), Some(Some("x")));
        assert_eq!(table.release(h), None, "double release fails closed");
    }

    #[test]
    fn oversized_and_null_ids_are_rejected() {
        let mut table = ObjectTable::new();
        assert!(!table.insert(ObjectHandle::new(0, 0), "a"));
        assert!(!table.insert(ObjectHandle::new(MAX_OBJECT_ID + 1, 0), "a"));
        assert!(table.insert(ObjectHandle::new(MAX_OBJECT_ID, 0), "a"));
    }

    #[test]
    fn drain_vacates_everything() {
        let mut table = ObjectTable::new();
        table.insert(ObjectHandle::new(1, 0), 1u32);
        table.insert(ObjectHandle::new(5, 2), 2u32);
        let mut drained = table.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(table.get(ObjectHandle::new(1, 0)), None);
    }
}
