//! Per-type handle allocation with generation recycling.

use tether_wire::ObjectHandle;

/// Allocates `(id, generation)` handles for one object type.
///
/// Ids start at 1 and are recycled through a free list; each reuse carries a
/// bumped generation, so no two live handles ever share `(id, generation)`
/// and a released handle can be told apart from the slot's next occupant.
/// Reservations (handles with no server object yet) come from the same id
/// space, so a reserved id can never collide with a live one.
#[derive(Debug, Default)]
pub(crate) struct HandleAllocator {
    /// Generation to use for the *next* allocation of each id, indexed by
    /// `id - 1`.
    generations: Vec<u32>,
    free: Vec<u32>,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> ObjectHandle {
        match self.free.pop() {
            Some(id) => ObjectHandle::new(id, self.generations[(id - 1) as usize]),
            None => {
                self.generations.push(0);
                ObjectHandle::new(self.generations.len() as u32, 0)
            }
        }
    }

    /// Returns the id to the free list. Fails closed on a stale or unknown
    /// handle so a double release cannot poison the free list.
    pub fn release(&mut self, handle: ObjectHandle) -> bool {
        let Some(slot) = handle
            .id
            .checked_sub(1)
            .and_then(|i| self.generations.get_mut(i as usize))
        else {
            return false;
        };
        if *slot != handle.generation || self.free.contains(&handle.id) {
            return false;
        }
        *slot = slot.wrapping_add(1);
        self.free.push(handle.id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_ids_get_fresh_generations() {
        let mut alloc = HandleAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a.id, b.id);

        assert!(alloc.release(a));
        let c = alloc.allocate();
        assert_eq!(c.id, a.id);
        assert_ne!(c.generation, a.generation);
    }

    #[test]
    fn no_two_live_handles_collide() {
        let mut alloc = HandleAllocator::new();
        let mut live = std::collections::HashSet::new();
        let mut handles = Vec::new();
        for round in 0..8 {
            for _ in 0..16 {
                let h = alloc.allocate();
                assert!(live.insert((h.id, h.generation)), "aliased handle {h:?}");
                handles.push(h);
            }
            // Release every other handle to churn the free list.
            let mut keep = Vec::new();
            for (i, h) in handles.drain(..).enumerate() {
                if (i + round) % 2 == 0 {
                    assert!(alloc.release(h));
                } else {
                    keep.push(h);
                }
            }
            handles = keep;
        }
    }

    #[test]
    fn stale_release_is_rejected() {
        let mut alloc = HandleAllocator::new();
        let a = alloc.allocate();
        assert!(alloc.release(a));
        assert!(!alloc.release(a), "double release must fail closed");
        assert!(!alloc.release(ObjectHandle::new(99, 0)));
    }
}
