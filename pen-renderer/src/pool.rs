//! Fixed-capacity slot table keyed by caller-chosen handles.
//!
//! The pool never picks slots itself; the renderer's callers pre-assign
//! them. Backing storage grows lazily up to the capacity fixed at
//! construction and never beyond it.

use std::fmt;

use thiserror::Error;

pub const DEFAULT_POOL_CAPACITY: usize = 4096;

/// Opaque index of a resource slot. Stable for the resource's lifetime and
/// reusable once the resource is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceHandle(pub u32);

impl ResourceHandle {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for ResourceHandle {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("Slot {slot} is outside the pool capacity of {capacity}")]
    OutOfRange {
        slot: ResourceHandle,
        capacity: usize,
    },

    #[error("Slot {0} already holds a resource")]
    Occupied(ResourceHandle),

    #[error("Slot {0} is empty")]
    Vacant(ResourceHandle),
}

pub struct ResourcePool<T> {
    slots: Vec<Option<T>>,
    capacity: usize,
    live: usize,
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("capacity", &self.capacity)
            .field("live", &self.live)
            .field("allocated_slots", &self.slots.len())
            .finish()
    }
}

impl<T> ResourcePool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn check_range(&self, slot: ResourceHandle) -> Result<usize, PoolError> {
        let index = slot.index();
        if index >= self.capacity {
            return Err(PoolError::OutOfRange {
                slot,
                capacity: self.capacity,
            });
        }
        Ok(index)
    }

    pub fn insert(&mut self, slot: ResourceHandle, value: T) -> Result<(), PoolError> {
        let index = self.check_range(slot)?;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        let entry = &mut self.slots[index];
        if entry.is_some() {
            return Err(PoolError::Occupied(slot));
        }
        *entry = Some(value);
        self.live += 1;
        Ok(())
    }

    /// Succeeds if `slot` is in range and free, so callers can fail before
    /// building the resource.
    pub fn check_vacant(&self, slot: ResourceHandle) -> Result<(), PoolError> {
        self.check_range(slot)?;
        if self.contains(slot) {
            return Err(PoolError::Occupied(slot));
        }
        Ok(())
    }

    pub fn contains(&self, slot: ResourceHandle) -> bool {
        self.slots
            .get(slot.index())
            .is_some_and(Option::is_some)
    }

    pub fn get(&self, slot: ResourceHandle) -> Result<&T, PoolError> {
        let index = self.check_range(slot)?;
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(PoolError::Vacant(slot))
    }

    pub fn get_mut(&mut self, slot: ResourceHandle) -> Result<&mut T, PoolError> {
        let index = self.check_range(slot)?;
        self.slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(PoolError::Vacant(slot))
    }

    /// Remove and return the resource at `slot`, leaving it free for reuse.
    pub fn take(&mut self, slot: ResourceHandle) -> Result<T, PoolError> {
        let index = self.check_range(slot)?;
        let value = self
            .slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(PoolError::Vacant(slot))?;
        self.live -= 1;
        Ok(value)
    }

    /// Swap the live resource at `slot` for `value`, returning the old one.
    pub fn replace(&mut self, slot: ResourceHandle, value: T) -> Result<T, PoolError> {
        let entry = self.get_mut(slot)?;
        Ok(std::mem::replace(entry, value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceHandle, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (ResourceHandle(i as u32), v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ResourceHandle, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, v)| v.as_mut().map(|v| (ResourceHandle(i as u32), v)))
    }

    /// Remove every resource, in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        self.live = 0;
        std::mem::take(&mut self.slots)
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let mut pool = ResourcePool::with_capacity(16);
        for slot in 0..16 {
            pool.insert(ResourceHandle(slot), slot * 10).unwrap();
        }
        for slot in 0..16 {
            assert_eq!(*pool.get(ResourceHandle(slot)).unwrap(), slot * 10);
        }
        assert_eq!(pool.len(), 16);
    }

    #[test]
    fn storage_grows_lazily() {
        let mut pool = ResourcePool::with_capacity(DEFAULT_POOL_CAPACITY);
        assert!(pool.slots.is_empty());
        pool.insert(ResourceHandle(100), ()).unwrap();
        assert_eq!(pool.slots.len(), 101);
        assert!(pool.contains(ResourceHandle(100)));
        assert!(!pool.contains(ResourceHandle(99)));
        assert!(!pool.contains(ResourceHandle(5000)));
    }

    #[test]
    fn capacity_is_a_hard_limit() {
        let mut pool = ResourcePool::with_capacity(DEFAULT_POOL_CAPACITY);
        for slot in 0..DEFAULT_POOL_CAPACITY as u32 {
            pool.insert(ResourceHandle(slot), slot).unwrap();
        }
        let err = pool
            .insert(ResourceHandle(DEFAULT_POOL_CAPACITY as u32), 0)
            .unwrap_err();
        assert_eq!(
            err,
            PoolError::OutOfRange {
                slot: ResourceHandle(4096),
                capacity: 4096,
            }
        );
        assert_eq!(pool.len(), DEFAULT_POOL_CAPACITY);
        assert!(matches!(
            pool.get(ResourceHandle(4096)),
            Err(PoolError::OutOfRange { .. })
        ));
    }

    #[test]
    fn occupied_slot_is_rejected() {
        let mut pool = ResourcePool::with_capacity(4);
        pool.insert(ResourceHandle(1), "a").unwrap();
        assert_eq!(
            pool.insert(ResourceHandle(1), "b"),
            Err(PoolError::Occupied(ResourceHandle(1)))
        );
        assert_eq!(*pool.get(ResourceHandle(1)).unwrap(), "a");
    }

    #[test]
    fn check_vacant_matches_insert() {
        let mut pool = ResourcePool::with_capacity(4);
        assert_eq!(pool.check_vacant(ResourceHandle(3)), Ok(()));
        pool.insert(ResourceHandle(3), ()).unwrap();
        assert_eq!(
            pool.check_vacant(ResourceHandle(3)),
            Err(PoolError::Occupied(ResourceHandle(3)))
        );
        assert!(matches!(
            pool.check_vacant(ResourceHandle(4)),
            Err(PoolError::OutOfRange { .. })
        ));
    }

    #[test]
    fn double_take_reports_vacant() {
        let mut pool = ResourcePool::with_capacity(4);
        pool.insert(ResourceHandle(2), 7).unwrap();
        assert_eq!(pool.take(ResourceHandle(2)), Ok(7));
        assert_eq!(
            pool.take(ResourceHandle(2)),
            Err(PoolError::Vacant(ResourceHandle(2)))
        );
        assert!(pool.is_empty());
        pool.insert(ResourceHandle(2), 8).unwrap();
        assert_eq!(*pool.get(ResourceHandle(2)).unwrap(), 8);
    }

    #[test]
    fn replace_needs_a_live_slot() {
        let mut pool = ResourcePool::with_capacity(4);
        assert_eq!(
            pool.replace(ResourceHandle(0), 1),
            Err(PoolError::Vacant(ResourceHandle(0)))
        );
        pool.insert(ResourceHandle(0), 1).unwrap();
        assert_eq!(pool.replace(ResourceHandle(0), 2), Ok(1));
        assert_eq!(*pool.get(ResourceHandle(0)).unwrap(), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn iteration_and_drain_follow_slot_order() {
        let mut pool = ResourcePool::with_capacity(8);
        pool.insert(ResourceHandle(5), 'b').unwrap();
        pool.insert(ResourceHandle(1), 'a').unwrap();
        let seen: Vec<_> = pool.iter().map(|(h, v)| (h.0, *v)).collect();
        assert_eq!(seen, vec![(1, 'a'), (5, 'b')]);
        assert_eq!(pool.drain(), vec!['a', 'b']);
        assert!(pool.is_empty());
    }
}
