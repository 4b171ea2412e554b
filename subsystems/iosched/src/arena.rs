//! Descriptor arena.
//!
//! Descriptors live in generation-checked slots; every index in the elevator
//! stores [`RequestHandle`]s into this arena rather than owning copies.

use alloc::vec::Vec;

use crate::error::{IoSchedError, IoSchedResult, InvariantViolation};
use crate::request::{Request, RequestHandle};

struct Slot {
    generation: u32,
    request: Option<Request>,
}

/// Bounded arena of descriptors
pub struct RequestArena {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
    capacity: usize,
}

impl RequestArena {
    /// Create an arena holding at most `capacity` live descriptors
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            live: 0,
            capacity,
        }
    }

    /// Store a descriptor.
    ///
    /// Fails with [`IoSchedError::Exhausted`] when the arena is full; the
    /// caller retries after completions free slots.
    pub fn insert(&mut self, request: Request) -> IoSchedResult<RequestHandle> {
        if self.live >= self.capacity {
            return Err(IoSchedError::Exhausted);
        }

        let handle = if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.request = Some(request);
            RequestHandle::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                request: Some(request),
            });
            RequestHandle::new(index, 0)
        };

        self.live += 1;
        Ok(handle)
    }

    /// Free a descriptor, returning it
    pub fn remove(&mut self, handle: RequestHandle) -> Option<Request> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let request = slot.request.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index());
        self.live -= 1;
        Some(request)
    }

    /// Look up a live descriptor
    #[inline]
    pub fn get(&self, handle: RequestHandle) -> Option<&Request> {
        let slot = self.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.request.as_ref()
    }

    /// Look up a live descriptor mutably
    #[inline]
    pub fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut Request> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.request.as_mut()
    }

    /// Descriptor that must exist; a stale handle here is a bug
    #[inline]
    pub fn rq(&self, handle: RequestHandle) -> &Request {
        match self.get(handle) {
            Some(rq) => rq,
            None => missing(handle),
        }
    }

    /// Mutable descriptor that must exist
    #[inline]
    pub fn rq_mut(&mut self, handle: RequestHandle) -> &mut Request {
        match self.get_mut(handle) {
            Some(rq) => rq,
            None => missing(handle),
        }
    }

    /// Whether the handle names a live descriptor
    #[inline]
    pub fn contains(&self, handle: RequestHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live descriptors
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no descriptor is live
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Maximum number of live descriptors
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the live-descriptor bound (never drops live entries)
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Iterate live descriptors
    pub fn iter(&self) -> impl Iterator<Item = (RequestHandle, &Request)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.request
                .as_ref()
                .map(|rq| (RequestHandle::new(index as u32, slot.generation), rq))
        })
    }

    /// Handles of every live descriptor
    pub fn handles(&self) -> Vec<RequestHandle> {
        self.iter().map(|(h, _)| h).collect()
    }
}

impl core::fmt::Debug for RequestArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RequestArena")
            .field("live", &self.live)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cold]
fn missing(handle: RequestHandle) -> ! {
    log::error!(
        "iosched: stale request handle {}:{}",
        handle.index(),
        handle.generation()
    );
    panic!("iosched: {}", InvariantViolation::MissingReference);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Bio;

    fn rq(sector: u64) -> Request {
        Request::from_bio(&Bio::write(1, sector, 8), 0)
    }

    #[test]
    fn test_insert_and_remove() {
        let mut arena = RequestArena::new(4);
        let a = arena.insert(rq(0)).unwrap();
        let b = arena.insert(rq(8)).unwrap();
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.rq(b).sector, 8);

        let removed = arena.remove(a).unwrap();
        assert_eq!(removed.sector, 0);
        assert!(!arena.contains(a));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut arena = RequestArena::new(4);
        let a = arena.insert(rq(0)).unwrap();
        arena.remove(a);
        let b = arena.insert(rq(16)).unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());
    }

    #[test]
    fn test_exhaustion_is_retryable() {
        let mut arena = RequestArena::new(1);
        let a = arena.insert(rq(0)).unwrap();
        let err = arena.insert(rq(8)).unwrap_err();
        assert_eq!(err, IoSchedError::Exhausted);
        arena.remove(a);
        assert!(arena.insert(rq(8)).is_ok());
    }

    #[test]
    #[should_panic]
    fn test_rq_on_stale_handle_panics() {
        let mut arena = RequestArena::new(1);
        let a = arena.insert(rq(0)).unwrap();
        arena.remove(a);
        let _ = arena.rq(a);
    }
}
