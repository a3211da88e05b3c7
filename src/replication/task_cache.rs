//! Outbound Task Buffer Cache
//!
//! A fixed-size free list of preallocated buffers for the fan-out write
//! path. Checkout never blocks: an empty cache returns `None` and the
//! caller defers the rest of its work to the next drain pass. Checked-out
//! values ride in a [`Pooled`] handle that knows its owning cache, so any
//! holder can route the value home without knowing where it came from.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Anything that can take a task buffer back
pub trait TaskOwner<T>: Send + Sync {
    /// Return a value to the owner
    fn gc(&self, value: T);
}

/// Fixed-size cache of preallocated values
pub struct TaskCache<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Send + 'static> TaskCache<T> {
    /// Preallocate `count` values built by `init`
    pub fn new(count: usize, init: impl Fn() -> T) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..count).map(|_| init()).collect()),
            capacity: count,
        })
    }

    /// Check out a value, or `None` when the cache is drained
    pub fn get(self: &Arc<Self>) -> Option<Pooled<T>> {
        let value = self.free.lock().pop()?;
        Some(Pooled {
            value: Some(value),
            owner: Arc::clone(self),
        })
    }

    /// Check whether `pooled` was checked out of this cache
    pub fn contains(self: &Arc<Self>, pooled: &Pooled<T>) -> bool {
        Arc::ptr_eq(self, &pooled.owner)
    }

    /// Values currently available for checkout
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Total values owned by the cache
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn put(&self, value: T) {
        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity);
        free.push(value);
    }
}

impl<T: Send + 'static> TaskOwner<T> for TaskCache<T> {
    fn gc(&self, value: T) {
        self.put(value);
    }
}

/// A checked-out value that returns itself to its owning cache on drop
pub struct Pooled<T: Send + 'static> {
    value: Option<T>,
    owner: Arc<TaskCache<T>>,
}

impl<T: Send + 'static> Pooled<T> {
    /// The cache this value came from
    pub fn owner(&self) -> &Arc<TaskCache<T>> {
        &self.owner
    }

    /// Detach the value from its handle. The caller becomes responsible
    /// for routing it back through [`TaskOwner::gc`].
    pub fn detach(mut self) -> T {
        self.value.take().expect("pooled value taken")
    }
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value taken")
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value taken")
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.owner.gc(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_and_return() {
        let cache: Arc<TaskCache<Vec<u8>>> = TaskCache::new(2, Vec::new);
        assert_eq!(cache.available(), 2);

        let mut a = cache.get().unwrap();
        a.push(1);
        let _b = cache.get().unwrap();
        assert_eq!(cache.available(), 0);

        // Drained cache applies backpressure
        assert!(cache.get().is_none());

        drop(a);
        assert_eq!(cache.available(), 1);
    }

    #[test]
    fn test_provenance() {
        let cache_a: Arc<TaskCache<Vec<u8>>> = TaskCache::new(1, Vec::new);
        let cache_b: Arc<TaskCache<Vec<u8>>> = TaskCache::new(1, Vec::new);

        let pooled = cache_a.get().unwrap();
        assert!(cache_a.contains(&pooled));
        assert!(!cache_b.contains(&pooled));

        // The value goes home to a, not b
        drop(pooled);
        assert_eq!(cache_a.available(), 1);
        assert_eq!(cache_b.available(), 1);
    }

    #[test]
    fn test_detach_and_gc() {
        let cache: Arc<TaskCache<Vec<u8>>> = TaskCache::new(1, Vec::new);

        let pooled = cache.get().unwrap();
        let owner: Arc<dyn TaskOwner<Vec<u8>>> = Arc::clone(pooled.owner()) as _;
        let value = pooled.detach();
        assert_eq!(cache.available(), 0);

        // A detached value comes home through the owner capability
        owner.gc(value);
        assert_eq!(cache.available(), 1);
    }
}
