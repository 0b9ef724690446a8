//! A batching frontend layered over a cache handle.
//!
//! A magazine is a bounded stack of object pointers sitting in front of a
//! [`Cache`]. Allocations pop the stack and frees push it, so a
//! mostly-balanced workload touches no slab bookkeeping at all. When the
//! stack runs dry the magazine refills it in a batch from the underlying
//! handle, doubling the batch each time up to the magazine's capacity; when
//! a free would overflow it, half the magazine is returned in one pass.
//!
//! Magazines cache raw slots with no notion of object state, so they refuse
//! caches that carry constructor or destructor hooks; the hook contract is
//! per-operation and a magazine exists to elide operations.

use core::ptr::NonNull;

use crate::cache::Cache;
use crate::{MAGAZINE_CAPACITY, MAGAZINE_INITIAL_REFILL};

pub struct MagazineCache {
    cache: Cache,
    stack: Vec<*mut u8>,
    /// Next refill batch size; doubles per refill up to the capacity.
    refill: usize,
}

unsafe impl Send for MagazineCache {}

impl MagazineCache {
    /// Wraps a cache handle in a magazine.
    ///
    /// Panics if the cache has hooks installed.
    pub fn new(cache: Cache) -> MagazineCache {
        assert!(
            !cache.has_hooks(),
            "magazine frontends do not support object hooks"
        );
        MagazineCache {
            cache,
            stack: Vec::with_capacity(MAGAZINE_CAPACITY),
            refill: MAGAZINE_INITIAL_REFILL,
        }
    }

    pub fn object_size(&self) -> usize {
        self.cache.object_size()
    }

    #[inline]
    pub fn alloc(&mut self) -> NonNull<u8> {
        match self.stack.pop() {
            // the magazine only ever holds pointers returned by alloc
            Some(obj) => unsafe { NonNull::new_unchecked(obj) },
            None => self.refill_then_alloc(),
        }
    }

    /// # Safety
    /// Same contract as [`Cache::free`].
    #[inline]
    pub unsafe fn free(&mut self, obj: NonNull<u8>) {
        if self.stack.len() == MAGAZINE_CAPACITY {
            self.flush_half();
        }
        self.stack.push(obj.as_ptr());
    }

    #[cold]
    fn refill_then_alloc(&mut self) -> NonNull<u8> {
        let batch = self.refill;
        self.refill = (self.refill * 2).min(MAGAZINE_CAPACITY);
        for _ in 0..batch - 1 {
            let obj = self.cache.alloc();
            self.stack.push(obj.as_ptr());
        }
        self.cache.alloc()
    }

    #[cold]
    fn flush_half(&mut self) {
        let keep = MAGAZINE_CAPACITY / 2;
        for obj in self.stack.drain(keep..) {
            unsafe { self.cache.free(NonNull::new_unchecked(obj)) };
        }
    }

    #[cfg(test)]
    fn stacked(&self) -> usize {
        self.stack.len()
    }
}

impl Clone for MagazineCache {
    /// A new magazine (initially unloaded) over a new handle to the same
    /// cache.
    fn clone(&self) -> MagazineCache {
        MagazineCache::new(self.cache.clone())
    }
}

impl Drop for MagazineCache {
    fn drop(&mut self) {
        for obj in self.stack.drain(..) {
            unsafe { self.cache.free(NonNull::new_unchecked(obj)) };
        }
    }
}
