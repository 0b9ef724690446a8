// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An object-caching slab allocator for fixed-size, high-churn workloads.
//!
//! # Design
//!
//! The allocator descends from the slab design introduced in the SunOS 5.4
//! kernel and described in [The Slab Allocator: An Object-Caching Kernel
//! Memory Allocator][1], with the concurrency structure rearranged for
//! user-land threads. Memory for one object size is managed by a [`Cache`],
//! which partitions OS chunks into power-of-two-sized, alignment-equal
//! *slabs*. Each slab holds a fixed number of object slots, a freelist
//! threaded through the free slots themselves, and an atomic inbox for
//! objects freed by threads that do not own the slab.
//!
//! Three tiers keep the common case lock-free:
//!
//! * Every handle (one per thread; handles are made by `clone`) owns an
//!   *active* slab plus partial/full/empty lists of slabs it has claimed.
//!   Allocation is a freelist pop from the active slab, and a free from the
//!   owning thread is a freelist push.
//! * A free from any other thread is a single CAS onto the owning slab's
//!   remote inbox; the owner drains inboxes wholesale the next time it
//!   misses.
//! * A mutex-guarded global pool holds parked empty slabs and the chunk
//!   records. It is touched roughly once per slab's worth of net traffic:
//!   when a handle runs out of local slabs, hoards too many empty ones, or
//!   the pool itself needs another chunk from the OS.
//!
//! Because a slab's size equals its alignment, the free path finds the
//! owning slab by masking the object address; there is no per-object header
//! and no global lookup structure. The space left over in each slab after
//! the header and the object array is recycled as a coloring offset, so
//! successive slabs stagger their object arrays across cache lines.
//!
//! [1]: http://www.usenix.org/publications/library/proceedings/bos94/full_papers/bonwick.ps

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

mod cache;
mod chunks;
mod layout;
mod magazine;
mod slab;
mod sys;

pub use cache::{Cache, CacheBuilder, CacheStats};
pub use layout::SlabLayout;
pub use magazine::MagazineCache;

use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;

/// In-place object constructor hook. Receives a properly-sized, properly-
/// aligned raw slot.
pub type ObjectCtor = unsafe fn(*mut u8);
/// In-place object finalizer hook.
pub type ObjectDtor = unsafe fn(*mut u8);

/// Smallest object size a cache will manage; smaller requests are rounded
/// up. Free slots store a freelist link in their first word, so this can
/// never go below a pointer.
pub const MIN_OBJECT_SIZE: usize = 16;
/// Fewest objects a slab is allowed to hold; slabs grow until this fits.
pub const MIN_OBJECTS_PER_SLAB: usize = 8;
/// Preferred OS chunk size. Slabs larger than this get one slab per chunk.
pub const TARGET_CHUNK_BYTES: usize = 2 << 20;
/// Empty slabs a handle may hoard before returning half to the global pool.
pub const MAX_LOCAL_EMPTY_SLABS: usize = 32;
/// Full-list slabs inspected per scavenge pass.
pub const SCAVENGE_WALK_LIMIT: usize = 64;
/// Misses to skip scavenging for after a fruitless pass.
pub const SCAVENGE_COOLDOWN: usize = 64;
/// Most objects a magazine frontend will hold.
pub const MAGAZINE_CAPACITY: usize = 256;
/// First magazine refill batch; batches double up to the capacity.
pub const MAGAZINE_INITIAL_REFILL: usize = 8;

macro_rules! typed_frontend {
    ($(#[$attr:meta])* $name:ident, $frontend:tt) => {
        $(#[$attr])*
        pub struct $name<T>($frontend, PhantomData<T>);

        impl<T> $name<T> {
            pub fn new() -> $name<T> {
                $name($frontend::for_object_size(mem::size_of::<T>()), PhantomData)
            }

            /// Allocates one `T`-shaped slot.
            ///
            /// # Safety
            /// The slot is uninitialized (or holds whatever the previous
            /// occupant left); the caller must initialize it before use.
            pub unsafe fn alloc(&mut self) -> NonNull<T> {
                self.0.alloc().cast()
            }

            /// # Safety
            /// Same contract as [`Cache::free`].
            pub unsafe fn free(&mut self, obj: NonNull<T>) {
                self.0.free(obj.cast())
            }
        }

        impl<T> Default for $name<T> {
            fn default() -> $name<T> {
                $name::new()
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> $name<T> {
                $name(self.0.clone(), PhantomData)
            }
        }

        unsafe impl<T> Send for $name<T> {}
    };
}

impl Cache {
    fn for_object_size(size: usize) -> Cache {
        Cache::new(size)
    }
}

impl MagazineCache {
    fn for_object_size(size: usize) -> MagazineCache {
        MagazineCache::new(Cache::new(size))
    }
}

typed_frontend!(
    /// A [`Cache`] handle that deals in `T`-shaped slots.
    TypedCache,
    Cache
);
typed_frontend!(
    /// A [`MagazineCache`] that deals in `T`-shaped slots.
    TypedMagazine,
    MagazineCache
);
