// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The cache core: one allocator per object size.
//!
//! A cache is split into two tiers. `CacheShared` is the cross-thread half:
//! the geometry, the object hooks, and a mutex-guarded pool of parked empty
//! slabs together with the chunk records that back them. `Cache` is the
//! handle half: it owns a private `Context` holding the active slab and the
//! partial/full/empty lists, and it is the only thing that ever touches
//! them. Handles are cheap to clone and `Send`; a thread that wants to use a
//! cache clones a handle and keeps it, which is what gives every thread its
//! own context without a lock or a TLS lookup on the hot path.
//!
//! The allocation fast path is a freelist pop from the active slab. On a
//! miss the handle works down a ladder: drain the active slab's remote
//! inbox, promote a partial slab, promote a locally parked empty slab,
//! scavenge the full list for remote frees, and only then take the global
//! lock to fetch a parked slab (mapping a fresh chunk if the pool is dry).
//!
//! Frees check the owner. The owning handle pushes straight onto the local
//! freelist and handles list transitions; any other thread CASes the object
//! onto the slab's remote inbox and walks away. The owner reconciles inboxes
//! lazily, at miss time.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::chunks::{self, Chunk};
use crate::layout::SlabLayout;
use crate::slab::{self, SlabHeader, SlabList};
use crate::{ObjectCtor, ObjectDtor};
use crate::{MAX_LOCAL_EMPTY_SLABS, SCAVENGE_COOLDOWN, SCAVENGE_WALK_LIMIT};

/// Builder for a [`Cache`].
///
/// The plain constructor covers hook-less caches; hooks are installed
/// through `unsafe` builder methods because the allocator will invoke them
/// on raw slot memory and cannot check what they do.
pub struct CacheBuilder {
    obj_size: usize,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
}

impl CacheBuilder {
    pub fn new(obj_size: usize) -> CacheBuilder {
        CacheBuilder {
            obj_size,
            ctor: None,
            dtor: None,
        }
    }

    /// Installs a constructor hook.
    ///
    /// With a constructor and no destructor, the hook runs once per slot
    /// when a slab is initialized and never again: freed objects are cached
    /// as-is and handed back still constructed (except for the first
    /// pointer-sized word of the slot, which the freelist borrows while the
    /// object is free). With both hooks installed, the constructor runs on
    /// every allocation instead.
    ///
    /// # Safety
    /// `ctor` must be sound to call on any properly-sized, properly-aligned
    /// raw slot.
    pub unsafe fn constructor(mut self, ctor: ObjectCtor) -> CacheBuilder {
        self.ctor = Some(ctor);
        self
    }

    /// Installs a destructor hook, which runs on every free.
    ///
    /// # Safety
    /// `dtor` must be sound to call on any object passed to `free`.
    pub unsafe fn destructor(mut self, dtor: ObjectDtor) -> CacheBuilder {
        self.dtor = Some(dtor);
        self
    }

    pub fn build(self) -> Cache {
        let layout = SlabLayout::compute(self.obj_size);
        debug!(
            "cache created: obj_size={} slab_bytes={} capacity={} colors={} pages_per_chunk={}",
            layout.obj_size,
            layout.slab_bytes,
            layout.capacity,
            layout.color_count,
            layout.pages_per_chunk
        );
        Cache {
            shared: Arc::new(CacheShared {
                layout,
                ctor: self.ctor,
                dtor: self.dtor,
                color_cursor: AtomicUsize::new(0),
                pool: Mutex::new(GlobalPool {
                    empty: SlabList::new(),
                    empty_len: 0,
                    chunks: Vec::new(),
                }),
                destroyed: AtomicBool::new(false),
                stats: SharedStats::default(),
            }),
            ctx: Box::new(Context::new()),
        }
    }
}

/// The cross-thread half of a cache.
struct CacheShared {
    layout: SlabLayout,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
    /// Advances once per slab initialization; slabs take the counter value
    /// modulo `color_count` as their color.
    color_cursor: AtomicUsize,
    pool: Mutex<GlobalPool>,
    /// Set by `destroy`; tells late handle drops that slab memory is gone.
    destroyed: AtomicBool,
    stats: SharedStats,
}

/// Everything the global lock protects.
struct GlobalPool {
    empty: SlabList,
    empty_len: usize,
    chunks: Vec<Chunk>,
}

// The pool holds raw slab pointers, but they are only reachable under the
// mutex that wraps it.
unsafe impl Send for GlobalPool {}

impl Drop for CacheShared {
    fn drop(&mut self) {
        if !*self.destroyed.get_mut() {
            let pool = self.pool.get_mut().unwrap();
            debug!("cache dropped: releasing {} chunks", pool.chunks.len());
            unsafe { chunks::release(&mut pool.chunks) };
        }
    }
}

/// The handle half of a cache: the per-thread frontend.
///
/// Clone one handle per thread. A handle is `Send` but deliberately not
/// `Sync`; all operations take `&mut self`.
pub struct Cache {
    shared: Arc<CacheShared>,
    ctx: Box<Context>,
}

unsafe impl Send for Cache {}

/// Thread-private slab bookkeeping. Boxed so its address can serve as the
/// owner identity stamped into claimed slabs; handles move, contexts don't.
struct Context {
    active: *mut SlabHeader,
    partial: SlabList,
    full: SlabList,
    empty: SlabList,
    empty_count: usize,
    /// Misses to skip full-list scavenging for, after a fruitless walk.
    scavenge_cooldown: usize,
    stats: LocalStats,
}

impl Context {
    fn new() -> Context {
        Context {
            active: ptr::null_mut(),
            partial: SlabList::new(),
            full: SlabList::new(),
            empty: SlabList::new(),
            empty_count: 0,
            scavenge_cooldown: 0,
            stats: LocalStats::default(),
        }
    }

    /// The identity foreign frees compare against `SlabHeader::owner`.
    #[inline]
    fn token(&self) -> *mut () {
        self as *const Context as *mut ()
    }

    fn is_idle(&self) -> bool {
        self.active.is_null()
            && self.partial.is_empty()
            && self.full.is_empty()
            && self.empty.is_empty()
    }
}

impl Cache {
    /// A cache for objects of `obj_size` bytes, with no hooks.
    pub fn new(obj_size: usize) -> Cache {
        CacheBuilder::new(obj_size).build()
    }

    /// The rounded-up size objects are actually allocated at.
    pub fn object_size(&self) -> usize {
        self.shared.layout.obj_size
    }

    /// Object slots per slab.
    pub fn slab_capacity(&self) -> usize {
        self.shared.layout.capacity
    }

    pub(crate) fn has_hooks(&self) -> bool {
        self.shared.ctor.is_some() || self.shared.dtor.is_some()
    }

    /// Allocates one object.
    ///
    /// Never returns null: if the OS refuses to map more memory the call
    /// aborts instead (there is no local recovery from exhaustion, and
    /// callers get to skip a check on every allocation for it).
    #[inline]
    pub fn alloc(&mut self) -> NonNull<u8> {
        unsafe {
            let active = self.ctx.active;
            if !active.is_null() {
                let obj = SlabHeader::pop_local(active);
                if !obj.is_null() {
                    (*active).active_count += 1;
                    self.ctx.stats.fast_alloc += 1;
                    return self.finish_alloc(obj);
                }
            }
            self.alloc_slow()
        }
    }

    /// Frees one object previously returned by `alloc` on any handle of
    /// this cache.
    ///
    /// # Safety
    /// `obj` must be live and must have come from this cache. Freeing a
    /// foreign pointer or freeing twice is undefined behavior and is not
    /// detected.
    #[inline]
    pub unsafe fn free(&mut self, obj: NonNull<u8>) {
        let obj = obj.as_ptr();
        if let Some(dtor) = self.shared.dtor {
            dtor(obj);
        }
        let slab = slab::slab_of(obj, self.shared.layout.slab_bytes);
        if SlabHeader::owner(slab) == self.ctx.token() {
            SlabHeader::push_local(slab, obj);
            let was = (*slab).active_count;
            (*slab).active_count = was - 1;
            self.ctx.stats.local_free += 1;
            if slab == self.ctx.active {
                return;
            }
            if was as usize == self.shared.layout.capacity {
                trace!("slab {:?} moved full -> partial", slab);
                slab::unlink(slab);
                self.ctx.partial.push_front(slab);
            } else if was == 1 {
                trace!("slab {:?} moved partial -> empty", slab);
                slab::unlink(slab);
                self.ctx.empty.push_front(slab);
                self.ctx.empty_count += 1;
                if self.ctx.empty_count > MAX_LOCAL_EMPTY_SLABS {
                    self.release_empty_slabs();
                }
            }
        } else {
            SlabHeader::push_remote(slab, obj);
            self.ctx.stats.remote_free += 1;
        }
    }

    /// Allocates `n` objects into `out`. Equivalent to `n` calls to
    /// `alloc`; constructor hooks run per object, in production order.
    pub fn alloc_many(&mut self, n: usize, out: &mut Vec<NonNull<u8>>) {
        out.reserve(n);
        for _ in 0..n {
            let obj = self.alloc();
            out.push(obj);
        }
    }

    /// Frees every object in `objs`. Equivalent to one `free` per element.
    ///
    /// # Safety
    /// Same contract as [`Cache::free`], for every element.
    pub unsafe fn free_many(&mut self, objs: &[NonNull<u8>]) {
        for &obj in objs {
            self.free(obj);
        }
    }

    /// Tears the cache down and releases every backing chunk immediately.
    ///
    /// Must be called with no outstanding objects. Other handles to the same
    /// cache become unusable: their subsequent allocations and frees are
    /// undefined behavior, and their drops turn into no-ops.
    pub fn destroy(self) {
        unsafe {
            self.shared.destroyed.store(true, Ordering::SeqCst);
            let mut pool = self.shared.pool.lock().unwrap();
            let mut stale = std::mem::take(&mut pool.chunks);
            pool.empty = SlabList::new();
            pool.empty_len = 0;
            drop(pool);
            debug!("cache destroyed: releasing {} chunks", stale.len());
            chunks::release(&mut stale);
        }
        // the Drop impl sees the destroyed flag and leaves slab memory alone
    }

    /// Local-stats flush plus a snapshot of the shared counters.
    pub fn stats(&mut self) -> CacheStats {
        self.shared.stats.absorb(&mut self.ctx.stats);
        self.shared.stats.snapshot()
    }

    #[inline]
    unsafe fn finish_alloc(&mut self, obj: *mut u8) -> NonNull<u8> {
        // ctor-on-alloc only applies when a destructor will undo it on free;
        // ctor-only caches construct at slab initialization instead
        if self.shared.dtor.is_some() {
            if let Some(ctor) = self.shared.ctor {
                ctor(obj);
            }
        }
        NonNull::new_unchecked(obj)
    }

    /// Makes `slab` the active slab and allocates from it. The slab must be
    /// detached from every list and have a non-empty local freelist.
    unsafe fn install_active(&mut self, slab: *mut SlabHeader) -> NonNull<u8> {
        debug_assert!(self.ctx.active.is_null());
        debug_assert!(!(*slab).local_head.is_null());
        self.ctx.active = slab;
        let obj = SlabHeader::pop_local(slab);
        (*slab).active_count += 1;
        self.finish_alloc(obj)
    }

    #[cold]
    unsafe fn alloc_slow(&mut self) -> NonNull<u8> {
        // The active slab's local list is dry (or there is no active slab).
        // Reconcile its remote inbox before giving up on it; foreign threads
        // may have handed objects back since the last miss.
        let active = self.ctx.active;
        if !active.is_null() {
            let reclaimed = SlabHeader::reclaim_remote(active);
            if reclaimed > 0 {
                self.shared
                    .stats
                    .remote_reclaimed
                    .fetch_add(reclaimed as u64, Ordering::Relaxed);
                let obj = SlabHeader::pop_local(active);
                (*active).active_count += 1;
                return self.finish_alloc(obj);
            }
            // local and remote both empty: every object is outstanding
            debug_assert_eq!((*active).active_count as usize, self.shared.layout.capacity);
            trace!("retired drained slab {:?} to the full list", active);
            self.ctx.active = ptr::null_mut();
            self.ctx.full.push_back(active);
        }

        // Promote a partial slab.
        if let Some(slab) = self.ctx.partial.pop_front() {
            if (*slab).local_head.is_null() {
                // A partial slab always has local free objects; this arm is
                // pure defense, and the inbox is the only possible source.
                let reclaimed = SlabHeader::reclaim_remote(slab);
                if reclaimed == 0 {
                    self.ctx.full.push_back(slab);
                } else {
                    self.shared
                        .stats
                        .remote_reclaimed
                        .fetch_add(reclaimed as u64, Ordering::Relaxed);
                    self.shared.stats.partial_refills.fetch_add(1, Ordering::Relaxed);
                    trace!("promoted partial slab {:?} to active", slab);
                    return self.install_active(slab);
                }
            } else {
                self.shared.stats.partial_refills.fetch_add(1, Ordering::Relaxed);
                trace!("promoted partial slab {:?} to active", slab);
                return self.install_active(slab);
            }
        }

        // Promote a locally parked empty slab.
        if let Some(slab) = self.ctx.empty.pop_front() {
            self.ctx.empty_count -= 1;
            self.shared.stats.empty_refills.fetch_add(1, Ordering::Relaxed);
            trace!("promoted empty slab {:?} to active", slab);
            return self.install_active(slab);
        }

        // Scavenge the full list for remote frees, oldest slabs first. A
        // fruitless walk arms a cooldown so repeated misses against an
        // all-full, all-quiet list stop paying for the walk.
        // TODO: resume the walk where the previous one stopped instead of
        // rescanning from the tail.
        if self.ctx.scavenge_cooldown > 0 {
            self.ctx.scavenge_cooldown -= 1;
        } else {
            let sentinel = self.ctx.full.sentinel();
            let mut cursor = self.ctx.full.tail();
            let mut walked = 0;
            while cursor != sentinel && walked < SCAVENGE_WALK_LIMIT {
                let prev = (*cursor).prev;
                if SlabHeader::has_remote(cursor) {
                    let reclaimed = SlabHeader::reclaim_remote(cursor);
                    if reclaimed > 0 {
                        self.shared
                            .stats
                            .remote_reclaimed
                            .fetch_add(reclaimed as u64, Ordering::Relaxed);
                        self.shared.stats.scavenge_hits.fetch_add(1, Ordering::Relaxed);
                        trace!(
                            "scavenged {} remote frees off full slab {:?}",
                            reclaimed,
                            cursor
                        );
                        slab::unlink(cursor);
                        return self.install_active(cursor);
                    }
                }
                cursor = prev;
                walked += 1;
            }
            self.ctx.scavenge_cooldown = SCAVENGE_COOLDOWN;
        }

        // Fetch from the global pool, growing it by a chunk if it is dry.
        let slab = {
            let mut pool = self.shared.pool.lock().unwrap();
            let pool = &mut *pool;
            if pool.empty.is_empty() {
                let carved = chunks::grow(
                    &self.shared.layout,
                    &self.shared.color_cursor,
                    &mut pool.empty,
                    &mut pool.chunks,
                    self.ctor_at_init(),
                );
                pool.empty_len += carved;
                self.shared.stats.chunks_mapped.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .stats
                    .slabs_carved
                    .fetch_add(carved as u64, Ordering::Relaxed);
            }
            let slab = pool.empty.pop_front().expect("fresh chunk carved no slabs");
            pool.empty_len -= 1;
            slab
        };
        SlabHeader::set_owner(slab, self.ctx.token());
        self.shared.stats.global_fetches.fetch_add(1, Ordering::Relaxed);
        trace!("claimed slab {:?} from the global pool", slab);
        self.install_active(slab)
    }

    /// Hoarding control: hands half of the locally parked empty slabs back
    /// to the global pool.
    #[cold]
    fn release_empty_slabs(&mut self) {
        let give = self.ctx.empty_count / 2;
        let mut pool = self.shared.pool.lock().unwrap();
        for _ in 0..give {
            let slab = unsafe { self.ctx.empty.pop_front() }.expect("empty_count overstates list");
            unsafe {
                SlabHeader::set_owner(slab, ptr::null_mut());
                pool.empty.push_back(slab);
            }
            pool.empty_len += 1;
        }
        drop(pool);
        self.ctx.empty_count -= give;
        self.shared
            .stats
            .hoard_returned
            .fetch_add(give as u64, Ordering::Relaxed);
        trace!("hoarding control returned {} empty slabs", give);
    }

    fn ctor_at_init(&self) -> Option<ObjectCtor> {
        if self.shared.dtor.is_none() {
            self.shared.ctor
        } else {
            None
        }
    }
}

impl Clone for Cache {
    /// A new handle over the same cache, with a fresh (slab-less) context.
    fn clone(&self) -> Cache {
        Cache {
            shared: self.shared.clone(),
            ctx: Box::new(Context::new()),
        }
    }
}

impl Drop for Cache {
    /// Unwinds this handle's context.
    ///
    /// Every owned slab has its remote inbox reconciled and its owner
    /// cleared. Slabs with no outstanding objects go back to the global
    /// pool; slabs whose objects are still live are left detached, to be
    /// reclaimed with their chunk at teardown. If the cache was already
    /// destroyed, the slab memory is gone and nothing is touched.
    fn drop(&mut self) {
        self.shared.stats.absorb(&mut self.ctx.stats);
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if self.ctx.is_idle() {
            return;
        }
        let mut pool = self.shared.pool.lock().unwrap();
        let pool = &mut *pool;
        let mut orphaned = 0usize;
        let mut reclaimed = 0usize;

        let mut retire = |slab: *mut SlabHeader| unsafe {
            reclaimed += SlabHeader::reclaim_remote(slab);
            SlabHeader::set_owner(slab, ptr::null_mut());
            if (*slab).active_count == 0 {
                pool.empty.push_back(slab);
                pool.empty_len += 1;
            } else {
                // outstanding objects: leave the slab detached; its
                // storage goes away with the chunk at teardown
                orphaned += 1;
            }
        };

        if !self.ctx.active.is_null() {
            retire(self.ctx.active);
        }
        unsafe {
            while let Some(slab) = self.ctx.partial.pop_front() {
                retire(slab);
            }
            while let Some(slab) = self.ctx.full.pop_front() {
                retire(slab);
            }
            while let Some(slab) = self.ctx.empty.pop_front() {
                retire(slab);
            }
        }
        drop(retire);

        self.shared
            .stats
            .remote_reclaimed
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
        if orphaned > 0 {
            debug!("context retired with {} slabs still holding live objects", orphaned);
        }
    }
}

/// Counters a handle bumps without synchronization; folded into the shared
/// counters when the handle is dropped or queried.
#[derive(Default)]
struct LocalStats {
    fast_alloc: u64,
    local_free: u64,
    remote_free: u64,
}

#[derive(Default)]
struct SharedStats {
    fast_alloc: AtomicU64,
    local_free: AtomicU64,
    remote_free: AtomicU64,
    partial_refills: AtomicU64,
    empty_refills: AtomicU64,
    scavenge_hits: AtomicU64,
    global_fetches: AtomicU64,
    chunks_mapped: AtomicU64,
    slabs_carved: AtomicU64,
    remote_reclaimed: AtomicU64,
    hoard_returned: AtomicU64,
}

impl SharedStats {
    fn absorb(&self, local: &mut LocalStats) {
        if local.fast_alloc > 0 {
            self.fast_alloc.fetch_add(local.fast_alloc, Ordering::Relaxed);
        }
        if local.local_free > 0 {
            self.local_free.fetch_add(local.local_free, Ordering::Relaxed);
        }
        if local.remote_free > 0 {
            self.remote_free.fetch_add(local.remote_free, Ordering::Relaxed);
        }
        *local = LocalStats::default();
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            fast_alloc: self.fast_alloc.load(Ordering::Relaxed),
            local_free: self.local_free.load(Ordering::Relaxed),
            remote_free: self.remote_free.load(Ordering::Relaxed),
            partial_refills: self.partial_refills.load(Ordering::Relaxed),
            empty_refills: self.empty_refills.load(Ordering::Relaxed),
            scavenge_hits: self.scavenge_hits.load(Ordering::Relaxed),
            global_fetches: self.global_fetches.load(Ordering::Relaxed),
            chunks_mapped: self.chunks_mapped.load(Ordering::Relaxed),
            slabs_carved: self.slabs_carved.load(Ordering::Relaxed),
            remote_reclaimed: self.remote_reclaimed.load(Ordering::Relaxed),
            hoard_returned: self.hoard_returned.load(Ordering::Relaxed),
        }
    }
}

/// Observational counters. Individually atomic, not mutually consistent;
/// useful for tests and diagnostics, not for synchronization.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    /// Allocations served by the active slab's freelist.
    pub fast_alloc: u64,
    /// Frees handled by the owning handle.
    pub local_free: u64,
    /// Frees pushed onto a foreign slab's remote inbox.
    pub remote_free: u64,
    /// Misses served by promoting a partial slab.
    pub partial_refills: u64,
    /// Misses served by promoting a locally parked empty slab.
    pub empty_refills: u64,
    /// Misses served by scavenging remote frees off the full list.
    pub scavenge_hits: u64,
    /// Slabs claimed from the global pool.
    pub global_fetches: u64,
    /// Chunks mapped from the OS.
    pub chunks_mapped: u64,
    /// Slabs carved out of those chunks.
    pub slabs_carved: u64,
    /// Objects recovered by draining remote inboxes.
    pub remote_reclaimed: u64,
    /// Empty slabs handed back to the global pool by hoarding control.
    pub hoard_returned: u64,
}

#[cfg(test)]
pub(crate) struct SlabCensus {
    pub active_count: u32,
    pub remote_pending: usize,
}

#[cfg(test)]
impl Cache {
    /// Per-slab accounting across everything this handle owns.
    pub(crate) fn census(&self) -> Vec<SlabCensus> {
        let mut out = Vec::new();
        let mut add = |slab: *mut SlabHeader| unsafe {
            out.push(SlabCensus {
                active_count: (*slab).active_count,
                remote_pending: SlabHeader::remote_len(slab),
            })
        };
        if !self.ctx.active.is_null() {
            add(self.ctx.active);
        }
        for slab in self.ctx.partial.iter() {
            add(slab);
        }
        for slab in self.ctx.full.iter() {
            add(slab);
        }
        for slab in self.ctx.empty.iter() {
            add(slab);
        }
        out
    }

    pub(crate) fn global_empty_len(&self) -> usize {
        self.shared.pool.lock().unwrap().empty_len
    }

    pub(crate) fn local_empty_count(&self) -> usize {
        self.ctx.empty_count
    }

    pub(crate) fn owns(&self, obj: NonNull<u8>) -> bool {
        unsafe {
            let slab = slab::slab_of(obj.as_ptr(), self.shared.layout.slab_bytes);
            SlabHeader::owner(slab) == self.ctx.token()
        }
    }

    pub(crate) fn slab_mem_offset(&self, obj: NonNull<u8>) -> usize {
        let slab = slab::slab_of(obj.as_ptr(), self.shared.layout.slab_bytes);
        obj.as_ptr() as usize - (slab as usize + self.shared.layout.meta_padded)
    }
}
