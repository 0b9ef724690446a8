// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Page backing: carving OS chunks into slabs and giving them back.
//!
//! Slabs are never mapped one at a time. The cache asks the OS for a chunk of
//! `pages_per_chunk` slabs' worth of anonymous memory, carves it into
//! slab-aligned regions, and parks the resulting slabs in the global empty
//! pool. If the OS hands back a base that is not aligned to the slab size,
//! the carve advances to the next alignment boundary and gives up one slab's
//! worth of usable space; the original base is stashed in the word
//! immediately below the first usable slab so the chunk can be released
//! without consulting any side table. Chunks are released only at cache
//! teardown, never during operation.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::layout::SlabLayout;
use crate::slab::{SlabHeader, SlabList, FLAG_ALIGNED, FLAG_CHUNK_FRONT};
use crate::sys;
use crate::ObjectCtor;

/// One OS mapping, recorded for teardown.
pub struct Chunk {
    pub base: *mut u8,
    pub bytes: usize,
}

/// Maps a fresh chunk, carves it into slabs, and links them onto `empty`.
///
/// `color_cursor` advances once per carved slab so successive slabs land on
/// successive colors. `ctor` is the construct-at-slab-init hook (present only
/// when the cache has a constructor and no destructor); it runs once per slot
/// before the slab becomes visible. Returns the number of slabs carved.
///
/// # Safety
/// Caller must hold the cache's global lock: `empty` and `chunks` are the
/// lock-protected pool.
pub unsafe fn grow(
    layout: &SlabLayout,
    color_cursor: &AtomicUsize,
    empty: &mut SlabList,
    chunks: &mut Vec<Chunk>,
    ctor: Option<ObjectCtor>,
) -> usize {
    // A lone-slab chunk could lose its only slab to alignment, so round the
    // request up to two slabs in that case.
    let slabs_mapped = if layout.pages_per_chunk == 1 {
        2
    } else {
        layout.pages_per_chunk
    };
    let bytes = layout.slab_bytes * slabs_mapped;
    let base = sys::map(bytes);

    let misalignment = base as usize & (layout.slab_bytes - 1);
    let (first, usable) = if misalignment == 0 {
        (base, slabs_mapped)
    } else {
        let first = base.add(layout.slab_bytes - misalignment);
        // remember where the mapping really started
        *(first as *mut *mut u8).sub(1) = base;
        (first, slabs_mapped - 1)
    };
    trace!(
        "mapped chunk: base={:?} bytes={} usable_slabs={} aligned={}",
        base,
        bytes,
        usable,
        misalignment == 0
    );

    chunks.push(Chunk { base, bytes });

    let base_flags = if misalignment == 0 { FLAG_ALIGNED } else { 0 };
    for i in 0..usable {
        let slab = first.add(i * layout.slab_bytes) as *mut SlabHeader;
        let color = (color_cursor.fetch_add(1, Ordering::Relaxed) % layout.color_count) as u32;
        let flags = base_flags | if i == 0 { FLAG_CHUNK_FRONT } else { 0 };
        SlabHeader::init(slab, layout, color, flags);
        if i == 0 {
            debug_assert_eq!(chunk_base(slab), base);
        }
        if let Some(ctor) = ctor {
            for slot in 0..layout.capacity {
                ctor((*slab).mem.add(slot * layout.obj_size));
            }
        }
        empty.push_back(slab);
    }
    usable
}

/// Recovers the mapping base for a chunk-front slab.
///
/// # Safety
/// `slab` must carry `FLAG_CHUNK_FRONT`.
pub unsafe fn chunk_base(slab: *mut SlabHeader) -> *mut u8 {
    debug_assert!((*slab).flags & FLAG_CHUNK_FRONT != 0);
    if (*slab).flags & FLAG_ALIGNED != 0 {
        slab as *mut u8
    } else {
        *(slab as *mut *mut u8).sub(1)
    }
}

/// Releases every recorded chunk. Individual slabs are never unmapped while
/// the cache operates; this is the one place backing memory goes away.
///
/// # Safety
/// No pointer into any of the chunks may be dereferenced afterwards.
pub unsafe fn release(chunks: &mut Vec<Chunk>) {
    for chunk in chunks.drain(..) {
        trace!("releasing chunk: base={:?} bytes={}", chunk.base, chunk.bytes);
        sys::unmap(chunk.base, chunk.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn carve_links_and_flags() {
        let layout = SlabLayout::compute(32);
        let cursor = AtomicUsize::new(0);
        let mut empty = SlabList::new();
        let mut chunks = Vec::new();
        unsafe {
            let carved = grow(&layout, &cursor, &mut empty, &mut chunks, None);
            assert!(carved == layout.pages_per_chunk || carved == layout.pages_per_chunk - 1);
            assert_eq!(chunks.len(), 1);
            assert_eq!(empty.len(), carved);

            let mut fronts = 0;
            for (i, slab) in empty.iter().enumerate() {
                // every slab is mask-friendly
                assert_eq!(slab as usize & (layout.slab_bytes - 1), 0);
                assert_eq!((*slab).active_count, 0);
                assert!(!(*slab).local_head.is_null());
                if (*slab).flags & FLAG_CHUNK_FRONT != 0 {
                    fronts += 1;
                    assert_eq!(i, 0);
                    // the recorded base must round-trip through the front slab
                    assert_eq!(chunk_base(slab), chunks[0].base);
                }
            }
            assert_eq!(fronts, 1);
            release(&mut chunks);
            assert!(chunks.is_empty());
        }
    }

    #[test]
    fn colors_advance_per_slab() {
        let layout = SlabLayout::compute(48);
        let cursor = AtomicUsize::new(0);
        let mut empty = SlabList::new();
        let mut chunks = Vec::new();
        unsafe {
            let carved = grow(&layout, &cursor, &mut empty, &mut chunks, None);
            assert_eq!(cursor.load(Ordering::Relaxed), carved);
            for (i, slab) in empty.iter().enumerate() {
                let expect = (i % layout.color_count) as u32;
                assert_eq!((*slab).color, expect);
                let offset = (*slab).mem as usize - slab as usize;
                assert_eq!(
                    offset,
                    layout.meta_padded + expect as usize * layout.color_stride
                );
            }
            release(&mut chunks);
        }
    }

    #[test]
    fn construct_at_init_touches_every_slot() {
        use core::sync::atomic::AtomicU64;
        static CALLS: AtomicU64 = AtomicU64::new(0);
        unsafe fn count(_obj: *mut u8) {
            CALLS.fetch_add(1, Ordering::Relaxed);
        }

        let layout = SlabLayout::compute(512);
        let cursor = AtomicUsize::new(0);
        let mut empty = SlabList::new();
        let mut chunks = Vec::new();
        unsafe {
            let before = CALLS.load(Ordering::Relaxed);
            let carved = grow(&layout, &cursor, &mut empty, &mut chunks, Some(count));
            let called = CALLS.load(Ordering::Relaxed) - before;
            assert_eq!(called as usize, carved * layout.capacity);
            release(&mut chunks);
        }
    }
}
