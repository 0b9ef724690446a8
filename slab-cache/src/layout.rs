//! Slab geometry.
//!
//! One `SlabLayout` is computed per cache at construction time and never
//! changes. The two load-bearing properties are that `slab_bytes` is a power
//! of two no smaller than a page (so object addresses can be masked down to
//! their header) and that at least `MIN_OBJECTS_PER_SLAB` objects fit in a
//! slab after the padded header (so per-slab overhead stays amortized).
//!
//! Whatever space is left after the header and the object array is spent on
//! coloring: successive slabs start their object arrays at different
//! cache-line multiples past the header, so equivalently-offset fields in
//! concurrently-touched slabs stop competing for the same L1 sets.

use core::cmp;
use core::mem;

use crate::slab::SlabHeader;
use crate::sys;
use crate::{MIN_OBJECTS_PER_SLAB, MIN_OBJECT_SIZE, TARGET_CHUNK_BYTES};

/// Geometry for one cache: how big a slab is, what lives where inside it,
/// and how coloring cycles.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlabLayout {
    /// Rounded-up object size. A power of two, at least `MIN_OBJECT_SIZE`
    /// and at least a pointer (free slots store a link in their first word).
    pub obj_size: usize,
    /// Size and alignment of one slab. A power of two, at least a page.
    pub slab_bytes: usize,
    /// Object slots per slab.
    pub capacity: usize,
    /// Header size rounded up to a cache-line boundary.
    pub meta_padded: usize,
    /// Slabs carved out of one OS chunk.
    pub pages_per_chunk: usize,
    /// Number of distinct colors before the cycle repeats.
    pub color_count: usize,
    /// Bytes between adjacent colors; one cache line.
    pub color_stride: usize,
}

impl SlabLayout {
    /// Computes the geometry for objects of `requested_size` bytes.
    ///
    /// Panics if `requested_size` is zero; a cache of nothing is a caller
    /// bug, not a recoverable condition.
    pub fn compute(requested_size: usize) -> SlabLayout {
        assert!(requested_size > 0, "cache object size must be nonzero");

        let cache_line = sys::cache_line_size();
        let page = sys::page_size();

        let obj_size = cmp::max(
            cmp::max(requested_size, MIN_OBJECT_SIZE),
            mem::size_of::<*mut u8>(),
        )
        .next_power_of_two();

        let meta_padded = align_up(mem::size_of::<SlabHeader>(), cache_line);
        let required = obj_size * MIN_OBJECTS_PER_SLAB + meta_padded;
        let slab_bytes = cmp::max(page, required.next_power_of_two());
        let pages_per_chunk = cmp::max(1, TARGET_CHUNK_BYTES / slab_bytes);

        let mut capacity = (slab_bytes - meta_padded) / obj_size;
        while meta_padded + capacity * obj_size > slab_bytes {
            capacity -= 1;
        }
        debug_assert!(capacity >= MIN_OBJECTS_PER_SLAB);

        let slack = slab_bytes - meta_padded - capacity * obj_size;
        let color_count = slack / cache_line + 1;

        SlabLayout {
            obj_size,
            slab_bytes,
            capacity,
            meta_padded,
            pages_per_chunk,
            color_count,
            color_stride: cache_line,
        }
    }

    /// Bytes in one OS chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.slab_bytes * self.pages_per_chunk
    }

    /// Largest byte offset coloring can add to the object array.
    pub fn max_color_offset(&self) -> usize {
        (self.color_count - 1) * self.color_stride
    }
}

#[inline]
pub fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}
