// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Queries against the runtime platform, resolved once at startup.

use core::ptr;

lazy_static! {
    static ref PAGE_SIZE: usize = query_page_size();
    static ref CACHE_LINE_SIZE: usize = query_cache_line_size();
}

/// The system's page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// The L1 data cache line size, or 64 bytes if the platform will not say.
#[inline]
pub fn cache_line_size() -> usize {
    *CACHE_LINE_SIZE
}

fn query_page_size() -> usize {
    // sysconf(_SC_PAGESIZE) is required by POSIX 1003.1:
    // http://www.unix.com/man-page/posix/3p/sysconf/
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(
        pagesize >= 1,
        "sysconf(_SC_PAGESIZE) failed, but _SC_PAGESIZE is required by POSIX 1003.1"
    );
    pagesize as usize
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn query_cache_line_size() -> usize {
    let linesize = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
    if linesize >= 1 {
        linesize as usize
    } else {
        // sysconf reports 0 inside some containers and VMs
        FALLBACK_CACHE_LINE_SIZE
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn query_cache_line_size() -> usize {
    FALLBACK_CACHE_LINE_SIZE
}

const FALLBACK_CACHE_LINE_SIZE: usize = 64;

/// Maps `bytes` of fresh, zeroed, read-write anonymous memory.
///
/// Mapping failure means the process is out of address space or memory; there
/// is no local recovery from that, so this aborts the calling thread with a
/// diagnostic rather than threading an error through every allocation path.
pub fn map(bytes: usize) -> *mut u8 {
    unsafe {
        let ptr = libc::mmap(
            ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        assert!(ptr != libc::MAP_FAILED, "mmap of {} bytes failed", bytes);
        ptr as *mut u8
    }
}

/// Releases a mapping previously obtained from `map`.
///
/// # Safety
/// `ptr` and `bytes` must denote exactly one prior `map` result, and no
/// object inside the mapping may be referenced again.
pub unsafe fn unmap(ptr: *mut u8, bytes: usize) {
    let ret = libc::munmap(ptr as *mut libc::c_void, bytes);
    debug_assert_eq!(ret, 0, "munmap({:?}, {}) failed", ptr, bytes);
}
