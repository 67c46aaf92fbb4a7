//! Narrow interface to the OS memory primitives.
//!
//! Three acquisition mechanisms back the allocator: the process break
//! for the main arena's contiguous heap, anonymous page mappings for
//! oversize chunks and fallback heaps, and aligned reservations
//! committed piecewise for the secondary-arena heaps.
//!
//! Failures that the allocator survives are logged with `log::warn!`;
//! the callers translate acquisition failure into ENOMEM.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use crate::ptr_utils::{align_up_by, is_aligned_to};

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The system page size, queried once.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Relaxed);
    if cached != 0 {
        return cached;
    }

    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let queried = if queried > 0 { queried as usize } else { 4096 };
    PAGE_SIZE.store(queried, Relaxed);
    queried
}

/// Map `size` bytes of fresh read-write memory.
pub fn map(size: usize) -> Option<NonNull<u8>> {
    debug_assert!(size % page_size() == 0);

    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED { None } else { NonNull::new(ptr.cast()) }
}

/// Unmap a region previously obtained from [`map`] or [`map_aligned`].
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    if libc::munmap(ptr.cast(), size) != 0 {
        log::warn!(
            "munmap failed: {}, addr {:p}, size {:#x}",
            errno::errno(),
            ptr,
            size
        );
    }
}

/// Reserve `size` bytes aligned to `align`, with no access permissions.
/// Commit ranges with [`commit`] before use.
///
/// The kernel gives no alignment promise, so over-reserve by the
/// alignment and unmap the misaligned edges.
pub fn map_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
    debug_assert!(align.is_power_of_two() && align >= page_size());
    debug_assert!(size % page_size() == 0);

    let over_size = size.checked_add(align)?;

    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            over_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return None;
    }

    let base = ptr.cast::<u8>();
    let aligned = align_up_by(base, align - 1);
    let lead = aligned as usize - base as usize;
    let trail = over_size - lead - size;

    unsafe {
        if lead > 0 {
            unmap(base, lead);
        }
        if trail > 0 {
            unmap(aligned.add(size), trail);
        }
    }

    NonNull::new(aligned)
}

/// Make a reserved range readable and writable.
pub unsafe fn commit(ptr: *mut u8, size: usize) -> bool {
    debug_assert!(is_aligned_to(ptr, page_size()));

    if libc::mprotect(ptr.cast(), size, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        log::warn!("mprotect commit failed: {}, addr {:p}, size {:#x}", errno::errno(), ptr, size);
        return false;
    }
    true
}

/// Drop access to a committed range and let the kernel reclaim it.
pub unsafe fn decommit(ptr: *mut u8, size: usize) -> bool {
    debug_assert!(is_aligned_to(ptr, page_size()));

    if libc::mprotect(ptr.cast(), size, libc::PROT_NONE) != 0 {
        log::warn!("mprotect decommit failed: {}, addr {:p}, size {:#x}", errno::errno(), ptr, size);
        return false;
    }
    let _ = libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED);
    true
}

/// Tell the kernel the pages are unneeded while keeping them mapped.
pub unsafe fn advise_unused(ptr: *mut u8, size: usize) {
    debug_assert!(is_aligned_to(ptr, page_size()));

    if libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) != 0 {
        log::warn!("madvise failed: {}, addr {:p}, size {:#x}", errno::errno(), ptr, size);
    }
}

/// The current process break.
pub fn current_break() -> *mut u8 {
    unsafe { libc::sbrk(0).cast() }
}

/// Move the process break by `delta` bytes. Returns the previous break
/// on success; `None` means the kernel refused (or another allocator
/// owns the break region and it cannot grow).
pub unsafe fn move_break(delta: isize) -> Option<*mut u8> {
    let prev = libc::sbrk(delta);

    if prev as isize == -1 { None } else { Some(prev.cast()) }
}

/// Resize a private mapping in place or let the kernel move it.
#[cfg(target_os = "linux")]
pub unsafe fn remap(ptr: *mut u8, old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
    let moved = libc::mremap(ptr.cast(), old_size, new_size, libc::MREMAP_MAYMOVE);

    if moved == libc::MAP_FAILED { None } else { NonNull::new(moved.cast()) }
}

#[cfg(not(target_os = "linux"))]
pub unsafe fn remap(_ptr: *mut u8, _old_size: usize, _new_size: usize) -> Option<NonNull<u8>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let size = page_size();
        assert!(size.is_power_of_two());
        assert!(size >= 4096);
    }

    #[test]
    fn map_unmap_round_trip() {
        let size = page_size() * 4;
        let ptr = map(size).expect("anonymous mapping");

        unsafe {
            ptr.as_ptr().write_bytes(0xa5, size);
            assert_eq!(*ptr.as_ptr().add(size - 1), 0xa5);
            unmap(ptr.as_ptr(), size);
        }
    }

    #[test]
    fn aligned_mapping_commit_decommit() {
        let align = 1 << 22;
        let size = align / 2;
        let ptr = map_aligned(size, align).expect("aligned reservation");

        assert!(is_aligned_to(ptr.as_ptr(), align));

        unsafe {
            assert!(commit(ptr.as_ptr(), page_size() * 8));
            ptr.as_ptr().write_bytes(0x5a, page_size() * 8);

            assert!(decommit(ptr.as_ptr(), page_size() * 8));
            assert!(commit(ptr.as_ptr(), page_size() * 8));
            // decommitted-then-recommitted pages read back as zero
            assert_eq!(*ptr.as_ptr(), 0);

            unmap(ptr.as_ptr(), size);
        }
    }

    #[test]
    fn advise_keeps_mapping_usable() {
        let size = page_size() * 2;
        let ptr = map(size).expect("anonymous mapping");

        unsafe {
            ptr.as_ptr().write_bytes(0xee, size);
            advise_unused(ptr.as_ptr(), size);
            // pages are reclaimed but still mapped and writable
            ptr.as_ptr().write_bytes(0x11, size);
            unmap(ptr.as_ptr(), size);
        }
    }
}
