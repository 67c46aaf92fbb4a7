//! Public entry points and the [`Marl`] allocator handle.
//!
//! Every entry follows the same discipline: consult the user hook,
//! validate the request magnitude, try the thread cache, then take an
//! arena and delegate to the engine, retrying once on a different
//! arena before reporting ENOMEM.

use core::ptr::{NonNull, null_mut};
use core::sync::atomic::Ordering::Relaxed;

use allocator_api2::alloc::{AllocError, Allocator, GlobalAlloc, Layout};

use crate::arena::{self, arena_for_chunk, heap_for_chunk, is_main, main_arena};
use crate::binning::{MAX_FAST_REQUEST, TCACHE_MAX_BINS, tcache_index};
use crate::chunk::{self, ALIGNMENT, MAX_REQUEST, checked_request_to_size};
use crate::engine;
use crate::hooks;
use crate::params::PARAMS;
use crate::ptr_utils::WORD_SIZE;
use crate::sysmem;
use crate::tcache;

#[inline]
fn set_enomem() {
    errno::set_errno(errno::Errno(libc::ENOMEM));
}

#[inline]
fn one_time_init() {
    arena::setup_fork_handlers();
}

/// Allocate at least `bytes` bytes, aligned to [`ALIGNMENT`].
///
/// A zero-byte request yields a minimum-size allocation. Returns null
/// and sets `ENOMEM` when the request cannot be satisfied.
///
/// # Safety
/// The returned region must be released through [`release`] or
/// [`reallocate`] exactly once, on this allocator.
pub unsafe fn allocate(bytes: usize) -> *mut u8 {
    if let Some(hook) = hooks::alloc_hook() {
        return hook(bytes);
    }

    one_time_init();

    let Some(nb) = checked_request_to_size(bytes) else {
        set_enomem();
        return null_mut();
    };

    tcache::ensure_init();
    if let Some(tc_idx) = tcache_index(nb) {
        if tc_idx < PARAMS.tcache_bins.load(Relaxed) {
            if let Some(mem) = tcache::get(tc_idx) {
                return mem;
            }
        }
    }

    let av = arena::arena_get(nb);
    let mut mem = engine::int_malloc(av, bytes);
    arena::unlock(av);

    if mem.is_null() {
        let retry = arena::arena_get_retry(av, nb);
        mem = engine::int_malloc(retry, bytes);
        arena::unlock(retry);
    }

    if mem.is_null() {
        set_enomem();
        return null_mut();
    }

    debug_assert!(mem as usize % ALIGNMENT == 0);
    mem
}

/// Release a region obtained from this allocator. Null is a no-op.
///
/// # Safety
/// `mem` must have come from [`allocate`], [`reallocate`] or
/// [`aligned_allocate`] and must not have been released already.
pub unsafe fn release(mem: *mut u8) {
    if mem.is_null() {
        return;
    }

    if let Some(hook) = hooks::release_hook() {
        hook(mem);
        return;
    }

    tcache::register_thread();

    let p = chunk::mem_to_chunk(mem);

    if chunk::is_mmapped(p) {
        PARAMS.adapt_mmap_threshold(chunk::size(p));
        sysmem::munmap_chunk(p);
        return;
    }

    if tcache::maybe_put(p) {
        return;
    }

    // a release always lands in the chunk's owning arena, so foreign
    // frees migrate memory home instead of fragmenting the caller's
    let Some(av) = arena_for_chunk(p) else { return };
    engine::int_free(av, p, false);
}

/// Resize a region, preserving the leading `min(old, new)` bytes.
///
/// Null `mem` allocates; zero `bytes` with non-null `mem` releases and
/// returns null. On failure the old region is left valid and `ENOMEM`
/// is set.
///
/// # Safety
/// As [`release`], plus the returned pointer replaces `mem`.
pub unsafe fn reallocate(mem: *mut u8, bytes: usize) -> *mut u8 {
    if let Some(hook) = hooks::realloc_hook() {
        return hook(mem, bytes);
    }

    if mem.is_null() {
        return allocate(bytes);
    }
    if bytes == 0 {
        release(mem);
        return null_mut();
    }

    let Some(nb) = checked_request_to_size(bytes) else {
        set_enomem();
        return null_mut();
    };

    let oldp = chunk::mem_to_chunk(mem);
    let old_size = chunk::size(oldp);

    if mem as usize % ALIGNMENT != 0 || (oldp as usize) > usize::MAX - old_size {
        crate::fatal::fatal("realloc(): invalid pointer");
    }

    if chunk::is_mmapped(oldp) {
        if let Some(newp) = sysmem::mremap_chunk(oldp, nb) {
            return chunk::chunk_to_mem(newp);
        }

        // still roomy enough in place
        if old_size >= nb + WORD_SIZE {
            return mem;
        }

        let new_mem = allocate(bytes);
        if new_mem.is_null() {
            set_enomem();
            return null_mut();
        }
        core::ptr::copy_nonoverlapping(mem, new_mem, old_size - 2 * WORD_SIZE);
        sysmem::munmap_chunk(oldp);
        return new_mem;
    }

    // SAFETY: non-mapped chunks always belong to an arena
    let av = arena_for_chunk(oldp).unwrap_unchecked();
    arena::lock(av);
    let new_mem = engine::int_realloc(av, oldp, old_size, nb);
    arena::unlock(av);

    if new_mem.is_null() {
        set_enomem();
    }
    new_mem
}

/// Allocate `bytes` bytes aligned to `alignment`.
///
/// Alignments below the default are raised to it, non-powers of two
/// are rounded up, and alignments beyond half the address range fail
/// with `EINVAL`.
///
/// # Safety
/// As [`allocate`].
pub unsafe fn aligned_allocate(alignment: usize, bytes: usize) -> *mut u8 {
    if let Some(hook) = hooks::aligned_alloc_hook() {
        return hook(alignment, bytes);
    }

    if alignment <= ALIGNMENT {
        return allocate(bytes);
    }

    if alignment > usize::MAX / 2 + 1 {
        errno::set_errno(errno::Errno(libc::EINVAL));
        return null_mut();
    }

    let alignment = alignment.next_power_of_two();

    let headroom = MAX_REQUEST.checked_sub(alignment + chunk::MIN_CHUNK_SIZE);
    if headroom.map_or(true, |headroom| bytes > headroom) {
        set_enomem();
        return null_mut();
    }

    one_time_init();
    tcache::ensure_init();

    let av = arena::arena_get(bytes + alignment);
    let mut mem = engine::int_memalign(av, alignment, bytes);
    arena::unlock(av);

    if mem.is_null() {
        let retry = arena::arena_get_retry(av, bytes + alignment);
        mem = engine::int_memalign(retry, alignment, bytes);
        arena::unlock(retry);
    }

    if mem.is_null() {
        set_enomem();
        return null_mut();
    }

    debug_assert!(mem as usize % alignment == 0);
    mem
}

/// The capacity of the region behind `mem`, header overhead excluded.
/// Null and released regions report zero.
///
/// # Safety
/// `mem` must be null or a live pointer from this allocator.
pub unsafe fn usable_size(mem: *mut u8) -> usize {
    if mem.is_null() {
        return 0;
    }

    let p = chunk::mem_to_chunk(mem);

    if chunk::is_mmapped(p) {
        chunk::size(p) - 2 * WORD_SIZE
    } else if chunk::inuse(p) {
        chunk::size(p) - WORD_SIZE
    } else {
        0
    }
}

/// Return unused memory to the OS across every arena: consolidate,
/// advise away whole free pages, and retract each arena's top past
/// `pad` bytes of slack. Returns whether anything was released.
pub fn trim(pad: usize) -> bool {
    one_time_init();

    let mut any = false;

    unsafe {
        let main = main_arena();
        let mut av = main;
        loop {
            arena::lock(av);
            engine::malloc_consolidate(av);
            sysmem::advise_free_pages(av);

            if is_main(av) {
                any |= sysmem::sys_trim(pad, av);
            } else {
                any |= sysmem::heap_trim(heap_for_chunk((*av).top), pad);
            }
            arena::unlock(av);

            av = (*av).next.load(core::sync::atomic::Ordering::Acquire);
            if av.is_null() || av == main {
                break;
            }
        }
    }

    any
}

/// The tunable parameters of [`tune`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tunable {
    /// Request-byte ceiling for fast-bin eligibility (0 disables).
    FastCeiling,
    /// Top-chunk slack above which releases auto-trim (-1 disables).
    TrimThreshold,
    /// Extra bytes requested with every heap extension.
    TopPad,
    /// Request size at which allocations switch to page mapping.
    MmapThreshold,
    /// Cap on concurrently mapped chunks (0 disables mapping).
    MmapMax,
    /// Junk-fill byte for allocations and releases (0 disables).
    Perturb,
    /// Arena-creation test threshold.
    ArenaTest,
    /// Hard cap on the number of arenas.
    ArenaMax,
    /// Per-class chunk cap of the thread cache.
    TcacheCount,
    /// Number of size classes the thread cache serves.
    TcacheMax,
    /// Cap on exact-fit stashes per unsorted drain.
    TcacheUnsortedLimit,
}

/// Adjust a process-wide parameter. Returns whether the value was
/// accepted. Serialized through the main arena's lock.
pub fn tune(param: Tunable, value: isize) -> bool {
    one_time_init();

    let main = main_arena();
    unsafe { arena::lock(main) };

    let accepted = unsafe { tune_locked(param, value) };

    unsafe { arena::unlock(main) };
    accepted
}

unsafe fn tune_locked(param: Tunable, value: isize) -> bool {
    match param {
        Tunable::FastCeiling => {
            if value < 0 || value as usize > MAX_FAST_REQUEST {
                return false;
            }
            // chunks already sitting in fast bins would dodge the new
            // ceiling's coalescing rules; flush them first
            if (*main_arena()).have_fastchunks.load(Relaxed) {
                engine::malloc_consolidate(main_arena());
            }
            PARAMS.set_max_fast(value as usize)
        }
        Tunable::TrimThreshold => {
            let threshold = if value < 0 { usize::MAX } else { value as usize };
            PARAMS.trim_threshold.store(threshold, Relaxed);
            PARAMS.no_dyn_threshold.store(true, Relaxed);
            true
        }
        Tunable::TopPad => {
            if value < 0 {
                return false;
            }
            PARAMS.top_pad.store(value as usize, Relaxed);
            true
        }
        Tunable::MmapThreshold => {
            if value < 0 {
                return false;
            }
            PARAMS.mmap_threshold.store(value as usize, Relaxed);
            PARAMS.no_dyn_threshold.store(true, Relaxed);
            true
        }
        Tunable::MmapMax => {
            if value < 0 {
                return false;
            }
            PARAMS.n_mmaps_max.store(value as usize, Relaxed);
            true
        }
        Tunable::Perturb => {
            PARAMS.perturb.store(value as u8, Relaxed);
            true
        }
        Tunable::ArenaTest => {
            if value <= 0 {
                return false;
            }
            PARAMS.arena_test.store(value as usize, Relaxed);
            true
        }
        Tunable::ArenaMax => {
            if value <= 0 {
                return false;
            }
            PARAMS.arena_max.store(value as usize, Relaxed);
            true
        }
        Tunable::TcacheCount => {
            if value < 0 || value as usize > u16::MAX as usize {
                return false;
            }
            PARAMS.tcache_count.store(value as usize, Relaxed);
            true
        }
        Tunable::TcacheMax => {
            if value < 0 || value as usize > TCACHE_MAX_BINS {
                return false;
            }
            PARAMS.tcache_bins.store(value as usize, Relaxed);
            true
        }
        Tunable::TcacheUnsortedLimit => {
            if value < 0 {
                return false;
            }
            PARAMS.tcache_unsorted_limit.store(value as usize, Relaxed);
            true
        }
    }
}

/// Allocator handle; a unit type, since all state is process-wide.
///
/// Implements [`GlobalAlloc`] and [`Allocator`], so it can serve as
/// `#[global_allocator]` or back individual collections.
pub struct Marl;

unsafe impl GlobalAlloc for Marl {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            allocate(layout.size())
        } else {
            aligned_allocate(layout.align(), layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        release(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return reallocate(ptr, new_size);
        }

        // over-aligned regions must be moved by hand to keep the
        // alignment guarantee
        let new_mem = aligned_allocate(layout.align(), new_size);
        if !new_mem.is_null() {
            let copy = usable_size(ptr).min(new_size);
            core::ptr::copy_nonoverlapping(ptr, new_mem, copy);
            release(ptr);
        }
        new_mem
    }
}

#[inline(always)]
fn nonnull_slice_from_raw_parts(nn: NonNull<u8>, len: usize) -> NonNull<[u8]> {
    // SAFETY: if `nn` is non-null, then the resulting slice is non-null
    unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(nn.as_ptr(), len)) }
}

unsafe impl Allocator for Marl {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(nonnull_slice_from_raw_parts(NonNull::dangling(), 0));
        }

        let mem = unsafe { GlobalAlloc::alloc(self, layout) };
        NonNull::new(mem)
            .map(|nn| nonnull_slice_from_raw_parts(nn, layout.size()))
            .ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            release(ptr.as_ptr());
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }

        let mem = GlobalAlloc::realloc(self, ptr.as_ptr(), new_layout, new_layout.size());
        NonNull::new(mem)
            .map(|nn| nonnull_slice_from_raw_parts(nn, new_layout.size()))
            .ok_or(AllocError)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if new_layout.size() == 0 {
            if old_layout.size() != 0 {
                release(ptr.as_ptr());
            }
            return Ok(nonnull_slice_from_raw_parts(NonNull::dangling(), 0));
        }

        let mem = GlobalAlloc::realloc(self, ptr.as_ptr(), new_layout, new_layout.size());
        NonNull::new(mem)
            .map(|nn| nonnull_slice_from_raw_parts(nn, new_layout.size()))
            .ok_or(AllocError)
    }
}
