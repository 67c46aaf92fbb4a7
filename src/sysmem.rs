//! System-memory acquisition and release for the engine.
//!
//! Three flows feed an arena: oversize requests become standalone page
//! mappings flagged M; the main arena extends the process break,
//! fenceposting whenever a foreign actor moved it; secondary arenas
//! grow their current heap's committed span or chain a fresh aligned
//! heap, retiring the old top through the ordinary release path.

use crate::arena::{self, Arena, HEAP_MAX_SIZE, Heap, heap_for_chunk, is_main};
use crate::chunk::{
    self, ALIGNMENT, ALIGN_MASK, Chunk, HEADER_SIZE, IS_MMAPPED, MIN_CHUNK_SIZE, PREV_INUSE,
};
use crate::engine;
use crate::fatal::fatal;
use crate::hooks;
use crate::os;
use crate::params::PARAMS;
use crate::ptr_utils::WORD_SIZE;

/// Floor for break-failure fallback mappings, so repeated fallbacks
/// don't shatter the address space.
const MMAP_AS_MORECORE_SIZE: usize = 1024 * 1024;

/// Serve `nb` through a standalone page mapping. The chunk records any
/// leading alignment correction in `prev_size` so the original mapping
/// bounds can be recovered at unmap time.
pub(crate) unsafe fn mmap_chunk(nb: usize) -> *mut u8 {
    let page_mask = os::page_size() - 1;
    let size = (nb + WORD_SIZE + page_mask) & !page_mask;

    if size <= nb {
        return core::ptr::null_mut();
    }

    let Some(mapping) = os::map(size) else { return core::ptr::null_mut() };
    let base = mapping.as_ptr();

    let front_misalign = chunk::chunk_to_mem(base.cast()) as usize & ALIGN_MASK;
    let p = if front_misalign != 0 {
        let correction = ALIGNMENT - front_misalign;
        let p = base.add(correction).cast::<Chunk>();
        chunk::set_prev_size(p, correction);
        chunk::set_head(p, (size - correction) | IS_MMAPPED);
        p
    } else {
        let p = base.cast::<Chunk>();
        chunk::set_prev_size(p, 0);
        chunk::set_head(p, size | IS_MMAPPED);
        p
    };

    PARAMS.account_mmap(size);

    chunk::chunk_to_mem(p)
}

/// Unmap a chunk flagged M, restoring the original mapping bounds from
/// the recorded correction.
pub(crate) unsafe fn munmap_chunk(p: *mut Chunk) {
    debug_assert!(chunk::is_mmapped(p));

    let size = chunk::size(p);
    let correction = chunk::prev_size(p);
    let block = p.cast::<u8>().wrapping_sub(correction);
    let total_size = correction + size;

    let page_mask = os::page_size() - 1;
    if (block as usize | total_size) & page_mask != 0 {
        fatal("munmap_chunk(): invalid pointer");
    }

    PARAMS.account_munmap(total_size);
    os::unmap(block, total_size);
}

/// Resize a mapped chunk in place (or let the kernel move it).
pub(crate) unsafe fn mremap_chunk(p: *mut Chunk, new_request: usize) -> Option<*mut Chunk> {
    debug_assert!(chunk::is_mmapped(p));

    let page_mask = os::page_size() - 1;
    let correction = chunk::prev_size(p);
    let old_total = chunk::size(p) + correction;
    let new_total = (new_request + WORD_SIZE + correction + page_mask) & !page_mask;

    if new_total == old_total {
        return Some(p);
    }

    let block = p.cast::<u8>().sub(correction);
    let moved = os::remap(block, old_total, new_total)?;

    let p = moved.as_ptr().add(correction).cast::<Chunk>();
    debug_assert!(chunk::chunk_to_mem(p) as usize & ALIGN_MASK == 0);
    chunk::set_prev_size(p, correction);
    chunk::set_head(p, (new_total - correction) | IS_MMAPPED);

    PARAMS.account_munmap(old_total);
    PARAMS.account_mmap(new_total);

    Some(p)
}

/// Acquire system memory so that the arena's top can satisfy `nb`,
/// then carve the chunk. Called with the arena locked; returns null
/// with no partial state on failure.
pub(crate) unsafe fn sys_alloc(nb: usize, av: *mut Arena) -> *mut u8 {
    let mut tried_mmap = false;

    // oversize requests bypass the arena entirely
    if nb >= PARAMS.mmap_threshold()
        && PARAMS.n_mmaps.load(core::sync::atomic::Ordering::Relaxed)
            < PARAMS.n_mmaps_max.load(core::sync::atomic::Ordering::Relaxed)
    {
        let mem = mmap_chunk(nb);
        if !mem.is_null() {
            return mem;
        }
        tried_mmap = true;
    }

    if is_main(av) {
        sys_alloc_main(nb, av);
    } else if !sys_alloc_secondary(nb, av) {
        // the heap could neither grow nor be replaced; a dedicated
        // mapping is the remaining option regardless of threshold
        if !tried_mmap && PARAMS.n_mmaps_max.load(core::sync::atomic::Ordering::Relaxed) != 0 {
            return mmap_chunk(nb);
        }
        return core::ptr::null_mut();
    }

    // carve from whatever top we now have
    let top = (*av).top;
    let top_size = chunk::size(top);
    if top_size >= nb + MIN_CHUNK_SIZE {
        let remainder_size = top_size - nb;
        let remainder = chunk::chunk_at_offset(top, nb);
        (*av).top = remainder;
        chunk::set_head(top, nb | PREV_INUSE | arena::arena_bit(av));
        chunk::set_head(remainder, remainder_size | PREV_INUSE);
        return chunk::chunk_to_mem(top);
    }

    if !tried_mmap && PARAMS.n_mmaps_max.load(core::sync::atomic::Ordering::Relaxed) != 0 {
        return mmap_chunk(nb);
    }

    core::ptr::null_mut()
}

/// Extend the main arena's top through the process break, falling back
/// to a mapped pseudo-heap when the break refuses to move.
unsafe fn sys_alloc_main(nb: usize, av: *mut Arena) {
    let page_mask = os::page_size() - 1;
    let old_top = (*av).top;
    let old_size = chunk::size(old_top);
    let old_end = old_top.cast::<u8>().wrapping_add(old_size);

    debug_assert!(old_size < nb + MIN_CHUNK_SIZE);

    let mut size = nb + PARAMS.top_pad.load(core::sync::atomic::Ordering::Relaxed) + MIN_CHUNK_SIZE;
    if (*av).contiguous {
        size -= old_size.min(size);
    }
    size = (size + page_mask) & !page_mask;
    if size == 0 {
        return;
    }

    let mut brk = core::ptr::null_mut::<u8>();
    let mut mapped_fallback = false;

    if (*av).contiguous || (*av).system_mem == 0 {
        // only extend the break while we believe we own its tail
        if os::current_break() == old_end || (*av).system_mem == 0 {
            if let Some(prev) = os::move_break(size as isize) {
                brk = prev;
                if let Some(hook) = hooks::heap_changed_hook() {
                    hook(size as isize);
                }
            }
        }
    }

    if brk.is_null() {
        // the break is unavailable or foreign-owned; map a standalone
        // region and run non-contiguously from here on
        let mut map_size = (nb + PARAMS.top_pad.load(core::sync::atomic::Ordering::Relaxed)
            + MIN_CHUNK_SIZE
            + page_mask)
            & !page_mask;
        map_size = map_size.max(MMAP_AS_MORECORE_SIZE);

        match os::map(map_size) {
            Some(mapping) => {
                brk = mapping.as_ptr();
                size = map_size;
                mapped_fallback = true;
                (*av).contiguous = false;
            }
            None => return,
        }
    }

    (*av).system_mem += size;
    (*av).max_system_mem = (*av).max_system_mem.max((*av).system_mem);

    if !mapped_fallback && brk == old_end && old_size != 0 {
        // the new space abuts the old top; just widen it
        chunk::set_head(old_top, (old_size + size) | PREV_INUSE);
        return;
    }

    if !mapped_fallback && (*av).contiguous && old_size != 0 && brk < old_end {
        fatal("break adjusted to free malloc space");
    }

    // non-contiguous extension: align a fresh top inside the new
    // region and wall off the old one behind fenceposts
    let front_misalign = chunk::chunk_to_mem(brk.cast()) as usize & ALIGN_MASK;
    let correction = if front_misalign != 0 { ALIGNMENT - front_misalign } else { 0 };
    let new_top = brk.add(correction).cast::<Chunk>();
    let new_top_size = size - correction;

    chunk::set_head(new_top, new_top_size | PREV_INUSE);
    (*av).top = new_top;

    if old_size != 0 {
        // a genuine discontinuity: some foreign actor owns the space
        // between the old top and the new region
        (*av).contiguous = false;
        fencepost_old_top(av, old_top, old_size);
    }
}

/// Grow a secondary arena: commit more of the current heap, or chain a
/// new one and retire the old top. Returns false if neither worked.
unsafe fn sys_alloc_secondary(nb: usize, av: *mut Arena) -> bool {
    let old_top = (*av).top;
    let old_size = chunk::size(old_top);
    let heap = heap_for_chunk(old_top);
    let old_heap_size = (*heap).size;

    if nb + MIN_CHUNK_SIZE > old_size
        && arena::grow_heap(heap, nb + MIN_CHUNK_SIZE - old_size)
    {
        (*av).system_mem += (*heap).size - old_heap_size;
        (*av).max_system_mem = (*av).max_system_mem.max((*av).system_mem);
        let new_top_size =
            heap.cast::<u8>().add((*heap).size) as usize - old_top.cast::<u8>() as usize;
        chunk::set_head(old_top, new_top_size | PREV_INUSE);
        return true;
    }

    let Some(new_heap) = arena::new_heap(
        nb + MIN_CHUNK_SIZE + core::mem::size_of::<Heap>(),
        PARAMS.top_pad.load(core::sync::atomic::Ordering::Relaxed),
    ) else {
        return false;
    };

    (*new_heap).ar_ptr = av;
    (*new_heap).prev = heap;
    (*av).system_mem += (*new_heap).size;
    (*av).max_system_mem = (*av).max_system_mem.max((*av).system_mem);

    let top = arena::heap_payload(new_heap).cast::<Chunk>();
    let top_size =
        new_heap.cast::<u8>().add((*new_heap).size) as usize - top.cast::<u8>() as usize;
    chunk::set_head(top, top_size | PREV_INUSE);
    (*av).top = top;

    fencepost_old_top(av, old_top, old_size);
    true
}

/// Shrink `old_top` so it ends in two minimal in-use headers; this
/// prevents any future coalescing from walking across the gap to the
/// region that now lies beyond it. The surviving body is released.
unsafe fn fencepost_old_top(av: *mut Arena, old_top: *mut Chunk, old_size: usize) {
    debug_assert!(old_size % ALIGNMENT == 0);

    if old_size < MIN_CHUNK_SIZE {
        // nothing worth fencing; leave the stub as a dead in-use chunk
        chunk::set_head(old_top, old_size | PREV_INUSE);
        return;
    }

    let body = (old_size - MIN_CHUNK_SIZE) & !ALIGN_MASK;

    let fence = chunk::chunk_at_offset(old_top, body);
    chunk::set_head(fence, HEADER_SIZE | PREV_INUSE);
    let fence2 = chunk::chunk_at_offset(old_top, body + HEADER_SIZE);
    chunk::set_head(fence2, HEADER_SIZE | PREV_INUSE);

    if body >= MIN_CHUNK_SIZE {
        chunk::set_head(old_top, body | PREV_INUSE | arena::arena_bit(av));
        engine::int_free(av, old_top, true);
    } else {
        chunk::set_head(old_top, (body + HEADER_SIZE) | PREV_INUSE);
    }
}

/// Return the page-aligned tail of the main arena's top to the kernel
/// through negative break movement. Fails silently when a foreign
/// actor moved the break since we last extended it.
pub(crate) unsafe fn sys_trim(pad: usize, av: *mut Arena) -> bool {
    debug_assert!(is_main(av));

    let top = (*av).top;
    let top_size = chunk::size(top);
    let page_mask = os::page_size() - 1;

    let top_area = match top_size.checked_sub(MIN_CHUNK_SIZE + 1) {
        Some(area) if area > pad => area,
        _ => return false,
    };
    let extra = (top_area - pad) & !page_mask;
    if extra == 0 {
        return false;
    }

    let current_brk = os::current_break();
    if current_brk != top.cast::<u8>().wrapping_add(top_size) {
        return false;
    }

    if os::move_break(-(extra as isize)).is_none() {
        return false;
    }

    // re-query rather than trusting the request; the kernel may round
    let released = current_brk as usize - os::current_break() as usize;
    if released == 0 {
        return false;
    }

    if let Some(hook) = hooks::heap_changed_hook() {
        hook(-(released as isize));
    }

    (*av).system_mem -= released;
    chunk::set_head(top, (top_size - released) | PREV_INUSE);
    true
}

/// Trim a secondary arena: unmap whole trailing heaps the top spans,
/// then decommit the page-aligned tail of the surviving heap.
pub(crate) unsafe fn heap_trim(mut heap: *mut Heap, pad: usize) -> bool {
    let av = (*heap).ar_ptr;
    let page_size = os::page_size();
    let page_mask = page_size - 1;
    let mut trimmed = false;

    // while the top chunk is the whole body of its heap, the heap can go
    while (*av).top == arena::heap_payload(heap).cast::<Chunk>() {
        let prev_heap = (*heap).prev;
        if prev_heap.is_null() {
            break;
        }

        // the previous heap ends in the two fencepost headers laid
        // down when it was abandoned
        let fence = prev_heap
            .cast::<u8>()
            .add((*prev_heap).size - MIN_CHUNK_SIZE)
            .cast::<Chunk>();
        debug_assert_eq!(chunk::size(fence), HEADER_SIZE);

        let mut p = fence;
        let mut new_size = chunk::size(p) + HEADER_SIZE;
        if !chunk::prev_inuse(p) {
            new_size += chunk::prev_size(p);
        }

        if new_size + (HEAP_MAX_SIZE - (*prev_heap).size) < pad + MIN_CHUNK_SIZE + page_size {
            break;
        }

        (*av).system_mem -= (*heap).size;
        arena::delete_heap(heap);
        heap = prev_heap;

        if !chunk::prev_inuse(p) {
            p = chunk::prev_chunk(p);
            engine::unlink_chunk(av, p);
            new_size = chunk::size(p) + 2 * HEADER_SIZE;
        }

        debug_assert_eq!(
            p.cast::<u8>().add(new_size),
            heap.cast::<u8>().add((*heap).size)
        );

        (*av).top = p;
        chunk::set_head(p, new_size | PREV_INUSE);
        trimmed = true;
    }

    let top = (*av).top;
    let top_size = chunk::size(top);
    let top_area = match top_size.checked_sub(MIN_CHUNK_SIZE + 1) {
        Some(area) if area > pad => area,
        _ => return trimmed,
    };
    let extra = (top_area - pad) & !page_mask;
    if extra == 0 {
        return trimmed;
    }

    arena::shrink_heap(heap, (*heap).size - extra);
    (*av).system_mem -= extra;
    chunk::set_head(top, (top_size - extra) | PREV_INUSE);
    true
}

/// Advise away every whole page inside the free chunks of all bins.
/// Structural state is untouched; only residency changes.
pub(crate) unsafe fn advise_free_pages(av: *mut Arena) {
    let page_size = os::page_size();
    let page_mask = page_size - 1;

    for index in 1..crate::binning::NBINS {
        let bin = arena::bin_at(av, index);
        let mut p = chunk::bk(bin);

        while p != bin {
            let size = chunk::size(p);

            if size > page_size + MIN_CHUNK_SIZE {
                // keep the header and list links resident
                let body = chunk::chunk_to_mem(p).add(2 * HEADER_SIZE);
                let aligned = crate::ptr_utils::align_up_by(body, page_mask);
                let end = p.cast::<u8>().add(size) as usize & !page_mask;

                if end > aligned as usize {
                    os::advise_unused(aligned, end - aligned as usize);
                }
            }

            p = chunk::bk(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_chunk_round_trip() {
        unsafe {
            let nb = chunk::request_to_size(256 * 1024);

            let mem = mmap_chunk(nb);
            assert!(!mem.is_null());
            assert_eq!(mem as usize & ALIGN_MASK, 0);

            let p = chunk::mem_to_chunk(mem);
            assert!(chunk::is_mmapped(p));
            assert!(chunk::size(p) >= nb);
            assert!(PARAMS.n_mmaps.load(core::sync::atomic::Ordering::Relaxed) >= 1);

            mem.write_bytes(0x42, nb - WORD_SIZE);

            munmap_chunk(p);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn mapped_chunk_remap_preserves_contents() {
        unsafe {
            let nb = chunk::request_to_size(128 * 1024);
            let mem = mmap_chunk(nb);
            assert!(!mem.is_null());
            mem.write_bytes(0x3c, 4096);

            let p = chunk::mem_to_chunk(mem);
            let grown = mremap_chunk(p, 512 * 1024).expect("remap");
            assert!(chunk::size(grown) >= chunk::request_to_size(512 * 1024));

            let new_mem = chunk::chunk_to_mem(grown);
            for offset in 0..4096 {
                assert_eq!(*new_mem.add(offset), 0x3c);
            }

            munmap_chunk(grown);
        }
    }
}
