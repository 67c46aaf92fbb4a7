//! The allocation engine: fast bins, the unsorted queue, small and
//! large bins, splitting and coalescing, and the tiered search that
//! every allocation walks.
//!
//! Everything here runs under the owning arena's lock except the fast
//! bin heads, which are compare-and-swap stacks so that releases can
//! make progress while another thread holds the arena for slow-path
//! work. When only one thread has ever touched the allocator the
//! atomics degrade to plain loads and stores.

use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::arena::{self, Arena, bin_at, heap_for_chunk, is_main};
use crate::binning::{
    FASTBIN_CONSOLIDATION_THRESHOLD, NBINS, UNSORTED_BIN, bin_index, fastbin_index,
    in_smallbin_range, largebin_index, smallbin_index, tcache_index,
};
use crate::chunk::{
    self, Chunk, HEADER_SIZE, MIN_CHUNK_SIZE, PREV_INUSE, checked_request_to_size,
};
use crate::fatal::fatal;
use crate::params::{PARAMS, alloc_perturb, free_perturb};
use crate::sysmem;
use crate::tcache;

/// Cap on chunks processed per drain of the unsorted queue.
const MAX_UNSORTED_ITERS: usize = 10_000;

/// Remove `p` from its doubly-linked bin, verifying the link-backs and,
/// for large chunks, the size-ordering ring.
pub(crate) unsafe fn unlink_chunk(_av: *mut Arena, p: *mut Chunk) {
    let size = chunk::size(p);

    if chunk::prev_size(chunk::chunk_at_offset(p, size)) != size {
        fatal("corrupted size vs. prev_size");
    }

    let fd = chunk::fd(p);
    let bk = chunk::bk(p);

    if chunk::bk(fd) != p || chunk::fd(bk) != p {
        fatal("corrupted double-linked list");
    }

    chunk::set_bk(fd, bk);
    chunk::set_fd(bk, fd);

    if !in_smallbin_range(size) && !chunk::fd_nextsize(p).is_null() {
        let p_fd_nextsize = chunk::fd_nextsize(p);
        let p_bk_nextsize = chunk::bk_nextsize(p);

        if chunk::bk_nextsize(p_fd_nextsize) != p || chunk::fd_nextsize(p_bk_nextsize) != p {
            fatal("corrupted double-linked list (not small)");
        }

        if chunk::fd_nextsize(fd).is_null() {
            // hand the skip node role to the duplicate behind us
            if p_fd_nextsize == p {
                chunk::set_fd_nextsize(fd, fd);
                chunk::set_bk_nextsize(fd, fd);
            } else {
                chunk::set_fd_nextsize(fd, p_fd_nextsize);
                chunk::set_bk_nextsize(fd, p_bk_nextsize);
                chunk::set_bk_nextsize(p_fd_nextsize, fd);
                chunk::set_fd_nextsize(p_bk_nextsize, fd);
            }
        } else {
            chunk::set_bk_nextsize(p_fd_nextsize, p_bk_nextsize);
            chunk::set_fd_nextsize(p_bk_nextsize, p_fd_nextsize);
        }
    }
}

unsafe fn fastbin_push(av: *mut Arena, idx: usize, p: *mut Chunk, have_lock: bool) {
    let fb = &(*av).fastbins[idx];

    if tcache::single_threaded() {
        let old = fb.load(Relaxed);
        if old == p {
            fatal("double free or corruption (fasttop)");
        }
        if have_lock && !old.is_null() && fastbin_index(chunk::size(old)) != idx {
            fatal("invalid fastbin entry (free)");
        }
        chunk::set_fd(p, old);
        fb.store(p, Relaxed);
    } else {
        let mut old = fb.load(Acquire);
        loop {
            if old == p {
                fatal("double free or corruption (fasttop)");
            }
            chunk::set_fd(p, old);
            match fb.compare_exchange_weak(old, p, Release, Acquire) {
                Ok(_) => break,
                Err(seen) => old = seen,
            }
        }
        if have_lock && !old.is_null() && fastbin_index(chunk::size(old)) != idx {
            fatal("invalid fastbin entry (free)");
        }
    }
}

unsafe fn fastbin_pop(av: *mut Arena, idx: usize) -> *mut Chunk {
    let fb = &(*av).fastbins[idx];

    if tcache::single_threaded() {
        let victim = fb.load(Relaxed);
        if !victim.is_null() {
            fb.store(chunk::fd(victim), Relaxed);
        }
        victim
    } else {
        let mut victim = fb.load(Acquire);
        while !victim.is_null() {
            match fb.compare_exchange_weak(victim, chunk::fd(victim), Acquire, Acquire) {
                Ok(_) => break,
                Err(seen) => victim = seen,
            }
        }
        victim
    }
}

/// Insert a free chunk at the head of the unsorted queue.
///
/// The queue-head link-back is verified first; the given tag lets each
/// caller keep its own diagnostic.
unsafe fn unsorted_insert(av: *mut Arena, p: *mut Chunk, size: usize, tag: &'static str) {
    let bck = bin_at(av, UNSORTED_BIN);
    let fwd = chunk::fd(bck);

    if chunk::bk(fwd) != bck {
        fatal(tag);
    }

    chunk::set_fd(p, fwd);
    chunk::set_bk(p, bck);
    if !in_smallbin_range(size) {
        chunk::set_fd_nextsize(p, core::ptr::null_mut());
        chunk::set_bk_nextsize(p, core::ptr::null_mut());
    }
    chunk::set_fd(bck, p);
    chunk::set_bk(fwd, p);
}

/// Fold every fast bin into the unsorted queue (or the top), coalescing
/// each chunk with its free neighbors on the way.
pub(crate) unsafe fn malloc_consolidate(av: *mut Arena) {
    (*av).have_fastchunks.store(false, Relaxed);

    let unsorted = bin_at(av, UNSORTED_BIN);

    for idx in 0..crate::binning::NFASTBINS {
        let mut p = (*av).fastbins[idx].swap(core::ptr::null_mut(), Acquire);

        while !p.is_null() {
            if fastbin_index(chunk::size(p)) != idx {
                fatal("malloc_consolidate(): invalid chunk size");
            }

            let next_p = chunk::fd(p);

            let mut size = chunk::size(p);
            let mut merged = p;

            if !chunk::prev_inuse(p) {
                let prev_size = chunk::prev_size(p);
                size += prev_size;
                merged = p.cast::<u8>().sub(prev_size).cast();
                if chunk::size(merged) != prev_size {
                    fatal("corrupted size vs. prev_size while consolidating");
                }
                unlink_chunk(av, merged);
            }

            let nextchunk = chunk::chunk_at_offset(merged, size);
            if nextchunk != (*av).top {
                let nextsize = chunk::size(nextchunk);
                let nextinuse = chunk::inuse_bit_at_offset(nextchunk, nextsize);

                if !nextinuse {
                    size += nextsize;
                    unlink_chunk(av, nextchunk);
                } else {
                    chunk::clear_inuse_bit_at_offset(nextchunk, 0);
                }

                let first = chunk::fd(unsorted);
                chunk::set_fd(unsorted, merged);
                chunk::set_bk(first, merged);
                chunk::set_bk(merged, unsorted);
                chunk::set_fd(merged, first);

                if !in_smallbin_range(size) {
                    chunk::set_fd_nextsize(merged, core::ptr::null_mut());
                    chunk::set_bk_nextsize(merged, core::ptr::null_mut());
                }

                chunk::set_head(merged, size | PREV_INUSE);
                chunk::set_foot(merged, size);
            } else {
                size += chunk::size(nextchunk);
                chunk::set_head(merged, size | PREV_INUSE);
                (*av).top = merged;
            }

            p = next_p;
        }
    }
}

/// The engine allocation path. Called with `av` locked; returns the
/// user pointer, or null after exhausting every tier including system
/// acquisition.
pub(crate) unsafe fn int_malloc(av: *mut Arena, bytes: usize) -> *mut u8 {
    let Some(nb) = checked_request_to_size(bytes) else {
        return core::ptr::null_mut();
    };

    let tc_idx = tcache_index(nb);

    // fast bins: exact size, no coalescing, lock-free pop
    let max_fast = PARAMS.max_fast();
    if max_fast != 0 && nb <= max_fast {
        let idx = fastbin_index(nb);
        let victim = fastbin_pop(av, idx);

        if !victim.is_null() {
            if fastbin_index(chunk::size(victim)) != idx {
                fatal("malloc(): memory corruption (fast)");
            }

            // prewarm: migrate further same-size chunks into the tcache
            if let Some(tc_idx) = tc_idx {
                while tcache::has_room(tc_idx) {
                    let extra = fastbin_pop(av, idx);
                    if extra.is_null() {
                        break;
                    }
                    if fastbin_index(chunk::size(extra)) != idx {
                        fatal("malloc(): memory corruption (fast)");
                    }
                    tcache::put_unchecked(extra, tc_idx);
                }
            }

            let mem = chunk::chunk_to_mem(victim);
            alloc_perturb(mem, bytes);
            return mem;
        }
    }

    // small bins: exact size, FIFO, oldest first
    let mut idx;
    if in_smallbin_range(nb) {
        idx = smallbin_index(nb);
        let bin = bin_at(av, idx);
        let victim = chunk::bk(bin);

        if victim != bin {
            let bck = chunk::bk(victim);
            if chunk::fd(bck) != victim {
                fatal("malloc(): smallbin double linked list corrupted");
            }

            chunk::set_inuse_bit_at_offset(victim, nb);
            chunk::set_bk(bin, bck);
            chunk::set_fd(bck, bin);
            (*victim).head |= arena::arena_bit(av);

            if let Some(tc_idx) = tc_idx {
                while tcache::has_room(tc_idx) {
                    let tc_victim = chunk::bk(bin);
                    if tc_victim == bin {
                        break;
                    }
                    let bck = chunk::bk(tc_victim);
                    chunk::set_inuse_bit_at_offset(tc_victim, nb);
                    chunk::set_bk(bin, bck);
                    chunk::set_fd(bck, bin);
                    (*tc_victim).head |= arena::arena_bit(av);
                    tcache::put_unchecked(tc_victim, tc_idx);
                }
            }

            let mem = chunk::chunk_to_mem(victim);
            alloc_perturb(mem, bytes);
            return mem;
        }
    } else {
        idx = largebin_index(nb);
        if (*av).have_fastchunks.load(Relaxed) {
            malloc_consolidate(av);
        }
    }

    let tcache_unsorted_limit = PARAMS.tcache_unsorted_limit.load(Relaxed);

    loop {
        let mut iters = 0usize;
        let mut tcache_unsorted_count = 0usize;
        let mut return_cached = false;

        // drain the unsorted queue from the tail
        'drain: loop {
            let unsorted = bin_at(av, UNSORTED_BIN);
            let victim = chunk::bk(unsorted);
            if victim == unsorted {
                break 'drain;
            }

            let size = chunk::size(victim);
            let next = chunk::chunk_at_offset(victim, size);
            let bck = chunk::bk(victim);

            if size <= HEADER_SIZE || size > (*av).system_mem {
                fatal("malloc(): invalid size (unsorted)");
            }
            // a fencepost successor legitimately reads one header wide
            if chunk::size(next) < HEADER_SIZE || chunk::size(next) > (*av).system_mem {
                fatal("malloc(): invalid next size (unsorted)");
            }
            if chunk::prev_size(next) != size {
                fatal("malloc(): mismatching next->prev_size (unsorted)");
            }
            if chunk::fd(bck) != victim || chunk::fd(victim) != unsorted {
                fatal("malloc(): unsorted double linked list corrupted");
            }
            if chunk::prev_inuse(next) {
                fatal("malloc(): invalid next->prev_inuse (unsorted)");
            }

            // the cached remainder of the last split serves small
            // requests directly, preserving locality
            if in_smallbin_range(nb)
                && bck == unsorted
                && victim == (*av).last_remainder
                && size > nb + MIN_CHUNK_SIZE
            {
                let remainder_size = size - nb;
                let remainder = chunk::chunk_at_offset(victim, nb);

                chunk::set_bk(unsorted, remainder);
                chunk::set_fd(unsorted, remainder);
                chunk::set_bk(remainder, unsorted);
                chunk::set_fd(remainder, unsorted);
                (*av).last_remainder = remainder;

                if !in_smallbin_range(remainder_size) {
                    chunk::set_fd_nextsize(remainder, core::ptr::null_mut());
                    chunk::set_bk_nextsize(remainder, core::ptr::null_mut());
                }

                chunk::set_head(victim, nb | PREV_INUSE | arena::arena_bit(av));
                chunk::set_head(remainder, remainder_size | PREV_INUSE);
                chunk::set_foot(remainder, remainder_size);

                let mem = chunk::chunk_to_mem(victim);
                alloc_perturb(mem, bytes);
                return mem;
            }

            // take the chunk off the queue
            chunk::set_bk(unsorted, bck);
            chunk::set_fd(bck, unsorted);

            if size == nb {
                chunk::set_inuse_bit_at_offset(victim, size);
                (*victim).head |= arena::arena_bit(av);

                // cache the exact fit and keep draining; the last one
                // cached comes back out when the drain settles
                if let Some(tc_idx) = tc_idx {
                    if tcache::has_room(tc_idx) {
                        tcache::put_unchecked(victim, tc_idx);
                        return_cached = true;

                        tcache_unsorted_count += 1;
                        if tcache_unsorted_limit > 0
                            && tcache_unsorted_count > tcache_unsorted_limit
                        {
                            break 'drain;
                        }

                        iters += 1;
                        if iters >= MAX_UNSORTED_ITERS {
                            break 'drain;
                        }
                        continue 'drain;
                    }
                }

                let mem = chunk::chunk_to_mem(victim);
                alloc_perturb(mem, bytes);
                return mem;
            }

            // bin the chunk where it belongs
            let victim_index;
            let mut bck;
            let mut fwd;

            if in_smallbin_range(size) {
                victim_index = smallbin_index(size);
                bck = bin_at(av, victim_index);
                fwd = chunk::fd(bck);
            } else {
                victim_index = largebin_index(size);
                bck = bin_at(av, victim_index);
                fwd = chunk::fd(bck);

                if fwd != bck {
                    // non-empty: maintain decreasing size order through
                    // the skip ring, one representative per size
                    if size < chunk::size(chunk::bk(bck)) {
                        // new smallest; becomes the tail representative
                        fwd = bck;
                        bck = chunk::bk(bck);

                        let head = chunk::fd(fwd);
                        chunk::set_fd_nextsize(victim, head);
                        chunk::set_bk_nextsize(victim, chunk::bk_nextsize(head));
                        if chunk::fd_nextsize(chunk::bk_nextsize(victim)) != head {
                            fatal("malloc(): largebin double linked list corrupted");
                        }
                        chunk::set_bk_nextsize(head, victim);
                        chunk::set_fd_nextsize(chunk::bk_nextsize(victim), victim);
                    } else {
                        while size < chunk::size(fwd) {
                            fwd = chunk::fd_nextsize(fwd);
                        }

                        if size == chunk::size(fwd) {
                            // duplicate: stack behind the representative
                            fwd = chunk::fd(fwd);
                        } else {
                            chunk::set_fd_nextsize(victim, fwd);
                            chunk::set_bk_nextsize(victim, chunk::bk_nextsize(fwd));
                            if chunk::fd_nextsize(chunk::bk_nextsize(fwd)) != fwd {
                                fatal("malloc(): largebin double linked list corrupted");
                            }
                            chunk::set_bk_nextsize(fwd, victim);
                            chunk::set_fd_nextsize(chunk::bk_nextsize(victim), victim);
                        }
                        bck = chunk::bk(fwd);
                    }
                } else {
                    chunk::set_fd_nextsize(victim, victim);
                    chunk::set_bk_nextsize(victim, victim);
                }
            }

            (*av).binmap.mark(victim_index);
            chunk::set_bk(victim, bck);
            chunk::set_fd(victim, fwd);
            chunk::set_bk(fwd, victim);
            chunk::set_fd(bck, victim);

            iters += 1;
            if iters >= MAX_UNSORTED_ITERS {
                break 'drain;
            }
        }

        if return_cached {
            // SAFETY: we stashed at least one exact fit above
            if let Some(tc_idx) = tc_idx {
                if let Some(mem) = tcache::get(tc_idx) {
                    alloc_perturb(mem, bytes);
                    return mem;
                }
            }
        }

        // large requests: best fit from the size-sorted bin
        if !in_smallbin_range(nb) {
            let bin = bin_at(av, idx);
            let first = chunk::fd(bin);

            if first != bin && chunk::size(first) >= nb {
                // walk from the smallest representative upward
                let mut victim = chunk::bk_nextsize(first);
                let mut size = chunk::size(victim);
                while size < nb {
                    victim = chunk::bk_nextsize(victim);
                    size = chunk::size(victim);
                }

                // prefer an equal-size duplicate so the skip ring
                // needs no rewiring on unlink
                if victim != chunk::bk(bin) && size == chunk::size(chunk::fd(victim)) {
                    victim = chunk::fd(victim);
                }

                let remainder_size = size - nb;
                unlink_chunk(av, victim);

                if remainder_size < MIN_CHUNK_SIZE {
                    chunk::set_inuse_bit_at_offset(victim, size);
                    (*victim).head |= arena::arena_bit(av);
                } else {
                    let remainder = chunk::chunk_at_offset(victim, nb);
                    unsorted_insert(av, remainder, remainder_size, "malloc(): corrupted unsorted chunks");

                    chunk::set_head(victim, nb | PREV_INUSE | arena::arena_bit(av));
                    chunk::set_head(remainder, remainder_size | PREV_INUSE);
                    chunk::set_foot(remainder, remainder_size);
                }

                let mem = chunk::chunk_to_mem(victim);
                alloc_perturb(mem, bytes);
                return mem;
            }
        }

        // scan upward through the binmap for any sufficient bin
        let mut scan_idx = idx + 1;
        loop {
            let Some(found) = (*av).binmap.next_marked(scan_idx) else {
                break;
            };
            if found >= NBINS {
                break;
            }

            let bin = bin_at(av, found);
            let victim = chunk::bk(bin);

            if victim == bin {
                // stale map bit
                (*av).binmap.unmark(found);
                scan_idx = found + 1;
                continue;
            }

            // any chunk of a higher bin is big enough by construction
            let size = chunk::size(victim);
            debug_assert!(size >= nb);
            let remainder_size = size - nb;

            unlink_chunk(av, victim);

            if remainder_size < MIN_CHUNK_SIZE {
                chunk::set_inuse_bit_at_offset(victim, size);
                (*victim).head |= arena::arena_bit(av);
            } else {
                let remainder = chunk::chunk_at_offset(victim, nb);
                unsorted_insert(av, remainder, remainder_size, "malloc(): corrupted unsorted chunks 2");

                if in_smallbin_range(nb) {
                    (*av).last_remainder = remainder;
                }

                chunk::set_head(victim, nb | PREV_INUSE | arena::arena_bit(av));
                chunk::set_head(remainder, remainder_size | PREV_INUSE);
                chunk::set_foot(remainder, remainder_size);
            }

            let mem = chunk::chunk_to_mem(victim);
            alloc_perturb(mem, bytes);
            return mem;
        }

        // the wilderness
        let top = (*av).top;
        let top_size = chunk::size(top);

        if top_size > (*av).system_mem {
            fatal("malloc(): corrupted top size");
        }

        if top_size >= nb + MIN_CHUNK_SIZE {
            let remainder_size = top_size - nb;
            let remainder = chunk::chunk_at_offset(top, nb);
            (*av).top = remainder;
            chunk::set_head(top, nb | PREV_INUSE | arena::arena_bit(av));
            chunk::set_head(remainder, remainder_size | PREV_INUSE);

            let mem = chunk::chunk_to_mem(top);
            alloc_perturb(mem, bytes);
            return mem;
        }

        if (*av).have_fastchunks.load(Relaxed) {
            // free fast chunks may coalesce into something usable
            malloc_consolidate(av);
            idx = bin_index(nb);
            continue;
        }

        let mem = sysmem::sys_alloc(nb, av);
        if !mem.is_null() {
            alloc_perturb(mem, bytes);
        }
        return mem;
    }
}

/// The engine release path. `have_lock` states whether the caller
/// already holds the arena lock (fencepost retirement, realloc tails).
pub(crate) unsafe fn int_free(av: *mut Arena, p: *mut Chunk, have_lock: bool) {
    let size = chunk::size(p);

    if (p as usize) > usize::MAX - size || chunk::chunk_to_mem(p) as usize & chunk::ALIGN_MASK != 0
    {
        fatal("free(): invalid pointer");
    }
    if size < MIN_CHUNK_SIZE || size & chunk::ALIGN_MASK != 0 {
        fatal("free(): invalid size");
    }

    let max_fast = PARAMS.max_fast();
    if max_fast != 0 && size <= max_fast {
        let next_size = chunk::size(chunk::chunk_at_offset(p, size));
        if next_size < HEADER_SIZE || next_size >= (*av).system_mem {
            fatal("free(): invalid next size (fast)");
        }

        free_perturb(chunk::chunk_to_mem(p), size - HEADER_SIZE);

        (*av).have_fastchunks.store(true, Relaxed);
        fastbin_push(av, fastbin_index(size), p, have_lock);
        return;
    }

    if chunk::is_mmapped(p) {
        sysmem::munmap_chunk(p);
        return;
    }

    if !have_lock {
        arena::lock(av);
    }

    let nextchunk = chunk::chunk_at_offset(p, size);

    if p == (*av).top {
        fatal("double free or corruption (top)");
    }
    if (*av).contiguous
        && nextchunk.cast::<u8>()
            >= (*av).top.cast::<u8>().wrapping_add(chunk::size((*av).top))
    {
        fatal("double free or corruption (out)");
    }
    if !chunk::prev_inuse(nextchunk) {
        fatal("double free or corruption (!prev)");
    }

    let nextsize = chunk::size(nextchunk);
    if nextsize < HEADER_SIZE || nextsize >= (*av).system_mem {
        fatal("free(): invalid next size (normal)");
    }

    free_perturb(chunk::chunk_to_mem(p), size - HEADER_SIZE);

    let mut p = p;
    let mut size = size;

    // backward coalesce
    if !chunk::prev_inuse(p) {
        let prevsize = chunk::prev_size(p);
        size += prevsize;
        p = p.cast::<u8>().sub(prevsize).cast();
        if chunk::size(p) != prevsize {
            fatal("corrupted size vs. prev_size");
        }
        unlink_chunk(av, p);
    }

    if nextchunk != (*av).top {
        // forward coalesce, then stage in the unsorted queue
        let nextinuse = chunk::inuse_bit_at_offset(nextchunk, nextsize);

        if !nextinuse {
            unlink_chunk(av, nextchunk);
            size += nextsize;
        } else {
            chunk::clear_inuse_bit_at_offset(nextchunk, 0);
        }

        unsorted_insert(av, p, size, "free(): corrupted unsorted chunks");
        chunk::set_head(p, size | PREV_INUSE);
        chunk::set_foot(p, size);
    } else {
        // the released block borders the wilderness; melt into it
        size += nextsize;
        chunk::set_head(p, size | PREV_INUSE);
        (*av).top = p;
    }

    // a large coalesced block hints that the locality burst is over
    if size >= FASTBIN_CONSOLIDATION_THRESHOLD {
        if (*av).have_fastchunks.load(Relaxed) {
            malloc_consolidate(av);
        }

        if is_main(av) {
            if chunk::size((*av).top) >= PARAMS.trim_threshold() {
                sysmem::sys_trim(PARAMS.top_pad.load(Relaxed), av);
            }
        } else {
            let heap = heap_for_chunk((*av).top);
            if chunk::size((*av).top) >= PARAMS.trim_threshold() {
                sysmem::heap_trim(heap, PARAMS.top_pad.load(Relaxed));
            }
        }
    }

    if !have_lock {
        arena::unlock(av);
    }
}

/// Release a chunk to its owning arena, bypassing the thread cache.
/// Used by the tcache drain and internal retirement paths.
pub(crate) unsafe fn free_to_arena(p: *mut Chunk) {
    if chunk::is_mmapped(p) {
        sysmem::munmap_chunk(p);
        return;
    }

    // SAFETY: non-mapped chunks always belong to an arena
    let av = arena::arena_for_chunk(p).unwrap_unchecked();
    int_free(av, p, false);
}

/// The engine reallocation path. Called with `av` locked and `p` not
/// mapped; returns null (old chunk intact) on failure.
pub(crate) unsafe fn int_realloc(
    av: *mut Arena,
    p: *mut Chunk,
    old_size: usize,
    nb: usize,
) -> *mut u8 {
    if old_size < MIN_CHUNK_SIZE || old_size >= (*av).system_mem {
        fatal("realloc(): invalid old size");
    }

    let next = chunk::chunk_at_offset(p, old_size);
    let next_size = chunk::size(next);
    if next_size < HEADER_SIZE || next_size >= (*av).system_mem {
        fatal("realloc(): invalid next size");
    }

    let mut newp = p;
    let mut new_size = old_size;

    if old_size < nb {
        if next == (*av).top && old_size + next_size >= nb + MIN_CHUNK_SIZE {
            // expand into the wilderness
            let new_top = chunk::chunk_at_offset(p, nb);
            chunk::set_head(new_top, (old_size + next_size - nb) | PREV_INUSE);
            (*av).top = new_top;
            chunk::set_head_size(p, nb);
            return chunk::chunk_to_mem(p);
        }

        if next != (*av).top && !chunk::inuse(next) && old_size + next_size >= nb {
            // absorb the free successor
            unlink_chunk(av, next);
            new_size = old_size + next_size;
        } else {
            // move: allocate, copy payload, release the old chunk
            let new_mem = int_malloc(av, nb - crate::ptr_utils::WORD_SIZE);
            if new_mem.is_null() {
                return core::ptr::null_mut();
            }

            newp = chunk::mem_to_chunk(new_mem);
            new_size = chunk::size(newp);

            if newp == next {
                // the allocator handed back the successor itself
                new_size += old_size;
                newp = p;
            } else {
                let old_mem = chunk::chunk_to_mem(p);
                core::ptr::copy_nonoverlapping(
                    old_mem,
                    new_mem,
                    old_size - crate::ptr_utils::WORD_SIZE,
                );
                int_free(av, p, true);
                return new_mem;
            }
        }
    }

    // in place, possibly with a releasable tail
    debug_assert!(new_size >= nb);
    let remainder_size = new_size - nb;

    if remainder_size < MIN_CHUNK_SIZE {
        chunk::set_head_size(newp, new_size);
        chunk::set_inuse_bit_at_offset(newp, new_size);
    } else {
        let remainder = chunk::chunk_at_offset(newp, nb);
        chunk::set_head_size(newp, nb);
        chunk::set_head(
            remainder,
            remainder_size | PREV_INUSE | arena::arena_bit(av),
        );
        chunk::set_inuse_bit_at_offset(remainder, remainder_size);
        int_free(av, remainder, true);
    }

    chunk::chunk_to_mem(newp)
}

/// The engine aligned-allocation path: over-allocate, carve an aligned
/// chunk out of the middle, and release both flanks.
pub(crate) unsafe fn int_memalign(av: *mut Arena, alignment: usize, bytes: usize) -> *mut u8 {
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(alignment > chunk::ALIGNMENT);

    let Some(nb) = checked_request_to_size(bytes) else {
        return core::ptr::null_mut();
    };

    let mem = int_malloc(av, nb + alignment + MIN_CHUNK_SIZE);
    if mem.is_null() {
        return core::ptr::null_mut();
    }

    let mut p = chunk::mem_to_chunk(mem);

    if mem as usize & (alignment - 1) != 0 {
        // find an aligned interior position at least a minimum chunk
        // past the base, so the lead can be released as a real chunk
        let mut aligned_mem =
            crate::ptr_utils::align_up_by(mem, alignment - 1);
        if (aligned_mem as usize - mem as usize) < MIN_CHUNK_SIZE {
            aligned_mem = aligned_mem.add(alignment);
        }
        let newp = chunk::mem_to_chunk(aligned_mem);
        let lead_size = newp.cast::<u8>() as usize - p.cast::<u8>() as usize;
        let new_size = chunk::size(p) - lead_size;

        if chunk::is_mmapped(p) {
            chunk::set_prev_size(newp, chunk::prev_size(p) + lead_size);
            chunk::set_head(newp, new_size | chunk::IS_MMAPPED);
            return chunk::chunk_to_mem(newp);
        }

        chunk::set_head(newp, new_size | PREV_INUSE | arena::arena_bit(av));
        chunk::set_inuse_bit_at_offset(newp, new_size);
        chunk::set_head_size(p, lead_size);
        int_free(av, p, true);
        p = newp;
    }

    if !chunk::is_mmapped(p) {
        let size = chunk::size(p);
        if size > nb + MIN_CHUNK_SIZE {
            let remainder_size = size - nb;
            let remainder = chunk::chunk_at_offset(p, nb);
            chunk::set_head(
                remainder,
                remainder_size | PREV_INUSE | arena::arena_bit(av),
            );
            chunk::set_head_size(p, nb);
            int_free(av, remainder, true);
        }
    }

    chunk::chunk_to_mem(p)
}

/// Walk every bin of a locked arena checking the structural invariants
/// reachable without knowing the physical region bounds. Test support.
#[cfg(test)]
pub(crate) unsafe fn verify_arena(av: *mut Arena) {
    for index in 1..NBINS {
        let bin = bin_at(av, index);
        let mut p = chunk::fd(bin);
        let mut prev = bin;

        while p != bin {
            // link-backs
            assert_eq!(chunk::bk(p), prev, "bin {index} broken bk");
            let size = chunk::size(p);

            // boundary tag and successor P bit
            let next = chunk::chunk_at_offset(p, size);
            assert_eq!(chunk::prev_size(next), size, "bin {index} bad foot");
            assert!(!chunk::prev_inuse(next), "bin {index} successor P set");

            // no two adjacent free chunks: the successor must be used
            // (or the top, which is never binned)
            if next != (*av).top {
                assert!(chunk::inuse(next), "bin {index} adjacent free chunks");
            }

            // size-class membership
            if index >= 2 {
                assert_eq!(bin_index(size), index, "bin {index} misfiled size {size}");
            }

            prev = p;
            p = chunk::fd(p);
        }

        // large-bin skip ring: strictly decreasing, closes on itself
        if index >= crate::binning::largebin_index(crate::binning::MIN_LARGE_SIZE)
            && chunk::fd(bin) != bin
        {
            let first = chunk::fd(bin);
            if !chunk::fd_nextsize(first).is_null() {
                let mut sizes = vec![];
                let mut q = first;
                loop {
                    sizes.push(chunk::size(q));
                    q = chunk::fd_nextsize(q);
                    if q == first {
                        break;
                    }
                    assert!(sizes.len() <= NBINS * 64, "skip ring does not close");
                }
                for pair in sizes.windows(2) {
                    assert!(pair[0] > pair[1], "skip ring not strictly decreasing");
                }
            }
        }
    }
}
