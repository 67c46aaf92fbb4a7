//! # Marl
//!
//! A general-purpose, multi-arena memory allocator for Unix processes,
//! built on boundary-tagged chunks and tiered free lists: a per-thread
//! cache, lock-free fast bins, an unsorted staging queue, exact-size
//! small bins, and size-sorted large bins with skip links.
//!
//! The main arena grows through the process break; further arenas are
//! created under contention inside aligned mapped heaps, and oversize
//! requests become standalone page mappings. Unused memory flows back
//! to the OS through top-chunk trimming and page advice.
//!
//! ## Quick start
//!
//! ```
//! let mem = unsafe { marl::allocate(100) };
//! assert!(!mem.is_null());
//! unsafe { marl::release(mem) };
//! ```
//!
//! Or install the handle as the global allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOCATOR: marl::Marl = marl::Marl;
//! ```
//!
//! Integrity violations (double frees, trampled boundary tags, broken
//! list link-backs) are reported with a stable one-line tag on stderr
//! and abort the process; see the crate's error-handling docs.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod api;
mod arena;
mod binning;
mod chunk;
mod engine;
mod fatal;
mod hooks;
mod os;
mod params;
mod ptr_utils;
mod sync;
mod sysmem;
mod tcache;

pub use api::{
    Marl, Tunable, aligned_allocate, allocate, reallocate, release, trim, tune, usable_size,
};
pub use chunk::{ALIGNMENT, MIN_CHUNK_SIZE};
pub use hooks::{
    AlignedAllocHook, AllocHook, HeapChangedHook, ReallocHook, ReleaseHook,
    set_aligned_alloc_hook, set_alloc_hook, set_heap_changed_hook, set_realloc_hook,
    set_release_hook,
};
pub use sync::SystemMutex;

#[cfg(test)]
mod tests {
    use crate::chunk::{self, request_to_size};
    use crate::{arena, engine, sysmem};

    use super::*;

    unsafe fn scenario_arena() -> *mut arena::Arena {
        // a private arena keeps these scenarios independent of
        // whatever state other tests leave in the shared ones
        arena::create_arena(1 << 20).expect("scenario arena")
    }

    #[test]
    fn fast_bin_recycles_lifo() {
        unsafe {
            let av = scenario_arena();

            let p1 = engine::int_malloc(av, 24);
            let p2 = engine::int_malloc(av, 24);
            assert!(!p1.is_null() && !p2.is_null());

            engine::int_free(av, chunk::mem_to_chunk(p1), true);
            engine::int_free(av, chunk::mem_to_chunk(p2), true);

            assert_eq!(engine::int_malloc(av, 24), p2);
            assert_eq!(engine::int_malloc(av, 24), p1);

            engine::verify_arena(av);
            arena::unlock(av);
        }
    }

    #[test]
    fn coalesced_neighbors_serve_combined_request() {
        unsafe {
            let av = scenario_arena();

            // 1200 rounds past both the fast ceiling and the cached range
            let p1 = engine::int_malloc(av, 1200);
            let p2 = engine::int_malloc(av, 1200);
            let guard = engine::int_malloc(av, 1200);
            assert!(!guard.is_null());

            let c1 = chunk::mem_to_chunk(p1);
            let combined = 2 * chunk::size(c1);

            engine::int_free(av, c1, true);
            engine::int_free(av, chunk::mem_to_chunk(p2), true);

            // backward coalesce merged both into one block at p1
            assert_eq!(chunk::size(c1), combined);
            assert!(!chunk::prev_inuse(chunk::mem_to_chunk(guard)));
            assert_eq!(chunk::prev_size(chunk::mem_to_chunk(guard)), combined);

            let p = engine::int_malloc(av, combined - crate::ptr_utils::WORD_SIZE);
            assert_eq!(p, p1);

            engine::verify_arena(av);
            arena::unlock(av);
        }
    }

    #[test]
    fn large_block_splits_from_its_base() {
        unsafe {
            let av = scenario_arena();

            let big = engine::int_malloc(av, 0x10000 - 8);
            let guard = engine::int_malloc(av, 64);
            assert!(!guard.is_null());
            assert_eq!(chunk::size(chunk::mem_to_chunk(big)), 0x10000);

            engine::int_free(av, chunk::mem_to_chunk(big), true);

            let p = engine::int_malloc(av, 0x400 - 8);
            assert_eq!(p, big, "first carve comes from the old block's base");

            let q = engine::int_malloc(av, 0x400 - 8);
            assert_eq!(q, big.add(0x400), "second carve follows the remainder");

            engine::verify_arena(av);
            arena::unlock(av);
        }
    }

    #[test]
    fn release_adjacent_to_top_melts_into_it() {
        unsafe {
            let av = scenario_arena();

            let p1 = engine::int_malloc(av, 2000);
            let p2 = engine::int_malloc(av, 2000);
            let c2 = chunk::mem_to_chunk(p2);
            assert_eq!(chunk::chunk_at_offset(c2, chunk::size(c2)), (*av).top);

            engine::int_free(av, c2, true);
            assert_eq!((*av).top, c2, "released block became the top");

            engine::int_free(av, chunk::mem_to_chunk(p1), true);
            assert_eq!((*av).top, chunk::mem_to_chunk(p1));

            arena::unlock(av);
        }
    }

    #[test]
    fn realloc_extends_forward_in_place() {
        unsafe {
            let av = scenario_arena();

            let p1 = engine::int_malloc(av, 1200);
            let p2 = engine::int_malloc(av, 1200);
            let guard = engine::int_malloc(av, 64);
            assert!(!guard.is_null());

            for offset in 0..1200 {
                *p1.add(offset) = (offset % 251) as u8;
            }

            engine::int_free(av, chunk::mem_to_chunk(p2), true);

            let old_size = chunk::size(chunk::mem_to_chunk(p1));
            let r = engine::int_realloc(av, chunk::mem_to_chunk(p1), old_size, request_to_size(2000));
            assert_eq!(r, p1, "grow absorbed the freed successor without moving");

            for offset in 0..1200 {
                assert_eq!(*r.add(offset), (offset % 251) as u8);
            }

            engine::verify_arena(av);
            arena::unlock(av);
        }
    }

    #[test]
    fn trim_is_idempotent() {
        unsafe {
            let av = scenario_arena();

            // burn and return some memory so the top has real slack
            let p = engine::int_malloc(av, 64 * 1024);
            engine::int_free(av, chunk::mem_to_chunk(p), true);

            let heap = arena::heap_for_chunk((*av).top);
            assert!(sysmem::heap_trim(heap, 0), "first trim releases the tail");
            assert!(!sysmem::heap_trim(heap, 0), "second trim finds nothing");

            arena::unlock(av);
        }
    }

    #[test]
    fn oversize_requests_are_isolated_mappings() {
        unsafe {
            // far above any adapted threshold, so this is stable no
            // matter what other tests released before us
            let bytes = 64 * 1024 * 1024;
            let mem = allocate(bytes);
            assert!(!mem.is_null());
            assert_eq!(mem as usize % ALIGNMENT, 0);

            let p = chunk::mem_to_chunk(mem);
            assert!(chunk::is_mmapped(p));
            assert!(!chunk::non_main_arena(p));

            assert!(usable_size(mem) >= bytes);
            assert_eq!(usable_size(mem), chunk::size(p) - 2 * crate::ptr_utils::WORD_SIZE);

            mem.write_bytes(0x6b, bytes);
            release(mem);
        }
    }

    #[test]
    fn tcache_holds_bounded_depth_in_lifo_order() {
        unsafe {
            let count = 10;
            let mut ptrs = vec![];
            for _ in 0..count {
                let mem = allocate(72);
                assert!(!mem.is_null());
                ptrs.push(mem);
            }

            for &mem in &ptrs {
                release(mem);
            }

            // the first seven releases were cached; they come back in
            // reverse order of release
            for index in (0..7).rev() {
                assert_eq!(allocate(72), ptrs[index]);
            }

            for _ in 7..count {
                let mem = allocate(72);
                assert!(!mem.is_null());
                release(mem);
            }
        }
    }

    #[test]
    fn double_free_aborts_with_fasttop_tag() {
        unsafe {
            // fill this thread's cache bucket so the victim reaches
            // the fast bin both times
            let mut pinned = vec![];
            for _ in 0..7 {
                pinned.push(allocate(24));
            }
            let victim = allocate(24);
            let extra = allocate(24);
            assert!(!extra.is_null());
            for &mem in &pinned {
                release(mem);
            }

            release(victim);

            let caught = std::panic::catch_unwind(|| unsafe { release(victim) });
            let message = *caught.unwrap_err().downcast::<String>().unwrap();
            assert_eq!(message, "double free or corruption (fasttop)");

            release(extra);
        }
    }

    #[test]
    fn aligned_allocation_honors_large_alignments() {
        unsafe {
            for &align in &[32usize, 256, 4096, 1 << 16] {
                let mem = aligned_allocate(align, 128);
                assert!(!mem.is_null());
                assert_eq!(mem as usize % align, 0);
                assert!(usable_size(mem) >= 128);

                mem.write_bytes(0x35, 128);
                release(mem);
            }

            // non-power-of-two alignments round up
            let mem = aligned_allocate(48, 64);
            assert!(!mem.is_null());
            assert_eq!(mem as usize % 64, 0);
            release(mem);
        }
    }

    #[test]
    fn zero_and_overflowing_requests() {
        unsafe {
            let mem = allocate(0);
            assert!(!mem.is_null());
            assert!(usable_size(mem) >= 1);
            release(mem);

            assert!(allocate(usize::MAX).is_null());
            assert_eq!(errno::errno().0, libc::ENOMEM);

            assert!(allocate(chunk::MAX_REQUEST + 1).is_null());

            let huge_align = usize::MAX / 2 + 2;
            assert!(aligned_allocate(huge_align, 8).is_null());
            assert_eq!(errno::errno().0, libc::EINVAL);
        }
    }

    #[test]
    fn reallocation_preserves_contents_across_moves() {
        unsafe {
            let mut mem = allocate(40);
            for offset in 0..40 {
                *mem.add(offset) = offset as u8;
            }

            // repeatedly grow through several size classes
            for &next in &[200usize, 1200, 5000, 90 * 1024] {
                mem = reallocate(mem, next);
                assert!(!mem.is_null());
                assert!(usable_size(mem) >= next);
                for offset in 0..40 {
                    assert_eq!(*mem.add(offset), offset as u8, "grow to {next}");
                }
            }

            // shrink back down in place or by copy, content intact
            mem = reallocate(mem, 64);
            assert!(!mem.is_null());
            for offset in 0..40 {
                assert_eq!(*mem.add(offset), offset as u8);
            }

            // reallocate to the current capacity returns the same block
            let same = reallocate(mem, usable_size(mem));
            assert_eq!(same, mem);

            assert!(reallocate(mem, 0).is_null());
        }
    }

    #[test]
    fn randomized_churn_keeps_heap_coherent() {
        unsafe {
            let mut rng = fastrand::Rng::with_seed(0x6d61726c);
            let mut live: Vec<(*mut u8, usize, u8)> = vec![];

            for round in 0..4000 {
                match rng.usize(0..10) {
                    0..=4 => {
                        let size = match rng.usize(0..3) {
                            0 => rng.usize(1..128),
                            1 => rng.usize(128..4096),
                            _ => rng.usize(4096..200_000),
                        };
                        let mem = allocate(size);
                        assert!(!mem.is_null(), "allocation of {size} failed");
                        let stamp = (round % 255) as u8 + 1;
                        mem.write_bytes(stamp, size);
                        live.push((mem, size, stamp));
                    }
                    5..=7 if !live.is_empty() => {
                        let (mem, size, stamp) = live.swap_remove(rng.usize(0..live.len()));
                        for offset in (0..size).step_by(97) {
                            assert_eq!(*mem.add(offset), stamp);
                        }
                        release(mem);
                    }
                    8 if !live.is_empty() => {
                        let index = rng.usize(0..live.len());
                        let (mem, size, stamp) = live[index];
                        let new_size = rng.usize(1..64 * 1024);
                        let new_mem = reallocate(mem, new_size);
                        assert!(!new_mem.is_null());
                        for offset in (0..size.min(new_size)).step_by(61) {
                            assert_eq!(*new_mem.add(offset), stamp);
                        }
                        let fresh = (round % 255) as u8 + 1;
                        new_mem.write_bytes(fresh, new_size);
                        live[index] = (new_mem, new_size, fresh);
                    }
                    _ => {
                        let align = 1 << rng.usize(5..13);
                        let size = rng.usize(1..2048);
                        let mem = aligned_allocate(align, size);
                        assert!(!mem.is_null());
                        assert_eq!(mem as usize % align, 0);
                        let stamp = (round % 255) as u8 + 1;
                        mem.write_bytes(stamp, size);
                        live.push((mem, size, stamp));
                    }
                }
            }

            for (mem, size, stamp) in live {
                for offset in (0..size).step_by(97) {
                    assert_eq!(*mem.add(offset), stamp);
                }
                release(mem);
            }

            let av = arena::arena_get(64);
            engine::verify_arena(av);
            arena::unlock(av);
        }
    }

    #[test]
    fn cross_thread_release_returns_chunks_home() {
        use std::sync::mpsc;

        struct SendPtr(*mut u8, usize);
        unsafe impl Send for SendPtr {}

        let (tx, rx) = mpsc::channel::<SendPtr>();

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let tx = tx.clone();
                std::thread::spawn(move || unsafe {
                    for round in 0..200 {
                        let size = 32 + (worker * 97 + round * 13) % 3000;
                        let mem = allocate(size);
                        assert!(!mem.is_null());
                        mem.write_bytes(0xd0 + worker as u8, size);

                        if round % 2 == 0 {
                            tx.send(SendPtr(mem, size)).unwrap();
                        } else {
                            release(mem);
                        }
                    }
                })
            })
            .collect();
        drop(tx);

        // frees from this thread must migrate chunks back to their
        // origin arenas rather than corrupting anything here
        for SendPtr(mem, size) in rx {
            unsafe {
                assert!(usable_size(mem) >= size);
                release(mem);
            }
        }

        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn global_alloc_and_allocator_surfaces() {
        use allocator_api2::alloc::{Allocator, Layout};

        unsafe {
            let layout = Layout::from_size_align(300, 64).unwrap();
            let mem = allocator_api2::alloc::GlobalAlloc::alloc(&Marl, layout);
            assert!(!mem.is_null());
            assert_eq!(mem as usize % 64, 0);
            mem.write_bytes(1, 300);

            let grown = allocator_api2::alloc::GlobalAlloc::realloc(&Marl, mem, layout, 900);
            assert!(!grown.is_null());
            assert_eq!(grown as usize % 64, 0);
            assert_eq!(*grown.add(299), 1);
            allocator_api2::alloc::GlobalAlloc::dealloc(
                &Marl,
                grown,
                Layout::from_size_align(900, 64).unwrap(),
            );
        }

        let slice = Marl.allocate(Layout::from_size_align(512, 16).unwrap()).unwrap();
        unsafe {
            slice.as_ptr().cast::<u8>().write_bytes(7, 512);
            Marl.deallocate(slice.cast(), Layout::from_size_align(512, 16).unwrap());
        }

        let empty = Marl.allocate(Layout::new::<()>()).unwrap();
        assert_eq!(empty.len(), 0);
    }

    #[test]
    fn tuning_surface_accepts_and_rejects() {
        // values chosen not to disturb concurrently running tests
        assert!(tune(Tunable::TcacheUnsortedLimit, 8));
        assert!(tune(Tunable::TcacheUnsortedLimit, 0));
        assert!(!tune(Tunable::TcacheUnsortedLimit, -1));

        assert!(!tune(Tunable::FastCeiling, 4096));
        assert!(!tune(Tunable::ArenaMax, 0));
        assert!(!tune(Tunable::TcacheMax, 65));

        assert!(tune(Tunable::TopPad, 128 * 1024));

        // a trim with an enormous pad is a no-op but must be safe
        let _ = trim(usize::MAX / 2);
    }

    #[test]
    fn vec_backed_by_marl() {
        let mut v = allocator_api2::vec::Vec::with_capacity_in(16, Marl);
        for value in 0..10_000u64 {
            v.push(value);
        }
        for (index, value) in v.iter().enumerate() {
            assert_eq!(index as u64, *value);
        }
    }
}
