//! The per-thread chunk cache.
//!
//! Each thread lazily allocates one [`Tcache`] record through the
//! normal arena path and serves its hottest small allocations from it
//! with no locking at all. Entries thread a `next` link through the
//! chunk payload and stamp a `key` word identifying the owning cache,
//! which doubles as the double-free prefilter.
//!
//! On thread exit the guard drains every bucket back to the owning
//! arenas and detaches the thread from its adopted arena.

use core::cell::Cell;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use crate::binning::{TCACHE_MAX_BINS, tcache_index};
use crate::chunk::{self, Chunk};
use crate::fatal::fatal;
use crate::params::PARAMS;

#[repr(C)]
pub struct TcacheEntry {
    next: *mut TcacheEntry,
    /// Owning cache stamp; cleared on every pop.
    key: *mut Tcache,
}

#[repr(C)]
pub struct Tcache {
    counts: [u16; TCACHE_MAX_BINS],
    entries: [*mut TcacheEntry; TCACHE_MAX_BINS],
}

struct TcacheGuard {
    cache: Cell<*mut Tcache>,
    /// Set while initializing and permanently after shutdown; stops
    /// the cache from resurrecting or recursing.
    unavailable: Cell<bool>,
}

impl Drop for TcacheGuard {
    fn drop(&mut self) {
        unsafe { shutdown(self) };
    }
}

thread_local! {
    static TCACHE: TcacheGuard = TcacheGuard {
        cache: Cell::new(null_mut()),
        unavailable: Cell::new(false),
    };
}

/// Threads that have ever touched the allocator. Monotonic: a thread
/// exiting does not re-enable the single-thread shortcuts, which keeps
/// the plain-store fast-bin path safe against late stragglers.
static THREADS_SEEN: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SEEN: Cell<bool> = const { Cell::new(false) };
}

/// Note the calling thread's existence before its first touch of any
/// shared allocator structure.
#[inline]
pub fn register_thread() {
    let _ = THREAD_SEEN.try_with(|seen| {
        if !seen.get() {
            seen.set(true);
            THREADS_SEEN.fetch_add(1, Relaxed);
        }
    });
}

/// Whether only one thread has ever touched the allocator, permitting
/// the fast-bin atomics to degrade to plain loads and stores.
#[inline]
pub fn single_threaded() -> bool {
    THREADS_SEEN.load(Relaxed) <= 1
}

#[inline]
fn with_cache<R>(f: impl FnOnce(&TcacheGuard) -> R) -> Option<R> {
    TCACHE.try_with(|guard| f(guard)).ok()
}

/// Ensure the calling thread has a cache, allocating it through the
/// arena path on first use. A failed allocation leaves the cache absent
/// and the next call tries again.
pub unsafe fn ensure_init() {
    register_thread();

    let _ = with_cache(|guard| {
        if !guard.cache.get().is_null() || guard.unavailable.get() {
            return;
        }

        // the engine never consults the tcache, but guard against any
        // future path re-entering while we bootstrap
        guard.unavailable.set(true);

        let size = core::mem::size_of::<Tcache>();
        let arena = crate::arena::arena_get(size);
        let mem = crate::engine::int_malloc(arena, size);
        let mem = if mem.is_null() {
            let retry = crate::arena::arena_get_retry(arena, size);
            let mem = crate::engine::int_malloc(retry, size);
            crate::arena::unlock(retry);
            mem
        } else {
            crate::arena::unlock(arena);
            mem
        };

        if !mem.is_null() {
            mem.write_bytes(0, size);
            guard.cache.set(mem.cast());
        }
        guard.unavailable.set(false);
    });
}

/// Pop the cached chunk for `tc_idx`, if any, returning the user pointer.
#[inline]
pub unsafe fn get(tc_idx: usize) -> Option<*mut u8> {
    with_cache(|guard| {
        let cache = guard.cache.get();
        if cache.is_null() || guard.unavailable.get() {
            return None;
        }

        let entry = (*cache).entries[tc_idx];
        if entry.is_null() {
            return None;
        }

        (*cache).entries[tc_idx] = (*entry).next;
        (*cache).counts[tc_idx] -= 1;
        (*entry).key = null_mut();
        Some(entry.cast::<u8>())
    })
    .flatten()
}

/// Try to absorb a just-released chunk. Returns `true` when cached.
///
/// A chunk whose payload still carries this cache's key stamp is a
/// double-free candidate; the bucket is scanned to confirm before the
/// fatal report, since user data may reproduce the stamp by chance.
pub unsafe fn maybe_put(p: *mut Chunk) -> bool {
    let Some(tc_idx) = tcache_index(chunk::size(p)) else { return false };
    if tc_idx >= PARAMS.tcache_bins.load(Relaxed) {
        return false;
    }

    with_cache(|guard| {
        let cache = guard.cache.get();
        if cache.is_null() || guard.unavailable.get() {
            return false;
        }

        let entry = chunk::chunk_to_mem(p).cast::<TcacheEntry>();

        if (*entry).key == cache {
            let mut scan = (*cache).entries[tc_idx];
            while !scan.is_null() {
                if scan == entry {
                    fatal("free(): double free detected in tcache 2");
                }
                scan = (*scan).next;
            }
        }

        if ((*cache).counts[tc_idx] as usize) < PARAMS.tcache_count.load(Relaxed) {
            (*entry).key = cache;
            (*entry).next = (*cache).entries[tc_idx];
            (*cache).entries[tc_idx] = entry;
            (*cache).counts[tc_idx] += 1;
            true
        } else {
            false
        }
    })
    .unwrap_or(false)
}

/// Stash a chunk the engine decided to cache (prewarm or unsorted-drain
/// exact fit). The caller has verified the bucket has room.
pub unsafe fn put_unchecked(p: *mut Chunk, tc_idx: usize) {
    let _ = with_cache(|guard| {
        let cache = guard.cache.get();
        debug_assert!(!cache.is_null());

        let entry = chunk::chunk_to_mem(p).cast::<TcacheEntry>();
        (*entry).key = cache;
        (*entry).next = (*cache).entries[tc_idx];
        (*cache).entries[tc_idx] = entry;
        (*cache).counts[tc_idx] += 1;
    });
}

/// Whether the bucket for `tc_idx` can take more chunks.
#[inline]
pub unsafe fn has_room(tc_idx: usize) -> bool {
    if tc_idx >= PARAMS.tcache_bins.load(Relaxed) {
        return false;
    }

    with_cache(|guard| {
        let cache = guard.cache.get();
        !cache.is_null()
            && !guard.unavailable.get()
            && ((*cache).counts[tc_idx] as usize) < PARAMS.tcache_count.load(Relaxed)
    })
    .unwrap_or(false)
}

#[inline]
pub unsafe fn bucket_len(tc_idx: usize) -> usize {
    with_cache(|guard| {
        let cache = guard.cache.get();
        if cache.is_null() { 0 } else { (*cache).counts[tc_idx] as usize }
    })
    .unwrap_or(0)
}

unsafe fn shutdown(guard: &TcacheGuard) {
    let cache = guard.cache.get();
    guard.cache.set(null_mut());
    guard.unavailable.set(true);

    if !cache.is_null() {
        for index in 0..TCACHE_MAX_BINS {
            let mut entry = (*cache).entries[index];
            (*cache).entries[index] = null_mut();
            (*cache).counts[index] = 0;

            while !entry.is_null() {
                let next = (*entry).next;
                (*entry).key = null_mut();
                crate::engine::free_to_arena(chunk::mem_to_chunk(entry.cast()));
                entry = next;
            }
        }

        crate::engine::free_to_arena(chunk::mem_to_chunk(cache.cast()));
    }

    crate::arena::thread_detach_arena();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::TCACHE_DEFAULT_COUNT;
    use crate::chunk::request_to_size;

    #[test]
    fn bucket_cap_and_lifo_order() {
        unsafe {
            ensure_init();

            let size = request_to_size(24);
            let tc_idx = tcache_index(size).unwrap();

            // drain anything earlier tests left behind
            while get(tc_idx).is_some() {}

            let mut backing = vec![0u8; 4096];
            let mut chunks = vec![];
            let mut cursor = crate::ptr_utils::align_up_by(backing.as_mut_ptr(), 15);
            for _ in 0..10 {
                let p = cursor.cast::<Chunk>();
                chunk::set_head(p, size | chunk::PREV_INUSE);
                chunks.push(p);
                cursor = cursor.add(size * 2);
            }

            for (index, &p) in chunks.iter().enumerate() {
                let cached = maybe_put(p);
                assert_eq!(cached, index < TCACHE_DEFAULT_COUNT, "entry {index}");
            }
            assert_eq!(bucket_len(tc_idx), TCACHE_DEFAULT_COUNT);

            // LIFO: the most recently cached chunk pops first
            for index in (0..TCACHE_DEFAULT_COUNT).rev() {
                let mem = get(tc_idx).expect("bucket entry");
                assert_eq!(chunk::mem_to_chunk(mem), chunks[index]);
            }
            assert!(get(tc_idx).is_none());
        }
    }

    #[test]
    fn double_free_is_detected() {
        unsafe {
            ensure_init();

            let size = request_to_size(56);
            let tc_idx = tcache_index(size).unwrap();
            while get(tc_idx).is_some() {}

            let mut backing = vec![0u8; 256];
            let p = crate::ptr_utils::align_up_by(backing.as_mut_ptr(), 15).cast::<Chunk>();
            chunk::set_head(p, size | chunk::PREV_INUSE);

            assert!(maybe_put(p));

            let caught = std::panic::catch_unwind(|| unsafe { maybe_put(p) });
            let message = *caught.unwrap_err().downcast::<String>().unwrap();
            assert_eq!(message, "free(): double free detected in tcache 2");

            // leave the bucket clean for other tests
            assert!(get(tc_idx).is_some());
        }
    }
}
