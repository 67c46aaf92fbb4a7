//! Arena state records, heaps, and arena selection.
//!
//! One statically allocated main arena grows through the process break;
//! further arenas are created on demand inside 64 MiB-aligned mapped
//! heaps, so the owning arena of any of their chunks is recovered by
//! masking the chunk address down to the heap base.

use core::cell::Cell;
use core::ptr::{addr_of_mut, null_mut};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering::{Acquire, Relaxed, Release}};

use lock_api::RawMutex as _;

use crate::binning::{BinMap, NBINS, NFASTBINS};
use crate::chunk::{
    self, ALIGNMENT, ALIGN_MASK, Chunk, HEADER_SIZE, MIN_CHUNK_SIZE, NON_MAIN_ARENA, PREV_INUSE,
};
use crate::os;
use crate::params::{MMAP_THRESHOLD_MAX, PARAMS};
use crate::ptr_utils::align_size_up;
use crate::sync::SystemMutex;

pub const HEAP_MIN_SIZE: usize = 32 * 1024;
/// Heaps are reserved and aligned at exactly this size so that any
/// chunk address masks down to its heap header.
pub const HEAP_MAX_SIZE: usize = 2 * MMAP_THRESHOLD_MAX;

/// An independent allocator instance.
///
/// The field order is load-bearing: `top` and `last_remainder` must
/// directly precede `bins` so that the pseudo-chunk for bin 1 overlays
/// them, making the initial top chunk read as zero-sized and route the
/// first allocation into system acquisition.
#[repr(C)]
pub struct Arena {
    pub mutex: SystemMutex,

    /// Set when the fast bins may be non-empty; cleared by consolidate.
    pub have_fastchunks: AtomicBool,
    /// Lock-free LIFO heads, one per fast size class.
    pub fastbins: [AtomicPtr<Chunk>; NFASTBINS],

    /// Whether the arena's backing memory is known to be one contiguous
    /// run (only ever true for the main arena).
    pub contiguous: bool,
    pub initialized: bool,

    pub top: *mut Chunk,
    pub last_remainder: *mut Chunk,
    /// Flat fd/bk slot table; access through [`bin_at`].
    pub bins: [*mut Chunk; (NBINS - 1) * 2],
    pub binmap: BinMap,

    pub next: AtomicPtr<Arena>,
    pub next_free: AtomicPtr<Arena>,
    /// Threads currently adopted by this arena; guarded by the list lock.
    pub attached_threads: usize,

    pub system_mem: usize,
    pub max_system_mem: usize,
}

impl Arena {
    const NULL_FASTBIN: AtomicPtr<Chunk> = AtomicPtr::new(null_mut());

    pub const fn new_unattached(contiguous: bool) -> Self {
        Self {
            mutex: SystemMutex::new(),
            have_fastchunks: AtomicBool::new(false),
            fastbins: [Self::NULL_FASTBIN; NFASTBINS],
            contiguous,
            initialized: false,
            top: null_mut(),
            last_remainder: null_mut(),
            bins: [null_mut(); (NBINS - 1) * 2],
            binmap: BinMap::new(),
            next: AtomicPtr::new(null_mut()),
            next_free: AtomicPtr::new(null_mut()),
            attached_threads: 1,
            system_mem: 0,
            max_system_mem: 0,
        }
    }
}

/// The backing-region header of a non-main arena's heap.
#[repr(C)]
pub struct Heap {
    pub ar_ptr: *mut Arena,
    /// Previous heap in this arena's chain, newest first.
    pub prev: *mut Heap,
    /// Currently committed bytes, header included.
    pub size: usize,
    pub committed: usize,
}

const HEAP_HDR_SIZE: usize = align_size_up(core::mem::size_of::<Heap>(), ALIGNMENT);

struct MainArenaCell(core::cell::UnsafeCell<Arena>);

// SAFETY: all mutation happens through raw pointers under the arena
// mutex or on the lock-free fastbin/have_fastchunks atomics.
unsafe impl Sync for MainArenaCell {}

static MAIN_ARENA: MainArenaCell =
    MainArenaCell(core::cell::UnsafeCell::new(Arena::new_unattached(true)));

/// Serializes arena creation, attachment counts, and free-list splices.
pub static LIST_LOCK: SystemMutex = SystemMutex::new();

static FREE_LIST: AtomicPtr<Arena> = AtomicPtr::new(null_mut());
static NEXT_TO_REUSE: AtomicPtr<Arena> = AtomicPtr::new(null_mut());
pub static NARENAS: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_ARENA: Cell<*mut Arena> = const { Cell::new(null_mut()) };
}

#[inline]
pub fn main_arena() -> *mut Arena {
    MAIN_ARENA.0.get()
}

#[inline]
pub unsafe fn is_main(arena: *mut Arena) -> bool {
    arena == main_arena()
}

/// The A-flag contribution for chunks carved from this arena.
#[inline]
pub unsafe fn arena_bit(arena: *mut Arena) -> usize {
    if is_main(arena) { 0 } else { NON_MAIN_ARENA }
}

/// The pseudo-chunk heading logical bin `index`: a pointer positioned
/// so that its fd/bk fields land on this bin's two table slots.
#[inline]
pub unsafe fn bin_at(arena: *mut Arena, index: usize) -> *mut Chunk {
    debug_assert!((1..NBINS).contains(&index));

    addr_of_mut!((*arena).bins[(index - 1) * 2]).cast::<u8>().wrapping_sub(HEADER_SIZE).cast()
}

/// Establish the empty-bin self-links and the zero-size initial top.
pub unsafe fn init_state(arena: *mut Arena) {
    for index in 1..NBINS {
        let bin = bin_at(arena, index);
        chunk::set_fd(bin, bin);
        chunk::set_bk(bin, bin);
    }

    (*arena).top = bin_at(arena, crate::binning::UNSORTED_BIN);
    (*arena).last_remainder = null_mut();
    (*arena).initialized = true;

    debug_assert_eq!(chunk::size((*arena).top), 0);
}

#[inline]
pub unsafe fn lock(arena: *mut Arena) {
    (*arena).mutex.lock();
    if !(*arena).initialized {
        init_state(arena);
    }
}

#[inline]
pub unsafe fn try_lock(arena: *mut Arena) -> bool {
    if (*arena).mutex.try_lock() {
        if !(*arena).initialized {
            init_state(arena);
        }
        true
    } else {
        false
    }
}

#[inline]
pub unsafe fn unlock(arena: *mut Arena) {
    (*arena).mutex.unlock();
}

#[inline]
pub fn heap_for_chunk(chunk: *mut Chunk) -> *mut Heap {
    ((chunk as usize) & !(HEAP_MAX_SIZE - 1)) as *mut Heap
}

/// The arena a chunk belongs to; `None` for individually mapped chunks.
#[inline]
pub unsafe fn arena_for_chunk(chunk: *mut Chunk) -> Option<*mut Arena> {
    if chunk::is_mmapped(chunk) {
        None
    } else if chunk::non_main_arena(chunk) {
        Some((*heap_for_chunk(chunk)).ar_ptr)
    } else {
        Some(main_arena())
    }
}

/// Reserve and partially commit a fresh aligned heap able to hold at
/// least `min_size` bytes past its header.
pub unsafe fn new_heap(min_size: usize, top_pad: usize) -> Option<*mut Heap> {
    let page_mask = os::page_size() - 1;

    let mut size = min_size + HEAP_HDR_SIZE;
    if size + top_pad <= HEAP_MAX_SIZE {
        size = (size + top_pad).max(HEAP_MIN_SIZE);
    } else if size > HEAP_MAX_SIZE {
        return None;
    }
    size = (size + page_mask) & !page_mask;

    let base = os::map_aligned(HEAP_MAX_SIZE, HEAP_MAX_SIZE)?;
    if !os::commit(base.as_ptr(), size) {
        os::unmap(base.as_ptr(), HEAP_MAX_SIZE);
        return None;
    }

    let heap = base.as_ptr().cast::<Heap>();
    (*heap).ar_ptr = null_mut();
    (*heap).prev = null_mut();
    (*heap).size = size;
    (*heap).committed = size;
    Some(heap)
}

/// Commit further pages of `heap`'s reservation.
pub unsafe fn grow_heap(heap: *mut Heap, grow: usize) -> bool {
    let page_mask = os::page_size() - 1;
    let new_size = ((*heap).size + grow + page_mask) & !page_mask;

    if new_size > HEAP_MAX_SIZE {
        return false;
    }

    if new_size > (*heap).committed {
        let commit_base = heap.cast::<u8>().add((*heap).committed);
        if !os::commit(commit_base, new_size - (*heap).committed) {
            return false;
        }
        (*heap).committed = new_size;
    }

    (*heap).size = new_size;
    true
}

/// Return the tail of `heap` beyond `new_size` to the kernel.
pub unsafe fn shrink_heap(heap: *mut Heap, new_size: usize) {
    debug_assert!(new_size <= (*heap).size);
    debug_assert!(new_size % os::page_size() == 0);

    os::decommit(heap.cast::<u8>().add(new_size), (*heap).committed - new_size);
    (*heap).size = new_size;
    (*heap).committed = new_size;
}

pub unsafe fn delete_heap(heap: *mut Heap) {
    os::unmap(heap.cast(), HEAP_MAX_SIZE);
}

/// First usable byte past a heap's header (and past the arena record,
/// for an arena's first heap).
pub unsafe fn heap_payload(heap: *mut Heap) -> *mut u8 {
    let mut payload = heap.cast::<u8>().add(HEAP_HDR_SIZE);
    if (*heap).ar_ptr == heap.cast::<u8>().add(HEAP_HDR_SIZE).cast::<Arena>() {
        payload = payload.add(align_size_up(core::mem::size_of::<Arena>(), ALIGNMENT));
    }
    payload
}

fn arena_limit() -> usize {
    let configured = PARAMS.arena_max.load(Relaxed);
    if configured != 0 {
        return configured;
    }

    static NCPUS: AtomicUsize = AtomicUsize::new(0);
    let mut ncpus = NCPUS.load(Relaxed);
    if ncpus == 0 {
        let queried = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        ncpus = if queried > 0 { queried as usize } else { 1 };
        NCPUS.store(ncpus, Relaxed);
    }

    ncpus * PARAMS.arena_test.load(Relaxed)
}

/// Create a new arena inside a fresh heap, locked and attached to the
/// calling thread. `size_hint` is the allocation that prompted creation.
pub(crate) unsafe fn create_arena(size_hint: usize) -> Option<*mut Arena> {
    let overhead = align_size_up(core::mem::size_of::<Arena>(), ALIGNMENT) + MIN_CHUNK_SIZE;
    let heap = new_heap(size_hint + overhead, PARAMS.top_pad.load(Relaxed))?;

    let arena = heap.cast::<u8>().add(HEAP_HDR_SIZE).cast::<Arena>();
    arena.write(Arena::new_unattached(false));
    (*heap).ar_ptr = arena;

    init_state(arena);
    (*arena).system_mem = (*heap).size;
    (*arena).max_system_mem = (*heap).size;

    // place the top chunk so its payload is aligned
    let mut top = heap_payload(heap);
    let misalign = chunk::chunk_to_mem(top.cast()) as usize & ALIGN_MASK;
    if misalign != 0 {
        top = top.add(ALIGNMENT - misalign);
    }
    let top = top.cast::<Chunk>();
    let top_size = heap.cast::<u8>().add((*heap).size) as usize - top as usize;
    chunk::set_head(top, top_size | PREV_INUSE);
    (*arena).top = top;

    lock(arena);

    LIST_LOCK.lock();
    let main = main_arena();
    (*arena).next.store((*main).next.load(Relaxed), Release);
    (*main).next.store(arena, Release);
    NARENAS.fetch_add(1, Relaxed);
    LIST_LOCK.unlock();

    Some(arena)
}

/// Pop an arena with no attached threads off the free list, locked.
unsafe fn get_free_arena() -> Option<*mut Arena> {
    if FREE_LIST.load(Acquire).is_null() {
        return None;
    }

    LIST_LOCK.lock();
    let arena = FREE_LIST.load(Acquire);
    if !arena.is_null() {
        FREE_LIST.store((*arena).next_free.load(Relaxed), Release);
        (*arena).next_free.store(null_mut(), Relaxed);
        (*arena).attached_threads += 1;
    }
    LIST_LOCK.unlock();

    if arena.is_null() {
        return None;
    }

    lock(arena);
    Some(arena)
}

/// Walk the circular arena list from the reuse cursor, adopting the
/// first arena whose lock is immediately available; if every arena is
/// busy, block on the cursor's arena.
unsafe fn reuse_arena(avoid: *mut Arena) -> *mut Arena {
    let mut start = NEXT_TO_REUSE.load(Acquire);
    if start.is_null() {
        start = main_arena();
    }

    let mut candidate = start;
    loop {
        if candidate != avoid && try_lock(candidate) {
            break;
        }

        candidate = next_arena(candidate);
        if candidate == start {
            // everyone is busy; pay the wait on one of them
            if candidate == avoid {
                candidate = next_arena(candidate);
            }
            lock(candidate);
            break;
        }
    }

    NEXT_TO_REUSE.store(next_arena(candidate), Release);

    LIST_LOCK.lock();
    (*candidate).attached_threads += 1;
    LIST_LOCK.unlock();

    candidate
}

#[inline]
unsafe fn next_arena(arena: *mut Arena) -> *mut Arena {
    let next = (*arena).next.load(Acquire);
    if next.is_null() { main_arena() } else { next }
}

/// Select and lock an arena for an allocation of `size` bytes.
pub unsafe fn arena_get(size: usize) -> *mut Arena {
    let current = THREAD_ARENA.with(|cell| cell.get());
    if !current.is_null() {
        lock(current);
        return current;
    }

    // the first thread to ever allocate adopts the main arena, whose
    // attachment count starts at one on its behalf
    static FIRST_THREAD_CLAIMED: AtomicBool = AtomicBool::new(false);
    let arena = if !FIRST_THREAD_CLAIMED.swap(true, Relaxed) {
        let main = main_arena();
        lock(main);
        main
    } else {
        arena_get_slow(size, null_mut())
    };

    THREAD_ARENA.with(|cell| cell.set(arena));
    arena
}

unsafe fn arena_get_slow(size: usize, avoid: *mut Arena) -> *mut Arena {
    if let Some(arena) = get_free_arena() {
        return arena;
    }

    if NARENAS.load(Relaxed) < arena_limit() {
        if let Some(arena) = create_arena(size) {
            return arena;
        }
        // creation failed; fall back on an existing arena
    }

    reuse_arena(avoid)
}

/// After an allocation failure on `failed` (now unlocked), pick one
/// other arena for a single retry, locked on return. The thread moves
/// its attachment to the replacement.
pub unsafe fn arena_get_retry(failed: *mut Arena, size: usize) -> *mut Arena {
    let arena = if is_main(failed) {
        arena_get_slow(size, failed)
    } else {
        let main = main_arena();
        lock(main);
        LIST_LOCK.lock();
        (*main).attached_threads += 1;
        LIST_LOCK.unlock();
        main
    };

    let previous = THREAD_ARENA.with(|cell| cell.replace(arena));
    if !previous.is_null() {
        detach(previous);
    }
    arena
}

/// Drop one attachment from `arena`, recycling it through the free
/// list when nothing is attached any more.
unsafe fn detach(arena: *mut Arena) {
    LIST_LOCK.lock();
    (*arena).attached_threads -= 1;
    if (*arena).attached_threads == 0 && !is_main(arena) {
        (*arena).next_free.store(FREE_LIST.load(Relaxed), Relaxed);
        FREE_LIST.store(arena, Release);
    }
    LIST_LOCK.unlock();
}

/// Detach the calling thread from its adopted arena; arenas left with
/// no attachments become reusable through the free list. Tolerates
/// being called during thread-local teardown.
pub unsafe fn thread_detach_arena() {
    let arena = THREAD_ARENA
        .try_with(|cell| cell.replace(null_mut()))
        .unwrap_or(null_mut());
    if arena.is_null() {
        return;
    }

    detach(arena);
}

unsafe extern "C" fn fork_prepare() {
    LIST_LOCK.lock();
    let main = main_arena();
    let mut arena = main;
    loop {
        (*arena).mutex.lock();
        arena = (*arena).next.load(Acquire);
        if arena.is_null() || arena == main {
            break;
        }
    }
}

unsafe extern "C" fn fork_parent() {
    let main = main_arena();
    let mut arena = main;
    loop {
        (*arena).mutex.unlock();
        arena = (*arena).next.load(Acquire);
        if arena.is_null() || arena == main {
            break;
        }
    }
    LIST_LOCK.unlock();
}

unsafe extern "C" fn fork_child() {
    let main = main_arena();
    let mut arena = main;
    loop {
        (*arena).mutex.reinit();
        arena = (*arena).next.load(Acquire);
        if arena.is_null() || arena == main {
            break;
        }
    }
    LIST_LOCK.reinit();
}

/// Install the fork handlers; idempotent, called on first allocator use.
pub fn setup_fork_handlers() {
    crate::sync::register_fork_handlers(fork_prepare, fork_parent, fork_child);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_links_alias_table_slots() {
        unsafe {
            let arena = main_arena();
            lock(arena);

            for index in 1..NBINS {
                let bin = bin_at(arena, index);
                assert_eq!(chunk::fd(bin), (*arena).bins[(index - 1) * 2]);
                assert_eq!(chunk::bk(bin), (*arena).bins[(index - 1) * 2 + 1]);
            }

            unlock(arena);
        }
    }

    #[test]
    fn initial_top_reads_zero_size() {
        unsafe {
            let arena = main_arena();
            lock(arena);

            if (*arena).last_remainder.is_null() && (*arena).system_mem == 0 {
                assert_eq!(chunk::size((*arena).top), 0);
            }

            unlock(arena);
        }
    }

    #[test]
    fn heap_header_recovery() {
        unsafe {
            let heap = new_heap(HEAP_MIN_SIZE, 0).expect("fresh heap");

            let inside = heap.cast::<u8>().add(HEAP_MAX_SIZE / 2).cast::<Chunk>();
            assert_eq!(heap_for_chunk(inside), heap);
            let near_start = heap.cast::<u8>().add(HEAP_HDR_SIZE).cast::<Chunk>();
            assert_eq!(heap_for_chunk(near_start), heap);

            delete_heap(heap);
        }
    }

    #[test]
    fn heap_grow_and_shrink() {
        unsafe {
            let heap = new_heap(HEAP_MIN_SIZE, 0).expect("fresh heap");
            let committed = (*heap).size;

            assert!(grow_heap(heap, os::page_size() * 16));
            assert!((*heap).size >= committed + os::page_size() * 16);

            let base = heap.cast::<u8>().add(committed);
            base.write_bytes(0x7e, os::page_size() * 16);

            let page = os::page_size();
            let target = ((*heap).size - page * 8) & !(page - 1);
            shrink_heap(heap, target);
            assert_eq!((*heap).size, target);

            assert!(!grow_heap(heap, HEAP_MAX_SIZE));

            delete_heap(heap);
        }
    }

    #[test]
    fn main_arena_chunk_mapping() {
        unsafe {
            let mut fake = [0usize; 4];
            let chunk = fake.as_mut_ptr().cast::<Chunk>();

            chunk::set_head(chunk, 64 | PREV_INUSE);
            assert_eq!(arena_for_chunk(chunk), Some(main_arena()));

            chunk::set_head(chunk, 64 | PREV_INUSE | chunk::IS_MMAPPED);
            assert_eq!(arena_for_chunk(chunk), None);
        }
    }
}
