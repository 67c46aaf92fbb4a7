//! The process-wide configuration record and its counters.
//!
//! A single [`Params`] instance is shared by every arena. Reads on the
//! allocation paths are relaxed atomic loads; tuning writes are
//! serialized by the caller through the main arena's lock.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering::Relaxed};

use crate::binning::{DEFAULT_FAST_REQUEST, MAX_FAST_REQUEST, TCACHE_DEFAULT_COUNT, TCACHE_MAX_BINS};
use crate::chunk::request_to_size;

pub const DEFAULT_TRIM_THRESHOLD: usize = 128 * 1024;
pub const DEFAULT_TOP_PAD: usize = 128 * 1024;
pub const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;
/// The dynamic mmap threshold never adapts beyond this.
pub const MMAP_THRESHOLD_MAX: usize = 4 * 1024 * 1024 * core::mem::size_of::<usize>();
pub const DEFAULT_MMAP_MAX: usize = 65536;

/// Process-wide tunables and mmap accounting.
pub struct Params {
    /// Chunk-size ceiling for fast-bin eligibility. Zero disables the
    /// fast bins entirely.
    pub max_fast: AtomicUsize,
    /// Residual top-chunk size above which releases trigger a trim.
    /// `usize::MAX` disables automatic trimming.
    pub trim_threshold: AtomicUsize,
    /// Slack added to every heap-extension request.
    pub top_pad: AtomicUsize,
    /// Requests rounding to at least this are served by page mapping.
    pub mmap_threshold: AtomicUsize,
    /// Cap on simultaneously live page-mapped chunks. Zero disables
    /// the mapping path.
    pub n_mmaps_max: AtomicUsize,
    /// Set once the user pins either threshold; stops the dynamic
    /// mmap-threshold adaptation.
    pub no_dyn_threshold: AtomicBool,
    /// If non-zero, freshly allocated memory is filled with
    /// `perturb ^ 0xff` and released memory with `perturb`.
    pub perturb: AtomicU8,

    pub arena_test: AtomicUsize,
    pub arena_max: AtomicUsize,

    pub tcache_count: AtomicUsize,
    pub tcache_bins: AtomicUsize,
    /// Exact-size chunks met while draining the unsorted queue are
    /// stashed in the tcache at most this many times per allocation;
    /// zero means no limit.
    pub tcache_unsorted_limit: AtomicUsize,

    pub n_mmaps: AtomicUsize,
    pub max_n_mmaps: AtomicUsize,
    pub mmapped_mem: AtomicUsize,
    pub max_mmapped_mem: AtomicUsize,
}

pub static PARAMS: Params = Params::new();

impl Params {
    pub const fn new() -> Self {
        Self {
            max_fast: AtomicUsize::new(request_to_size(DEFAULT_FAST_REQUEST)),
            trim_threshold: AtomicUsize::new(DEFAULT_TRIM_THRESHOLD),
            top_pad: AtomicUsize::new(DEFAULT_TOP_PAD),
            mmap_threshold: AtomicUsize::new(DEFAULT_MMAP_THRESHOLD),
            n_mmaps_max: AtomicUsize::new(DEFAULT_MMAP_MAX),
            no_dyn_threshold: AtomicBool::new(false),
            perturb: AtomicU8::new(0),
            arena_test: AtomicUsize::new(8),
            arena_max: AtomicUsize::new(0),
            tcache_count: AtomicUsize::new(TCACHE_DEFAULT_COUNT),
            tcache_bins: AtomicUsize::new(TCACHE_MAX_BINS),
            tcache_unsorted_limit: AtomicUsize::new(0),
            n_mmaps: AtomicUsize::new(0),
            max_n_mmaps: AtomicUsize::new(0),
            mmapped_mem: AtomicUsize::new(0),
            max_mmapped_mem: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn max_fast(&self) -> usize {
        self.max_fast.load(Relaxed)
    }

    /// Set the fast-bin ceiling from a request-byte bound.
    ///
    /// Returns `false` if `request` exceeds the supported maximum.
    pub fn set_max_fast(&self, request: usize) -> bool {
        if request > MAX_FAST_REQUEST {
            return false;
        }

        let ceiling = if request == 0 { 0 } else { request_to_size(request) };
        self.max_fast.store(ceiling, Relaxed);
        true
    }

    #[inline]
    pub fn mmap_threshold(&self) -> usize {
        self.mmap_threshold.load(Relaxed)
    }

    #[inline]
    pub fn trim_threshold(&self) -> usize {
        self.trim_threshold.load(Relaxed)
    }

    /// Adapt the thresholds to a just-released mapped chunk, unless the
    /// user has pinned them.
    pub fn adapt_mmap_threshold(&self, chunk_size: usize) {
        if self.no_dyn_threshold.load(Relaxed) {
            return;
        }

        if chunk_size > self.mmap_threshold.load(Relaxed) && chunk_size <= MMAP_THRESHOLD_MAX {
            self.mmap_threshold.store(chunk_size, Relaxed);
            self.trim_threshold.store(2 * chunk_size, Relaxed);
        }
    }

    pub fn account_mmap(&self, size: usize) {
        let n = self.n_mmaps.fetch_add(1, Relaxed) + 1;
        self.max_n_mmaps.fetch_max(n, Relaxed);
        let mem = self.mmapped_mem.fetch_add(size, Relaxed) + size;
        self.max_mmapped_mem.fetch_max(mem, Relaxed);
    }

    pub fn account_munmap(&self, size: usize) {
        self.n_mmaps.fetch_sub(1, Relaxed);
        self.mmapped_mem.fetch_sub(size, Relaxed);
    }

    #[inline]
    pub fn perturb_byte(&self) -> u8 {
        self.perturb.load(Relaxed)
    }
}

/// Fill a freshly allocated region, if perturbation is enabled.
#[inline]
pub unsafe fn alloc_perturb(mem: *mut u8, len: usize) {
    let byte = PARAMS.perturb_byte();
    if byte != 0 {
        mem.write_bytes(byte ^ 0xff, len);
    }
}

/// Fill a released region, if perturbation is enabled.
#[inline]
pub unsafe fn free_perturb(mem: *mut u8, len: usize) {
    let byte = PARAMS.perturb_byte();
    if byte != 0 {
        mem.write_bytes(byte, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_ceiling_rounding() {
        let params = Params::new();

        assert_eq!(params.max_fast(), request_to_size(DEFAULT_FAST_REQUEST));

        assert!(params.set_max_fast(0));
        assert_eq!(params.max_fast(), 0);

        assert!(params.set_max_fast(MAX_FAST_REQUEST));
        assert_eq!(params.max_fast(), request_to_size(MAX_FAST_REQUEST));

        assert!(!params.set_max_fast(MAX_FAST_REQUEST + 1));
        assert_eq!(params.max_fast(), request_to_size(MAX_FAST_REQUEST));
    }

    #[test]
    fn dynamic_threshold_band() {
        let params = Params::new();

        params.adapt_mmap_threshold(DEFAULT_MMAP_THRESHOLD / 2);
        assert_eq!(params.mmap_threshold(), DEFAULT_MMAP_THRESHOLD);

        params.adapt_mmap_threshold(DEFAULT_MMAP_THRESHOLD * 2);
        assert_eq!(params.mmap_threshold(), DEFAULT_MMAP_THRESHOLD * 2);
        assert_eq!(params.trim_threshold(), DEFAULT_MMAP_THRESHOLD * 4);

        params.adapt_mmap_threshold(2 * MMAP_THRESHOLD_MAX);
        assert_eq!(params.mmap_threshold(), DEFAULT_MMAP_THRESHOLD * 2);

        params.no_dyn_threshold.store(true, core::sync::atomic::Ordering::Relaxed);
        params.adapt_mmap_threshold(DEFAULT_MMAP_THRESHOLD * 4);
        assert_eq!(params.mmap_threshold(), DEFAULT_MMAP_THRESHOLD * 2);
    }

    #[test]
    fn mmap_accounting() {
        let params = Params::new();

        params.account_mmap(4096);
        params.account_mmap(8192);
        assert_eq!(params.n_mmaps.load(Relaxed), 2);
        assert_eq!(params.mmapped_mem.load(Relaxed), 12288);

        params.account_munmap(4096);
        assert_eq!(params.n_mmaps.load(Relaxed), 1);
        assert_eq!(params.max_n_mmaps.load(Relaxed), 2);
        assert_eq!(params.max_mmapped_mem.load(Relaxed), 12288);
    }
}
