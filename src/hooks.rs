//! User-installable interception hooks.
//!
//! Each public entry consults its hook slot first; an installed hook
//! bypasses the engine entirely. Because the check happens before the
//! thread-cache lookup, a hook never observes tcache state.
//!
//! Slots are process-wide atomic function pointers, read with acquire
//! ordering so a hook installed by one thread is seen fully initialized
//! by the others.

use core::sync::atomic::{AtomicPtr, Ordering::{AcqRel, Acquire}};

pub type AllocHook = unsafe fn(usize) -> *mut u8;
pub type ReleaseHook = unsafe fn(*mut u8);
pub type ReallocHook = unsafe fn(*mut u8, usize) -> *mut u8;
pub type AlignedAllocHook = unsafe fn(usize, usize) -> *mut u8;
/// Invoked after the main arena's contiguous heap is extended or
/// retracted; receives the change in bytes (negative for trims).
pub type HeapChangedHook = unsafe fn(isize);

static ALLOC_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static RELEASE_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static REALLOC_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static ALIGNED_ALLOC_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static HEAP_CHANGED_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

macro_rules! hook_accessors {
    ($get:ident, $set:ident, $slot:ident, $ty:ty) => {
        #[inline]
        pub(crate) fn $get() -> Option<$ty> {
            let raw = $slot.load(Acquire);
            // SAFETY: the slot only ever holds null or a pointer that
            // was transmuted from a `$ty` in the setter below.
            (!raw.is_null()).then(|| unsafe { core::mem::transmute::<*mut (), $ty>(raw) })
        }

        /// Install or clear the hook, returning the previous one.
        pub fn $set(hook: Option<$ty>) -> Option<$ty> {
            let raw = match hook {
                Some(f) => f as *mut (),
                None => core::ptr::null_mut(),
            };
            let prev = $slot.swap(raw, AcqRel);
            (!prev.is_null()).then(|| unsafe { core::mem::transmute::<*mut (), $ty>(prev) })
        }
    };
}

hook_accessors!(alloc_hook, set_alloc_hook, ALLOC_HOOK, AllocHook);
hook_accessors!(release_hook, set_release_hook, RELEASE_HOOK, ReleaseHook);
hook_accessors!(realloc_hook, set_realloc_hook, REALLOC_HOOK, ReallocHook);
hook_accessors!(aligned_alloc_hook, set_aligned_alloc_hook, ALIGNED_ALLOC_HOOK, AlignedAllocHook);
hook_accessors!(heap_changed_hook, set_heap_changed_hook, HEAP_CHANGED_HOOK, HeapChangedHook);

#[cfg(test)]
mod tests {
    use super::*;

    // the heap-changed hook is the only one safe to install while other
    // tests allocate concurrently; it observes, never intercepts
    unsafe fn stub_heap_changed(delta: isize) {
        use core::sync::atomic::{AtomicIsize, Ordering};
        static LAST: AtomicIsize = AtomicIsize::new(0);
        LAST.store(delta, Ordering::Relaxed);
    }

    #[test]
    fn install_and_clear() {
        assert!(set_heap_changed_hook(Some(stub_heap_changed)).is_none());

        let hook = heap_changed_hook().expect("hook should be installed");
        unsafe { hook(4096) };

        let prev = set_heap_changed_hook(None).expect("previous hook returned");
        assert_eq!(prev as usize, stub_heap_changed as usize);
        assert!(heap_changed_hook().is_none());
    }
}
