//! System mutexes for arena and list locking.
//!
//! Arenas embed their lock directly in their state record, which may
//! live inside mapped memory, so the mutex must be a plain POD value
//! with a constant initializer. A pthread mutex behind
//! [`lock_api::RawMutex`] fits: blocking lock, try-lock for the
//! contention-avoidance walk, and fork integration via
//! `pthread_atfork`.

use core::cell::UnsafeCell;

/// A `pthread_mutex_t` exposed through [`lock_api::RawMutex`].
///
/// Must not be moved once locked for the first time. Arena records
/// never move, and the statically allocated locks trivially qualify.
pub struct SystemMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for SystemMutex {}
unsafe impl Sync for SystemMutex {}

impl SystemMutex {
    pub const fn new() -> Self {
        Self { inner: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER) }
    }

    /// Reset to the unlocked state. Only valid when no thread can hold
    /// the lock, e.g. in the child of a fork.
    pub unsafe fn reinit(&self) {
        self.inner.get().write(libc::PTHREAD_MUTEX_INITIALIZER);
    }
}

unsafe impl lock_api::RawMutex for SystemMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn lock(&self) {
        unsafe {
            libc::pthread_mutex_lock(self.inner.get());
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        unsafe { libc::pthread_mutex_trylock(self.inner.get()) == 0 }
    }

    #[inline]
    unsafe fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.inner.get());
        }
    }
}

/// Register fork handlers once.
///
/// The prepare handler must leave every allocator lock held so the
/// child's address space snapshots a consistent state; the parent
/// releases them and the child reinitializes them. The handlers
/// themselves live with the arena list, which owns the lock order.
pub fn register_fork_handlers(
    prepare: unsafe extern "C" fn(),
    parent: unsafe extern "C" fn(),
    child: unsafe extern "C" fn(),
) {
    use core::sync::atomic::{AtomicBool, Ordering};

    // atfork must only be registered once, or the handlers would
    // attempt to acquire the same locks twice and deadlock
    static REGISTERED: AtomicBool = AtomicBool::new(false);

    if REGISTERED
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        let result = unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) };
        debug_assert_eq!(result, 0);
    }
}

#[cfg(test)]
mod tests {
    use lock_api::RawMutex as _;

    use super::*;

    #[test]
    fn lock_try_lock_unlock() {
        let mutex = SystemMutex::new();

        mutex.lock();
        unsafe { mutex.unlock() };

        assert!(mutex.try_lock());
        // recursive try-lock on a default pthread mutex must fail
        assert!(!mutex.try_lock());
        unsafe { mutex.unlock() };
        assert!(mutex.try_lock());
        unsafe { mutex.unlock() };
    }

    #[test]
    fn contention_blocks_until_release() {
        use std::sync::Arc;

        struct Shared(SystemMutex, core::sync::atomic::AtomicUsize);

        let shared = Arc::new(Shared(SystemMutex::new(), core::sync::atomic::AtomicUsize::new(0)));

        shared.0.lock();

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                shared.0.lock();
                shared.1.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
                unsafe { shared.0.unlock() };
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(shared.1.load(core::sync::atomic::Ordering::SeqCst), 0);

        unsafe { shared.0.unlock() };
        worker.join().unwrap();
        assert_eq!(shared.1.load(core::sync::atomic::Ordering::SeqCst), 1);
    }
}
