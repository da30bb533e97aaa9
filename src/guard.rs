//! The patching lock and no-safepoint scopes.
//!
//! Every mutation of an installed call site, inline cache cell or stub jump
//! word happens while holding the runtime's [`PatchingLock`]. The
//! [`PatchScope`] it hands out doubles as the capability token that patching
//! operations require, and marks the thread as being inside a no-safepoint
//! region: reaching a cooperative [`checkpoint`] there is a bug.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

thread_local! {
    static NO_SAFEPOINT_DEPTH: Cell<u32> = const { Cell::new(0) };
    static HOLDS_PATCHING_LOCK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as unable to reach a safepoint.
///
/// Scopes nest. The type is neither `Send` nor `Sync`: it describes the
/// thread that created it.
pub struct NoSafepointScope {
    _thread_bound: PhantomData<*const ()>,
}

impl NoSafepointScope {
    pub fn enter() -> Self {
        NO_SAFEPOINT_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for NoSafepointScope {
    fn drop(&mut self) {
        NO_SAFEPOINT_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Whether the current thread is inside a no-safepoint scope.
pub fn in_no_safepoint_scope() -> bool {
    NO_SAFEPOINT_DEPTH.with(|depth| depth.get() > 0)
}

/// A cooperative safepoint check.
///
/// Slow paths call this before doing anything that may block or allocate.
///
/// # Panics
///
/// Panics if the current thread is inside a no-safepoint scope.
pub fn checkpoint() {
    assert!(
        !in_no_safepoint_scope(),
        "safepoint checkpoint reached inside a no-safepoint scope"
    );
}

/// The global patching lock.
#[derive(Default)]
pub struct PatchingLock {
    mutex: Mutex<()>,
    acquisitions: AtomicU64,
}

/// Proof that the patching lock is held by the current thread.
///
/// Fields drop in declaration order: the lock is released before the
/// no-safepoint scope ends.
pub struct PatchScope<'a> {
    _guard: MutexGuard<'a, ()>,
    _owner: LockOwner,
    _no_safepoint: NoSafepointScope,
}

struct LockOwner;

impl Drop for LockOwner {
    fn drop(&mut self) {
        HOLDS_PATCHING_LOCK.with(|held| held.set(false));
    }
}

impl PatchingLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock.
    ///
    /// # Panics
    ///
    /// Panics if the current thread already holds a patching lock; the lock is
    /// not reentrant.
    pub fn lock(&self) -> PatchScope<'_> {
        assert!(
            !HOLDS_PATCHING_LOCK.with(Cell::get),
            "patching lock is not reentrant"
        );
        // A panic while patching leaves call sites in a valid state, so a
        // poisoned lock is still usable.
        let guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        HOLDS_PATCHING_LOCK.with(|held| held.set(true));
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        PatchScope {
            _guard: guard,
            _owner: LockOwner,
            _no_safepoint: NoSafepointScope::enter(),
        }
    }

    /// Number of times the lock has been taken.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

/// Whether the current thread holds a patching lock.
pub fn holds_patching_lock() -> bool {
    HOLDS_PATCHING_LOCK.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_nesting() {
        assert!(!in_no_safepoint_scope());
        {
            let _outer = NoSafepointScope::enter();
            {
                let _inner = NoSafepointScope::enter();
                assert!(in_no_safepoint_scope());
            }
            assert!(in_no_safepoint_scope());
        }
        assert!(!in_no_safepoint_scope());
    }

    #[test]
    fn test_checkpoint_outside_scope() {
        checkpoint();
    }

    #[test]
    #[should_panic(expected = "no-safepoint scope")]
    fn test_checkpoint_inside_scope_panics() {
        let _scope = NoSafepointScope::enter();
        checkpoint();
    }

    #[test]
    fn test_patch_scope_blocks_safepoints() {
        let lock = PatchingLock::new();
        {
            let _scope = lock.lock();
            assert!(in_no_safepoint_scope());
            assert!(holds_patching_lock());
        }
        assert!(!in_no_safepoint_scope());
        assert!(!holds_patching_lock());
        assert_eq!(lock.acquisitions(), 1);
    }

    #[test]
    #[should_panic(expected = "not reentrant")]
    fn test_reentrant_lock_panics() {
        let lock = PatchingLock::new();
        let _first = lock.lock();
        let _second = lock.lock();
    }

    #[test]
    fn test_scope_is_per_thread() {
        let lock = PatchingLock::new();
        let _scope = lock.lock();
        std::thread::scope(|s| {
            s.spawn(|| assert!(!in_no_safepoint_scope()));
        });
    }
}
