//! Initialise-once global state.
//!
//! The kernel keeps one singleton per subsystem (boot info, timer queue,
//! scheduler, heap). Each is created during boot and never torn down, so a
//! mutex around an `Option` is all the machinery required; `init` refuses a
//! second initialisation instead of silently replacing live state.

use spin::Mutex;

/// A mutex-guarded global that is set exactly once during boot.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    /// Create new uninitialized global state
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the global state.
    ///
    /// Returns the value back if the state was already initialised.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut lock = self.inner.lock();
        if lock.is_some() {
            Err(value)
        } else {
            *lock = Some(value);
            Ok(())
        }
    }

    /// Whether `init` has run.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Run `f` with a shared reference to the value, if initialised.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let lock = self.inner.lock();
        lock.as_ref().map(f)
    }

    /// Run `f` with an exclusive reference to the value, if initialised.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut lock = self.inner.lock();
        lock.as_mut().map(f)
    }

    /// Tear the value down again. Only used by tests that rebuild a
    /// subsystem singleton from scratch.
    pub fn reset(&self) -> Option<T> {
        self.inner.lock().take()
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the spin::Mutex serialises every access to the inner Option<T>, so
// sharing a GlobalState between contexts is sound whenever T itself may be
// moved between them.
unsafe impl<T: Send> Send for GlobalState<T> {}
// SAFETY: all access goes through the Mutex, so no two contexts can observe
// the inner value concurrently; T: Send suffices.
unsafe impl<T: Send> Sync for GlobalState<T> {}
