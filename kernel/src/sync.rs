//! Blocking synchronization primitives layered on the scheduler.
//!
//! Until the first user task is about to start there is exactly one thread
//! of control in the kernel, so lock and unlock skip both the interrupt
//! fiddling and the possibility of blocking.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::interrupts::without_interrupts;
use crate::scheduler::{self, ThreadQueue};

struct MutexState {
    locked: bool,
    waiters: ThreadQueue,
}

/// A blocking mutex with FIFO waiters and direct ownership handoff: when a
/// holder releases a contended lock, the lock stays owned and the head
/// waiter becomes the owner before it even runs. There is no window in
/// which the lock is free while a waiter is still queued.
pub struct Mutex<T: ?Sized> {
    state: UnsafeCell<MutexState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*mut ()>,
}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Mutex<T> {
        Mutex {
            state: UnsafeCell::new(MutexState {
                locked: false,
                waiters: ThreadQueue::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the mutex, blocking the calling thread if it is held.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if !scheduler::multitasking_active() {
            let state = unsafe { &mut *self.state.get() };
            debug_assert!(!state.locked, "boot-phase lock held twice");
            state.locked = true;
            return MutexGuard {
                mutex: self,
                _not_send: PhantomData,
            };
        }
        without_interrupts(|| {
            // No borrow of the state may survive the switch; release runs
            // on another thread while this frame sleeps.
            let held = unsafe { (*self.state.get()).locked };
            if !held {
                unsafe { (*self.state.get()).locked = true };
            } else {
                let current = scheduler::current_thread().expect("no current thread");
                unsafe { (*self.state.get()).waiters.push_back(current.clone()) };
                scheduler::block_current(&current);
                // Ownership was handed to us on release; the lock is still
                // marked held.
            }
        });
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    fn unlock(&self) {
        if !scheduler::multitasking_active() {
            unsafe { (*self.state.get()).locked = false };
            return;
        }
        without_interrupts(|| {
            let state = unsafe { &mut *self.state.get() };
            match state.waiters.pop_front() {
                Some(waiter) => scheduler::wake(waiter),
                None => state.locked = false,
            }
        });
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Condition variable with FIFO waiters. Waking is only meaningful under
/// the associated mutex: callers re-test their predicate in a loop, and a
/// signal with no waiters is forgotten.
pub struct Condvar {
    waiters: UnsafeCell<ThreadQueue>,
}

unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            waiters: UnsafeCell::new(ThreadQueue::new()),
        }
    }

    /// Atomically release the guard's mutex and block; reacquire before
    /// returning. The waiter queue mutation and the release happen with
    /// interrupts disabled, so a signal cannot slip between them.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex;
        without_interrupts(|| {
            let current = scheduler::current_thread().expect("no current thread");
            unsafe { (*self.waiters.get()).push_back(current.clone()) };
            core::mem::forget(guard);
            mutex.unlock();
            scheduler::block_current(&current);
        });
        mutex.lock()
    }

    /// Wake the longest-waiting thread, if any.
    pub fn notify_one(&self) {
        without_interrupts(|| {
            if let Some(waiter) = unsafe { (*self.waiters.get()).pop_front() } {
                scheduler::wake(waiter);
            }
        });
    }

    /// Wake every thread currently waiting.
    pub fn notify_all(&self) {
        without_interrupts(|| {
            while let Some(waiter) = unsafe { (*self.waiters.get()).pop_front() } {
                scheduler::wake(waiter);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn boot_phase_lock_roundtrip() {
        let mutex = Mutex::new(7u32);
        {
            let mut guard = mutex.lock();
            *guard += 1;
        }
        assert_eq!(*mutex.lock(), 8);
    }

    #[test_case]
    fn guard_release_on_drop() {
        let mutex = Mutex::new(());
        drop(mutex.lock());
        drop(mutex.lock());
    }

    #[test_case]
    fn notify_without_waiters_is_noop() {
        let condvar = Condvar::new();
        condvar.notify_one();
        condvar.notify_all();
    }
}
