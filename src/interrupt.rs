//! Cooperative thread interruption.
//!
//! Blocking operations in this crate (channel I/O, `Selector::select`, task
//! queue waits) cannot be cut short by the OS alone. Instead, every thread
//! carries an interrupt slot: a status flag plus an optional hook installed
//! for the duration of a blocking call. `ThreadHandle::interrupt` sets the
//! flag and fires the hook, which knows how to unblock the operation in
//! progress (close the channel, wake the selector, notify the queue).

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Callback installed while a thread is blocked in an interruptible
/// operation. Fired at most once per `interrupt` call, with the handle of
/// the thread being interrupted.
pub trait Interruptible: Send + Sync {
    fn interrupt(&self, target: &ThreadHandle);
}

struct ThreadState {
    status: AtomicBool,
    blocker: Mutex<Option<Arc<dyn Interruptible>>>,
}

/// Handle to one thread's interrupt state. Cloneable and sendable, so other
/// threads can interrupt the owner after it has gone on to block somewhere.
#[derive(Clone)]
pub struct ThreadHandle {
    inner: Arc<ThreadState>,
}

impl ThreadHandle {
    /// Create a handle not yet bound to a thread. The owning thread binds it
    /// with [`adopt`]; until then `interrupt` only sets the status flag.
    pub fn new() -> ThreadHandle {
        ThreadHandle {
            inner: Arc::new(ThreadState {
                status: AtomicBool::new(false),
                blocker: Mutex::new(None),
            }),
        }
    }

    /// Set the interrupt status and fire the blocker hook, if one is
    /// installed. The hook runs on the caller's thread while the slot lock is
    /// held, so it cannot race with the owner uninstalling it.
    pub fn interrupt(&self) {
        self.inner.status.store(true, Ordering::SeqCst);
        let blocker = self.inner.blocker.lock().unwrap();
        if let Some(hook) = blocker.as_ref() {
            hook.interrupt(self);
        }
    }

    /// Observe the interrupt status without clearing it.
    pub fn is_interrupted(&self) -> bool {
        self.inner.status.load(Ordering::SeqCst)
    }

    /// Observe and clear the interrupt status.
    pub fn take_interrupted(&self) -> bool {
        self.inner.status.swap(false, Ordering::SeqCst)
    }

    /// Identity comparison; two handles are the same thread iff they share
    /// the same state.
    pub fn same_as(&self, other: &ThreadHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for ThreadHandle {
    fn default() -> Self {
        ThreadHandle::new()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
}

/// The calling thread's interrupt handle, created on first use.
pub fn current() -> ThreadHandle {
    CURRENT.with(|c| {
        let mut slot = c.borrow_mut();
        if let Some(h) = slot.as_ref() {
            return h.clone();
        }
        let h = ThreadHandle::new();
        *slot = Some(h.clone());
        h
    })
}

/// Bind a pre-created handle to the calling thread. The worker pool creates
/// handles eagerly so a worker can be interrupted before its thread has
/// reached the task loop.
pub(crate) fn adopt(handle: ThreadHandle) {
    CURRENT.with(|c| {
        *c.borrow_mut() = Some(handle);
    });
}

/// Install or remove the calling thread's blocker hook.
pub(crate) fn blocked_on(hook: Option<Arc<dyn Interruptible>>) {
    let me = current();
    *me.inner.blocker.lock().unwrap() = hook;
}

/// Scoped blocker installation; removes the hook when dropped.
pub(crate) struct BlockGuard;

impl BlockGuard {
    pub(crate) fn install(hook: Arc<dyn Interruptible>) -> BlockGuard {
        blocked_on(Some(hook));
        BlockGuard
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        blocked_on(None);
    }
}
