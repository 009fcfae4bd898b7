//! Selectable channels.
//!
//! `ChannelCore` carries the state every selectable channel shares: the
//! file descriptor, the blocking-mode flag, the keys the channel holds with
//! selectors, and the close/interrupt machinery. Concrete channels embed a
//! core and implement [`SelectableChannel`], overriding the ready-event
//! translation where their operation alphabet differs from the default.
//!
//! Every potentially-blocking syscall a channel performs is bracketed by
//! `begin`/`end`. `begin` installs an interrupt hook that closes the
//! channel and records the interrupted thread; `end` removes the hook and
//! surfaces `ClosedByInterrupt` or `AsynchronousClose` as appropriate.

pub mod pipe;
pub mod tcp;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{MuxError, Result};
use crate::event::Ops;
use crate::interrupt::{self, Interruptible, ThreadHandle};
use crate::key::SelectionKey;
use crate::poll::{POLLERR, POLLHUP, POLLIN, POLLOUT};
use crate::selector::SelectorInner;
use crate::utils::cvt;

/// `poll(2)`-style invalid-fd bit; reported when a watched fd was closed
/// out from under the kernel during the cycle.
pub(crate) const POLLNVAL: u32 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    /// Created but not yet usable for I/O (e.g. an unbound listener).
    Uninitialized,
    InUse,
    /// Fd released; terminal.
    Killed,
}

/// Shared state of a selectable channel.
pub struct ChannelCore {
    fd: RawFd,
    open: AtomicBool,
    state: Mutex<ChannelState>,
    close_lock: Mutex<()>,
    /// Guards registration and blocking-mode changes.
    pub(crate) reg_lock: Mutex<()>,
    blocking: AtomicBool,
    keys: Mutex<Vec<Arc<SelectionKey>>>,
    /// Thread whose interruption closed this channel, if any.
    interrupted_by: Mutex<Option<ThreadHandle>>,
    /// Number of threads currently inside a blocking syscall on this fd.
    blocked_in_io: AtomicUsize,
}

impl ChannelCore {
    pub(crate) fn new(fd: RawFd) -> ChannelCore {
        ChannelCore::with_state(fd, ChannelState::InUse)
    }

    pub(crate) fn new_uninitialized(fd: RawFd) -> ChannelCore {
        ChannelCore::with_state(fd, ChannelState::Uninitialized)
    }

    fn with_state(fd: RawFd, state: ChannelState) -> ChannelCore {
        ChannelCore {
            fd,
            open: AtomicBool::new(true),
            state: Mutex::new(state),
            close_lock: Mutex::new(()),
            reg_lock: Mutex::new(()),
            // Channels start in blocking mode.
            blocking: AtomicBool::new(true),
            keys: Mutex::new(Vec::new()),
            interrupted_by: Mutex::new(None),
            blocked_in_io: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_in_use(&self) {
        let mut st = self.state.lock().unwrap();
        if *st == ChannelState::Uninitialized {
            *st = ChannelState::InUse;
        }
    }

    pub(crate) fn add_key(&self, key: Arc<SelectionKey>) {
        self.keys.lock().unwrap().push(key);
    }

    pub(crate) fn remove_key(&self, key: &Arc<SelectionKey>) {
        self.keys
            .lock()
            .unwrap()
            .retain(|k| !Arc::ptr_eq(k, key));
    }

    pub(crate) fn find_key(&self, selector: &Arc<SelectorInner>) -> Option<Arc<SelectionKey>> {
        let target = Arc::downgrade(selector);
        self.keys
            .lock()
            .unwrap()
            .iter()
            .find(|k| Weak::ptr_eq(&k.selector, &target))
            .cloned()
    }

    pub(crate) fn is_registered(&self) -> bool {
        !self.keys.lock().unwrap().is_empty()
    }

    fn has_valid_keys(&self) -> bool {
        self.keys.lock().unwrap().iter().any(|k| k.is_valid())
    }

    fn cancel_keys(&self) {
        let keys = self.keys.lock().unwrap().clone();
        for key in keys {
            key.cancel();
        }
    }

    /// Release the fd. Called only once the channel is both closed and no
    /// longer registered with any selector.
    pub(crate) fn kill(&self) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        if *st == ChannelState::Killed {
            return Ok(());
        }
        debug_assert!(!self.is_open());
        *st = ChannelState::Killed;
        cvt(unsafe { libc::close(self.fd) })?;
        Ok(())
    }

    fn set_nonblocking_fd(&self, nonblocking: bool) -> io::Result<()> {
        let flags = cvt(unsafe { libc::fcntl(self.fd, libc::F_GETFL) })?;
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        cvt(unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) })?;
        Ok(())
    }

    /// Mark the start of a potentially-blocking I/O operation: install the
    /// interrupt hook for the current thread. If the thread's interrupt
    /// status is already set, the hook fires immediately so the upcoming
    /// syscall observes a closed fd and returns promptly.
    pub(crate) fn begin(&self, channel: &Arc<dyn SelectableChannel>) {
        let hook: Arc<dyn Interruptible> = Arc::new(ChannelInterruptor {
            channel: Arc::downgrade(channel),
        });
        interrupt::blocked_on(Some(hook.clone()));
        let me = interrupt::current();
        if me.is_interrupted() {
            hook.interrupt(&me);
        }
    }

    /// Mark the end of a blocking I/O operation. `completed` is true iff
    /// the operation had an effect visible to the caller (or returned
    /// `WouldBlock`).
    pub(crate) fn end(&self, completed: bool) -> Result<()> {
        interrupt::blocked_on(None);
        let interrupted = self.interrupted_by.lock().unwrap().clone();
        if let Some(thread) = interrupted {
            if thread.same_as(&interrupt::current()) {
                *self.interrupted_by.lock().unwrap() = None;
                return Err(MuxError::ClosedByInterrupt);
            }
        }
        if !completed && !self.is_open() {
            return Err(MuxError::AsynchronousClose);
        }
        Ok(())
    }

    pub(crate) fn enter_io(&self) {
        self.blocked_in_io.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave_io(&self) {
        self.blocked_in_io.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn io_in_flight(&self) -> bool {
        self.blocked_in_io.load(Ordering::SeqCst) != 0
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap();
        if *st != ChannelState::Killed {
            *st = ChannelState::Killed;
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Interrupt hook installed by `ChannelCore::begin`: close the channel,
/// remember which thread was interrupted, and release the fd machinery so
/// the blocked syscall returns.
struct ChannelInterruptor {
    channel: Weak<dyn SelectableChannel>,
}

impl Interruptible for ChannelInterruptor {
    fn interrupt(&self, target: &ThreadHandle) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let core = channel.core();
        let _guard = core.close_lock.lock().unwrap();
        if !core.open.load(Ordering::SeqCst) {
            return;
        }
        core.open.store(false, Ordering::SeqCst);
        *core.interrupted_by.lock().unwrap() = Some(target.clone());
        let _ = channel.impl_close_selectable();
        core.cancel_keys();
    }
}

/// Capability interface the selector consumes from a channel, plus the
/// channel-side registration mechanics shared by all variants.
pub trait SelectableChannel: Send + Sync {
    fn core(&self) -> &ChannelCore;

    /// Operations this channel variant supports in an interest set.
    fn valid_ops(&self) -> Ops;

    /// Channel-specific close work: arrange for any thread blocked in I/O
    /// on this channel to return promptly, and release the fd if the
    /// channel is not registered with any selector.
    fn impl_close_selectable(&self) -> io::Result<()>;

    fn fd_val(&self) -> RawFd {
        self.core().fd()
    }

    fn is_open(&self) -> bool {
        self.core().is_open()
    }

    fn is_blocking(&self) -> bool {
        self.core().is_blocking()
    }

    fn is_registered(&self) -> bool {
        self.core().is_registered()
    }

    /// Translate an interest set into the kernel event byte staged with the
    /// demux.
    fn translate_interest(&self, interest: Ops) -> u8 {
        let mut events = 0u32;
        if interest.intersects(Ops::READ | Ops::ACCEPT) {
            events |= POLLIN;
        }
        if interest.intersects(Ops::WRITE | Ops::CONNECT) {
            events |= POLLOUT;
        }
        events as u8
    }

    /// Fold kernel event bits into the key's ready set, starting from
    /// `initial`. Returns true iff bits not present in `initial` appeared.
    ///
    /// Error and hangup conditions conservatively mark the full interest
    /// set ready, so the application finds out regardless of which
    /// operation it was waiting on.
    fn translate_ready(&self, kernel: u32, initial: Ops, key: &SelectionKey) -> bool {
        if kernel & POLLNVAL != 0 {
            // The fd was closed during the cycle; the cancelled-key sweep
            // will clean up.
            return false;
        }
        let interest = key.interest();
        if kernel & (POLLERR | POLLHUP) != 0 {
            key.set_ready(interest);
            return !interest.difference(initial).is_empty();
        }
        let mut new_ops = Ops::empty();
        if kernel & POLLIN != 0 {
            if interest.contains(Ops::ACCEPT) {
                new_ops = new_ops | Ops::ACCEPT;
            }
            if interest.contains(Ops::READ) {
                new_ops = new_ops | Ops::READ;
            }
        }
        if kernel & POLLOUT != 0 {
            if interest.contains(Ops::WRITE) {
                new_ops = new_ops | Ops::WRITE;
            }
            if interest.contains(Ops::CONNECT) {
                new_ops = new_ops | Ops::CONNECT;
            }
        }
        key.set_ready(initial | new_ops);
        !new_ops.difference(initial).is_empty()
    }

    /// Switch between blocking and non-blocking mode. A channel registered
    /// with a selector cannot be put back into blocking mode.
    fn configure_blocking(&self, block: bool) -> Result<()> {
        let core = self.core();
        let _guard = core.reg_lock.lock().unwrap();
        if !core.is_open() {
            return Err(MuxError::ClosedChannel);
        }
        if block == core.is_blocking() {
            return Ok(());
        }
        if block && core.has_valid_keys() {
            return Err(MuxError::IllegalBlockingMode);
        }
        core.set_nonblocking_fd(!block)?;
        core.blocking.store(block, Ordering::SeqCst);
        Ok(())
    }

    /// Close the channel and cancel all of its keys. The fd is released
    /// here if the channel is unregistered, otherwise when the last
    /// selector deregisters it.
    fn close(&self) -> Result<()> {
        let core = self.core();
        let _guard = core.close_lock.lock().unwrap();
        if !core.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.impl_close_selectable()?;
        core.cancel_keys();
        Ok(())
    }

    /// Release the fd once the channel is closed and fully deregistered.
    fn kill(&self) -> io::Result<()> {
        self.core().kill()
    }
}

/// Outcome of one bracketed syscall, fed to `ChannelCore::end` and then
/// merged with the interruption verdict.
pub(crate) fn finish_io(core: &ChannelCore, result: io::Result<isize>) -> Result<isize> {
    let completed = match &result {
        Ok(n) => *n > 0,
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
    };
    core.end(completed)?;
    result.map_err(MuxError::from)
}
