//! Kernel-side event demultiplexer.
//!
//! `EventDemux` owns the epoll instance and the fixed native event array
//! passed to `epoll_wait`. Interest changes are not applied immediately:
//! they are staged in a pending-update table and flushed in a batch at the
//! start of the next wait, so a burst of interest churn costs one syscall
//! per fd instead of one per change. A staged removal is recorded as the
//! `KILLED` sentinel, which absorbs any later staged interest for that fd
//! until a forced re-add re-arms the slot for fd reuse.
//!
//! The demux also owns the interrupt pipe. Its read end is registered with
//! epoll before any user fd; writing one byte to the write end forces a
//! blocked `epoll_wait` to return.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::utils::{cvt, cvt_isize, fd_limit};

/// Sentinel pending-event value: ignore this fd, it has been removed.
pub(crate) const KILLED: u8 = 0xff;

const INITIAL_PENDING_SIZE: usize = 64;

/// Fds below this use the flat byte table; larger fds go to the spill map.
const DENSE_EVENTS_LIMIT: usize = 64 * 1024;

/// Kernel event bits stored per fd. They all fit in one byte, which keeps
/// the dense table a single memory write per staged update.
pub(crate) const POLLIN: u32 = libc::EPOLLIN as u32;
pub(crate) const POLLOUT: u32 = libc::EPOLLOUT as u32;
pub(crate) const POLLERR: u32 = libc::EPOLLERR as u32;
pub(crate) const POLLHUP: u32 = libc::EPOLLHUP as u32;

/// Word-array bitset of fds currently registered with the kernel.
struct FdSet {
    words: Vec<u64>,
}

impl FdSet {
    fn new() -> FdSet {
        FdSet { words: Vec::new() }
    }

    fn get(&self, fd: RawFd) -> bool {
        let idx = fd as usize / 64;
        match self.words.get(idx) {
            Some(w) => w & (1 << (fd as usize % 64)) != 0,
            None => false,
        }
    }

    fn set(&mut self, fd: RawFd) {
        let idx = fd as usize / 64;
        if idx >= self.words.len() {
            self.words.resize(idx + 1, 0);
        }
        self.words[idx] |= 1 << (fd as usize % 64);
    }

    fn clear(&mut self, fd: RawFd) {
        let idx = fd as usize / 64;
        if let Some(w) = self.words.get_mut(idx) {
            *w &= !(1 << (fd as usize % 64));
        }
    }
}

/// Staged registration changes, guarded by the demux update lock.
struct Updates {
    /// Fds with a pending change, in staging order.
    queue: Vec<RawFd>,
    /// Pending event byte per fd, dense path.
    events_low: Box<[u8]>,
    /// Pending event byte for fds at or above `DENSE_EVENTS_LIMIT`.
    events_high: HashMap<RawFd, u8>,
    /// Fds the kernel currently knows about.
    registered: FdSet,
}

impl Updates {
    /// Store the pending events for `fd`. No effect if the slot is KILLED,
    /// unless `force` is set (used by `add` to re-arm a reused fd).
    fn set_update_events(&mut self, fd: RawFd, events: u8, force: bool) {
        if (fd as usize) < DENSE_EVENTS_LIMIT {
            if self.events_low[fd as usize] != KILLED || force {
                self.events_low[fd as usize] = events;
            }
        } else if self.events_high.get(&fd) != Some(&KILLED) || force {
            self.events_high.insert(fd, events);
        }
    }

    fn get_update_events(&self, fd: RawFd) -> u8 {
        if (fd as usize) < DENSE_EVENTS_LIMIT {
            self.events_low[fd as usize]
        } else {
            *self.events_high.get(&fd).unwrap_or(&0)
        }
    }
}

/// State owned by the single selecting thread: the native event array and
/// the interrupt bookkeeping for the current cycle. The mutex doubles as
/// the "one thread selects at a time" guard.
pub(crate) struct WaitState {
    events: Box<[libc::epoll_event]>,
    /// Number of entries populated by the last wait.
    pub(crate) updated: usize,
    pub(crate) interrupted: bool,
    pub(crate) interrupted_index: usize,
}

impl WaitState {
    pub(crate) fn event_fd(&self, i: usize) -> RawFd {
        let data = self.events[i].u64;
        data as RawFd
    }

    pub(crate) fn event_bits(&self, i: usize) -> u32 {
        self.events[i].events
    }

    pub(crate) fn clear_event(&mut self, i: usize) {
        self.events[i].events = 0;
    }
}

pub(crate) struct EventDemux {
    epfd: RawFd,
    /// Read end of the interrupt pipe, registered with epoll.
    incoming_interrupt: RawFd,
    /// Write end of the interrupt pipe.
    outgoing_interrupt: RawFd,
    updates: Mutex<Updates>,
    pub(crate) wait: Mutex<WaitState>,
    closed: AtomicBool,
}

impl EventDemux {
    pub(crate) fn new() -> io::Result<EventDemux> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;

        let mut pipe_fds: [libc::c_int; 2] = [0; 2];
        if let Err(e) = cvt(unsafe {
            libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK)
        }) {
            unsafe { libc::close(epfd) };
            return Err(e);
        }
        let (fd0, fd1) = (pipe_fds[0], pipe_fds[1]);

        // Register the interrupt read end before any user fd.
        let mut ev = libc::epoll_event {
            events: POLLIN,
            u64: fd0 as u64,
        };
        if let Err(e) = cvt(unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd0, &mut ev) }) {
            unsafe {
                libc::close(fd0);
                libc::close(fd1);
                libc::close(epfd);
            }
            return Err(e);
        }

        let capacity = fd_limit().min(8192);
        let events = vec![libc::epoll_event { events: 0, u64: 0 }; capacity].into_boxed_slice();

        Ok(EventDemux {
            epfd,
            incoming_interrupt: fd0,
            outgoing_interrupt: fd1,
            updates: Mutex::new(Updates {
                queue: Vec::with_capacity(INITIAL_PENDING_SIZE),
                events_low: vec![0u8; DENSE_EVENTS_LIMIT].into_boxed_slice(),
                events_high: HashMap::new(),
                registered: FdSet::new(),
            }),
            wait: Mutex::new(WaitState {
                events,
                updated: 0,
                interrupted: false,
                interrupted_index: 0,
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Begin tracking `fd`. Forces the pending events to zero, overriding a
    /// KILLED left behind by a previous registration of a reused fd value.
    pub(crate) fn add(&self, fd: RawFd) {
        let mut updates = self.updates.lock().unwrap();
        debug_assert!(!updates.registered.get(fd));
        updates.set_update_events(fd, 0, true);
    }

    /// Stop tracking `fd`: kill pending and future updates, and detach it
    /// from the kernel if currently registered. Idempotent.
    pub(crate) fn remove(&self, fd: RawFd) {
        let mut updates = self.updates.lock().unwrap();
        updates.set_update_events(fd, KILLED, false);
        if updates.registered.get(fd) {
            // The fd may already be closed; a failed DEL here is the benign
            // pre-close race.
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
            updates.registered.clear(fd);
        }
    }

    /// Stage new interest events for `fd`, to be flushed by the next wait.
    pub(crate) fn set_interest(&self, fd: RawFd, events: u8) {
        debug_assert!(events != KILLED);
        let mut updates = self.updates.lock().unwrap();
        updates.queue.push(fd);
        updates.set_update_events(fd, events, false);
    }

    /// Flush staged updates, then block in `epoll_wait` for up to
    /// `timeout_ms` milliseconds (`-1` blocks indefinitely, `0` polls).
    /// Populates the wait state with the ready entries and flags the
    /// interrupt if the pipe's read end is among them.
    pub(crate) fn poll(&self, ws: &mut WaitState, timeout_ms: i32) -> io::Result<usize> {
        self.flush_updates()?;

        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                ws.events.as_mut_ptr(),
                ws.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                // A signal cut the wait short; report no events.
                ws.updated = 0;
                return Ok(0);
            }
            return Err(err);
        }

        ws.updated = n as usize;
        for i in 0..ws.updated {
            if ws.event_fd(i) == self.incoming_interrupt {
                ws.interrupted_index = i;
                ws.interrupted = true;
                break;
            }
        }
        Ok(ws.updated)
    }

    /// Apply every staged `(fd, events)` pair to the kernel. KILLED slots
    /// are skipped; the opcode is derived from whether the kernel already
    /// knows the fd and whether the new event set is empty.
    fn flush_updates(&self) -> io::Result<()> {
        let mut updates = self.updates.lock().unwrap();
        let mut j = 0;
        while j < updates.queue.len() {
            let fd = updates.queue[j];
            let events = updates.get_update_events(fd);
            j += 1;
            if events == KILLED {
                continue;
            }
            let is_registered = updates.registered.get(fd);
            if is_registered {
                if events != 0 {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, events)?;
                } else {
                    self.ctl(libc::EPOLL_CTL_DEL, fd, 0)?;
                    updates.registered.clear(fd);
                }
            } else if events != 0 {
                self.ctl(libc::EPOLL_CTL_ADD, fd, events)?;
                updates.registered.set(fd);
            }
        }
        updates.queue.clear();
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u8) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: events as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            // A concurrently pre-closed fd surfaces as EBADF or ENOENT; the
            // cancelled-key sweep will finish tearing it down.
            match err.raw_os_error() {
                Some(libc::EBADF) | Some(libc::ENOENT) => return Ok(()),
                _ => return Err(err),
            }
        }
        Ok(())
    }

    /// Write one byte to the interrupt pipe, forcing the wait to return.
    pub(crate) fn interrupt(&self) -> io::Result<()> {
        let buf = [0u8; 1];
        match cvt_isize(unsafe {
            libc::write(self.outgoing_interrupt, buf.as_ptr() as *const libc::c_void, 1)
        }) {
            Ok(_) => Ok(()),
            // A full pipe already guarantees the wait will wake.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drain the bytes queued on the interrupt pipe.
    pub(crate) fn drain_interrupt(&self) {
        let mut buf = [0u8; 128];
        loop {
            let n = unsafe {
                libc::read(
                    self.incoming_interrupt,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 || (n as usize) < buf.len() {
                break;
            }
        }
    }

    /// Release the kernel handle and both pipe ends. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        unsafe {
            libc::close(self.incoming_interrupt);
            libc::close(self.outgoing_interrupt);
            libc::close(self.epfd);
        }
    }
}

impl Drop for EventDemux {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_pipe() -> (RawFd, RawFd) {
        let mut fds: [libc::c_int; 2] = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_poll_reports_readable_fd() {
        let demux = EventDemux::new().unwrap();
        let (rd, wr) = raw_pipe();
        demux.add(rd);
        demux.set_interest(rd, POLLIN as u8);

        let one = [1u8];
        unsafe { libc::write(wr, one.as_ptr() as *const libc::c_void, 1) };

        let mut ws = demux.wait.lock().unwrap();
        let n = demux.poll(&mut ws, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(ws.event_fd(0), rd);
        assert!(ws.event_bits(0) & POLLIN != 0);
        assert!(!ws.interrupted);
        drop(ws);

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_poll_timeout_with_no_events() {
        let demux = EventDemux::new().unwrap();
        let mut ws = demux.wait.lock().unwrap();
        let n = demux.poll(&mut ws, 10).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_interrupt_wakes_poll() {
        let demux = EventDemux::new().unwrap();
        demux.interrupt().unwrap();

        let mut ws = demux.wait.lock().unwrap();
        let n = demux.poll(&mut ws, 5000).unwrap();
        assert_eq!(n, 1);
        assert!(ws.interrupted);
        assert_eq!(ws.interrupted_index, 0);
        ws.interrupted = false;
        drop(ws);
        demux.drain_interrupt();

        // Drained: the next poll times out instead of reporting the pipe.
        let mut ws = demux.wait.lock().unwrap();
        let n = demux.poll(&mut ws, 10).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_killed_absorbs_staged_interest() {
        let demux = EventDemux::new().unwrap();
        let (rd, wr) = raw_pipe();
        demux.add(rd);
        demux.set_interest(rd, POLLIN as u8);
        demux.remove(rd);
        // Staged after the remove: must be ignored by the flush.
        demux.set_interest(rd, POLLIN as u8);

        let one = [1u8];
        unsafe { libc::write(wr, one.as_ptr() as *const libc::c_void, 1) };

        let mut ws = demux.wait.lock().unwrap();
        let n = demux.poll(&mut ws, 10).unwrap();
        assert_eq!(n, 0);
        drop(ws);

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_forced_add_rearms_killed_fd() {
        let demux = EventDemux::new().unwrap();
        let (rd, wr) = raw_pipe();
        demux.add(rd);
        demux.set_interest(rd, POLLIN as u8);
        demux.remove(rd);
        // Same fd value reused by a new registration.
        demux.add(rd);
        demux.set_interest(rd, POLLIN as u8);

        let one = [1u8];
        unsafe { libc::write(wr, one.as_ptr() as *const libc::c_void, 1) };

        let mut ws = demux.wait.lock().unwrap();
        let n = demux.poll(&mut ws, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(ws.event_fd(0), rd);
        drop(ws);

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let demux = EventDemux::new().unwrap();
        let (rd, _wr) = raw_pipe();
        demux.add(rd);
        demux.set_interest(rd, POLLIN as u8);
        {
            let mut ws = demux.wait.lock().unwrap();
            demux.poll(&mut ws, 0).unwrap();
        }
        demux.remove(rd);
        demux.remove(rd);
        close_fd(rd);
        close_fd(_wr);
    }

    #[test]
    fn test_interest_coalesces_per_fd() {
        let demux = EventDemux::new().unwrap();
        let (rd, wr) = raw_pipe();
        demux.add(rd);
        // Last staged write wins.
        demux.set_interest(rd, POLLIN as u8);
        demux.set_interest(rd, 0);

        let one = [1u8];
        unsafe { libc::write(wr, one.as_ptr() as *const libc::c_void, 1) };

        let mut ws = demux.wait.lock().unwrap();
        let n = demux.poll(&mut ws, 10).unwrap();
        assert_eq!(n, 0);
        drop(ws);

        close_fd(rd);
        close_fd(wr);
    }
}
