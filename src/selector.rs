//! Readiness selector.
//!
//! The selector owns an [`EventDemux`](crate::poll) and three key sets:
//! registered, ready, and cancelled. One thread at a time runs the select
//! cycle — deregister cancelled keys, flush staged interest and wait in the
//! kernel, deregister again, then fold returned events into the ready set.
//! Registration, cancellation, wakeup, and close may be called from any
//! thread.
//!
//! Lock order for a cycle is fixed: the wait-state guard, then the
//! registered set, then the ready set. `wakeup` takes only the dedicated
//! interrupt lock, so it never blocks behind a selecting thread; one byte
//! is written to the interrupt pipe at most once per cycle.

use std::any::Any;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lockfree::map::Map;

use crate::channel::SelectableChannel;
use crate::error::{MuxError, Result};
use crate::event::Ops;
use crate::interrupt::{self, BlockGuard, Interruptible, ThreadHandle};
use crate::key::SelectionKey;
use crate::poll::{EventDemux, WaitState};

type KeyMap = HashMap<RawFd, Arc<SelectionKey>>;

pub(crate) struct SelectorInner {
    demux: EventDemux,
    /// Keys registered with this selector, by fd.
    registered: Mutex<KeyMap>,
    /// Keys with ready operations observed and not yet consumed.
    selected: Mutex<KeyMap>,
    /// Keys cancelled since the last cycle; deregistered at the next one.
    cancelled: Mutex<Vec<Arc<SelectionKey>>>,
    /// Lock-free fd lookup used on the wake path.
    fd_to_key: Map<RawFd, Arc<SelectionKey>>,
    /// Guards the interrupt pipe write; true once a wakeup is staged for
    /// the current cycle.
    interrupt_triggered: Mutex<bool>,
    closed: AtomicBool,
}

impl SelectorInner {
    pub(crate) fn stage_interest(&self, fd: RawFd, events: u8) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::ClosedSelector);
        }
        self.demux.set_interest(fd, events);
        Ok(())
    }

    pub(crate) fn enqueue_cancelled(&self, key: &Arc<SelectionKey>) {
        let mut cancelled = self.cancelled.lock().unwrap();
        if !cancelled.iter().any(|k| Arc::ptr_eq(k, key)) {
            cancelled.push(key.clone());
        }
    }

    fn wakeup(&self) {
        let mut triggered = self.interrupt_triggered.lock().unwrap();
        if !*triggered {
            let _ = self.demux.interrupt();
            *triggered = true;
        }
    }

    fn process_deregister_queue(&self, registered: &mut KeyMap, selected: &mut KeyMap) {
        let cancelled: Vec<Arc<SelectionKey>> =
            self.cancelled.lock().unwrap().drain(..).collect();
        for key in cancelled {
            self.deregister(&key, registered, selected);
        }
    }

    fn deregister(&self, key: &Arc<SelectionKey>, registered: &mut KeyMap, selected: &mut KeyMap) {
        debug_assert!(key.index.load(Ordering::SeqCst) >= 0);
        let fd = key.fd;
        self.fd_to_key.remove(&fd);
        self.demux.remove(fd);
        key.index.store(-1, Ordering::SeqCst);
        registered.remove(&fd);
        selected.remove(&fd);
        key.invalidate();
        if let Some(channel) = key.channel() {
            channel.core().remove_key(key);
            if !channel.is_open() && !channel.is_registered() {
                let _ = channel.kill();
            }
        }
    }

    /// Fold the demux's ready entries into the selected set. Returns the
    /// number of keys whose ready set actually changed.
    fn update_selected_keys(&self, ws: &WaitState, selected: &mut KeyMap) -> usize {
        let mut updated = 0;
        for i in 0..ws.updated {
            let fd = ws.event_fd(i);
            // The interrupt pipe carries no key.
            let key = match self.fd_to_key.get(&fd) {
                Some(guard) => guard.1.clone(),
                None => continue,
            };
            let Some(channel) = key.channel() else {
                continue;
            };
            let kernel = ws.event_bits(i);
            if selected.contains_key(&fd) {
                if channel.translate_ready(kernel, key.ready_ops(), &key) {
                    updated += 1;
                }
            } else {
                channel.translate_ready(kernel, Ops::empty(), &key);
                if key.ready_ops().intersects(key.interest()) {
                    selected.insert(fd, key.clone());
                    updated += 1;
                }
            }
        }
        updated
    }
}

impl Drop for SelectorInner {
    fn drop(&mut self) {
        self.demux.close();
    }
}

/// Wakes the selector when the selecting thread is interrupted. The
/// selector itself stays usable; only the wait is cut short.
struct SelectorWaker {
    inner: std::sync::Weak<SelectorInner>,
}

impl Interruptible for SelectorWaker {
    fn interrupt(&self, _target: &ThreadHandle) {
        if let Some(inner) = self.inner.upgrade() {
            inner.wakeup();
        }
    }
}

/// Cheap cloneable handle to one selector.
#[derive(Clone)]
pub struct Selector {
    inner: Arc<SelectorInner>,
}

impl Selector {
    pub fn open() -> Result<Selector> {
        Ok(Selector {
            inner: Arc::new(SelectorInner {
                demux: EventDemux::new()?,
                registered: Mutex::new(HashMap::new()),
                selected: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(Vec::new()),
                fd_to_key: Map::new(),
                interrupt_triggered: Mutex::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Register a channel, creating (or updating) the key binding it to
    /// this selector. The channel must be open and in non-blocking mode.
    pub fn register<C>(
        &self,
        channel: &Arc<C>,
        interest: Ops,
        attachment: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Arc<SelectionKey>>
    where
        C: SelectableChannel + 'static,
    {
        let channel: Arc<dyn SelectableChannel> = channel.clone();
        let inner = &self.inner;
        let core = channel.core();
        let _reg = core.reg_lock.lock().unwrap();
        if !self.is_open() {
            return Err(MuxError::ClosedSelector);
        }
        if !core.is_open() {
            return Err(MuxError::ClosedChannel);
        }
        if !interest.difference(channel.valid_ops()).is_empty() {
            return Err(MuxError::UnsupportedOps);
        }
        if core.is_blocking() {
            return Err(MuxError::IllegalBlockingMode);
        }

        if let Some(existing) = core.find_key(inner) {
            existing.set_interest_ops(interest)?;
            existing.attach(attachment);
            return Ok(existing);
        }

        let fd = channel.fd_val();
        let key = Arc::new(SelectionKey::new(
            Arc::downgrade(inner),
            Arc::downgrade(&channel),
            fd,
        ));
        key.attach(attachment);
        {
            let mut registered = inner.registered.lock().unwrap();
            if !self.is_open() {
                return Err(MuxError::ClosedSelector);
            }
            inner.demux.add(fd);
            registered.insert(fd, key.clone());
            inner.fd_to_key.insert(fd, key.clone());
        }
        core.add_key(key.clone());
        key.set_interest_ops(interest)?;
        Ok(key)
    }

    /// Wait for ready operations. A timeout of 0 blocks indefinitely; any
    /// positive value is a ceiling in milliseconds. Returns the number of
    /// keys whose ready set changed.
    pub fn select(&self, timeout_ms: u64) -> Result<usize> {
        let timeout = if timeout_ms == 0 {
            -1
        } else {
            timeout_ms.min(i32::MAX as u64) as i32
        };
        self.lock_and_do_select(timeout)
    }

    /// Non-blocking poll of ready operations.
    pub fn select_now(&self) -> Result<usize> {
        self.lock_and_do_select(0)
    }

    fn lock_and_do_select(&self, timeout: i32) -> Result<usize> {
        let inner = &self.inner;
        let mut ws = inner.demux.wait.lock().unwrap();
        if !self.is_open() {
            return Err(MuxError::ClosedSelector);
        }
        let mut registered = inner.registered.lock().unwrap();
        let mut selected = inner.selected.lock().unwrap();
        self.do_select(&mut ws, &mut registered, &mut selected, timeout)
    }

    fn do_select(
        &self,
        ws: &mut WaitState,
        registered: &mut KeyMap,
        selected: &mut KeyMap,
        timeout: i32,
    ) -> Result<usize> {
        let inner = &self.inner;
        inner.process_deregister_queue(registered, selected);
        {
            // Interruption of the selecting thread only wakes the wait.
            let waker: Arc<dyn Interruptible> = Arc::new(SelectorWaker {
                inner: Arc::downgrade(inner),
            });
            let _blocked = BlockGuard::install(waker.clone());
            let me = interrupt::current();
            if me.is_interrupted() {
                waker.interrupt(&me);
            }
            inner.demux.poll(ws, timeout)?;
        }
        let updated = inner.update_selected_keys(ws, selected);
        inner.process_deregister_queue(registered, selected);
        if ws.interrupted {
            ws.clear_event(ws.interrupted_index);
            let mut triggered = inner.interrupt_triggered.lock().unwrap();
            ws.interrupted = false;
            inner.demux.drain_interrupt();
            *triggered = false;
        }
        Ok(updated)
    }

    /// Force an in-progress (or the next) `select` to return promptly.
    /// Idempotent within one select cycle.
    pub fn wakeup(&self) {
        self.inner.wakeup();
    }

    /// The key binding `channel` to this selector, if one exists.
    pub fn key_for<C>(&self, channel: &Arc<C>) -> Option<Arc<SelectionKey>>
    where
        C: SelectableChannel + 'static,
    {
        channel.core().find_key(&self.inner)
    }

    /// Snapshot of the registered keys.
    pub fn keys(&self) -> Vec<Arc<SelectionKey>> {
        self.inner.registered.lock().unwrap().values().cloned().collect()
    }

    /// Handle to the ready set. Keys can be read and removed through it,
    /// never inserted.
    pub fn selected_keys(&self) -> SelectedKeys {
        SelectedKeys {
            inner: self.inner.clone(),
        }
    }

    /// Close the selector: wake a blocked select, deregister every key, and
    /// release the kernel resources. Channels that are closed and no longer
    /// registered anywhere are killed.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.wakeup();
        let _ws = inner.demux.wait.lock().unwrap();
        let mut registered = inner.registered.lock().unwrap();
        let mut selected = inner.selected.lock().unwrap();
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Block any further pipe writes.
        *inner.interrupt_triggered.lock().unwrap() = true;

        let keys: Vec<Arc<SelectionKey>> = registered.values().cloned().collect();
        for key in keys {
            key.invalidate();
            inner.deregister(&key, &mut registered, &mut selected);
        }
        inner.cancelled.lock().unwrap().clear();
        inner.demux.close();
        Ok(())
    }
}

/// Removal-only view of a selector's ready set.
pub struct SelectedKeys {
    inner: Arc<SelectorInner>,
}

impl SelectedKeys {
    pub fn len(&self) -> usize {
        self.inner.selected.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<SelectionKey>> {
        self.inner.selected.lock().unwrap().values().cloned().collect()
    }

    pub fn contains(&self, key: &Arc<SelectionKey>) -> bool {
        self.inner
            .selected
            .lock()
            .unwrap()
            .get(&key.fd)
            .map(|k| Arc::ptr_eq(k, key))
            .unwrap_or(false)
    }

    pub fn remove(&self, key: &Arc<SelectionKey>) -> bool {
        let mut selected = self.inner.selected.lock().unwrap();
        match selected.get(&key.fd) {
            Some(k) if Arc::ptr_eq(k, key) => {
                selected.remove(&key.fd);
                true
            }
            _ => false,
        }
    }

    /// Remove and return every ready key.
    pub fn drain(&self) -> Vec<Arc<SelectionKey>> {
        self.inner
            .selected
            .lock()
            .unwrap()
            .drain()
            .map(|(_, k)| k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pipe::Pipe;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_readiness_on_registered_pipe() {
        let selector = Selector::open().unwrap();
        let (source, sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();
        let key = selector.register(&source, Ops::READ, None).unwrap();

        let writer = thread::spawn(move || {
            sink.write(b"x").unwrap();
        });

        let n = selector.select(1000).unwrap();
        writer.join().unwrap();
        assert_eq!(n, 1);
        let ready = selector.selected_keys().snapshot();
        assert_eq!(ready.len(), 1);
        assert!(Arc::ptr_eq(&ready[0], &key));
        assert!(ready[0].ready_ops().contains(Ops::READ));
    }

    #[test]
    fn test_accept_readiness_on_server_socket() {
        use crate::channel::tcp::{ServerSocketChannel, SocketChannel};

        let selector = Selector::open().unwrap();
        let server = ServerSocketChannel::open().unwrap();
        server.bind("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let addr = server.local_addr().unwrap();
        server.configure_blocking(false).unwrap();
        let key = selector.register(&server, Ops::ACCEPT, None).unwrap();

        let connector = thread::spawn(move || {
            let client = SocketChannel::open().unwrap();
            client.connect(addr).unwrap();
            client
        });

        let n = selector.select(2000).unwrap();
        assert_eq!(n, 1);
        assert!(key.ready_ops().contains(Ops::ACCEPT));
        let accepted = server.accept().unwrap();
        assert!(accepted.is_some());
        let _client = connector.join().unwrap();
    }

    #[test]
    fn test_write_readiness_on_pipe_sink() {
        let selector = Selector::open().unwrap();
        let (_source, sink) = Pipe::new().unwrap();
        sink.configure_blocking(false).unwrap();
        let key = selector.register(&sink, Ops::WRITE, None).unwrap();

        // An empty pipe is immediately writable.
        let n = selector.select(1000).unwrap();
        assert_eq!(n, 1);
        assert!(key.ready_ops().contains(Ops::WRITE));
    }

    #[test]
    fn test_wakeup_from_other_thread_returns_promptly() {
        let selector = Selector::open().unwrap();
        let (source, _sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();
        selector.register(&source, Ops::READ, None).unwrap();

        let other = selector.clone();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            other.wakeup();
        });

        let start = Instant::now();
        let n = selector.select(10_000).unwrap();
        waker.join().unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_millis(2000));
    }

    #[test]
    fn test_wakeup_before_select_is_latched() {
        let selector = Selector::open().unwrap();
        selector.wakeup();
        let start = Instant::now();
        let n = selector.select(10_000).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn test_wakeup_is_idempotent_within_cycle() {
        let selector = Selector::open().unwrap();
        for _ in 0..5 {
            selector.wakeup();
        }
        selector.select(10_000).unwrap();
        // All five wakeups collapsed into the cycle above; this select must
        // actually wait out its timeout.
        let start = Instant::now();
        let n = selector.select(60).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_select_now_never_blocks() {
        let selector = Selector::open().unwrap();
        let start = Instant::now();
        let n = selector.select_now().unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_interrupt_wakes_select_and_preserves_status() {
        let selector = Selector::open().unwrap();
        let (source, _sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();
        selector.register(&source, Ops::READ, None).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let sel = selector.clone();
        let src = source.clone();
        let selecting = thread::spawn(move || {
            tx.send(interrupt::current()).unwrap();
            let n = sel.select(10_000).unwrap();
            (n, src.is_open(), interrupt::current().is_interrupted())
        });

        let handle = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        handle.interrupt();

        let (n, channel_open, status) = selecting.join().unwrap();
        assert_eq!(n, 0);
        // The interrupt only wakes the selector; the channel is untouched
        // and the thread keeps its interrupt status.
        assert!(channel_open);
        assert!(status);
    }

    #[test]
    fn test_register_twice_updates_existing_key() {
        let selector = Selector::open().unwrap();
        let (source, _sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();

        let marker: Arc<dyn std::any::Any + Send + Sync> = Arc::new(7usize);
        let k1 = selector.register(&source, Ops::READ, None).unwrap();
        let k2 = selector
            .register(&source, Ops::READ, Some(marker))
            .unwrap();
        assert!(Arc::ptr_eq(&k1, &k2));
        assert_eq!(selector.keys().len(), 1);
        let att = k2.attachment().unwrap();
        assert_eq!(*att.downcast_ref::<usize>().unwrap(), 7);
    }

    #[test]
    fn test_key_for_roundtrip() {
        let selector = Selector::open().unwrap();
        let (source, _sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();
        assert!(selector.key_for(&source).is_none());

        let marker: Arc<dyn std::any::Any + Send + Sync> = Arc::new("tag");
        let key = selector
            .register(&source, Ops::READ, Some(marker))
            .unwrap();
        let found = selector.key_for(&source).unwrap();
        assert!(Arc::ptr_eq(&key, &found));
        assert_eq!(found.interest_ops().unwrap(), Ops::READ);
        assert_eq!(
            *found.attachment().unwrap().downcast_ref::<&str>().unwrap(),
            "tag"
        );
    }

    #[test]
    fn test_register_blocking_channel_fails() {
        let selector = Selector::open().unwrap();
        let (source, _sink) = Pipe::new().unwrap();
        let err = selector.register(&source, Ops::READ, None).unwrap_err();
        assert!(matches!(err, MuxError::IllegalBlockingMode));
    }

    #[test]
    fn test_register_unsupported_ops_fails() {
        let selector = Selector::open().unwrap();
        let (source, _sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();
        let err = selector.register(&source, Ops::WRITE, None).unwrap_err();
        assert!(matches!(err, MuxError::UnsupportedOps));
    }

    #[test]
    fn test_cancelled_key_removed_next_cycle() {
        let selector = Selector::open().unwrap();
        let (source, _sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();
        let key = selector.register(&source, Ops::READ, None).unwrap();

        key.cancel();
        assert!(!key.is_valid());
        // Still present until the next cycle processes the cancelled set.
        assert_eq!(selector.keys().len(), 1);
        selector.select_now().unwrap();
        assert_eq!(selector.keys().len(), 0);
        assert!(!source.is_registered());
    }

    #[test]
    fn test_close_deregisters_and_kills_closed_channels() {
        let selector = Selector::open().unwrap();
        let (source, _sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();
        let key = selector.register(&source, Ops::READ, None).unwrap();

        source.close().unwrap();
        selector.close().unwrap();
        assert!(!selector.is_open());
        assert!(!key.is_valid());
        assert!(selector.keys().is_empty());
        assert!(matches!(
            selector.select_now().unwrap_err(),
            MuxError::ClosedSelector
        ));
    }

    #[test]
    fn test_registered_superset_of_ready() {
        let selector = Selector::open().unwrap();
        let (source, sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();
        selector.register(&source, Ops::READ, None).unwrap();
        sink.write(b"y").unwrap();
        selector.select(1000).unwrap();

        let registered = selector.keys();
        for ready in selector.selected_keys().snapshot() {
            assert!(registered.iter().any(|k| Arc::ptr_eq(k, &ready)));
        }
    }

    #[test]
    fn test_ready_bits_accumulate_while_selected() {
        let selector = Selector::open().unwrap();
        let (source, sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();
        let key = selector.register(&source, Ops::READ, None).unwrap();
        sink.write(b"z").unwrap();

        assert_eq!(selector.select(1000).unwrap(), 1);
        // Key already ready with READ; a second cycle reports no change.
        assert_eq!(selector.select(50).unwrap(), 0);
        assert!(key.ready_ops().contains(Ops::READ));
        assert_eq!(selector.selected_keys().len(), 1);
    }
}
