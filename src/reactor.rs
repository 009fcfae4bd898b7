//! Selector-driven dispatch loop.
//!
//! The reactor repeatedly selects and hands every ready key to the worker
//! pool, invoking the `EventHandler` attached to the key at registration.
//! `run` occupies the calling thread until `shutdown` clears the running
//! flag and wakes the selector.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::SelectableChannel;
use crate::error::Result;
use crate::event::{Ops, ReadyEvent};
use crate::handler::{EventHandler, LogLevel, Logger};
use crate::key::SelectionKey;
use crate::selector::Selector;
use crate::thread_pool::ThreadPool;

pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 150;

/// Key attachment carrying the registered handler.
struct HandlerAttachment {
    handler: Arc<dyn EventHandler>,
}

pub struct Reactor {
    selector: Selector,
    pool: ThreadPool,
    running: AtomicBool,
    poll_timeout_ms: u64,
    logger: Arc<dyn Logger>,
}

impl Reactor {
    pub fn new(workers: usize, poll_timeout_ms: u64, logger: Arc<dyn Logger>) -> Result<Reactor> {
        Ok(Reactor {
            selector: Selector::open()?,
            pool: ThreadPool::fixed(workers),
            running: AtomicBool::new(false),
            poll_timeout_ms,
            logger,
        })
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Register a channel and attach its handler.
    pub fn register<C, H>(
        &self,
        channel: &Arc<C>,
        interest: Ops,
        handler: H,
    ) -> Result<Arc<SelectionKey>>
    where
        C: SelectableChannel + 'static,
        H: EventHandler + 'static,
    {
        let attachment: Arc<dyn Any + Send + Sync> = Arc::new(HandlerAttachment {
            handler: Arc::new(handler),
        });
        self.selector.register(channel, interest, Some(attachment))
    }

    /// Cancel a registration; it is fully removed at the next cycle.
    pub fn deregister(&self, key: &Arc<SelectionKey>) {
        key.cancel();
        self.selector.wakeup();
    }

    /// Run the select/dispatch loop on the calling thread until `shutdown`.
    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) {
            self.selector.select(self.poll_timeout_ms)?;
            for key in self.selector.selected_keys().drain() {
                self.dispatch(&key);
            }
        }
        Ok(())
    }

    fn dispatch(&self, key: &Arc<SelectionKey>) {
        let ready = key.ready_ops();
        if ready.is_empty() {
            return;
        }
        let Some(attachment) = key.attachment() else {
            return;
        };
        let Some(entry) = attachment.downcast_ref::<HandlerAttachment>() else {
            return;
        };
        let handler = entry.handler.clone();
        let fd = key.fd();
        let submitted = self.pool.execute(move || {
            handler.handle_event(&ReadyEvent::new(fd, ready));
        });
        if let Err(e) = submitted {
            self.logger.log(
                LogLevel::Error,
                &format!("failed to dispatch ready fd {}: {}", fd, e),
            );
        }
    }

    /// Stop the run loop and wake the selector so it notices promptly.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.selector.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pipe::Pipe;
    use crate::handler::NoOpLogger;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    struct CountingHandler {
        hits: Arc<AtomicUsize>,
    }

    impl EventHandler for CountingHandler {
        fn handle_event(&self, event: &ReadyEvent) {
            if event.is_readable() {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_dispatches_ready_channel_to_handler() {
        let reactor = Arc::new(Reactor::new(2, 50, Arc::new(NoOpLogger)).unwrap());
        let (source, sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let key = reactor
            .register(&source, Ops::READ, CountingHandler { hits: hits.clone() })
            .unwrap();

        let r = reactor.clone();
        let loop_thread = thread::spawn(move || r.run().unwrap());

        sink.write(b"!").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(hits.load(Ordering::SeqCst) >= 1);

        reactor.deregister(&key);
        reactor.shutdown();
        loop_thread.join().unwrap();
    }

    #[test]
    fn test_shutdown_stops_run_loop_promptly() {
        let reactor = Arc::new(Reactor::new(1, 5000, Arc::new(NoOpLogger)).unwrap());
        let r = reactor.clone();
        let loop_thread = thread::spawn(move || r.run().unwrap());

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        reactor.shutdown();
        loop_thread.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
