//! Readiness-based I/O multiplexer and bounded worker pool on Linux epoll.
//!
//! Two cores share one design concern, interruptibility of blocking
//! operations:
//!
//! - the selector stack ([`Selector`], [`SelectionKey`], the channel
//!   implementations in [`channel`]) multiplexes non-blocking channels over
//!   a single epoll instance, staying promptly wakeable from user space;
//! - the [`ThreadPool`] executes submitted tasks on a bounded set of
//!   workers whose lifecycle state and count live in one packed atomic
//!   word.
//!
//! [`EventLoop`] ties them together: ready channels found by the selector
//! are dispatched to handler callbacks on the pool.

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod interrupt;
pub mod key;
mod poll;
pub mod queue;
pub mod reactor;
pub mod selector;
pub mod thread_pool;
pub mod utils;

use std::sync::Arc;

pub use config::{
    AbortPolicy, CallerRunsPolicy, DiscardOldestPolicy, DiscardPolicy, LifecycleHooks, NoOpHooks,
    PoolConfig, RejectionPolicy,
};
pub use error::{MuxError, Result};
pub use event::{Ops, ReadyEvent};
pub use handler::{EventHandler, LogLevel, Logger, NoOpLogger};
pub use key::SelectionKey;
pub use queue::{BlockingQueue, Task, TaskQueue};
pub use selector::{SelectedKeys, Selector};
pub use thread_pool::ThreadPool;

use crate::channel::SelectableChannel;
use crate::reactor::{Reactor, DEFAULT_POLL_TIMEOUT_MS};
use crate::utils::default_parallelism;

/// Reactor facade: a selector plus a worker pool behind a register/run/stop
/// surface.
pub struct EventLoop {
    reactor: Reactor,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new(
            default_parallelism(),
            DEFAULT_POLL_TIMEOUT_MS,
            Arc::new(NoOpLogger),
        )
        .unwrap()
    }
}

impl EventLoop {
    pub fn new(
        workers: usize,
        poll_timeout_ms: u64,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        let reactor = Reactor::new(workers, poll_timeout_ms, logger)?;
        Ok(Self { reactor })
    }

    /// Register a non-blocking channel; `handler` runs on the pool whenever
    /// the channel reports ready operations.
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
        self.reactor.register(channel, interest, handler)
    }

    pub fn deregister(&self, key: &Arc<SelectionKey>) {
        self.reactor.deregister(key)
    }

    /// Run the dispatch loop on the calling thread until [`stop`].
    ///
    /// [`stop`]: EventLoop::stop
    pub fn run(&self) -> Result<()> {
        self.reactor.run()
    }

    pub fn stop(&self) {
        self.reactor.shutdown();
    }

    pub fn selector(&self) -> &Selector {
        self.reactor.selector()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pipe::Pipe;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    struct Echo {
        seen: Arc<AtomicUsize>,
    }

    impl EventHandler for Echo {
        fn handle_event(&self, event: &ReadyEvent) {
            if event.is_readable() {
                self.seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_event_loop_end_to_end() {
        let event_loop = Arc::new(EventLoop::default());
        let (source, sink) = Pipe::new().unwrap();
        source.configure_blocking(false).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        event_loop
            .register(&source, Ops::READ, Echo { seen: seen.clone() })
            .unwrap();

        let el = event_loop.clone();
        let loop_thread = thread::spawn(move || el.run().unwrap());

        sink.write(b"ready").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(seen.load(Ordering::SeqCst) >= 1);

        event_loop.stop();
        loop_thread.join().unwrap();
    }
}
