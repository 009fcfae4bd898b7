//! Blocking task queue.
//!
//! The worker pool consumes its queue through the [`TaskQueue`] capability
//! so alternative implementations can be dropped in. The provided
//! [`BlockingQueue`] is a mutex-and-condvar queue, bounded or unbounded,
//! whose blocking `take`/`poll` observe thread interruption: a waiting
//! thread installs a hook that pulses the condvars, so
//! [`ThreadHandle::interrupt`](crate::interrupt::ThreadHandle::interrupt)
//! wakes it and the wait returns `Interrupted` with the status cleared.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{MuxError, Result};
use crate::interrupt::{self, BlockGuard, Interruptible, ThreadHandle};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identity of a queued task: the data pointer of its boxed closure.
/// Captured before the task is moved into the queue.
pub(crate) fn task_token(task: &Task) -> usize {
    &**task as *const _ as *const () as usize
}

/// Queue capability consumed by the worker pool.
pub trait TaskQueue: Send + Sync {
    /// Enqueue without blocking; gives the task back when full.
    fn offer(&self, task: Task) -> std::result::Result<(), Task>;

    /// Block until a task is available. Fails with `Interrupted` when the
    /// waiting thread is interrupted, clearing its interrupt status.
    fn take(&self) -> Result<Task>;

    /// Block up to `timeout` for a task; `Ok(None)` on timeout.
    fn poll(&self, timeout: Duration) -> Result<Option<Task>>;

    /// Dequeue without blocking.
    fn poll_now(&self) -> Option<Task>;

    /// Remove and return the queued task with the given identity token.
    fn remove(&self, token: usize) -> Option<Task>;

    /// Remove and return every queued task.
    fn drain(&self) -> Vec<Task>;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;
}

struct QueueInner {
    tasks: Mutex<VecDeque<Task>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

/// Pulses both condvars so an interrupted waiter re-checks its status. The
/// queue mutex is taken first, which closes the window between a waiter's
/// status check and its wait.
struct QueueWaker {
    inner: Weak<QueueInner>,
}

impl Interruptible for QueueWaker {
    fn interrupt(&self, _target: &ThreadHandle) {
        if let Some(inner) = self.inner.upgrade() {
            let _guard = inner.tasks.lock().unwrap();
            inner.not_empty.notify_all();
            inner.not_full.notify_all();
        }
    }
}

pub struct BlockingQueue {
    inner: Arc<QueueInner>,
}

impl BlockingQueue {
    pub fn bounded(capacity: usize) -> BlockingQueue {
        BlockingQueue::with_capacity(Some(capacity))
    }

    pub fn unbounded() -> BlockingQueue {
        BlockingQueue::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> BlockingQueue {
        BlockingQueue {
            inner: Arc::new(QueueInner {
                tasks: Mutex::new(VecDeque::new()),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
            }),
        }
    }

    fn waker(&self) -> Arc<dyn Interruptible> {
        Arc::new(QueueWaker {
            inner: Arc::downgrade(&self.inner),
        })
    }
}

impl TaskQueue for BlockingQueue {
    fn offer(&self, task: Task) -> std::result::Result<(), Task> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        if let Some(cap) = self.inner.capacity {
            if tasks.len() >= cap {
                return Err(task);
            }
        }
        tasks.push_back(task);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    fn take(&self) -> Result<Task> {
        let me = interrupt::current();
        let _blocked = BlockGuard::install(self.waker());
        let mut tasks = self.inner.tasks.lock().unwrap();
        loop {
            if me.take_interrupted() {
                return Err(MuxError::Interrupted);
            }
            if let Some(task) = tasks.pop_front() {
                self.inner.not_full.notify_one();
                return Ok(task);
            }
            tasks = self.inner.not_empty.wait(tasks).unwrap();
        }
    }

    fn poll(&self, timeout: Duration) -> Result<Option<Task>> {
        let me = interrupt::current();
        let _blocked = BlockGuard::install(self.waker());
        let deadline = Instant::now() + timeout;
        let mut tasks = self.inner.tasks.lock().unwrap();
        loop {
            if me.take_interrupted() {
                return Err(MuxError::Interrupted);
            }
            if let Some(task) = tasks.pop_front() {
                self.inner.not_full.notify_one();
                return Ok(Some(task));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _timed_out) = self
                .inner
                .not_empty
                .wait_timeout(tasks, deadline - now)
                .unwrap();
            tasks = guard;
        }
    }

    fn poll_now(&self) -> Option<Task> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let task = tasks.pop_front();
        if task.is_some() {
            self.inner.not_full.notify_one();
        }
        task
    }

    fn remove(&self, token: usize) -> Option<Task> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let pos = tasks.iter().position(|t| task_token(t) == token)?;
        let task = tasks.remove(pos);
        if task.is_some() {
            self.inner.not_full.notify_one();
        }
        task
    }

    fn drain(&self) -> Vec<Task> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let drained: Vec<Task> = tasks.drain(..).collect();
        if !drained.is_empty() {
            self.inner.not_full.notify_all();
        }
        drained
    }

    fn is_empty(&self) -> bool {
        self.inner.tasks.lock().unwrap().is_empty()
    }

    fn len(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }
}
