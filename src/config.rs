//! Worker pool configuration.
//!
//! Sizing, keep-alive, the rejection policy, and the lifecycle hooks are
//! all fixed at construction. Use `PoolConfig::builder()` for ergonomic
//! construction; unset fields fall back to the defaults.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{MuxError, Result};
use crate::queue::Task;
use crate::thread_pool::ThreadPool;
use crate::utils::default_parallelism;

/// Configuration for a [`ThreadPool`].
#[derive(Clone)]
pub struct PoolConfig {
    /// Workers kept alive even when idle (unless `allow_core_timeout`).
    pub core_size: usize,
    /// Hard ceiling on live workers.
    pub max_size: usize,
    /// Idle time after which workers beyond the core are retired.
    pub keep_alive: Duration,
    /// Apply the keep-alive timeout to core workers as well.
    pub allow_core_timeout: bool,
    /// Worker thread name prefix; the worker id is appended.
    pub name_prefix: String,
    /// Policy invoked when a task cannot be accepted.
    pub policy: Arc<dyn RejectionPolicy>,
    /// Callbacks around task execution and pool termination.
    pub hooks: Arc<dyn LifecycleHooks>,
}

impl PoolConfig {
    /// Create a new builder for PoolConfig.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = default_parallelism();
        Self {
            core_size: cores,
            max_size: cores,
            keep_alive: Duration::from_secs(60),
            allow_core_timeout: false,
            name_prefix: "pool-worker-".to_string(),
            policy: Arc::new(AbortPolicy),
            hooks: Arc::new(NoOpHooks),
        }
    }
}

/// Builder for PoolConfig. Unset fields use the defaults from
/// `PoolConfig::default()`.
pub struct PoolConfigBuilder {
    core_size: Option<usize>,
    max_size: Option<usize>,
    keep_alive: Option<Duration>,
    allow_core_timeout: Option<bool>,
    name_prefix: Option<String>,
    policy: Option<Arc<dyn RejectionPolicy>>,
    hooks: Option<Arc<dyn LifecycleHooks>>,
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self {
            core_size: None,
            max_size: None,
            keep_alive: None,
            allow_core_timeout: None,
            name_prefix: None,
            policy: None,
            hooks: None,
        }
    }

    /// Set the number of core workers.
    pub fn core_size(mut self, size: usize) -> Self {
        self.core_size = Some(size);
        self
    }

    /// Set the maximum number of workers.
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = Some(size);
        self
    }

    /// Set the idle keep-alive for non-core workers.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Let core workers time out when idle.
    pub fn allow_core_timeout(mut self, allow: bool) -> Self {
        self.allow_core_timeout = Some(allow);
        self
    }

    /// Set the worker thread name prefix.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Set the rejection policy.
    pub fn policy(mut self, policy: Arc<dyn RejectionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the lifecycle hooks.
    pub fn hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Build the PoolConfig.
    pub fn build(self) -> PoolConfig {
        let default = PoolConfig::default();
        let core_size = self.core_size.unwrap_or(default.core_size);
        PoolConfig {
            core_size,
            max_size: self.max_size.unwrap_or_else(|| core_size.max(default.max_size)),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            allow_core_timeout: self.allow_core_timeout.unwrap_or(default.allow_core_timeout),
            name_prefix: self.name_prefix.unwrap_or(default.name_prefix),
            policy: self.policy.unwrap_or(default.policy),
            hooks: self.hooks.unwrap_or(default.hooks),
        }
    }
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides what happens to a task the pool cannot accept.
///
/// Invoked on the submitting thread. The policy may surface an error,
/// absorb the task, run it in place, or make room and resubmit.
pub trait RejectionPolicy: Send + Sync {
    fn rejected(&self, task: Task, pool: &ThreadPool) -> Result<()>;
}

/// Fail the submission.
#[derive(Default, Clone)]
pub struct AbortPolicy;

impl RejectionPolicy for AbortPolicy {
    fn rejected(&self, _task: Task, _pool: &ThreadPool) -> Result<()> {
        Err(MuxError::Rejected("pool saturated or shut down".to_string()))
    }
}

/// Run the task on the submitting thread, unless the pool is shut down.
#[derive(Default, Clone)]
pub struct CallerRunsPolicy;

impl RejectionPolicy for CallerRunsPolicy {
    fn rejected(&self, task: Task, pool: &ThreadPool) -> Result<()> {
        if !pool.is_shutdown() {
            task();
        }
        Ok(())
    }
}

/// Silently drop the task.
#[derive(Default, Clone)]
pub struct DiscardPolicy;

impl RejectionPolicy for DiscardPolicy {
    fn rejected(&self, _task: Task, _pool: &ThreadPool) -> Result<()> {
        Ok(())
    }
}

/// Drop the oldest queued task and retry the submission.
#[derive(Default, Clone)]
pub struct DiscardOldestPolicy;

impl RejectionPolicy for DiscardOldestPolicy {
    fn rejected(&self, task: Task, pool: &ThreadPool) -> Result<()> {
        if !pool.is_shutdown() {
            pool.queue().poll_now();
            pool.execute_task(task)?;
        }
        Ok(())
    }
}

/// Callbacks around worker execution and pool termination.
///
/// All methods default to no-ops. Implementations run on worker threads
/// (or, for `terminated`, on whichever thread completes termination) and
/// should be quick.
pub trait LifecycleHooks: Send + Sync {
    /// Runs on the worker immediately before each task.
    fn before_execute(&self) {}

    /// Runs on the worker after each task; `panicked` is true if the task
    /// unwound.
    fn after_execute(&self, panicked: bool) {
        let _ = panicked;
    }

    /// Runs once when the pool transitions to the terminated state.
    fn terminated(&self) {}
}

/// Default hooks that do nothing.
#[derive(Default, Clone)]
pub struct NoOpHooks;

impl LifecycleHooks for NoOpHooks {}
