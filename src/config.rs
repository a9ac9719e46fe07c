use crate::common::*;

/// Dispatcher configuration.
///
/// The default is an unbounded queue with two submission attempts per task.
///
/// ```rust
/// use par_collect::{DispatcherConfig, OverflowPolicy};
///
/// // unbounded queue
/// let config: DispatcherConfig = None.into();
/// assert_eq!(config.queue_capacity, None);
///
/// // at most 64 pending tasks, submitters wait for room
/// let config: DispatcherConfig = 64.into();
/// assert_eq!(config.queue_capacity, Some(64));
/// assert_eq!(config.overflow, OverflowPolicy::Block);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum number of queued tasks, or `None` for an unbounded queue.
    pub queue_capacity: Option<usize>,
    /// What `submit` does when a bounded queue is full.
    pub overflow: OverflowPolicy,
    pub retry: RetryPolicy,
    /// Name of the consumer thread.
    pub thread_name: Option<String>,
}

impl DispatcherConfig {
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            overflow: OverflowPolicy::Block,
            retry: RetryPolicy::default(),
            thread_name: None,
        }
    }
}

impl From<Option<usize>> for DispatcherConfig {
    fn from(capacity: Option<usize>) -> Self {
        if let Some(capacity) = capacity {
            assert!(capacity > 0, "queue capacity must be positive");
        }

        Self {
            queue_capacity: capacity,
            ..Default::default()
        }
    }
}

impl From<usize> for DispatcherConfig {
    fn from(capacity: usize) -> Self {
        Some(capacity).into()
    }
}

impl From<(usize, OverflowPolicy)> for DispatcherConfig {
    fn from((capacity, overflow): (usize, OverflowPolicy)) -> Self {
        DispatcherConfig::from(capacity).overflow(overflow)
    }
}

impl From<RetryPolicy> for DispatcherConfig {
    fn from(retry: RetryPolicy) -> Self {
        DispatcherConfig::default().retry(retry)
    }
}

/// The behavior of a full bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// The submitter waits until the consumer makes room.
    Block,
    /// The submitted task fails immediately with [QueueFull](crate::TaskError::QueueFull).
    FailFast,
}

/// How many times a job is offered to a worker pool that rejects it.
///
/// Attempts after the first are separated by an exponential backoff that
/// starts with spinning and ends with yielding the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
}

impl RetryPolicy {
    pub fn attempts(max_attempts: usize) -> Self {
        assert!(max_attempts > 0, "at least one attempt is required");
        Self { max_attempts }
    }

    /// A single attempt, without retrying.
    pub fn none() -> Self {
        Self::attempts(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::attempts(2)
    }
}

/// Fixed thread pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub num_workers: Count,
    /// Number of jobs waiting for a free worker before the pool rejects.
    pub queue_size: Count,
}

impl From<Option<usize>> for PoolConfig {
    fn from(size: Option<usize>) -> Self {
        match size {
            Some(size) => PoolConfig {
                num_workers: Count::Absolute(size),
                queue_size: Count::Absolute(size),
            },
            None => PoolConfig {
                num_workers: Count::Auto,
                queue_size: Count::Auto,
            },
        }
    }
}

impl From<usize> for PoolConfig {
    fn from(size: usize) -> Self {
        PoolConfig {
            num_workers: Count::Absolute(size),
            queue_size: Count::Absolute(size),
        }
    }
}

impl From<f64> for PoolConfig {
    fn from(scale: f64) -> Self {
        PoolConfig {
            num_workers: Count::Scale(scale),
            queue_size: Count::Scale(scale),
        }
    }
}

impl From<(usize, usize)> for PoolConfig {
    fn from((num_workers, queue_size): (usize, usize)) -> Self {
        PoolConfig {
            num_workers: Count::Absolute(num_workers),
            queue_size: Count::Absolute(queue_size),
        }
    }
}

impl From<(f64, usize)> for PoolConfig {
    fn from((num_workers, queue_size): (f64, usize)) -> Self {
        PoolConfig {
            num_workers: Count::Scale(num_workers),
            queue_size: Count::Absolute(queue_size),
        }
    }
}

/// Sum type of absolute value and scaling value.
#[derive(Debug, Clone)]
pub enum Count {
    Auto,
    Absolute(usize),
    Scale(f64),
}

impl Count {
    pub fn to_absolute(&self) -> usize {
        match *self {
            Self::Auto => num_cpus::get(),
            Self::Absolute(val) => {
                assert!(val > 0, "absolute value must be positive");
                val
            }
            Self::Scale(scale) => {
                assert!(
                    scale.is_finite() && scale.is_sign_positive(),
                    "scaling value must be positive finite"
                );
                (num_cpus::get() as f64 * scale).ceil() as usize
            }
        }
    }
}

/// Fixed thread pool parameters, resolved from a [PoolConfig].
#[derive(Debug, Clone)]
pub struct PoolParams {
    pub(crate) num_workers: usize,
    pub(crate) queue_size: usize,
}

impl From<PoolConfig> for PoolParams {
    fn from(from: PoolConfig) -> Self {
        let PoolConfig {
            num_workers,
            queue_size,
        } = from;

        let num_workers = num_workers.to_absolute();
        let queue_size = queue_size.to_absolute();

        Self {
            num_workers,
            queue_size,
        }
    }
}

pub trait IntoPoolParams {
    fn into_pool_params(self) -> PoolParams;
}

impl<T> IntoPoolParams for T
where
    PoolConfig: From<T>,
{
    fn into_pool_params(self) -> PoolParams {
        let config: PoolConfig = self.into();
        config.into()
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::FailFast => write!(f, "fail-fast"),
        }
    }
}
