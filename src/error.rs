use derivative::Derivative;
use std::any::Any;
use thiserror::Error;

/// The failure outcome of a single task.
///
/// `E` is the error type returned by the user transform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError<E> {
    /// The transform returned an error.
    #[error("transform failed: {0}")]
    Failed(E),
    /// The transform panicked.
    #[error("transform panicked: {0}")]
    Panicked(String),
    /// The worker pool refused the job on every attempt.
    #[error("worker pool rejected the task after {attempts} attempt(s)")]
    Rejected { attempts: usize },
    /// The task was cancelled because a sibling task failed.
    #[error("task was cancelled")]
    Cancelled,
    /// The task was submitted after the dispatcher was stopped.
    #[error("dispatcher is stopped")]
    Stopped,
    /// The bounded dispatch queue was full.
    #[error("dispatch queue is full")]
    QueueFull,
    /// The task was dropped before it could produce a result.
    #[error("task was abandoned before completion")]
    Abandoned,
    /// The dispatcher could not start its consumer thread.
    #[error("unable to spawn the dispatcher thread: {0}")]
    Spawn(String),
}

impl<E> TaskError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if the transform itself failed, either by error or by panic.
    pub fn is_transform_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Panicked(_))
    }

    /// Returns the transform error if there is one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn map_err<F, U>(self, f: F) -> TaskError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Self::Failed(err) => TaskError::Failed(f(err)),
            Self::Panicked(msg) => TaskError::Panicked(msg),
            Self::Rejected { attempts } => TaskError::Rejected { attempts },
            Self::Cancelled => TaskError::Cancelled,
            Self::Stopped => TaskError::Stopped,
            Self::QueueFull => TaskError::QueueFull,
            Self::Abandoned => TaskError::Abandoned,
            Self::Spawn(msg) => TaskError::Spawn(msg),
        }
    }
}

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Returned when two partial accumulators are merged.
///
/// Collection is sequential-submission only, so the merge step of a
/// split reduction always fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("combining partial accumulators is not supported")]
pub struct UnsupportedCombine;

/// Returned by a [WorkerPool](crate::pool::WorkerPool) that refuses a job.
///
/// The job is handed back so that it can be resubmitted.
#[derive(Derivative, Error)]
#[derivative(Debug(bound = ""))]
#[error("worker pool rejected the job")]
pub struct Rejected<J>(#[derivative(Debug = "ignore")] pub J);

impl<J> Rejected<J> {
    pub fn into_inner(self) -> J {
        self.0
    }
}
