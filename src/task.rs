use crate::{
    common::*,
    error::{panic_message, TaskError},
    handle::Completer,
};

/// Reasons a job is resolved without running its transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refusal {
    Rejected { attempts: usize },
    QueueFull,
    Abandoned,
}

impl<E> From<Refusal> for TaskError<E> {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::Rejected { attempts } => TaskError::Rejected { attempts },
            Refusal::QueueFull => TaskError::QueueFull,
            Refusal::Abandoned => TaskError::Abandoned,
        }
    }
}

trait Runnable: Send {
    fn run(self: Box<Self>);

    fn refuse(self: Box<Self>, refusal: Refusal);
}

struct TaskBody<F, T, E> {
    f: F,
    completer: Completer<T, E>,
}

impl<F, T, E> Runnable for TaskBody<F, T, E>
where
    F: 'static + Send + FnOnce(&CancellationToken) -> Result<T, E>,
    T: 'static + Send,
    E: 'static + Send,
{
    fn run(self: Box<Self>) {
        let TaskBody { f, completer } = *self;

        if completer.is_cancelled() {
            trace!("skipping a cancelled task");
            completer.resolve(Err(TaskError::Cancelled));
            return;
        }

        let token = completer.token().clone();
        let result = match panic::catch_unwind(AssertUnwindSafe(move || f(&token))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TaskError::Failed(err)),
            Err(payload) => {
                let msg = panic_message(&*payload);
                debug!("transform panicked: {}", msg);
                Err(TaskError::Panicked(msg))
            }
        };

        completer.resolve(result);
    }

    fn refuse(self: Box<Self>, refusal: Refusal) {
        self.completer.resolve(Err(refusal.into()));
    }
}

/// A unit of work handed to a [WorkerPool](crate::pool::WorkerPool).
///
/// Running the job applies the transform to its element and resolves the
/// corresponding [CompletionHandle](crate::CompletionHandle). Errors and
/// panics of the transform are captured into the handle, so `run()` never
/// panics. Dropping the job without running it fails the handle with
/// [Abandoned](TaskError::Abandoned).
#[must_use = "dropping a job abandons its task"]
pub struct Job {
    task: Box<dyn Runnable>,
}

impl Job {
    pub(crate) fn new<F, T, E>(f: F, completer: Completer<T, E>) -> Self
    where
        F: 'static + Send + FnOnce(&CancellationToken) -> Result<T, E>,
        T: 'static + Send,
        E: 'static + Send,
    {
        Self {
            task: Box::new(TaskBody { f, completer }),
        }
    }

    pub fn run(self) {
        self.task.run()
    }

    pub(crate) fn refuse(self, refusal: Refusal) {
        self.task.refuse(refusal)
    }
}

impl Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").finish_non_exhaustive()
    }
}
