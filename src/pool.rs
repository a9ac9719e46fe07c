//! Worker pools that execute dispatched jobs.

use crate::{
    common::*,
    config::{IntoPoolParams, PoolParams},
    error::Rejected,
    task::Job,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::Handle;

/// An executor of [jobs](Job).
///
/// The pool belongs to the caller. A [Dispatcher](crate::Dispatcher) only
/// submits jobs to it and never starts or stops its workers.
///
/// A saturated pool may refuse a job by returning it in [Rejected], in which
/// case the dispatcher may offer it again later.
pub trait WorkerPool
where
    Self: 'static + Send + Sync,
{
    fn execute(&self, job: Job) -> Result<(), Rejected<Job>>;
}

impl<P> WorkerPool for Arc<P>
where
    P: ?Sized + WorkerPool,
{
    fn execute(&self, job: Job) -> Result<(), Rejected<Job>> {
        (**self).execute(job)
    }
}

impl WorkerPool for Box<dyn WorkerPool> {
    fn execute(&self, job: Job) -> Result<(), Rejected<Job>> {
        (**self).execute(job)
    }
}

/// Spawns one thread per job.
///
/// This is the default pool. Concurrency is unbounded: every dispatched job
/// gets its own thread, which exits when the job finishes. A job is rejected
/// only if the operating system refuses to create a thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadPerTask {
    name: Option<String>,
}

impl ThreadPerTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the spawned worker threads.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl WorkerPool for ThreadPerTask {
    fn execute(&self, job: Job) -> Result<(), Rejected<Job>> {
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }

        // the closure is lost if spawning fails, so keep the job reachable
        let slot = Arc::new(Mutex::new(Some(job)));
        let worker_slot = slot.clone();

        let result = builder.spawn(move || {
            let job = worker_slot.lock().take();
            if let Some(job) = job {
                job.run();
            }
        });

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!("unable to spawn a worker thread: {}", err);
                match slot.lock().take() {
                    Some(job) => Err(Rejected(job)),
                    None => Ok(()),
                }
            }
        }
    }
}

/// A fixed number of worker threads fed by a bounded queue.
///
/// When all workers are busy and the queue is full, further jobs are
/// rejected.
///
/// Dropping the pool closes its queue without waiting. The workers finish the
/// queued jobs in the background and exit. Use [shutdown()](Self::shutdown)
/// to wait for them.
///
/// The queue holds `queue_size` jobs, one per processor unless configured.
/// A run that submits many slow jobs faster than the workers take them fails
/// with [Rejected](crate::TaskError::Rejected) once the dispatcher runs out of
/// attempts, so size the queue for the expected backlog.
///
/// ```rust
/// use par_collect::{Dispatcher, FixedThreadPool};
///
/// // 4 workers, at most 8 waiting jobs
/// let pool = FixedThreadPool::new((4, 8));
/// assert_eq!(pool.num_workers(), 4);
///
/// let dispatcher = Dispatcher::new(pool);
/// let handle = dispatcher.submit(|| Ok::<_, ()>(1 + 1));
/// dispatcher.stop();
/// assert_eq!(handle.wait(), Ok(2));
/// ```
#[derive(Derivative)]
#[derivative(Debug)]
pub struct FixedThreadPool {
    params: PoolParams,
    #[derivative(Debug = "ignore")]
    tx: Option<flume::Sender<Job>>,
    #[derivative(Debug = "ignore")]
    workers: Vec<thread::JoinHandle<()>>,
    #[derivative(Debug = "ignore")]
    busy: Arc<AtomicUsize>,
}

impl FixedThreadPool {
    /// Creates the pool and starts its workers.
    ///
    /// The `config` accepts the same forms as [PoolConfig](crate::PoolConfig):
    /// `None` for one worker per processor, `4` for four workers, `2.0` for
    /// twice the processors, or `(workers, queue_size)`.
    pub fn new<P>(config: P) -> Self
    where
        P: IntoPoolParams,
    {
        let params = config.into_pool_params();
        let (tx, rx) = flume::bounded::<Job>(params.queue_size);
        let busy = Arc::new(AtomicUsize::new(0));

        let workers = (0..params.num_workers)
            .filter_map(|index| {
                let rx = rx.clone();
                let busy = busy.clone();

                let result = thread::Builder::new()
                    .name(format!("par-collect-worker-{}", index))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            busy.fetch_add(1, Ordering::SeqCst);
                            job.run();
                            busy.fetch_sub(1, Ordering::SeqCst);
                        }
                    });

                match result {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        error!("unable to spawn worker {}: {}", index, err);
                        None
                    }
                }
            })
            .collect();

        Self {
            params,
            tx: Some(tx),
            workers,
            busy,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn queue_size(&self) -> usize {
        self.params.queue_size
    }

    /// Number of jobs currently running.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    /// Closes the queue and blocks until the workers have run every queued
    /// job and exited.
    pub fn shutdown(mut self) {
        self.tx = None;

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("a worker thread panicked");
            }
        }
    }
}

impl WorkerPool for FixedThreadPool {
    fn execute(&self, job: Job) -> Result<(), Rejected<Job>> {
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return Err(Rejected(job)),
        };

        tx.try_send(job).map_err(|err| Rejected(err.into_inner()))
    }
}

impl Drop for FixedThreadPool {
    fn drop(&mut self) {
        // closing the channel lets workers drain the queue and exit on their own
        self.tx = None;

        if !self.workers.is_empty() {
            trace!("detaching {} pool workers", self.workers.len());
            self.workers.clear();
        }
    }
}

/// Runs jobs on the blocking thread pool of a tokio runtime.
///
/// Tokio queues blocking tasks without limit, so this pool never rejects.
#[derive(Debug, Clone)]
pub struct TokioBlockingPool {
    handle: Handle,
}

impl TokioBlockingPool {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the current context.
    ///
    /// It returns `None` outside of a tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl WorkerPool for TokioBlockingPool {
    fn execute(&self, job: Job) -> Result<(), Rejected<Job>> {
        let _ = self.handle.spawn_blocking(move || job.run());
        Ok(())
    }
}
