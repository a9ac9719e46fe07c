use crate::{
    common::*,
    config::{DispatcherConfig, OverflowPolicy, RetryPolicy},
    error::{panic_message, Rejected, TaskError},
    handle::{completion, CompletionHandle},
    pool::{ThreadPerTask, WorkerPool},
    task::{Job, Refusal},
    utils,
};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::sync::Weak;

const DEFAULT_THREAD_NAME: &str = "par-collect-dispatcher";

/// The lifecycle of a [Dispatcher]. It only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherState {
    NotStarted,
    Running,
    /// The sentinel is queued and the consumer is draining the tasks ahead of it.
    Stopping,
    Stopped,
}

enum Entry {
    Task(Job),
    Sentinel,
}

struct Control {
    state: DispatcherState,
    // installed by start() and kept until the dispatcher is dropped
    tx: Option<flume::Sender<Entry>>,
    consumer: Option<thread::JoinHandle<()>>,
}

/// Serializes the submission of tasks to a worker pool.
///
/// Submitted tasks are queued and handed to the pool, in submission order,
/// by a dedicated consumer thread. The thread is started by the first
/// [submit()](Self::submit) and exits after [stop()](Self::stop) once every
/// task queued before the stop has been dispatched.
///
/// A dispatcher serves a single collection run. Once stopped, it resolves
/// further submissions with [Stopped](TaskError::Stopped).
///
/// ```rust
/// use par_collect::{Dispatcher, ThreadPerTask};
///
/// let dispatcher = Dispatcher::new(ThreadPerTask::new());
/// let handles: Vec<_> = (0..4)
///     .map(|value| dispatcher.submit(move || Ok::<_, ()>(value * 2)))
///     .collect();
/// dispatcher.stop();
///
/// let values: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
/// assert_eq!(values, [0, 2, 4, 6]);
/// ```
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Dispatcher<P = ThreadPerTask>
where
    P: WorkerPool,
{
    #[derivative(Debug = "ignore")]
    pool: Arc<P>,
    config: DispatcherConfig,
    #[derivative(Debug = "ignore")]
    control: Arc<Mutex<Control>>,
}

impl Default for Dispatcher<ThreadPerTask> {
    fn default() -> Self {
        Self::new(ThreadPerTask::new())
    }
}

impl<P> Dispatcher<P>
where
    P: WorkerPool,
{
    pub fn new(pool: P) -> Self {
        Self::with_config(pool, DispatcherConfig::default())
    }

    pub fn with_config<C>(pool: P, config: C) -> Self
    where
        C: Into<DispatcherConfig>,
    {
        Self {
            pool: Arc::new(pool),
            config: config.into(),
            control: Arc::new(Mutex::new(Control {
                state: DispatcherState::NotStarted,
                tx: None,
                consumer: None,
            })),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Queues a task and returns the handle of its result.
    ///
    /// The consumer thread is started if it is not running yet. With an
    /// unbounded queue this never blocks.
    pub fn submit<T, E, F>(&self, f: F) -> CompletionHandle<T, E>
    where
        F: 'static + Send + FnOnce() -> Result<T, E>,
        T: 'static + Send,
        E: 'static + Send,
    {
        self.submit_with_token(move |_| f())
    }

    /// Like [submit()](Self::submit), but the task receives its cancellation
    /// token so that a long running transform can stop early.
    pub fn submit_with_token<T, E, F>(&self, f: F) -> CompletionHandle<T, E>
    where
        F: 'static + Send + FnOnce(&CancellationToken) -> Result<T, E>,
        T: 'static + Send,
        E: 'static + Send,
    {
        let (completer, handle) = completion();
        let mut control = self.control.lock();

        if control.state == DispatcherState::NotStarted {
            if let Err(err) = self.start(&mut control) {
                error!("unable to start the dispatcher: {}", err);
                control.state = DispatcherState::Stopped;
                completer.resolve(Err(TaskError::Spawn(err.to_string())));
                return handle;
            }
        }

        let tx = match (control.state, &control.tx) {
            (DispatcherState::Running, Some(tx)) => tx,
            (state, _) => {
                debug!("task submitted to a dispatcher in state {:?}", state);
                completer.resolve(Err(TaskError::Stopped));
                return handle;
            }
        };

        let entry = Entry::Task(Job::new(f, completer));
        let result = match (self.config.queue_capacity, self.config.overflow) {
            (Some(_), OverflowPolicy::FailFast) => tx.try_send(entry).map_err(|err| match err {
                flume::TrySendError::Full(entry) => (entry, Refusal::QueueFull),
                flume::TrySendError::Disconnected(entry) => (entry, Refusal::Abandoned),
            }),
            _ => tx
                .send(entry)
                .map_err(|flume::SendError(entry)| (entry, Refusal::Abandoned)),
        };

        if let Err((Entry::Task(job), refusal)) = result {
            debug!("task not queued: {:?}", refusal);
            job.refuse(refusal);
        }

        handle
    }

    /// Queues the sentinel. The consumer exits after dispatching every task
    /// queued before it.
    ///
    /// It does not wait for the queue to drain. Only the first call has an
    /// effect.
    pub fn stop(&self) {
        let mut control = self.control.lock();

        match control.state {
            DispatcherState::NotStarted => {
                trace!("dispatcher stopped before any submission");
                control.state = DispatcherState::Stopped;
            }
            DispatcherState::Running => {
                control.state = DispatcherState::Stopping;

                if let Some(tx) = &control.tx {
                    // the consumer is gone if this fails, and the queue with it
                    let _ = tx.send(Entry::Sentinel);
                }
            }
            DispatcherState::Stopping | DispatcherState::Stopped => {}
        }
    }

    /// Returns true once the dispatcher has started.
    ///
    /// It remains true after the dispatcher is stopped.
    pub fn is_running(&self) -> bool {
        let control = self.control.lock();
        control.state != DispatcherState::NotStarted && control.tx.is_some()
    }

    pub fn state(&self) -> DispatcherState {
        self.control.lock().state
    }

    /// Waits for the consumer thread to exit.
    ///
    /// Call [stop()](Self::stop) first, or this blocks forever. It does not
    /// wait for the dispatched tasks to finish.
    pub fn join(&self) {
        let consumer = self.control.lock().consumer.take();

        if let Some(consumer) = consumer {
            if consumer.join().is_err() {
                error!("the dispatcher thread panicked");
            }
        }
    }

    fn start(&self, control: &mut Control) -> std::io::Result<()> {
        let (tx, rx) = utils::channel(self.config.queue_capacity);
        let name = self
            .config
            .thread_name
            .clone()
            .unwrap_or_else(|| DEFAULT_THREAD_NAME.to_string());
        let pool = self.pool.clone();
        let retry = self.config.retry;
        let weak = Arc::downgrade(&self.control);

        let consumer = thread::Builder::new()
            .name(name)
            .spawn(move || run_consumer(&*pool, rx, retry, weak))?;

        match self.config.queue_capacity {
            Some(capacity) => debug!(
                "dispatcher started with a queue of {} tasks, overflow policy {}",
                capacity, self.config.overflow
            ),
            None => debug!("dispatcher started with an unbounded queue"),
        }
        control.state = DispatcherState::Running;
        control.tx = Some(tx);
        control.consumer = Some(consumer);
        Ok(())
    }
}

impl<P> Drop for Dispatcher<P>
where
    P: WorkerPool,
{
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_consumer<P>(
    pool: &P,
    rx: flume::Receiver<Entry>,
    retry: RetryPolicy,
    control: Weak<Mutex<Control>>,
) where
    P: ?Sized + WorkerPool,
{
    match panic::catch_unwind(AssertUnwindSafe(|| consume(pool, &rx, retry))) {
        Ok(dispatched) => debug!("dispatcher exits after dispatching {} tasks", dispatched),
        Err(payload) => error!("dispatcher loop failed: {}", panic_message(&*payload)),
    }

    // dropped jobs resolve their handles as abandoned
    let abandoned = rx
        .drain()
        .filter(|entry| matches!(entry, Entry::Task(_)))
        .count();
    if abandoned > 0 {
        warn!("{} queued tasks were abandoned", abandoned);
    }
    drop(rx);

    if let Some(control) = control.upgrade() {
        control.lock().state = DispatcherState::Stopped;
    }
}

fn consume<P>(pool: &P, rx: &flume::Receiver<Entry>, retry: RetryPolicy) -> usize
where
    P: ?Sized + WorkerPool,
{
    let mut dispatched = 0;

    loop {
        match rx.recv() {
            Ok(Entry::Task(job)) => {
                dispatch(pool, job, retry);
                dispatched += 1;
            }
            Ok(Entry::Sentinel) => break,
            Err(flume::RecvError::Disconnected) => {
                debug!("all dispatcher handles are dropped");
                break;
            }
        }
    }

    dispatched
}

fn dispatch<P>(pool: &P, mut job: Job, retry: RetryPolicy)
where
    P: ?Sized + WorkerPool,
{
    let backoff = Backoff::new();
    let mut attempts = 0;

    loop {
        attempts += 1;

        match pool.execute(job) {
            Ok(()) => break,
            Err(Rejected(returned)) if attempts < retry.max_attempts => {
                trace!("worker pool rejected attempt {}, retrying", attempts);
                backoff.snooze();
                job = returned;
            }
            Err(Rejected(returned)) => {
                warn!("worker pool rejected the task {} times", attempts);
                returned.refuse(Refusal::Rejected { attempts });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handle::HandleStatus, pool::FixedThreadPool};
    use rand::prelude::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// Rejects the first `rejections` jobs it sees, then runs jobs inline.
    struct Flaky {
        rejections: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(rejections: usize) -> Self {
            Self {
                rejections: AtomicUsize::new(rejections),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl WorkerPool for Flaky {
        fn execute(&self, job: Job) -> Result<(), Rejected<Job>> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let reject = self
                .rejections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if reject {
                return Err(Rejected(job));
            }

            job.run();
            Ok(())
        }
    }

    /// Runs jobs inline and records the order they arrive in.
    #[derive(Default)]
    struct Recorder {
        order: Mutex<Vec<usize>>,
    }

    impl WorkerPool for Recorder {
        fn execute(&self, job: Job) -> Result<(), Rejected<Job>> {
            job.run();
            Ok(())
        }
    }

    struct Panicking;

    impl WorkerPool for Panicking {
        fn execute(&self, _job: Job) -> Result<(), Rejected<Job>> {
            panic!("pool is broken");
        }
    }

    #[test]
    fn submit_and_stop() {
        utils::init_tracing();

        let dispatcher = Dispatcher::default();
        assert!(!dispatcher.is_running());
        assert_eq!(dispatcher.state(), DispatcherState::NotStarted);

        let handles: Vec<_> = (0..32)
            .map(|value| dispatcher.submit(move || Ok::<_, ()>(value + 1)))
            .collect();
        assert!(dispatcher.is_running());

        dispatcher.stop();
        dispatcher.stop();
        dispatcher.join();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert!(dispatcher.is_running());

        let values: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(values, (1..=32).collect::<Vec<_>>());
    }

    #[test]
    fn dispatch_in_submission_order() {
        let dispatcher = Dispatcher::new(Arc::new(Recorder::default()));
        let recorder = dispatcher.pool().clone();

        let handles: Vec<_> = (0..100)
            .map(|index| {
                let recorder = recorder.clone();
                dispatcher.submit(move || {
                    recorder.order.lock().push(index);
                    Ok::<_, ()>(())
                })
            })
            .collect();
        dispatcher.stop();
        dispatcher.join();

        assert!(handles.iter().all(|handle| handle.is_done()));
        assert_eq!(*recorder.order.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn submit_after_stop() {
        let dispatcher = Dispatcher::default();
        let first = dispatcher.submit(|| Ok::<_, ()>(1));
        dispatcher.stop();

        let late = dispatcher.submit(|| Ok::<_, ()>(2));
        assert_eq!(late.wait(), Err(TaskError::Stopped));
        assert_eq!(first.wait(), Ok(1));

        // stopped before it ever started
        let dispatcher = Dispatcher::default();
        dispatcher.stop();
        assert!(!dispatcher.is_running());
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        let late = dispatcher.submit(|| Ok::<_, ()>(2));
        assert_eq!(late.wait(), Err(TaskError::Stopped));
    }

    #[test]
    fn transform_failures_are_captured() {
        let dispatcher = Dispatcher::default();
        let failed = dispatcher.submit(|| Err::<usize, _>("bad input"));
        let panicked = dispatcher.submit(|| -> Result<usize, &str> { panic!("worker blew up") });
        let ok = dispatcher.submit(|| Ok::<usize, &str>(3));
        dispatcher.stop();

        assert_eq!(failed.wait(), Err(TaskError::Failed("bad input")));
        assert_eq!(
            panicked.wait(),
            Err(TaskError::Panicked("worker blew up".into()))
        );
        assert_eq!(ok.wait(), Ok(3));
    }

    #[test]
    fn rejected_once_then_accepted() {
        let dispatcher = Dispatcher::new(Flaky::new(1));
        let handle = dispatcher.submit(|| Ok::<_, ()>("done"));
        dispatcher.stop();
        dispatcher.join();

        assert_eq!(handle.status(), HandleStatus::Succeeded);
        assert_eq!(handle.wait(), Ok("done"));
        assert_eq!(dispatcher.pool().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rejected_on_every_attempt() {
        let dispatcher = Dispatcher::new(Flaky::new(2));
        let rejected = dispatcher.submit(|| Ok::<_, ()>(1));
        let accepted = dispatcher.submit(|| Ok::<_, ()>(2));
        dispatcher.stop();

        assert_eq!(rejected.wait(), Err(TaskError::Rejected { attempts: 2 }));
        assert_eq!(accepted.wait(), Ok(2));

        let dispatcher = Dispatcher::with_config(Flaky::new(4), RetryPolicy::attempts(5));
        let handle = dispatcher.submit(|| Ok::<_, ()>(3));
        dispatcher.stop();
        assert_eq!(handle.wait(), Ok(3));

        let dispatcher = Dispatcher::with_config(Flaky::new(1), RetryPolicy::none());
        let handle = dispatcher.submit(|| Ok::<_, ()>(4));
        dispatcher.stop();
        assert_eq!(handle.wait(), Err(TaskError::Rejected { attempts: 1 }));
    }

    #[test]
    fn broken_pool_resolves_every_handle() {
        let dispatcher = Dispatcher::new(Panicking);
        let handles: Vec<_> = (0..8)
            .map(|value| dispatcher.submit(move || Ok::<_, ()>(value)))
            .collect();
        dispatcher.join_after_stop();

        // submissions racing with the dying consumer see it as stopped
        for handle in handles {
            match handle.wait() {
                Err(TaskError::Abandoned) | Err(TaskError::Stopped) => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);

        let late = dispatcher.submit(|| Ok::<_, ()>(0));
        assert_eq!(late.wait(), Err(TaskError::Stopped));
    }

    #[test]
    fn bounded_queue_fail_fast() {
        let pool = FixedThreadPool::new((1, 1));
        let config = DispatcherConfig::from((1, OverflowPolicy::FailFast))
            .retry(RetryPolicy::attempts(1000));
        let dispatcher = Dispatcher::with_config(pool, config);
        let (gate_tx, gate_rx) = flume::unbounded::<()>();

        let handles: Vec<_> = (0..64)
            .map(|value| {
                let gate_rx = gate_rx.clone();
                dispatcher.submit(move || {
                    gate_rx.recv().unwrap();
                    Ok::<_, ()>(value)
                })
            })
            .collect();

        // the worker, the pool queue and the dispatch queue hold one task each
        let full = handles
            .iter()
            .filter(|handle| handle.status() == HandleStatus::Failed)
            .count();
        assert!(full > 0);

        for _ in 0..64 {
            gate_tx.send(()).unwrap();
        }
        dispatcher.stop();

        for handle in handles {
            match handle.wait() {
                Ok(_) | Err(TaskError::QueueFull) | Err(TaskError::Rejected { .. }) => {}
                Err(err) => panic!("unexpected outcome {:?}", err),
            }
        }
    }

    #[test]
    fn bounded_queue_blocks() {
        let dispatcher = Dispatcher::with_config(ThreadPerTask::new(), 2);
        let mut rng = rand::thread_rng();

        let handles: Vec<_> = (0..50)
            .map(|value| {
                let delay = Duration::from_micros(rng.gen_range(0..500));
                dispatcher.submit(move || {
                    thread::sleep(delay);
                    Ok::<_, ()>(value)
                })
            })
            .collect();
        dispatcher.stop();

        let values: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(values, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn cancellation_token_reaches_transform() {
        let dispatcher = Dispatcher::default();
        let (started_tx, started_rx) = flume::bounded::<()>(1);
        let (observed_tx, observed_rx) = flume::bounded::<bool>(1);

        let handle = dispatcher.submit_with_token(move |token| {
            started_tx.send(()).unwrap();
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while !token.is_cancelled() && std::time::Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            observed_tx.send(token.is_cancelled()).unwrap();
            Ok::<_, ()>(())
        });
        dispatcher.stop();

        started_rx.recv().unwrap();
        assert!(handle.cancel());
        assert!(observed_rx.recv().unwrap());
        assert_eq!(handle.wait(), Err(TaskError::Cancelled));
    }

    #[test]
    fn dropped_dispatcher_still_dispatches() {
        let dispatcher = Dispatcher::default();
        let handle = dispatcher.submit(|| Ok::<_, ()>(5));
        drop(dispatcher);
        assert_eq!(handle.wait(), Ok(5));
    }

    impl<P> Dispatcher<P>
    where
        P: WorkerPool,
    {
        fn join_after_stop(&self) {
            self.stop();
            self.join();
        }
    }
}
