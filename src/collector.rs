use crate::{
    aggregate::combine,
    common::*,
    config::DispatcherConfig,
    dispatcher::Dispatcher,
    error::{TaskError, UnsupportedCombine},
    handle::CompletionHandle,
    pool::{ThreadPerTask, WorkerPool},
};
use futures::future::BoxFuture;
use std::{convert::Infallible, vec};

/// The partial result of a collection run: one handle per submitted element,
/// in submission order.
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Default(bound = ""))]
pub struct Accumulator<R, E> {
    handles: Vec<CompletionHandle<R, E>>,
}

impl<R, E> Accumulator<R, E> {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Merging two accumulators is not supported and always fails.
    pub fn merge(self, _other: Self) -> Result<Self, UnsupportedCombine> {
        Err(UnsupportedCombine)
    }

    pub fn into_handles(self) -> Vec<CompletionHandle<R, E>> {
        self.handles
    }
}

/// The deferred result of a parallel collection.
///
/// Await it, or block on it with [wait()](Self::wait).
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Collected<C, E> {
    future: BoxFuture<'static, Result<C, TaskError<E>>>,
}

impl<C, E> Collected<C, E> {
    pub(crate) fn new(future: BoxFuture<'static, Result<C, TaskError<E>>>) -> Self {
        Self { future }
    }

    /// Blocks the current thread until the collection finishes.
    pub fn wait(self) -> Result<C, TaskError<E>> {
        futures::executor::block_on(self.future)
    }
}

impl<C, E> Future for Collected<C, E> {
    type Output = Result<C, TaskError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.poll_unpin(cx)
    }
}

impl<C, E> Debug for Collected<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collected").finish_non_exhaustive()
    }
}

/// A reducer that maps elements concurrently and collects the results.
///
/// The reducer works in four steps, mirroring a sequential fold:
///
/// - [supply()](Self::supply) creates an empty [Accumulator].
/// - [accumulate()](Self::accumulate) submits the transform of one element.
/// - [combine()](Self::combine) would merge two accumulators, but always fails
///   because collection is sequential-submission only.
/// - [finish()](Self::finish) stops the dispatcher and applies the reduction to
///   the ordered values once all transforms succeed.
///
/// ```rust
/// use par_collect::ParCollector;
/// use std::collections::HashSet;
///
/// let collector = ParCollector::new(
///     |value: u32| Ok::<_, ()>(value + 10),
///     |values| values.collect::<HashSet<_>>(),
/// );
/// let mut acc = collector.supply();
/// for value in 1..=9 {
///     collector.accumulate(&mut acc, value);
/// }
///
/// let set = collector.finish(acc).wait().unwrap();
/// assert_eq!(set, (11..=19).collect());
/// ```
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct ParCollector<I, R, E, C, F, G, P = ThreadPerTask>
where
    P: WorkerPool,
{
    #[derivative(Debug = "ignore")]
    transform: Arc<F>,
    #[derivative(Debug = "ignore")]
    reduction: G,
    dispatcher: Dispatcher<P>,
    #[derivative(Debug = "ignore")]
    _phantom: PhantomData<fn(I) -> (R, E, C)>,
}

impl<I, R, E, C, F, G> ParCollector<I, R, E, C, F, G, ThreadPerTask>
where
    I: 'static + Send,
    R: 'static + Send,
    E: 'static + Send,
    C: 'static + Send,
    F: 'static + Send + Sync + Fn(I) -> Result<R, E>,
    G: 'static + Send + FnOnce(vec::IntoIter<R>) -> C,
{
    /// Creates a collector that runs one thread per element.
    pub fn new(transform: F, reduction: G) -> Self {
        Self::with_pool(DispatcherConfig::default(), ThreadPerTask::new(), transform, reduction)
    }
}

impl<I, R, E, C, F, G, P> ParCollector<I, R, E, C, F, G, P>
where
    I: 'static + Send,
    R: 'static + Send,
    E: 'static + Send,
    C: 'static + Send,
    F: 'static + Send + Sync + Fn(I) -> Result<R, E>,
    G: 'static + Send + FnOnce(vec::IntoIter<R>) -> C,
    P: WorkerPool,
{
    /// Creates a collector that dispatches to the given worker pool.
    pub fn with_pool<Cfg>(config: Cfg, pool: P, transform: F, reduction: G) -> Self
    where
        Cfg: Into<DispatcherConfig>,
    {
        Self {
            transform: Arc::new(transform),
            reduction,
            dispatcher: Dispatcher::with_config(pool, config),
            _phantom: PhantomData,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<P> {
        &self.dispatcher
    }

    pub fn supply(&self) -> Accumulator<R, E> {
        Accumulator::default()
    }

    /// Submits the transform of `item`.
    pub fn accumulate(&self, acc: &mut Accumulator<R, E>, item: I) {
        let transform = self.transform.clone();
        let handle = self.dispatcher.submit(move || transform(item));
        acc.handles.push(handle);
    }

    /// Always fails with [UnsupportedCombine].
    ///
    /// Splitting the input across several accumulators and merging them is
    /// not part of the contract.
    pub fn combine(
        &self,
        left: Accumulator<R, E>,
        right: Accumulator<R, E>,
    ) -> Result<Accumulator<R, E>, UnsupportedCombine> {
        left.merge(right)
    }

    /// Stops the dispatcher and returns the deferred reduction of all values.
    pub fn finish(self, acc: Accumulator<R, E>) -> Collected<C, E> {
        let Self {
            reduction,
            dispatcher,
            ..
        } = self;

        dispatcher.stop();
        let signal = combine(acc.handles);
        debug!("collecting {} elements", signal.len());

        let future = signal.map(move |result| result.map(|values| reduction(values.into_iter())));
        Collected::new(future.boxed())
    }

    /// Runs the whole collection over `items`.
    pub fn collect<Iter>(self, items: Iter) -> Collected<C, E>
    where
        Iter: IntoIterator<Item = I>,
    {
        let mut acc = self.supply();
        for item in items {
            self.accumulate(&mut acc, item);
        }
        self.finish(acc)
    }
}

/// An extension trait that collects iterator elements through parallel transforms.
///
/// ```rust
/// use par_collect::prelude::*;
/// use std::collections::HashSet;
///
/// let set = (1..=9)
///     .par_map_collect(|value| value + 10, |values| values.collect::<HashSet<_>>())
///     .wait()
///     .unwrap();
/// assert_eq!(set, (11..=19).collect());
/// ```
pub trait ParCollectExt
where
    Self: Iterator + Sized,
    Self::Item: 'static + Send,
{
    /// Applies the fallible `transform` to every element on its own thread,
    /// then applies `reduction` to the values in input order.
    ///
    /// The first failing transform fails the whole collection and cancels
    /// the others.
    fn par_collect<R, E, C, F, G>(self, transform: F, reduction: G) -> Collected<C, E>
    where
        R: 'static + Send,
        E: 'static + Send,
        C: 'static + Send,
        F: 'static + Send + Sync + Fn(Self::Item) -> Result<R, E>,
        G: 'static + Send + FnOnce(vec::IntoIter<R>) -> C,
    {
        ParCollector::new(transform, reduction).collect(self)
    }

    /// Like [par_collect()](Self::par_collect), on a caller-supplied worker
    /// pool and dispatcher configuration.
    fn par_collect_with<Cfg, P, R, E, C, F, G>(
        self,
        config: Cfg,
        pool: P,
        transform: F,
        reduction: G,
    ) -> Collected<C, E>
    where
        Cfg: Into<DispatcherConfig>,
        P: WorkerPool,
        R: 'static + Send,
        E: 'static + Send,
        C: 'static + Send,
        F: 'static + Send + Sync + Fn(Self::Item) -> Result<R, E>,
        G: 'static + Send + FnOnce(vec::IntoIter<R>) -> C,
    {
        ParCollector::with_pool(config, pool, transform, reduction).collect(self)
    }

    /// Like [par_collect()](Self::par_collect) for a transform that cannot fail.
    fn par_map_collect<R, C, F, G>(self, transform: F, reduction: G) -> Collected<C, Infallible>
    where
        R: 'static + Send,
        C: 'static + Send,
        F: 'static + Send + Sync + Fn(Self::Item) -> R,
        G: 'static + Send + FnOnce(vec::IntoIter<R>) -> C,
    {
        self.par_collect(move |item| Ok(transform(item)), reduction)
    }
}

impl<I> ParCollectExt for I
where
    I: Iterator,
    I::Item: 'static + Send,
{
}
