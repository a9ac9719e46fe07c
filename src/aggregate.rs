//! All-or-nothing aggregation of task results.

use crate::{
    common::*,
    error::TaskError,
    handle::{completion, CancelHandle, Completer, CompletionHandle},
};
use parking_lot::Mutex;

/// Combines the handles of one collection run into a single signal.
///
/// The signal completes with the values in the order of `handles` once every
/// handle succeeds. As soon as any handle fails, the signal fails with that
/// error and every other unresolved handle is cancelled. Cancellation is
/// best effort: the signal may report the failure before the siblings
/// observe their cancellation.
///
/// When several tasks fail concurrently, the first failure observed wins and
/// the others are discarded.
///
/// ```rust
/// use par_collect::{combine, Dispatcher};
///
/// let dispatcher = Dispatcher::default();
/// let handles: Vec<_> = (0..5)
///     .map(|value| dispatcher.submit(move || Ok::<_, ()>(value * value)))
///     .collect();
/// dispatcher.stop();
///
/// assert_eq!(combine(handles).wait(), Ok(vec![0, 1, 4, 9, 16]));
/// ```
pub fn combine<T, E>(handles: Vec<CompletionHandle<T, E>>) -> AggregateSignal<T, E>
where
    T: 'static + Send,
    E: 'static + Send,
{
    let len = handles.len();
    let (completer, handle) = completion();

    if handles.is_empty() {
        completer.resolve(Ok(vec![]));
        return AggregateSignal { handle, len };
    }

    let gather = Arc::new(Gather {
        state: Mutex::new(GatherState {
            values: iter::repeat_with(|| None).take(len).collect(),
            remaining: len,
            failed: false,
        }),
        siblings: handles.iter().map(|handle| handle.cancel_handle()).collect(),
        completer,
    });

    for (index, handle) in handles.into_iter().enumerate() {
        let gather = gather.clone();
        handle.on_complete(move |result| gather.observe(index, result));
    }

    AggregateSignal { handle, len }
}

struct Gather<T, E> {
    state: Mutex<GatherState<T>>,
    siblings: Vec<CancelHandle<T, E>>,
    completer: Completer<Vec<T>, E>,
}

struct GatherState<T> {
    values: Vec<Option<T>>,
    remaining: usize,
    failed: bool,
}

impl<T, E> Gather<T, E> {
    fn observe(&self, index: usize, result: Result<T, TaskError<E>>) {
        match result {
            Ok(value) => {
                let values = {
                    let mut state = self.state.lock();
                    if state.failed {
                        return;
                    }

                    state.values[index] = Some(value);
                    state.remaining -= 1;
                    if state.remaining > 0 {
                        return;
                    }
                    mem::take(&mut state.values)
                };

                let values: Vec<T> = values.into_iter().flatten().collect();
                trace!("all {} tasks succeeded", values.len());
                self.completer.resolve(Ok(values));
            }
            Err(err) => {
                let first = {
                    let mut state = self.state.lock();
                    !mem::replace(&mut state.failed, true)
                };

                if !first {
                    trace!("discarding failure of task {}", index);
                    return;
                }

                debug!("task {} failed, cancelling its siblings", index);

                // siblings are terminal before anyone waiting on the signal wakes up,
                // their callbacks into observe() are discarded
                let cancelled = self
                    .siblings
                    .iter()
                    .enumerate()
                    .filter(|(other, _)| *other != index)
                    .filter(|(_, sibling)| sibling.cancel())
                    .count();
                debug!("cancelled {} pending tasks", cancelled);

                self.completer.resolve(Err(err));
            }
        }
    }
}

/// The outcome of a whole collection run.
///
/// It resolves to every value in submission order, or to the first observed
/// failure. Await it, or block on it with [wait()](Self::wait).
#[must_use = "the aggregate result is lost if the signal is dropped"]
pub struct AggregateSignal<T, E> {
    handle: CompletionHandle<Vec<T>, E>,
    len: usize,
}

impl<T, E> AggregateSignal<T, E> {
    /// Number of combined handles.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    /// Blocks the current thread until the signal resolves.
    pub fn wait(self) -> Result<Vec<T>, TaskError<E>> {
        self.handle.wait()
    }
}

impl<T, E> Future for AggregateSignal<T, E> {
    type Output = Result<Vec<T>, TaskError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T, E> Debug for AggregateSignal<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateSignal")
            .field("len", &self.len)
            .field("status", &self.handle.status())
            .finish()
    }
}
