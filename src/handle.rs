//! Single-assignment, cancellable task results.

use crate::{common::*, error::TaskError};
use parking_lot::{Condvar, Mutex};

type Listener<T, E> = Box<dyn FnOnce(Result<T, TaskError<E>>) + Send>;

/// Creates a connected [Completer] and [CompletionHandle] pair sharing one
/// cancellation token.
///
/// ```rust
/// use par_collect::{completion, TaskError};
///
/// let (completer, handle) = completion::<u32, ()>();
/// assert!(completer.resolve(Ok(1)));
/// assert!(!completer.resolve(Err(TaskError::Failed(()))));
/// assert_eq!(handle.wait(), Ok(1));
/// ```
pub fn completion<T, E>() -> (Completer<T, E>, CompletionHandle<T, E>) {
    let cell = Arc::new(Cell {
        slot: Mutex::new(Slot::Pending {
            waker: None,
            listener: None,
        }),
        cond: Condvar::new(),
    });
    let token = CancellationToken::new();

    let completer = Completer {
        cell: cell.clone(),
        token: token.clone(),
    };
    let handle = CompletionHandle { cell, token };
    (completer, handle)
}

/// The observable state of a [CompletionHandle].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl HandleStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    fn of<T, E>(result: &Result<T, TaskError<E>>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(TaskError::Cancelled) => Self::Cancelled,
            Err(_) => Self::Failed,
        }
    }
}

struct Cell<T, E> {
    slot: Mutex<Slot<T, E>>,
    cond: Condvar,
}

enum Slot<T, E> {
    Pending {
        waker: Option<Waker>,
        listener: Option<Listener<T, E>>,
    },
    Resolved {
        status: HandleStatus,
        // None once the result is taken or handed to a listener
        result: Option<Result<T, TaskError<E>>>,
    },
}

impl<T, E> Cell<T, E> {
    fn resolve(&self, result: Result<T, TaskError<E>>) -> bool {
        let status = HandleStatus::of(&result);
        let mut slot = self.slot.lock();

        let (waker, listener) = match &mut *slot {
            Slot::Pending { waker, listener } => (waker.take(), listener.take()),
            Slot::Resolved { .. } => return false,
        };

        match listener {
            Some(listener) => {
                *slot = Slot::Resolved {
                    status,
                    result: None,
                };
                drop(slot);
                self.cond.notify_all();
                listener(result);
            }
            None => {
                *slot = Slot::Resolved {
                    status,
                    result: Some(result),
                };
                drop(slot);
                self.cond.notify_all();
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
        }

        true
    }

    fn status(&self) -> HandleStatus {
        match &*self.slot.lock() {
            Slot::Pending { .. } => HandleStatus::Pending,
            Slot::Resolved { status, .. } => *status,
        }
    }
}

/// The task side of a [CompletionHandle].
///
/// Dropping a completer that never resolved fails its handle with
/// [Abandoned](TaskError::Abandoned), so a discarded task never leaves a
/// waiter hanging.
pub struct Completer<T, E> {
    cell: Arc<Cell<T, E>>,
    token: CancellationToken,
}

impl<T, E> Completer<T, E> {
    /// Resolves the handle. Returns false if it was already resolved.
    pub fn resolve(&self, result: Result<T, TaskError<E>>) -> bool {
        self.cell.resolve(result)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The token cancelled together with the handle.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl<T, E> Drop for Completer<T, E> {
    fn drop(&mut self) {
        if self.cell.resolve(Err(TaskError::Abandoned)) {
            warn!("task dropped before producing a result");
        }
    }
}

impl<T, E> Debug for Completer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("status", &self.cell.status())
            .finish()
    }
}

/// A cancellable, single-assignment future for the result of one task.
///
/// The handle resolves exactly once. Whichever of completion, failure or
/// cancellation comes first wins and later attempts are ignored.
///
/// It can be awaited, or waited on synchronously by [wait()](Self::wait).
#[must_use = "the task result is lost if the handle is dropped"]
pub struct CompletionHandle<T, E> {
    cell: Arc<Cell<T, E>>,
    token: CancellationToken,
}

impl<T, E> CompletionHandle<T, E> {
    /// Cancels the backing task and resolves the handle as
    /// [Cancelled](TaskError::Cancelled).
    ///
    /// A task that has not started yet is skipped. A running transform
    /// observes the cancellation through its token. Returns false and does
    /// nothing if the handle is already resolved.
    pub fn cancel(&self) -> bool {
        if self.is_done() {
            return false;
        }
        self.token.cancel();
        self.cell.resolve(Err(TaskError::Cancelled))
    }

    pub fn status(&self) -> HandleStatus {
        self.cell.status()
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Returns a lightweight handle that can only cancel this task.
    pub fn cancel_handle(&self) -> CancelHandle<T, E> {
        CancelHandle {
            cell: self.cell.clone(),
            token: self.token.clone(),
        }
    }

    /// Takes the result if the handle is resolved and the result was not
    /// taken yet.
    pub fn try_take(&mut self) -> Option<Result<T, TaskError<E>>> {
        match &mut *self.cell.slot.lock() {
            Slot::Pending { .. } => None,
            Slot::Resolved { result, .. } => result.take(),
        }
    }

    /// Blocks the current thread until the handle resolves.
    ///
    /// It returns [Abandoned](TaskError::Abandoned) if the result was
    /// already taken by [try_take()](Self::try_take).
    pub fn wait(self) -> Result<T, TaskError<E>> {
        let mut slot = self.cell.slot.lock();

        loop {
            if let Slot::Resolved { result, .. } = &mut *slot {
                break result.take().unwrap_or(Err(TaskError::Abandoned));
            }
            self.cell.cond.wait(&mut slot);
        }
    }

    /// Consumes the handle and calls `f` with the result once it resolves.
    ///
    /// If the handle is already resolved, `f` runs on the current thread.
    /// Otherwise it runs on the thread that resolves the handle.
    pub fn on_complete<F>(self, f: F)
    where
        F: 'static + Send + FnOnce(Result<T, TaskError<E>>),
    {
        let mut slot = self.cell.slot.lock();

        match &mut *slot {
            Slot::Pending { listener, .. } => {
                *listener = Some(Box::new(f));
            }
            Slot::Resolved { result, .. } => {
                let result = result.take().unwrap_or(Err(TaskError::Abandoned));
                drop(slot);
                f(result);
            }
        }
    }
}

impl<T, E> Future for CompletionHandle<T, E> {
    type Output = Result<T, TaskError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.cell.slot.lock();

        match &mut *slot {
            Slot::Pending { waker, .. } => {
                match waker {
                    Some(waker) if waker.will_wake(cx.waker()) => {}
                    _ => *waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
            Slot::Resolved { result, .. } => {
                Poll::Ready(result.take().unwrap_or(Err(TaskError::Abandoned)))
            }
        }
    }
}

impl<T, E> Debug for CompletionHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("status", &self.status())
            .finish()
    }
}

/// Cancels a task without owning its result.
pub struct CancelHandle<T, E> {
    cell: Arc<Cell<T, E>>,
    token: CancellationToken,
}

impl<T, E> CancelHandle<T, E> {
    /// Same as [CompletionHandle::cancel].
    pub fn cancel(&self) -> bool {
        if self.cell.status().is_terminal() {
            return false;
        }
        self.token.cancel();
        self.cell.resolve(Err(TaskError::Cancelled))
    }

    pub fn status(&self) -> HandleStatus {
        self.cell.status()
    }
}

impl<T, E> Clone for CancelHandle<T, E> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T, E> Debug for CancelHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Barrier, time::Duration};

    #[test]
    fn resolves_exactly_once() {
        let (completer, handle) = completion::<usize, ()>();
        assert_eq!(handle.status(), HandleStatus::Pending);

        assert!(completer.resolve(Ok(1)));
        assert!(!completer.resolve(Ok(2)));
        assert!(!completer.resolve(Err(TaskError::Failed(()))));
        assert!(!handle.cancel());
        assert!(!completer.is_cancelled());

        assert_eq!(handle.status(), HandleStatus::Succeeded);
        assert_eq!(handle.wait(), Ok(1));
    }

    #[test]
    fn racing_resolutions() {
        for _ in 0..200 {
            let (completer, handle) = completion::<usize, ()>();
            let completer = Arc::new(completer);
            let barrier = Arc::new(Barrier::new(3));

            let threads: Vec<_> = (0..2)
                .map(|value| {
                    let completer = completer.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        completer.resolve(Ok(value))
                    })
                })
                .collect();
            let canceller = handle.cancel_handle();
            let cancel_thread = {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    canceller.cancel()
                })
            };

            let mut wins: usize = threads
                .into_iter()
                .map(|thread| thread.join().unwrap() as usize)
                .sum();
            wins += cancel_thread.join().unwrap() as usize;
            assert_eq!(wins, 1);

            match handle.wait() {
                Ok(value) => assert!(value < 2),
                Err(err) => assert!(err.is_cancelled()),
            }
        }
    }

    #[test]
    fn cancel_marks_token() {
        let (completer, handle) = completion::<(), ()>();
        assert!(handle.cancel());
        assert!(completer.is_cancelled());
        assert!(completer.token().is_cancelled());
        assert_eq!(handle.status(), HandleStatus::Cancelled);
        assert!(!completer.resolve(Ok(())));
        assert_eq!(handle.wait(), Err(TaskError::Cancelled));
    }

    #[test]
    fn dropped_completer_abandons() {
        let (completer, handle) = completion::<(), ()>();
        drop(completer);
        assert_eq!(handle.status(), HandleStatus::Failed);
        assert_eq!(handle.wait(), Err(TaskError::Abandoned));
    }

    #[test]
    fn wait_blocks_until_resolved() {
        let (completer, handle) = completion::<&'static str, ()>();

        let thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.resolve(Ok("done"));
        });

        assert_eq!(handle.wait(), Ok("done"));
        thread.join().unwrap();
    }

    #[test]
    fn try_take_once() {
        let (completer, mut handle) = completion::<usize, ()>();
        assert_eq!(handle.try_take(), None);
        completer.resolve(Ok(7));
        assert_eq!(handle.try_take(), Some(Ok(7)));
        assert_eq!(handle.try_take(), None);
        assert_eq!(handle.status(), HandleStatus::Succeeded);
    }

    #[test]
    fn listener_runs_on_resolution() {
        let (completer, handle) = completion::<usize, ()>();
        let (tx, rx) = flume::unbounded();

        handle.on_complete(move |result| tx.send(result).unwrap());
        assert!(rx.try_recv().is_err());

        completer.resolve(Ok(3));
        assert_eq!(rx.recv().unwrap(), Ok(3));

        // already resolved
        let (completer, handle) = completion::<usize, ()>();
        completer.resolve(Err(TaskError::Failed(())));
        let (tx, rx) = flume::unbounded();
        handle.on_complete(move |result| tx.send(result).unwrap());
        assert_eq!(rx.try_recv().unwrap(), Err(TaskError::Failed(())));
    }

    #[tokio::test]
    async fn await_handle() {
        let (completer, handle) = completion::<usize, ()>();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completer.resolve(Ok(42));
        });

        assert_eq!(handle.await, Ok(42));
    }
}
