//! Concurrent map-and-collect with ordered, fail-fast aggregation.
//!
//! The crate runs a per-element transform on a worker pool and folds all
//! results into a single deferred value. It is meant for blocking or
//! side-effecting work inside an otherwise sequential collection, without
//! managing threads or futures by hand.
//!
//! # Usage
//!
//! The extension traits can be imported from [`prelude`](prelude).
//!
//! ```rust
//! use par_collect::prelude::*;
//! use std::collections::HashSet;
//!
//! let set = (1..=9)
//!     .par_collect(|value| Ok::<_, ()>(value + 10), |values| values.collect::<HashSet<_>>())
//!     .wait()
//!     .unwrap();
//! assert_eq!(set, (11..=19).collect());
//! ```
//!
//! - [`iter.par_collect(transform, reduction)`](ParCollectExt::par_collect) runs each
//!   transform on its own thread.
//! - [`iter.par_collect_with(config, pool, transform, reduction)`](ParCollectExt::par_collect_with)
//!   runs them on a caller-supplied [WorkerPool].
//! - [`stream.par_collect(transform, reduction)`](ParCollectStreamExt::par_collect) does the
//!   same for asynchronous streams.
//!
//! The returned [Collected] value can be awaited or waited on synchronously.
//! The reduction receives the values in input order, regardless of the order
//! the transforms finish in.
//!
//! # Failure
//!
//! Collection is all-or-nothing. The first failing transform fails the whole
//! collection with its [TaskError] and the other transforms are cancelled.
//! Transforms that run for a long time may observe the cancellation through
//! the [CancellationToken] handed to them by
//! [`Dispatcher::submit_with_token`].
//!
//! ```rust
//! use par_collect::{prelude::*, TaskError};
//!
//! let result = (1..=9)
//!     .par_collect(
//!         |value| if value == 5 { Err("five") } else { Ok(value) },
//!         |values| values.collect::<Vec<_>>(),
//!     )
//!     .wait();
//! assert_eq!(result, Err(TaskError::Failed("five")));
//! ```
//!
//! # Building Blocks
//!
//! - [Dispatcher] queues tasks and hands them to a worker pool, in submission
//!   order, from a dedicated thread.
//! - [CompletionHandle] is the cancellable single-assignment result of one task.
//! - [combine()] folds the handles of one run into an [AggregateSignal].
//! - [ParCollector] wires the three together as a reducer.
//!
//! # Worker Pools
//!
//! - [ThreadPerTask] spawns a thread per task. It is the default.
//! - [FixedThreadPool] bounds concurrency with a fixed set of workers.
//! - [TokioBlockingPool] runs tasks on the blocking threads of a tokio runtime.
//!
//! A pool that is saturated may reject a job. The dispatcher then offers it
//! again according to its [RetryPolicy] before failing the task with
//! [TaskError::Rejected].

/// Commonly used traits.
pub mod prelude {
    pub use super::{collector::ParCollectExt, stream::ParCollectStreamExt};
}

mod aggregate;
mod collector;
mod common;
mod config;
mod dispatcher;
mod error;
mod handle;
mod pool;
mod stream;
mod task;
mod utils;

pub use aggregate::*;
pub use collector::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use handle::*;
pub use pool::*;
pub use stream::*;
pub use task::Job;
pub use tokio_util::sync::CancellationToken;
