use crate::{
    collector::{Collected, ParCollector},
    common::*,
    config::DispatcherConfig,
    pool::{ThreadPerTask, WorkerPool},
};
use std::vec;

/// An extension trait that collects stream items through parallel transforms.
///
/// Items are submitted as soon as the stream yields them, so transforms of
/// early items run while later items are still being produced.
///
/// With a bounded dispatch queue and [Block](crate::OverflowPolicy::Block)
/// overflow, submitting an item may block the polling thread until the
/// queue has room.
pub trait ParCollectStreamExt
where
    Self: 'static + Send + Stream + Sized,
    Self::Item: 'static + Send,
{
    /// The stream counterpart of [ParCollectExt::par_collect](crate::ParCollectExt::par_collect).
    fn par_collect<R, E, C, F, G>(self, transform: F, reduction: G) -> Collected<C, E>
    where
        R: 'static + Send,
        E: 'static + Send,
        C: 'static + Send,
        F: 'static + Send + Sync + Fn(Self::Item) -> Result<R, E>,
        G: 'static + Send + FnOnce(vec::IntoIter<R>) -> C,
    {
        self.par_collect_with(
            DispatcherConfig::default(),
            ThreadPerTask::new(),
            transform,
            reduction,
        )
    }

    /// The stream counterpart of
    /// [ParCollectExt::par_collect_with](crate::ParCollectExt::par_collect_with).
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
        let collector = ParCollector::with_pool(config, pool, transform, reduction);

        let future = async move {
            let mut stream = self.boxed();
            let mut acc = collector.supply();

            while let Some(item) = stream.next().await {
                collector.accumulate(&mut acc, item);
            }

            collector.finish(acc).await
        };

        Collected::new(future.boxed())
    }
}

impl<S> ParCollectStreamExt for S
where
    S: 'static + Send + Stream,
    S::Item: 'static + Send,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::TaskError, pool::TokioBlockingPool};
    use futures::stream;
    use std::{collections::HashSet, time::Duration};

    #[tokio::test]
    async fn collect_stream_to_set() {
        let set = stream::iter(1..=9)
            .par_collect(|value| Ok::<_, ()>(value + 10), |values| values.collect::<HashSet<_>>())
            .await
            .unwrap();

        assert_eq!(set, (11..=19).collect::<HashSet<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interleaved_production() {
        let stream = stream::iter(0..20u64).then(|value| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            value
        });

        let values = stream
            .par_collect_with(
                None,
                TokioBlockingPool::current().unwrap(),
                |value| {
                    std::thread::sleep(Duration::from_millis(20 - value));
                    Ok::<_, ()>(value)
                },
                |values| values.collect::<Vec<_>>(),
            )
            .await
            .unwrap();

        assert_eq!(values, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failing_stream_item() {
        let result = stream::iter(1..=9)
            .par_collect(
                |value| if value == 5 { Err("five") } else { Ok(value) },
                |values| values.collect::<Vec<_>>(),
            )
            .await;

        assert_eq!(result, Err(TaskError::Failed("five")));
    }

    #[tokio::test]
    async fn empty_stream() {
        let values = stream::empty::<u8>()
            .par_collect(|value| Ok::<_, ()>(value), |values| values.count())
            .await;
        assert_eq!(values, Ok(0));
    }
}
