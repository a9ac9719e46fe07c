use par_collect::{prelude::*, FixedThreadPool};
use std::{collections::HashSet, thread, time::Duration};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // one thread per element
    let doubled: Vec<_> = (0..100)
        .par_map_collect(
            |value| {
                // pretend to do blocking work
                thread::sleep(Duration::from_millis(10));
                value * 2
            },
            |values| values.collect::<Vec<_>>(),
        )
        .wait()
        .unwrap();

    // the output is in input order
    let expect = (0..100).map(|value| value * 2).collect::<Vec<_>>();
    assert_eq!(doubled, expect);

    // a fixed pool of 4 workers bounds the concurrency
    let pool = FixedThreadPool::new((4, 128));
    let set = (1..=9)
        .par_collect_with(
            None,
            pool,
            |value| Ok::<_, ()>(value + 10),
            |values| values.collect::<HashSet<_>>(),
        )
        .wait()
        .unwrap();

    assert_eq!(set, (11..=19).collect::<HashSet<_>>());
}
