use par_collect::{Dispatcher, HandleStatus, TaskError};
use std::{thread, time::Duration};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let dispatcher = Dispatcher::default();

    let handles: Vec<_> = (0..8)
        .map(|index| {
            dispatcher.submit_with_token(move |token| {
                if index == 3 {
                    return Err(format!("element {} is broken", index));
                }

                // long running work that checks for cancellation
                for _ in 0..1000 {
                    if token.is_cancelled() {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(index)
            })
        })
        .collect();
    dispatcher.stop();

    let cancellers: Vec<_> = handles.iter().map(|handle| handle.cancel_handle()).collect();
    let result = par_collect::combine(handles).wait();
    assert_eq!(result, Err(TaskError::Failed("element 3 is broken".to_string())));

    for (index, canceller) in cancellers.iter().enumerate() {
        let status = canceller.status();
        println!("task {}: {:?}", index, status);
        assert_ne!(status, HandleStatus::Pending);
    }
}
