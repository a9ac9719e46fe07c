pub use derivative::Derivative;
pub use futures::{
    stream::{Stream, StreamExt},
    FutureExt,
};
pub use std::{
    fmt::{self, Debug},
    future::Future,
    iter,
    marker::PhantomData,
    mem,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    thread,
};
pub use tokio_util::sync::CancellationToken;
pub use tracing::{debug, error, trace, warn};
