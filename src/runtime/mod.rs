mod join_handle;
mod shutdown;

use std::{future::Future, time::Duration};

pub(crate) use self::{join_handle::AsyncJoinHandle, shutdown::ShutdownRequest};

/// Spawn a task in the background to run a future.
///
/// This must be called from an async block or function running on a runtime.
#[track_caller]
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Await on a future for a maximum amount of time before returning `None`.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Option<F::Output> {
    tokio::time::timeout(timeout, future).await.ok()
}
