use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A handle to a spawned task. Unlike the tokio handle it wraps, awaiting it panics if
/// the task panicked, rather than surfacing a join error; driver tasks are not meant to
/// panic.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> AsyncJoinHandle<T> {
    #[track_caller]
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        AsyncJoinHandle(tokio::task::spawn(fut))
    }

    /// Stops the task, if it is still running.
    pub(crate) fn abort(&self) {
        self.0.abort();
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            #[allow(clippy::expect_used)]
            result.expect("task panicked or was aborted while being awaited")
        })
    }
}
