use tokio::sync::oneshot;

/// An order for a worker to drain and stop, carrying the channel it reports
/// completion on. Dropping the request unblocks the waiter too, so a worker that
/// dies mid-drain never strands the caller.
#[derive(Debug)]
pub(crate) struct ShutdownRequest {
    done: oneshot::Sender<()>,
}

impl ShutdownRequest {
    /// A new request plus the completion the shutdown initiator awaits.
    pub(crate) fn channel() -> (ShutdownRequest, ShutdownComplete) {
        let (done, completion) = oneshot::channel();
        (ShutdownRequest { done }, ShutdownComplete(completion))
    }

    /// Signals that the worker finished draining.
    pub(crate) fn complete(self) {
        // The initiator may have stopped waiting; that is fine.
        let _ = self.done.send(());
    }
}

/// The initiator's half: resolves once the worker drained, or as soon as the
/// request was dropped unprocessed.
#[derive(Debug)]
pub(crate) struct ShutdownComplete(oneshot::Receiver<()>);

impl ShutdownComplete {
    pub(crate) async fn wait(self) {
        let _ = self.0.await;
    }
}
