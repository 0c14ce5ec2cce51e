/// Create a channel for publishing and awaiting changes to the number of opened connections.
pub(super) fn channel() -> (OpenedCountPublisher, OpenedCountSubscriber) {
    let (sender, receiver) = tokio::sync::watch::channel(0);
    (
        OpenedCountPublisher { sender },
        OpenedCountSubscriber { receiver },
    )
}

/// Struct used to publish the size of the pool's opened-set.
#[derive(Debug)]
pub(super) struct OpenedCountPublisher {
    sender: tokio::sync::watch::Sender<usize>,
}

impl OpenedCountPublisher {
    /// Publish a new count. Succeeds whether or not anyone is listening.
    pub(super) fn publish(&self, opened: usize) {
        self.sender.send_replace(opened);
    }

    pub(super) fn subscribe(&self) -> OpenedCountSubscriber {
        OpenedCountSubscriber {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Subscriber used to wait for the pool's opened-set to empty.
#[derive(Clone, Debug)]
pub(super) struct OpenedCountSubscriber {
    receiver: tokio::sync::watch::Receiver<usize>,
}

impl OpenedCountSubscriber {
    /// Get the latest count.
    pub(super) fn opened(&self) -> usize {
        *self.receiver.borrow()
    }

    /// Completes once no connections remain open.
    pub(super) async fn wait_for_empty(&mut self) {
        // The sender lives as long as the pool, so this only errs during teardown.
        let _ = self.receiver.wait_for(|opened| *opened == 0).await;
    }
}
