use tokio::sync::oneshot::{Receiver, Sender};
use tracing::debug;

/// A signal telling a component to stop.
#[derive(Debug)]
pub struct ShutdownSignal {
    /// When set, the receiver acknowledges completion through it.
    pub sender: Option<Sender<()>>,
}

/// Broadcasts shutdown signals to subscribed components and waits for each
/// to acknowledge.
pub struct ShutdownController {
    subscribers: Vec<Sender<ShutdownSignal>>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> ShutdownReceiver {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        self.subscribers.push(sender);
        ShutdownReceiver { receiver }
    }

    /// Signal every subscriber and wait for their acknowledgements.
    pub async fn signal_shutdown(self) {
        debug!("signaling shutdown to all subscribers");
        let mut acks = Vec::new();
        for sender in self.subscribers {
            let (responder, receiver) = tokio::sync::oneshot::channel();
            if sender
                .send(ShutdownSignal {
                    sender: Some(responder),
                })
                .is_ok()
            {
                acks.push(receiver);
            }
        }
        for ack in acks {
            if let Err(e) = ack.await {
                debug!("subscriber dropped before acknowledging shutdown: {:?}", e);
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for a shutdown signal from a [`ShutdownController`].
pub struct ShutdownReceiver {
    pub receiver: Receiver<ShutdownSignal>,
}

impl ShutdownReceiver {
    pub async fn wait_for_shutdown(self) -> Option<ShutdownSignal> {
        self.receiver.await.ok()
    }
}
