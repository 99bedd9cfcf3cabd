use futures::channel::oneshot;
use futures::future::{FutureExt as _, Shared};

/// Create a handle that requests shutdown and the signal observed by the
/// tunnel.
pub fn channel() -> (Shutdown, ShutdownSignal) {
    let (sender, receiver) = oneshot::channel();
    (
        Shutdown { sender },
        ShutdownSignal {
            receiver: receiver.shared(),
        },
    )
}

/// Requests shutdown when triggered or dropped.
#[derive(Debug)]
pub struct Shutdown {
    sender: oneshot::Sender<()>,
}

impl Shutdown {
    pub fn trigger(self) {
        let _ = self.sender.send(());
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: Shared<oneshot::Receiver<()>>,
}

impl ShutdownSignal {
    /// Resolves once shutdown was requested.
    pub async fn wait(&self) {
        let _ = self.receiver.clone().await;
    }

    pub fn is_triggered(&self) -> bool {
        self.receiver.clone().now_or_never().is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn trigger() {
        let (shutdown, signal) = channel();
        let waiting = async_std::task::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });
        assert!(!signal.is_triggered());
        shutdown.trigger();
        waiting.await;
        assert!(signal.is_triggered());
    }

    #[async_std::test]
    async fn drop_triggers() {
        let (shutdown, signal) = channel();
        drop(shutdown);
        signal.wait().await;
        assert!(signal.is_triggered());
    }
}
