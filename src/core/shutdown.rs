//! Cooperative cancellation shared by long-running tasks.

use tokio::sync::watch;

/// Receiving half of a shutdown broadcast.
///
/// Cloned into every task that must observe cancellation: the agent
/// scheduler, its workers, the retrying transport and the server's backup
/// job. A dropped trigger never fires.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Sending half of a shutdown broadcast.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    /// Create a connected trigger/signal pair
    pub fn new() -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, ShutdownSignal { rx })
    }

    /// A signal that is never triggered
    pub fn never() -> ShutdownSignal {
        let (_trigger, signal) = Self::new();
        signal
    }

    /// Returns true once shutdown was requested
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is requested.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl ShutdownTrigger {
    /// Request shutdown of every connected signal
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}
