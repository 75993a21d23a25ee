//! Cooperative shutdown signal.
//!
//! [`Shutdown`] is the trigger side (held by the Ctrl-C handler);
//! [`ShutdownSignal`] is the observer side, cloned into every task that must
//! stop.  Triggering is sticky: a signal created after the trigger fired
//! still reports it.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown.  Safe to call from any thread, any number of times.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.  Never resolves if every
    /// [`Shutdown`] handle is dropped without triggering.
    pub async fn triggered(&mut self) {
        let fired = self.rx.wait_for(|fired| *fired).await.is_ok();
        if !fired {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn(async move {
            signal.triggered().await;
        });
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake")
            .expect("waiter task");
    }

    #[tokio::test]
    async fn trigger_is_sticky() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();
        let mut late = shutdown.signal();
        assert!(late.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), late.triggered())
            .await
            .expect("already-triggered signal resolves immediately");
    }

    #[tokio::test]
    async fn dropped_trigger_never_fires() {
        let mut signal = Shutdown::new().signal();
        let res = tokio::time::timeout(Duration::from_millis(50), signal.triggered()).await;
        assert!(res.is_err());
    }
}
