//! Level-triggered async flag.
//!
//! A `Signal` is a boolean that tasks can wait on. It is built on
//! `tokio::sync::watch`, so any number of waiters observe a `set()` and a waiter
//! that arrives after the flag was raised returns immediately.
//!
//! ```
//! use daq_macroserver::signal::Signal;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let finished = Signal::new();
//! let waiter = finished.clone();
//! let task = tokio::spawn(async move { waiter.wait().await });
//! finished.set();
//! task.await.unwrap();
//! assert!(finished.wait_timeout(Duration::from_millis(10)).await);
//! # });
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Shared boolean flag with async waiting.
///
/// Cloning yields another handle to the same flag.
#[derive(Clone, Debug)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    /// Create a cleared signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Create a signal that starts raised.
    pub fn raised() -> Self {
        let signal = Self::new();
        signal.set();
        signal
    }

    /// Raise the flag and wake every waiter.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    /// Lower the flag.
    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    /// Current value of the flag.
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is raised.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until the flag is raised or `timeout` elapses.
    ///
    /// Returns `true` if the flag was raised.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
