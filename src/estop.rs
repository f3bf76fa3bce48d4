//! Shared emergency-stop flag.
//!
//! One flag is shared by the dispatch loop, the trigger wait path and the
//! motion driver's move-wait loop. It is backed by a `watch` channel so a
//! waiter can either poll [`EstopFlag::is_set`] at a check point or await
//! [`EstopFlag::wait`] inside a `select!`.

use std::sync::Arc;
use tokio::sync::watch;

/// Process-wide emergency stop, shared by clones.
#[derive(Clone)]
pub struct EstopFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl EstopFlag {
    /// Disengaged flag.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Engage or release the stop.
    pub fn set(&self, engaged: bool) {
        self.tx.send_replace(engaged);
    }

    /// Whether the stop is engaged.
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is engaged.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|engaged| *engaged).await.is_err() {
            // Sender lives as long as self; never reached.
            std::future::pending::<()>().await;
        }
    }
}

impl Default for EstopFlag {
    fn default() -> Self {
        Self::new()
    }
}
