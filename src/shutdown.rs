//! Cancellation shared by all components of a transport instance.
//!
//! A [ShutdownToken] owns the stop signal and the handles of long-running background tasks
//!  (receive loops, the announce loop). Components get a [ShutdownSignal] through
//!  [ShutdownToken::subscribe] and check it in `select!` branches, so waiting operations
//!  (resend delays, acknowledgement waits, expiry timers) are interrupted rather than run to
//!  completion.

use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct ShutdownToken {
    stop_tx: watch::Sender<bool>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        let (stop_tx, _) = watch::channel(false);

        ShutdownToken {
            stop_tx,
            task_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            stop_rx: self.stop_tx.subscribe(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Idempotent
    pub fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Register a background task to be awaited on shutdown
    pub fn add_task(&self, handle: JoinHandle<()>) {
        self.task_handles.lock().unwrap().push(handle);
    }

    /// Await all registered background tasks, draining the handle list. Panics in the tasks
    ///  are logged and otherwise ignored.
    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = self.task_handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                debug!("background task terminated abnormally: {}", e);
            }
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The receiving side of a [ShutdownToken], cheap to clone
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    stop_rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Completes when the stop signal is sent, or when the token is dropped. This is
    ///  cancellation safe.
    pub async fn cancelled(&mut self) {
        let _ = self.stop_rx.wait_for(|stopped| *stopped).await;
    }
}
