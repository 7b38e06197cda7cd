//! Coordinated graceful shutdown
//!
//! One controller fans a terminal signal out to every long-running
//! component. Cancellation is a first-class event, not an error: components
//! observe it, unwind cleanly, and return.

use tokio::sync::watch;
use tracing::warn;

/// Create a linked controller/signal pair
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownController { tx }, ShutdownSignal { rx })
}

/// Triggers shutdown for every signal cloned from this channel
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    /// Signal all components to stop
    pub fn shutdown(&self) {
        // Receivers may already be gone during teardown; that's fine
        let _ = self.tx.send(true);
    }
}

/// Cloneable handle components wait on
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown has been triggered
    ///
    /// Returns immediately when it already was; also resolves if the
    /// controller is dropped, so components never wait on a dead channel.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Block until SIGTERM or SIGINT, returning the signal's name
pub async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!(error = %e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
