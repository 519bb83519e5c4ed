//! Shutdown signalling shared by the background loops and blocked callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Cloneable one-shot signal. Once triggered it stays triggered.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    shutdown_signal: broadcast::Sender<()>,
    is_shutting_down: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_signal: shutdown_tx,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Returns `false` if the signal had already been triggered.
    pub fn trigger(&self) -> bool {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown_signal.send(());
        true
    }

    /// Resolves once [`trigger`](Self::trigger) was called.
    pub async fn wait(&self) {
        let mut rx = self.shutdown_signal.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
