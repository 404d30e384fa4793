//! Cooperative cancellation for long-running jobs.
//!
//! Every scan, check, and execution gets a token. Holders either poll
//! `is_cancelled` at loop boundaries or `select!` on a subscribed receiver
//! while waiting on subprocesses and streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    tx: broadcast::Sender<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Receiver that fires once when the token is cancelled.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_flips_flag_and_wakes_subscribers() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let mut rx = token.subscribe();
        token.cancel();
        assert!(token.is_cancelled());
        rx.recv().await.unwrap();
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
