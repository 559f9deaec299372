//! Ledger access trait and the new-block subscription handle.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::IndexerError;
use crate::types::{LedgerBlock, RawLog};

/// Read-only, height-addressed access to the chain.
///
/// Implementations talk to a node (see `chaintrace-evm`'s JSON-RPC ledger) or
/// serve fixtures in tests. Failures surface as [`IndexerError::Rpc`] and are
/// treated as transient by the scanner.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current chain head.
    async fn chain_height(&self) -> Result<u64, IndexerError>;

    /// Block at `height` with its transactions, `None` if it does not exist yet.
    async fn block(&self, height: u64) -> Result<Option<LedgerBlock>, IndexerError>;

    /// Logs emitted by `tx_hash`, in log-index order.
    async fn transaction_logs(&self, tx_hash: &str) -> Result<Vec<RawLog>, IndexerError>;

    /// Subscribe to new-block notifications (block heights).
    async fn subscribe_new_blocks(&self) -> Result<BlockSubscription, IndexerError>;
}

type Canceller = Box<dyn FnOnce() + Send + Sync>;

/// A live stream of new-block heights.
///
/// Heights arrive in the order the ledger announces them and may skip or
/// repeat; consumers only rely on them as "something at or below this height
/// is available". Dropping the handle or calling [`cancel`](Self::cancel)
/// stops delivery.
pub struct BlockSubscription {
    rx: mpsc::UnboundedReceiver<u64>,
    on_cancel: Option<Canceller>,
}

impl BlockSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<u64>) -> Self {
        Self { rx, on_cancel: None }
    }

    /// A subscription plus the sender side that feeds it.
    pub fn channel() -> (mpsc::UnboundedSender<u64>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    /// Run `f` once when the subscription is cancelled or dropped.
    pub fn on_cancel(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }

    /// Wait for the next height. `None` once the producer is gone or the
    /// subscription was cancelled.
    pub async fn recv(&mut self) -> Option<u64> {
        self.rx.recv().await
    }

    /// Next queued height without waiting.
    pub fn try_recv(&mut self) -> Option<u64> {
        self.rx.try_recv().ok()
    }

    /// Drain every queued height and return the highest, if any.
    pub fn drain_max(&mut self) -> Option<u64> {
        let mut max = None;
        while let Some(h) = self.try_recv() {
            max = Some(max.map_or(h, |m: u64| m.max(h)));
        }
        max
    }

    /// Stop delivery. Heights already queued are discarded, so `recv`
    /// returns `None` from here on.
    pub fn cancel(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        if let Some(f) = self.on_cancel.take() {
            f();
        }
    }
}

impl Drop for BlockSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for BlockSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSubscription")
            .field("cancelled", &self.on_cancel.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn delivers_in_order() {
        let (tx, mut sub) = BlockSubscription::channel();
        tx.send(5).unwrap();
        tx.send(6).unwrap();
        assert_eq!(sub.recv().await, Some(5));
        assert_eq!(sub.recv().await, Some(6));
        drop(tx);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn drain_returns_highest() {
        let (tx, mut sub) = BlockSubscription::channel();
        for h in [3, 9, 4] {
            tx.send(h).unwrap();
        }
        assert_eq!(sub.drain_max(), Some(9));
        assert_eq!(sub.drain_max(), None);
    }

    #[tokio::test]
    async fn cancel_stops_delivery_and_runs_hook() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let (tx, sub) = BlockSubscription::channel();
        let mut sub = sub.on_cancel(move || flag.store(true, Ordering::SeqCst));

        tx.send(7).unwrap();
        tx.send(8).unwrap();
        sub.cancel();
        assert!(fired.load(Ordering::SeqCst));
        assert!(tx.send(1).is_err());
        assert_eq!(sub.try_recv(), None);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn drop_closes_channel() {
        let (tx, sub) = BlockSubscription::channel();
        drop(sub);
        assert!(tx.is_closed());
    }
}
