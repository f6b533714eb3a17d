//! Send-or-drop queue helper.
//!
//! Every hop between pipeline stages is a bounded `tokio::sync::mpsc`
//! queue. A full queue drops the newest item and logs; a sender never
//! waits on a slow receiver.

use crate::MetricsContext;
use tokio::sync::mpsc::{error::TrySendError, Sender};
use tracing::{debug, warn};

/// Tries to enqueue `item` on `tx`.
///
/// Returns `true` if the item was queued. When the queue is full the
/// item is dropped with a warning naming `what`; when the receiver is
/// gone it is dropped at debug level (normal during shutdown).
pub fn try_forward<T>(tx: &Sender<T>, item: T, what: &str) -> bool {
    // ---
    try_forward_counted(tx, item, what, None)
}

/// [`try_forward`] that also counts full-queue drops.
pub fn try_forward_counted<T>(
    tx: &Sender<T>,
    item: T,
    what: &str,
    metrics: Option<&MetricsContext>,
) -> bool {
    // ---
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("{what} queue is full, dropping item");
            if let Some(m) = metrics {
                m.channel_full_drops_total.inc();
            }
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!("{what} queue is closed, dropping item");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_try_forward_drops_when_full() {
        // ---
        let (tx, mut rx) = mpsc::channel(2);
        assert!(try_forward(&tx, 1, "test"));
        assert!(try_forward(&tx, 2, "test"));
        assert!(!try_forward(&tx, 3, "test"));

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_try_forward_closed_receiver() {
        // ---
        let (tx, rx) = mpsc::channel::<u8>(1);
        drop(rx);
        assert!(!try_forward(&tx, 1, "test"));
    }

    #[tokio::test]
    async fn test_full_drop_is_counted() {
        // ---
        let metrics = MetricsContext::new("test").unwrap();
        let (tx, _rx) = mpsc::channel(1);
        assert!(try_forward_counted(&tx, 1, "test", Some(&metrics)));
        assert!(!try_forward_counted(&tx, 2, "test", Some(&metrics)));
        assert_eq!(metrics.channel_full_drops_total.get(), 1);
    }
}
