//! Process shutdown signal shared by every in-flight run
//!
//! The driver owns the sender; runs hold receivers and check them between
//! steps. A dropped sender never counts as shutdown.

use tokio::sync::watch;

use crate::error::{PrescaleError, Result};

pub type ShutdownReceiver = watch::Receiver<bool>;

/// Create a shutdown channel, initially not signalled
pub fn channel() -> (watch::Sender<bool>, ShutdownReceiver) {
    watch::channel(false)
}

pub fn is_shutdown(rx: &ShutdownReceiver) -> bool {
    *rx.borrow()
}

/// Fail with [`PrescaleError::Cancelled`] once shutdown was signalled
pub fn check(rx: &ShutdownReceiver) -> Result<()> {
    if is_shutdown(rx) {
        Err(PrescaleError::Cancelled)
    } else {
        Ok(())
    }
}

/// Resolve when shutdown is signalled
pub async fn signalled(rx: &mut ShutdownReceiver) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signalled_resolves_on_send() {
        let (tx, mut rx) = channel();
        assert!(check(&rx).is_ok());

        let waiter = tokio::spawn(async move {
            signalled(&mut rx).await;
            rx
        });
        tx.send(true).unwrap();

        let rx = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(check(&rx), Err(PrescaleError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_not_shutdown() {
        let (tx, mut rx) = channel();
        drop(tx);

        let result = tokio::time::timeout(Duration::from_millis(50), signalled(&mut rx)).await;
        assert!(result.is_err());
        assert!(!is_shutdown(&rx));
    }
}
