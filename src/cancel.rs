//! Cancellation signal shared between a lifecycle operation and whoever may
//! interrupt it (a deadline timer or a concurrent stop).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{AppError, Result};

/// Triggers cancellation. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes cancellation.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

pub fn cancellation_pair() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, Cancellation { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Cancel after `deadline` unless the returned task is aborted first.
    pub fn cancel_after(&self, deadline: Duration) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            log::warn!("Deadline of {:?} expired, cancelling", deadline);
            handle.cancel();
        })
    }
}

impl Cancellation {
    /// A token nobody can cancel.
    pub fn never() -> Self {
        let (_handle, cancel) = cancellation_pair();
        cancel
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if every handle is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AppError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning `Cancelled` if interrupted.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            () = self.cancelled() => Err(AppError::cancelled()),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn sleep_completes_without_cancel() {
        let (_handle, cancel) = cancellation_pair();
        assert!(cancel.sleep(Duration::from_millis(10)).await.is_ok());
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_interrupts_sleep() {
        let (handle, cancel) = cancellation_pair();
        let _timer = handle.cancel_after(Duration::from_millis(20));
        let started = tokio::time::Instant::now();
        let err = cancel.sleep(Duration::from_secs(30)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(cancel.check().is_err());
    }

    #[tokio::test]
    async fn dropped_handle_never_cancels() {
        let (handle, cancel) = cancellation_pair();
        drop(handle);
        assert!(cancel.sleep(Duration::from_millis(10)).await.is_ok());
    }
}
