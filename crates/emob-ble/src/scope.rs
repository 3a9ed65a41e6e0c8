//! Supervised task scope for BLE work
//!
//! Every connection driver, scan session and per-peer worker runs as its own
//! task spawned through a [`BleScope`]. A task that fails or panics is
//! logged and ends alone: it never cancels its siblings.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use emob_core::Result;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Task group passed into the scanner, client and server at construction
#[derive(Debug, Clone)]
pub struct BleScope {
    handle: Handle,
}

impl BleScope {
    /// Scope bound to an explicit runtime handle
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scope bound to the runtime this is called from
    ///
    /// Panics outside a tokio runtime, like [`Handle::current`].
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Spawn a named task; its failure is contained and logged
    pub fn spawn<F>(&self, name: impl Into<String>, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        self.handle.spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => debug!("Task {} finished", name),
                Ok(Err(e)) => warn!("Task {} failed: {}", name, e),
                Err(_) => error!("Task {} panicked", name),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emob_core::EmobError;

    #[tokio::test]
    async fn test_failing_task_does_not_affect_sibling() {
        let scope = BleScope::current();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let failing = scope.spawn("failing", async { Err(EmobError::transport("boom")) });
        let panicking = scope.spawn("panicking", async {
            if true {
                panic!("peer worker blew up");
            }
            Ok(())
        });
        let healthy = scope.spawn("healthy", async move {
            let _ = tx.send(7);
            Ok(())
        });

        failing.await.unwrap();
        panicking.await.unwrap();
        healthy.await.unwrap();
        assert_eq!(rx.await.unwrap(), 7);
    }
}
