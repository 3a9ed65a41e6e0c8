//! Busy-retry discipline for transport writes and notifications
//!
//! The radio rejects overlapping operations with a transient busy status.
//! [`RetryWriter`] re-issues the operation after a fixed backoff for as long
//! as the transport answers busy, and hands back any other status
//! untouched. The wait is a plain `tokio::time::sleep`, so dropping the
//! enclosing future cancels the loop without issuing another call.

use core::fmt;
use core::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::{EmobError, Result};

// ----------------------------------------------------------------------------
// Status Codes
// ----------------------------------------------------------------------------

pub const GATT_SUCCESS: i32 = 0;
pub const GATT_ERROR: i32 = 133;
pub const GATT_WRITE_REQUEST_BUSY: i32 = 201;
pub const GATT_FAILURE: i32 = 257;

/// Tri-state result of a characteristic write, descriptor write or notify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    /// Transient: the transport has an operation in flight
    Busy,
    /// Any other failure code
    Failure(i32),
}

impl GattStatus {
    /// Map a raw transport status code
    pub fn from_code(code: i32) -> Self {
        match code {
            GATT_SUCCESS => GattStatus::Success,
            GATT_WRITE_REQUEST_BUSY => GattStatus::Busy,
            other => GattStatus::Failure(other),
        }
    }

    /// Raw transport status code
    pub fn code(self) -> i32 {
        match self {
            GattStatus::Success => GATT_SUCCESS,
            GattStatus::Busy => GATT_WRITE_REQUEST_BUSY,
            GattStatus::Failure(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == GattStatus::Success
    }

    /// Convert to a result, treating anything but success as a write failure
    pub fn into_result(self) -> Result<()> {
        match self {
            GattStatus::Success => Ok(()),
            other => Err(EmobError::WriteFailed {
                status: other.code(),
            }),
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Success => f.write_str("success"),
            GattStatus::Busy => f.write_str("busy"),
            GattStatus::Failure(code) => write!(f, "failure({})", code),
        }
    }
}

// ----------------------------------------------------------------------------
// Retry Writer
// ----------------------------------------------------------------------------

/// Default wait between attempts while the transport is busy
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Default retry cap, about ten seconds at the default backoff
pub const DEFAULT_MAX_RETRIES: u32 = 100;

/// Wraps one transport operation in the busy-retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryWriter {
    backoff: Duration,
    max_retries: Option<u32>,
}

impl Default for RetryWriter {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_RETRY_BACKOFF,
            max_retries: Some(DEFAULT_MAX_RETRIES),
        }
    }
}

impl RetryWriter {
    /// `max_retries = None` retries for as long as the transport is busy
    pub fn new(backoff: Duration, max_retries: Option<u32>) -> Self {
        Self {
            backoff,
            max_retries,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.backoff(), config.max_retries)
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Run `operation` until it answers something other than busy
    ///
    /// Success and non-busy failures are returned as `Ok(status)`. Only
    /// hitting the retry cap is an error.
    pub async fn perform<F, Fut>(&self, mut operation: F) -> Result<GattStatus>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GattStatus>,
    {
        let mut retries: u32 = 0;
        loop {
            let status = operation().await;
            if status != GattStatus::Busy {
                if retries > 0 {
                    debug!("Transport ready after {} retries: {}", retries, status);
                }
                return Ok(status);
            }

            if let Some(max) = self.max_retries {
                if retries >= max {
                    warn!("Transport still busy after {} attempts, giving up", retries + 1);
                    return Err(EmobError::RetryExhausted {
                        attempts: retries + 1,
                    });
                }
            }

            debug!("waiting for gatt");
            tokio::time::sleep(self.backoff).await;
            retries += 1;
        }
    }

    /// Like [`perform`](Self::perform) but any non-success status is an error
    pub async fn write<F, Fut>(&self, operation: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GattStatus>,
    {
        self.perform(operation).await?.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn busy_then(
        busy: u32,
        last: GattStatus,
        calls: Arc<AtomicU32>,
    ) -> impl FnMut() -> futures::future::Ready<GattStatus> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(if n < busy { GattStatus::Busy } else { last })
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GattStatus::from_code(0), GattStatus::Success);
        assert_eq!(GattStatus::from_code(201), GattStatus::Busy);
        assert_eq!(GattStatus::from_code(133), GattStatus::Failure(133));
        assert_eq!(GattStatus::Failure(257).code(), 257);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_n_busy() {
        let calls = Arc::new(AtomicU32::new(0));
        let writer = RetryWriter::default();
        let start = Instant::now();

        let status = writer
            .perform(busy_then(5, GattStatus::Success, calls.clone()))
            .await
            .unwrap();

        assert_eq!(status, GattStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_returned_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let writer = RetryWriter::default();
        let start = Instant::now();

        let status = writer
            .perform(busy_then(0, GattStatus::Failure(GATT_ERROR), calls.clone()))
            .await
            .unwrap();

        assert_eq!(status, GattStatus::Failure(GATT_ERROR));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);

        let err = writer
            .write(busy_then(0, GattStatus::Failure(GATT_ERROR), Arc::new(AtomicU32::new(0))))
            .await
            .unwrap_err();
        assert_eq!(err, EmobError::WriteFailed { status: GATT_ERROR });
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let writer = RetryWriter::new(Duration::from_millis(100), Some(3));

        let err = writer
            .perform(busy_then(u32::MAX, GattStatus::Success, calls.clone()))
            .await
            .unwrap_err();

        assert_eq!(err, EmobError::RetryExhausted { attempts: 4 });
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_keeps_waiting() {
        let calls = Arc::new(AtomicU32::new(0));
        let writer = RetryWriter::new(Duration::from_millis(100), None);

        let status = writer
            .perform(busy_then(500, GattStatus::Success, calls.clone()))
            .await
            .unwrap();

        assert_eq!(status, GattStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 501);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_wait_stops_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let writer = RetryWriter::new(Duration::from_millis(100), None);
        let op = busy_then(u32::MAX, GattStatus::Success, calls.clone());

        let task = tokio::spawn(async move { writer.perform(op).await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        task.abort();
        let _ = task.await;
        let seen = calls.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }
}
