//! Recovery policies wrapped around transfer operations.
//!
//! Composition is outer to inner: authentication refresh, then digest
//! retry, then the bulkhead, then the operation itself. Each attempt
//! re-acquires its bulkhead permit, so a sleeping retry never holds a
//! connection slot. Transient faults are deliberately not retried here;
//! they surface to the caller, which may re-issue the whole transfer.

use std::sync::Arc;

use api_kit::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::client::Session;
use crate::errors::{Error, ErrorKind};

/// Caps the number of in-flight operations of one class.
#[derive(Debug, Clone)]
pub(crate) struct Bulkhead {
    permits: Arc<Semaphore>,
}

impl Bulkhead {
    pub(crate) fn new(limit: usize) -> Self {
        Bulkhead {
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Wait for a slot. Waiters queue without bound.
    pub(crate) async fn acquire(&self) -> OwnedSemaphorePermit {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .expect("bulkhead semaphore is never closed")
    }
}

impl Session {
    /// Run one operation attempt under the recovery policies.
    ///
    /// `attempt` is re-invoked after an authentication refresh or a digest
    /// mismatch, up to `retry_count` times per class; everything else
    /// surfaces unchanged. The attempt future itself should acquire the
    /// appropriate bulkhead permit first.
    pub(crate) async fn run_transfer<'f, T, F>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        attempt: F,
    ) -> Result<T, Error>
    where
        F: Fn() -> BoxFuture<'f, Result<T, Error>> + Send + 'f,
    {
        let retries = self.config().retry_count;
        let mut auth_attempts = 0u32;
        let mut hash_attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let seen = self.generation();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = attempt() => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match error.kind() {
                ErrorKind::Authentication => {
                    if auth_attempts >= retries {
                        return Err(Error::RetriesExhausted {
                            op,
                            attempts: auth_attempts,
                            last: Box::new(error),
                        });
                    }
                    auth_attempts += 1;
                    tracing::debug!(op, attempt = auth_attempts, "retrying after auth failure");

                    // Rejected credentials surface from here without retry.
                    self.reauthorize(seen).await?;
                    self.pause(auth_attempts, cancel).await?;
                }
                ErrorKind::InvalidHash => {
                    if hash_attempts >= retries {
                        return Err(Error::RetriesExhausted {
                            op,
                            attempts: hash_attempts,
                            last: Box::new(error),
                        });
                    }
                    hash_attempts += 1;
                    tracing::debug!(op, attempt = hash_attempts, "retrying after digest mismatch");
                    self.pause(hash_attempts, cancel).await?;
                }
                _ => return Err(error),
            }
        }
    }

    /// Sleep the backoff delay for this attempt, honoring cancellation.
    async fn pause(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), Error> {
        let delay = self.backoff().delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
