//! Progress reporting for transfers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A snapshot of a transfer, emitted after each flushed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes moved so far.
    pub bytes_transferred: u64,
    /// Total bytes the transfer will move.
    pub total_bytes: u64,
    /// Time elapsed since the transfer started.
    pub elapsed: Duration,
}

/// A progress observer. Called on the transfer task, so it must not block.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Byte accounting for one transfer, shared across its part tasks.
pub(crate) struct ProgressTracker {
    total: u64,
    transferred: AtomicU64,
    started: Instant,
    observer: Option<ProgressFn>,
}

impl ProgressTracker {
    pub(crate) fn new(total: u64, observer: Option<ProgressFn>) -> Self {
        ProgressTracker {
            total,
            transferred: AtomicU64::new(0),
            started: Instant::now(),
            observer,
        }
    }

    /// Account for `bytes` flushed and notify the observer.
    pub(crate) fn record(&self, bytes: u64) {
        let transferred = self.transferred.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.emit(transferred);
    }

    /// Restart accounting for an attempt that rewrites from the beginning.
    pub(crate) fn reset(&self) {
        self.transferred.store(0, Ordering::Relaxed);
    }

    /// Bytes recorded so far.
    pub(crate) fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    fn emit(&self, transferred: u64) {
        if let Some(observer) = &self.observer {
            observer(Progress {
                bytes_transferred: transferred,
                total_bytes: self.total,
                elapsed: self.started.elapsed(),
            });
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total", &self.total)
            .field("transferred", &self.transferred)
            .finish()
    }
}
