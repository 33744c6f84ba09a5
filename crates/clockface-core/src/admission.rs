//! Load-shedding admission control for verification jobs.
//!
//! Jobs either get a slot immediately or are refused with
//! [`CapacityError::Busy`]; nothing is queued. A slot is held by an
//! [`AdmissionTicket`] and returned when the ticket drops, so every exit path
//! (success, failure, early return, panic unwind) releases exactly once.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Default number of concurrently running verification jobs.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error("service busy: {max_concurrent} verifications already in flight")]
    Busy { max_concurrent: usize },
    #[error("admission controller closed")]
    Closed,
}

#[derive(Debug)]
pub struct AdmissionController {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl AdmissionController {
    /// `max_concurrent` of 0 is raised to 1.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Take a slot or fail immediately.
    pub fn try_acquire(&self) -> Result<AdmissionTicket, CapacityError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                tracing::trace!(in_flight = self.in_flight(), "admission granted");
                Ok(AdmissionTicket { _permit: permit })
            }
            Err(TryAcquireError::NoPermits) => {
                tracing::warn!(max = self.max_concurrent, "admission rejected: at capacity");
                Err(CapacityError::Busy {
                    max_concurrent: self.max_concurrent,
                })
            }
            Err(TryAcquireError::Closed) => Err(CapacityError::Closed),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }

    /// Refuse all future acquisitions. Outstanding tickets stay valid.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Wait for every outstanding ticket to be released, for at most
    /// `timeout`. Returns `false` if jobs were still running when it expired.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            let mut ticker = tokio::time::interval(IDLE_POLL_INTERVAL);
            while self.in_flight() > 0 {
                ticker.tick().await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

/// Proof of an admitted job. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "dropping the ticket releases the slot immediately"]
pub struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionTicket {
    /// Release the slot explicitly. Equivalent to dropping the ticket.
    pub fn release(self) {}
}
