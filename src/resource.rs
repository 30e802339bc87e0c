//! Resource Management
//!
//! Optional admission gate bounding the number of concurrent relay sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Caps concurrent relay sessions across all forward rules
#[derive(Debug)]
pub struct AdmissionGate {
    limit: usize,
    semaphore: Arc<Semaphore>,
    peak: AtomicUsize,
}

/// Slot held for the lifetime of one relay session
#[derive(Debug)]
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            peak: AtomicUsize::new(0),
        }
    }

    /// Try to take a session slot without waiting
    pub fn try_admit(&self) -> Option<SessionPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                let in_use = self.in_use();
                self.peak.fetch_max(in_use, Ordering::Relaxed);
                debug!("Admitted session, {} of {} slots in use", in_use, self.limit);
                Some(SessionPermit { _permit: permit })
            }
            Err(_) => {
                debug!("Session limit of {} reached", self.limit);
                None
            }
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Highest number of simultaneously admitted sessions seen
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}
