//! Backpressure control for the consumer
//!
//! The consume loop takes a permit before pulling the next message, so no
//! more than `max_inflight` messages are ever being dispatched.

use crate::error::{RotorError, RotorResult};
use crate::poll::{Poll, PollState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bounded work queue
#[derive(Debug, Clone)]
pub struct BackpressureController {
    /// Maximum number of inflight messages
    max_inflight: usize,
    /// Current inflight count
    inflight: Arc<AtomicUsize>,
    /// Semaphore for limiting concurrency
    semaphore: Arc<Semaphore>,
}

impl BackpressureController {
    /// Create a new backpressure controller
    pub fn new(max_inflight: usize) -> Self {
        let max_inflight = max_inflight.max(1);
        Self {
            max_inflight,
            inflight: Arc::new(AtomicUsize::new(0)),
            semaphore: Arc::new(Semaphore::new(max_inflight)),
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> RotorResult<BackpressurePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RotorError::Kafka("work queue is closed".into()))?;
        Ok(self.permit(permit))
    }

    /// Take a slot if one is free
    pub fn try_acquire(&self) -> Option<BackpressurePermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.permit(permit))
    }

    fn permit(&self, permit: OwnedSemaphorePermit) -> BackpressurePermit {
        let count = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Acquired permit, inflight: {}/{}", count, self.max_inflight);
        BackpressurePermit {
            _permit: permit,
            inflight: self.inflight.clone(),
        }
    }

    /// Messages currently being processed
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Configured limit
    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    /// Stop handing out permits
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Wait until nothing is in flight, at most `timeout`
    pub async fn on_idle(&self, timeout: Duration) -> PollState {
        let inflight = self.inflight.clone();
        Poll::new(Duration::from_millis(50))
            .with_deadline(timeout)
            .until(move || {
                if inflight.load(Ordering::SeqCst) == 0 {
                    PollState::Succeeded
                } else {
                    PollState::Pending
                }
            })
            .await
    }
}

/// Slot in the work queue, released on drop
#[derive(Debug)]
pub struct BackpressurePermit {
    _permit: OwnedSemaphorePermit,
    inflight: Arc<AtomicUsize>,
}

impl Drop for BackpressurePermit {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limits_inflight() {
        let controller = BackpressureController::new(2);
        let a = controller.acquire().await.unwrap();
        let _b = controller.acquire().await.unwrap();
        assert_eq!(controller.inflight(), 2);
        assert!(controller.try_acquire().is_none());

        drop(a);
        assert_eq!(controller.inflight(), 1);
        assert!(controller.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_on_idle() {
        let controller = BackpressureController::new(4);
        let permit = controller.acquire().await.unwrap();
        assert!(matches!(
            controller.on_idle(Duration::from_millis(60)).await,
            PollState::Failed(_)
        ));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(permit);
        });
        assert_eq!(controller.on_idle(Duration::from_secs(5)).await, PollState::Succeeded);
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let controller = BackpressureController::new(1);
        controller.close();
        assert!(controller.acquire().await.is_err());
    }
}
