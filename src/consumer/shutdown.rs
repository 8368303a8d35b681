//! Graceful shutdown management for the consumer

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shutdown progress of a consumer
#[derive(Debug)]
pub struct ShutdownState {
    /// Fired when shutdown begins
    token: CancellationToken,
    /// Whether shutdown is complete
    shutdown_complete: AtomicBool,
    /// Shutdown initiated timestamp
    shutdown_start: parking_lot::Mutex<Option<Instant>>,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            shutdown_complete: AtomicBool::new(false),
            shutdown_start: parking_lot::Mutex::new(None),
        }
    }

    /// Begin the shutdown process
    pub fn begin_shutdown(&self) {
        let mut start = self.shutdown_start.lock();
        if start.is_none() {
            *start = Some(Instant::now());
            info!("Shutdown initiated");
        }
        self.token.cancel();
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token fired by [`begin_shutdown`](Self::begin_shutdown)
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Complete the shutdown process
    pub fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::SeqCst);
        if let Some(start) = *self.shutdown_start.lock() {
            info!("Shutdown completed in {:?}", start.elapsed());
        }
    }

    /// Check if shutdown is complete
    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_state() {
        let state = ShutdownState::new();
        let token = state.token();

        assert!(!state.is_shutting_down());
        assert!(!state.is_shutdown_complete());

        state.begin_shutdown();
        assert!(state.is_shutting_down());
        assert!(token.is_cancelled());

        state.complete_shutdown();
        assert!(state.is_shutdown_complete());
    }
}
