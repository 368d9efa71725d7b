//! Bounded-time readiness polling.
//!
//! Drives a backend from "provisioning" to "usable" by repeatedly invoking
//! a status probe, spaced by a check interval. Never busy-polls and never
//! outlives its timeout by more than one interval. Waits are cancellable so
//! teardown of an in-flight session interrupts the wait promptly instead of
//! letting it run out its budget.

use std::future::Future;
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Outcome of a single readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The backend is usable.
    Ready,
    /// Not usable yet; keep polling.
    NotReady(String),
    /// Unrecoverable; stop immediately, no further probes.
    Fatal(String),
}

/// Why a wait ended without the backend becoming ready.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The timeout elapsed with the probe still reporting not-ready.
    #[error("not ready after {waited:?} ({attempts} attempts), last: {last_reason}")]
    TimedOut {
        waited: Duration,
        attempts: u32,
        last_reason: String,
    },

    /// The probe reported an unrecoverable failure.
    #[error("{0}")]
    Fatal(String),

    /// The wait was interrupted by cancellation.
    #[error("wait cancelled")]
    Cancelled,
}

/// Generic bounded-time polling state machine.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessWaiter {
    pub timeout: Duration,
    pub check_interval: Duration,
}

impl ReadinessWaiter {
    pub fn new(timeout: Duration, check_interval: Duration) -> Self {
        Self {
            timeout,
            check_interval,
        }
    }

    /// Poll `check` until it reports ready, fatal, timeout, or cancellation.
    ///
    /// With a probe that never becomes ready this returns within
    /// `timeout + check_interval`.
    pub async fn wait<F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut check: F,
    ) -> Result<(), WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Readiness>,
    {
        let start = tokio::time::Instant::now();
        let mut attempts: u32 = 0;
        let mut last_reason = String::from("no probe completed");

        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }

            attempts += 1;
            match check().await {
                Readiness::Ready => {
                    debug!(
                        "{} ready after {} attempts over {:?}",
                        what,
                        attempts,
                        start.elapsed()
                    );
                    return Ok(());
                }
                Readiness::Fatal(reason) => return Err(WaitError::Fatal(reason)),
                Readiness::NotReady(reason) => {
                    debug!("{} not ready (attempt {}): {}", what, attempts, reason);
                    last_reason = reason;
                }
            }

            if start.elapsed() >= self.timeout {
                return Err(WaitError::TimedOut {
                    waited: start.elapsed(),
                    attempts,
                    last_reason,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_first_probe() {
        let waiter = ReadinessWaiter::new(Duration::from_secs(10), Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let result = waiter
            .wait("probe", &cancel, || async { Readiness::Ready })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_becomes_ready_after_retries() {
        let waiter = ReadinessWaiter::new(Duration::from_secs(10), Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_probe = calls.clone();
        let result = waiter
            .wait("probe", &cancel, move || {
                let calls = calls_probe.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Readiness::NotReady("warming up".to_string())
                    } else {
                        Readiness::Ready
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_terminates_within_budget() {
        let timeout = Duration::from_secs(5);
        let interval = Duration::from_millis(500);
        let waiter = ReadinessWaiter::new(timeout, interval);
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let result = waiter
            .wait("probe", &cancel, || async {
                Readiness::NotReady("still provisioning".to_string())
            })
            .await;

        assert!(matches!(result, Err(WaitError::TimedOut { .. })));
        assert!(start.elapsed() <= timeout + interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stops_immediately() {
        let waiter = ReadinessWaiter::new(Duration::from_secs(60), Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_probe = calls.clone();
        let start = tokio::time::Instant::now();
        let result = waiter
            .wait("probe", &cancel, move || {
                let calls = calls_probe.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Readiness::Fatal("Runtime failed to start".to_string())
                }
            })
            .await;

        match result {
            Err(WaitError::Fatal(reason)) => assert_eq!(reason, "Runtime failed to start"),
            other => panic!("expected fatal, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let waiter = ReadinessWaiter::new(Duration::from_secs(600), Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let cancel_later = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            cancel_later.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = waiter
            .wait("probe", &cancel, || async {
                Readiness::NotReady("never".to_string())
            })
            .await;

        assert!(matches!(result, Err(WaitError::Cancelled)));
        // interrupted long before the 600s budget
        assert!(start.elapsed() < Duration::from_secs(15));
    }
}
