//! Supervisor (C9): wires the entity bus (C3), destination updater (C6), and
//! MITM relay (C7) together, runs them concurrently, and restarts the whole
//! set on any fatal failure up to [`MAX_JPP_LOOP`] times.
//!
//! The original wires these three via mutable callback fields set up once at
//! startup and mutated in place on restart. Here each restart attempt gets a
//! fresh instance of everything (a fresh socket, a fresh bus connection): the
//! caller supplies an `attempt` closure that builds and runs one full pass,
//! returning when any of its tasks fails fatally. That keeps "never mutate
//! after startup" (see SPEC_FULL §9) — restarting means constructing new
//! instances, not resetting existing ones.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::BridgeError;

pub const MAX_JPP_LOOP: u32 = 10;
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Runs `attempt` until it succeeds, is cancelled, or has failed
/// [`MAX_JPP_LOOP`] times. `attempt` is expected to return only when the
/// supervised set (C3/C6/C7) has encountered a fatal error or the caller's
/// shutdown signal fired; a successful (`Ok`) return also ends the loop —
/// there's no supervised work left to restart.
pub async fn run<F, Fut>(mut attempt: F) -> Result<(), BridgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BridgeError>>,
{
    let mut restarts = 0u32;
    loop {
        match attempt().await {
            Ok(()) => {
                info!("supervised core exited cleanly");
                return Ok(());
            }
            Err(e) => {
                restarts += 1;
                error!(error = %e, restarts, max = MAX_JPP_LOOP, "core failed, restarting");
                if restarts >= MAX_JPP_LOOP {
                    error!("restart budget exhausted, giving up");
                    return Err(BridgeError::SupervisorExhausted(restarts));
                }
                warn!(delay_s = RESTART_DELAY.as_secs(), "pausing before restart");
                tokio::time::sleep(RESTART_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::error::RelayError;

    #[tokio::test]
    async fn succeeds_without_restarting_when_attempt_succeeds_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = run(|| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_on_failure_and_eventually_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = run(|| {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(BridgeError::Relay(RelayError::Fatal("boom".into())))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_jpp_loop_restarts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = run(|| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BridgeError::Relay(RelayError::Fatal("boom".into())))
            }
        })
        .await;
        match result {
            Err(BridgeError::SupervisorExhausted(n)) => assert_eq!(n, MAX_JPP_LOOP),
            other => panic!("expected SupervisorExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), MAX_JPP_LOOP);
    }
}
