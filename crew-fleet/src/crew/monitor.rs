//! Background loop: periodic health summary plus idle detection.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use super::LifecycleManager;

/// Used when the configured period is zero, which `interval` cannot take.
const FALLBACK_PERIOD: Duration = Duration::from_secs(1);

pub(crate) struct MonitorTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl MonitorTask {
    /// The loop holds only a weak reference, so an unused manager can still
    /// be dropped while its monitor is running.
    pub(crate) fn spawn(manager: Weak<LifecycleManager>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run(manager, period, cancel.clone()));
        Self { cancel, join }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Signal the loop and wait for it to exit.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "Crew monitor task ended abnormally");
        }
    }
}

async fn run(manager: Weak<LifecycleManager>, period: Duration, cancel: CancellationToken) {
    tick_loop(period, cancel, move || {
        let manager = manager.upgrade()?;
        Some(async move {
            manager.monitor_tick().await;
        })
    })
    .await
}

/// Call `tick` every `period` until cancelled or until `tick` returns `None`.
/// A panicking iteration is logged and the loop carries on.
async fn tick_loop<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Option<Fut>,
    Fut: Future<Output = ()>,
{
    let period = if period.is_zero() {
        tracing::warn!(
            fallback_secs = FALLBACK_PERIOD.as_secs(),
            "Crew monitor interval is zero, using fallback"
        );
        FALLBACK_PERIOD
    } else {
        period
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    tracing::info!(interval_ms = period.as_millis() as u64, "Crew monitor started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(iteration) = tick() else {
            break;
        };
        let iteration = AssertUnwindSafe(iteration).catch_unwind();
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = iteration => {
                if result.is_err() {
                    tracing::error!("Crew monitor iteration panicked, continuing on next tick");
                }
            }
        }
    }
    tracing::info!("Crew monitor stopped");
}
