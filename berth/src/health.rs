//! Periodic health monitoring.
//!
//! The monitor runs on its own task and delegates each sweep to
//! [`AllocationEngine::health_sweep`], which owns all mutation. Failure
//! counting, escalation, and cleanup semantics live in the engine; this
//! module only provides the cadence and shutdown handling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::engine::AllocationEngine;

/// The health-monitor task.
pub struct HealthMonitor {
    engine: Arc<AllocationEngine>,
    interval: Duration,
}

impl HealthMonitor {
    /// Create a monitor sweeping every `interval`.
    #[must_use]
    pub fn new(engine: Arc<AllocationEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Run until the shutdown signal fires.
    ///
    /// The first sweep happens one full interval after startup; recovery has
    /// already validated state at that point.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let engine = Arc::clone(&self.engine);
                    // Sweeps probe ports and processes; keep them off the
                    // async worker threads.
                    let cleaned = tokio::task::spawn_blocking(move || engine.health_sweep())
                        .await
                        .unwrap_or(0);
                    if cleaned > 0 {
                        tracing::info!(cleaned, "health monitor cleaned up stale allocations");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("health monitor stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::engine::AllocateRequest;
    use crate::probe::{PortProber, ScriptedProber};
    use crate::process::{ProcessProbe, ScriptedProcessProbe};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_monitor_sweeps_until_escalation() {
        let prober = Arc::new(ScriptedProber::new());
        let process = Arc::new(ScriptedProcessProbe::new());
        let engine = Arc::new(
            crate::engine::AllocationEngine::builder(Catalog::builtin().unwrap())
                .prober(Arc::clone(&prober) as Arc<dyn PortProber>)
                .process(Arc::clone(&process) as Arc<dyn ProcessProbe>)
                .build(),
        );

        // An allocation whose port never comes up: three sweeps remove it.
        engine
            .allocate(
                &AllocateRequest::new("dev")
                    .with_instance_id("i1")
                    .with_pid(Some(700)),
            )
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = HealthMonitor::new(Arc::clone(&engine), Duration::from_millis(10));
        let task = tokio::spawn(monitor.run(shutdown_rx));

        // Plenty of 10ms intervals for the three failing sweeps.
        for _ in 0..100 {
            if engine.list_allocations().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(engine.list_allocations().is_empty());
    }
}
