//! Worker spawn slots: one rotation cadence per configured tunnel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gate::HealthGate;
use crate::invoker::WorkerInvoker;
use crate::state::Controller;

/// Delay between the first trigger of consecutive slots, so the initial
/// round of invocations does not stampede the invocation API.
const SLOT_STAGGER: Duration = Duration::from_secs(3);
/// How often a paused slot re-checks the health gate.
const GATE_POLL: Duration = Duration::from_secs(1);

/// Spawn the N slot tasks.
pub fn start_slots(ctrl: &Arc<Controller>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let payload = Arc::new(ctrl.worker_request().to_payload());
    let lifetime = Duration::from_secs(ctrl.config.rotate_interval_secs);

    (0..ctrl.config.tunnels)
        .map(|slot| {
            tokio::spawn(run_slot(
                slot,
                Arc::clone(&ctrl.gate),
                Arc::clone(&ctrl.invoker),
                Arc::clone(&payload),
                lifetime,
                SLOT_STAGGER * slot as u32,
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn run_slot(
    slot: usize,
    gate: Arc<HealthGate>,
    invoker: Arc<dyn WorkerInvoker>,
    payload: Arc<Vec<u8>>,
    lifetime: Duration,
    stagger: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(slot, "spawn slot starting");
    tokio::select! {
        _ = tokio::time::sleep(stagger) => {}
        _ = shutdown.changed() => return,
    }

    loop {
        // Wait for demand before burning an invocation.
        while !gate.is_running() {
            debug!(slot, "rotation paused, waiting for demand");
            tokio::select! {
                _ = tokio::time::sleep(GATE_POLL) => {}
                _ = shutdown.changed() => {
                    info!(slot, "spawn slot stopping");
                    return;
                }
            }
        }

        info!(slot, lifetime_secs = lifetime.as_secs(), "triggering worker");
        // Invocation failure is transient: the worker simply never dials
        // back and this slot tries again on its next tick.
        if let Err(e) = invoker.invoke(payload.as_ref().clone()).await {
            warn!(slot, error = %e, "worker invocation failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(lifetime) => {}
            _ = shutdown.changed() => {
                info!(slot, "spawn slot stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::InvokeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockInvoker {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WorkerInvoker for MockInvoker {
        async fn invoke(&self, _payload: Vec<u8>) -> Result<(), InvokeError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slot_fires_on_cadence_and_respects_gate() {
        let gate = Arc::new(HealthGate::new(Duration::from_millis(50)));
        let invoker = Arc::new(MockInvoker {
            count: AtomicUsize::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_slot(
            0,
            Arc::clone(&gate),
            invoker.clone() as Arc<dyn WorkerInvoker>,
            Arc::new(Vec::new()),
            Duration::from_millis(100),
            Duration::ZERO,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(350)).await;
        let while_running = invoker.count.load(Ordering::SeqCst);
        assert!(while_running >= 2, "expected repeated triggers, got {while_running}");

        // Four idle evaluations close the gate; the slot stops triggering.
        for _ in 0..4 {
            gate.tick_idle();
        }
        assert!(!gate.is_running());
        tokio::time::sleep(Duration::from_millis(400)).await;
        let while_paused = invoker.count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(invoker.count.load(Ordering::SeqCst) <= while_paused + 1);

        // Demand re-opens the gate and triggers resume.
        gate.on_activity();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(invoker.count.load(Ordering::SeqCst) > while_paused);

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_no_invocations_while_gate_closed_from_start() {
        let gate = Arc::new(HealthGate::new(Duration::from_millis(50)));
        for _ in 0..4 {
            gate.tick_idle();
        }
        assert!(!gate.is_running());

        let invoker = Arc::new(MockInvoker {
            count: AtomicUsize::new(0),
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_slot(
            0,
            Arc::clone(&gate),
            invoker.clone() as Arc<dyn WorkerInvoker>,
            Arc::new(Vec::new()),
            Duration::from_millis(100),
            Duration::ZERO,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(invoker.count.load(Ordering::SeqCst), 0);
    }
}
