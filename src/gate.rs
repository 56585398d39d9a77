//! Demand gate: pauses worker rotation when no client traffic arrives.
//!
//! Each rotation spawns a paid cloud invocation, so the spawn slots only
//! run while there is observed demand. All slots share one running flag;
//! a single pause stops all rotation cost at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Idle evaluations tolerated before rotation pauses.
const IDLE_STRIKE_LIMIT: u32 = 3;

struct GateInner {
    last_activity: Instant,
    idle_strikes: u32,
}

pub struct HealthGate {
    running: AtomicBool,
    window: Duration,
    inner: Mutex<GateInner>,
}

impl HealthGate {
    /// `window` is the idle gap that counts as a strike; sized one tick
    /// under the rotation interval so the gate reacts before the next
    /// slot would fire.
    pub fn new(window: Duration) -> Self {
        Self {
            running: AtomicBool::new(true),
            window,
            inner: Mutex::new(GateInner {
                last_activity: Instant::now(),
                idle_strikes: 0,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Record one accepted client connection.
    pub fn on_activity(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if !self.running.load(Ordering::Acquire) {
            self.running.store(true, Ordering::Release);
            inner.idle_strikes = 0;
            info!("client demand resumed, rotation enabled");
        } else if now.duration_since(inner.last_activity) >= self.window {
            inner.idle_strikes += 1;
            if inner.idle_strikes > IDLE_STRIKE_LIMIT {
                self.running.store(false, Ordering::Release);
                inner.idle_strikes = 0;
                info!("no sustained client demand, rotation paused");
            }
        } else {
            inner.idle_strikes = 0;
        }

        inner.last_activity = now;
    }

    /// One idle evaluation; the monitor loop calls this every window so a
    /// total absence of traffic also pauses rotation.
    pub(crate) fn tick_idle(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.last_activity.elapsed() >= self.window {
            inner.idle_strikes += 1;
            debug!(strikes = inner.idle_strikes, "idle window elapsed");
            if inner.idle_strikes > IDLE_STRIKE_LIMIT {
                self.running.store(false, Ordering::Release);
                inner.idle_strikes = 0;
                info!("no client demand, rotation paused");
            }
        }
    }

    pub async fn run_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.window) => self.tick_idle(),
                _ = shutdown.changed() => {
                    debug!("demand gate monitor stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(window_ms: u64) -> HealthGate {
        HealthGate::new(Duration::from_millis(window_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_dense_activity_keeps_running() {
        let g = gate(100);
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(40)).await;
            g.on_activity();
        }
        assert!(g.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sparse_activity_pauses_then_resumes() {
        let g = gate(100);
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(100)).await;
            g.on_activity();
            assert!(g.is_running());
        }
        tokio::time::advance(Duration::from_millis(100)).await;
        g.on_activity();
        assert!(!g.is_running());

        // The next accept re-opens the gate.
        g.on_activity();
        assert!(g.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_monitor_pauses_without_traffic() {
        let g = gate(100);
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(100)).await;
            g.tick_idle();
            assert!(g.is_running());
        }
        tokio::time::advance(Duration::from_millis(100)).await;
        g.tick_idle();
        assert!(!g.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_between_gaps_resets_strikes() {
        let g = gate(100);
        tokio::time::advance(Duration::from_millis(100)).await;
        g.on_activity(); // strike 1
        tokio::time::advance(Duration::from_millis(100)).await;
        g.on_activity(); // strike 2
        tokio::time::advance(Duration::from_millis(10)).await;
        g.on_activity(); // dense: strikes reset
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(100)).await;
            g.on_activity();
        }
        // Only three strikes since the reset; still running.
        assert!(g.is_running());
        tokio::time::advance(Duration::from_millis(100)).await;
        g.on_activity();
        assert!(!g.is_running());
    }
}
