//! Per-tunnel liveness and expiry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::connection::TunnelConnection;
use super::pool::TunnelPool;

const PING_INTERVAL: Duration = Duration::from_millis(300);
/// A tunnel dying this close to (or past) its rotation deadline is normal
/// churn; anything earlier gets a warning.
const EARLY_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Liveness loop for one tunnel.
///
/// A failed ping means the tunnel is dead: it is removed and closed. Past
/// its lifetime the tunnel is only removed from rotation and left open so
/// in-flight streams drain; the worker goes away on its own timer and the
/// ping failure then closes it for good.
pub(crate) async fn run(pool: Arc<TunnelPool>, conn: Arc<TunnelConnection>, lifetime: Duration) {
    let mut expired = false;
    loop {
        if conn.ping().await.is_err() {
            if conn.age() + EARLY_CLOSE_GRACE < lifetime {
                warn!(
                    remote = %conn.remote_addr(),
                    age_secs = conn.age().as_secs(),
                    "tunnel closed early"
                );
            }
            pool.remove(&conn, true);
            return;
        }
        if !expired && conn.age() > lifetime {
            info!(
                remote = %conn.remote_addr(),
                streams = conn.num_streams(),
                "tunnel expired, draining"
            );
            pool.remove(&conn, false);
            expired = true;
        }
        tokio::time::sleep(PING_INTERVAL).await;
    }
}
