//! Pool of live tunnels with round-robin stream allocation.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::identity::SshIdentity;
use crate::mux::stream::MuxStream;
use crate::mux::MuxError;
use crate::net;

use super::connection::TunnelConnection;
use super::pinger;

/// How long `get_stream` sleeps between checks while the pool is empty.
const WAIT_READY_DELAY: Duration = Duration::from_secs(1);
/// Backoff after a failed accept on the tunnel listener.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Ordered set of live tunnels plus the round-robin request counter.
///
/// The sequence only ever contains connections whose multiplex endpoint
/// came up; mutation is serialized by the writer lock, and the lock is
/// never held across an await point.
pub struct TunnelPool {
    conns: RwLock<Vec<Arc<TunnelConnection>>>,
    req_counter: AtomicU64,
    lifetime: Duration,
    identity: Arc<SshIdentity>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl TunnelPool {
    pub fn new(lifetime: Duration, identity: Arc<SshIdentity>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            conns: RwLock::new(Vec::new()),
            req_counter: AtomicU64::new(0),
            lifetime,
            identity,
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.conns.read().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<Arc<TunnelConnection>> {
        self.conns.read().unwrap().clone()
    }

    /// Insert a freshly established tunnel and spawn its pinger.
    pub fn register(self: &Arc<Self>, conn: Arc<TunnelConnection>) {
        if self.closed.load(Ordering::Acquire) {
            conn.close();
            return;
        }
        self.conns.write().unwrap().push(Arc::clone(&conn));
        tokio::spawn(pinger::run(
            Arc::clone(self),
            Arc::clone(&conn),
            self.lifetime,
        ));
        self.log_summary();
    }

    fn log_summary(&self) {
        let conns = self.conns.read().unwrap();
        info!(active = conns.len(), "tunnel pool updated");
        for (i, conn) in conns.iter().enumerate() {
            info!(
                tunnel = i + 1,
                remote = %conn.remote_addr(),
                age_secs = conn.age().as_secs(),
                streams = conn.num_streams(),
                "tunnel status"
            );
        }
    }

    /// Open a substream on the next tunnel in round-robin order.
    ///
    /// Waits for a tunnel to register when the pool is empty; an open
    /// failure on the selected tunnel is returned to the caller, which is
    /// expected to drop the request and try again with the next one.
    pub async fn get_stream(&self) -> Result<MuxStream, MuxError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(MuxError::Closed);
            }
            let picked = {
                let conns = self.conns.read().unwrap();
                if conns.is_empty() {
                    None
                } else {
                    let seq = self.req_counter.fetch_add(1, Ordering::AcqRel) as usize;
                    Some(Arc::clone(&conns[seq % conns.len()]))
                }
            };
            match picked {
                Some(conn) => return conn.open_stream(),
                None => {
                    debug!("no tunnel registered yet, waiting");
                    tokio::time::sleep(WAIT_READY_DELAY).await;
                }
            }
        }
    }

    /// Remove a tunnel, keyed by its remote address. Idempotent.
    pub fn remove(&self, conn: &TunnelConnection, close: bool) {
        {
            let mut conns = self.conns.write().unwrap();
            if let Some(pos) = conns
                .iter()
                .position(|c| c.remote_addr() == conn.remote_addr())
            {
                info!(remote = %conn.remote_addr(), "removing tunnel");
                conns.remove(pos);
            }
        }
        if close {
            info!(remote = %conn.remote_addr(), "closing tunnel");
            conn.close();
        }
    }

    /// Close every tunnel, stop the tunnel listener, and uninstall the
    /// one-shot SSH identity. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(active = self.len(), "closing tunnel pool");
        let drained: Vec<_> = self.conns.write().unwrap().drain(..).collect();
        for conn in &drained {
            info!(remote = %conn.remote_addr(), "closing tunnel");
            conn.close();
        }
        let _ = self.shutdown.send(true);
        if let Err(e) = self.identity.invalidate() {
            warn!(error = %e, "failed to uninstall tunnel key");
        }
    }
}

/// Accept loop for the tunnel listener: upgrade each inbound socket from
/// a worker to a client-role multiplex endpoint and register it.
///
/// When `forwarder` is set, each registration triggers a best-effort
/// egress-IP lookup routed through it, feeding the rolling set of
/// distinct worker IPs.
pub async fn run_accept(
    pool: Arc<TunnelPool>,
    listener: TcpListener,
    forwarder: Option<SocketAddr>,
) {
    let mut shutdown = pool.shutdown.subscribe();
    let seen_ips: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("tunnel listener closing");
                return;
            }
            result = listener.accept() => {
                match result {
                    Ok((sock, peer)) => {
                        if let Err(e) = sock.set_nodelay(true) {
                            debug!(remote = %peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        info!(remote = %peer, "accepted tunnel connection");
                        let conn = Arc::new(TunnelConnection::new(peer, sock));
                        pool.register(conn);

                        if let Some(fwd) = forwarder {
                            let seen = Arc::clone(&seen_ips);
                            tokio::spawn(observe_egress(fwd, seen));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept tunnel connection");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

async fn observe_egress(forwarder: SocketAddr, seen: Arc<Mutex<HashSet<String>>>) {
    match net::egress_ip_via(forwarder).await {
        Ok(ip) => {
            let unique = {
                let mut set = seen.lock().unwrap();
                set.insert(ip.clone());
                set.len()
            };
            info!(egress_ip = %ip, unique_egress_ips = unique, "worker egress address observed");
        }
        Err(e) => debug!(error = %e, "egress address lookup failed"),
    }
}
