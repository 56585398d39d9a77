//! Dispatcher: bridges local client connections onto tunnel streams.

use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::gate::HealthGate;
use crate::tunnel::pool::TunnelPool;

/// Accept loop for the internal forwarder listener.
///
/// Every accepted connection marks demand on the gate, takes the next
/// tunnel stream in round-robin order, and splices the two until either
/// direction ends. Request-level errors are logged quietly and never
/// propagate; a client that arrives before any tunnel is ready simply
/// hangs until one registers.
pub async fn run(
    listener: TcpListener,
    pool: Arc<TunnelPool>,
    gate: Arc<HealthGate>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("forwarder listener closing");
                return;
            }
            result = listener.accept() => {
                let (mut client, peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept forwarded connection");
                        continue;
                    }
                };
                debug!(peer = %peer, "forwarded connection accepted");
                gate.on_activity();

                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    let mut stream = match pool.get_stream().await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "unable to open tunnel stream");
                            return;
                        }
                    };
                    match copy_bidirectional(&mut client, &mut stream).await {
                        Ok((to_worker, from_worker)) => {
                            debug!(peer = %peer, to_worker, from_worker, "bridge closed");
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "bridge ended");
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SshIdentity;
    use crate::tunnel::pool;
    use crate::tunnel::testutil::{spawn_fake_worker, wait_for_pool_len};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_client_bytes_round_trip_through_worker() {
        let dir = tempfile::tempdir().unwrap();
        let identity =
            Arc::new(SshIdentity::generate(dir.path().join("authorized_keys")).unwrap());
        let tunnels = TunnelPool::new(Duration::from_secs(60), identity);

        let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_addr = tunnel_listener.local_addr().unwrap();
        tokio::spawn(pool::run_accept(
            Arc::clone(&tunnels),
            tunnel_listener,
            None,
        ));

        let fwd_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fwd_addr = fwd_listener.local_addr().unwrap();
        let gate = Arc::new(HealthGate::new(Duration::from_secs(55)));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run(
            fwd_listener,
            Arc::clone(&tunnels),
            Arc::clone(&gate),
            shutdown_rx,
        ));

        spawn_fake_worker(tunnel_addr, 0).await;
        wait_for_pool_len(&tunnels, 1).await;

        let mut client = TcpStream::connect(fwd_addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET / HTTP/1.0\r\n\r\n");
        assert!(gate.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let dir = tempfile::tempdir().unwrap();
        let identity =
            Arc::new(SshIdentity::generate(dir.path().join("authorized_keys")).unwrap());
        let tunnels = TunnelPool::new(Duration::from_secs(60), identity);

        let fwd_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fwd_addr = fwd_listener.local_addr().unwrap();
        let gate = Arc::new(HealthGate::new(Duration::from_secs(55)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(fwd_listener, tunnels, gate, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        // Listener is gone; new connections are refused.
        assert!(TcpStream::connect(fwd_addr).await.is_err());
    }
}
