//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::config::{Config, ListenerSpec};
use crate::gate::HealthGate;
use crate::identity::SshIdentity;
use crate::invoker::{LambdaInvoker, WorkerInvoker};
use crate::state::Controller;
use crate::tunnel::pool::{self, TunnelPool};
use crate::{forwarder, frontend, net, tunnel};

/// Run the full controller lifecycle after config has been parsed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tunnels = config.tunnels,
        rotate_secs = config.rotate_interval_secs,
        "rotor starting"
    );

    let listener_spec = ListenerSpec::parse(&config.listener_url)?;
    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let public_ip = match &config.public_ip {
        Some(ip) => ip.clone(),
        None => net::detect_public_ip(&http)
            .await
            .context("cannot determine public IP (set --public-ip to skip detection)")?,
    };
    info!(public_ip = %public_ip, "controller public address resolved");

    let ssh_user = config
        .ssh_user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .context("cannot determine SSH user (set --ssh-user)")?;
    let auth_path = match &config.authorized_keys {
        Some(path) => path.clone(),
        None => dirs::home_dir()
            .context("cannot locate home directory (set --authorized-keys)")?
            .join(".ssh")
            .join("authorized_keys"),
    };

    // Invoker setup and listener binds happen before the key install so a
    // fatal startup error leaves the authorized_keys file untouched.
    let invoker: Arc<dyn WorkerInvoker> = Arc::new(
        LambdaInvoker::new(&config)
            .await
            .context("worker invoker setup failed")?,
    );

    // Workers reach the tunnel listener by dialing localhost through the
    // reverse channel, so it only listens on loopback.
    let tunnel_listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("failed to bind tunnel listener")?;
    let tunnel_endpoint = format!("localhost:{}", tunnel_listener.local_addr()?.port());
    info!(endpoint = %tunnel_endpoint, "tunnel listener bound");

    let forwarder_listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("failed to bind forwarder listener")?;
    let forwarder_addr = forwarder_listener.local_addr()?;

    let frontend_listener = TcpListener::bind(listener_spec.bind_addr())
        .await
        .with_context(|| format!("failed to bind client listener on {}", config.listener_url))?;
    info!(
        addr = %frontend_listener.local_addr()?,
        authenticated = listener_spec.credentials().is_some(),
        "client listener bound"
    );

    let identity = Arc::new(
        SshIdentity::generate(auth_path).context("cannot install tunnel key")?,
    );

    let rotate = Duration::from_secs(config.rotate_interval_secs);
    let gate = Arc::new(HealthGate::new(Duration::from_secs(config.gate_window_secs())));
    let pool = TunnelPool::new(rotate, Arc::clone(&identity));
    let ssh_endpoint = format!("{}:{}", public_ip, config.ssh_port);

    let ctrl = Arc::new(Controller {
        config: Arc::new(config),
        identity,
        pool: Arc::clone(&pool),
        gate: Arc::clone(&gate),
        invoker,
        ssh_endpoint,
        tunnel_endpoint,
        ssh_user,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    handles.push(tokio::spawn(pool::run_accept(
        Arc::clone(&pool),
        tunnel_listener,
        Some(forwarder_addr),
    )));
    handles.push(tokio::spawn(forwarder::run(
        forwarder_listener,
        Arc::clone(&pool),
        Arc::clone(&gate),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(frontend::run(
        frontend_listener,
        forwarder_addr,
        listener_spec.credentials(),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(
        Arc::clone(&gate).run_monitor(shutdown_rx.clone()),
    ));
    handles.extend(tunnel::spawner::start_slots(&ctrl, &shutdown_rx));

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");

    // Stop new work first, then tear down the tunnels, the tunnel
    // listener, and the installed key.
    let _ = shutdown_tx.send(true);
    ctrl.pool.close();

    for handle in handles {
        let _ = handle.await;
    }

    info!("rotor stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
