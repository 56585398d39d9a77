//! Shared controller state passed to all subsystems.

use std::sync::Arc;

use crate::config::Config;
use crate::gate::HealthGate;
use crate::identity::SshIdentity;
use crate::invoker::{WorkerInvoker, WorkerRequest};
use crate::tunnel::pool::TunnelPool;

/// The process-wide singletons, constructed at startup and passed
/// explicitly to every task.
pub struct Controller {
    pub config: Arc<Config>,
    pub identity: Arc<SshIdentity>,
    pub pool: Arc<TunnelPool>,
    pub gate: Arc<HealthGate>,
    pub invoker: Arc<dyn WorkerInvoker>,
    /// Endpoint workers dial for the authenticated reverse channel
    /// (public_ip:ssh_port).
    pub ssh_endpoint: String,
    /// Tunnel listener endpoint as seen through that channel.
    pub tunnel_endpoint: String,
    /// Account workers authenticate as.
    pub ssh_user: String,
}

impl Controller {
    /// The invocation payload for one worker launch.
    pub fn worker_request(&self) -> WorkerRequest {
        WorkerRequest {
            ssh_endpoint: self.ssh_endpoint.clone(),
            tunnel_endpoint: self.tunnel_endpoint.clone(),
            private_key: self.identity.private_key_pem().to_string(),
            user: self.ssh_user.clone(),
        }
    }
}
