//! A single live tunnel to one worker.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::mux::stream::MuxStream;
use crate::mux::{MuxEndpoint, MuxError, Role};

/// One reverse-dialed, multiplexed connection from a worker.
///
/// The pool exclusively owns it; the pinger and dispatcher only borrow it
/// for the duration of one operation. The age clock starts when the
/// multiplex endpoint is established, not when the TCP socket was accepted.
pub struct TunnelConnection {
    remote: SocketAddr,
    endpoint: MuxEndpoint,
    established_at: Instant,
}

impl TunnelConnection {
    pub fn new<T>(remote: SocketAddr, io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self {
            remote,
            endpoint: MuxEndpoint::new(io, Role::Client),
            established_at: Instant::now(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        self.endpoint.open_stream()
    }

    pub async fn ping(&self) -> Result<(), MuxError> {
        self.endpoint.ping().await
    }

    pub fn num_streams(&self) -> usize {
        self.endpoint.num_streams()
    }

    pub fn close(&self) {
        self.endpoint.close();
    }
}
