//! Client-facing relay.
//!
//! The proxy protocol itself is terminated by the worker's proxy engine;
//! this listener only authenticates clients against the credentials from
//! the listener URL, strips the Proxy-Authorization header, and relays
//! the raw bytes to the internal forwarder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Largest request head we accept before bridging.
const MAX_HEAD: usize = 16 * 1024;
/// How long a client may take to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

const PROXY_AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
    Proxy-Authenticate: Basic realm=\"rotor\"\r\nContent-Length: 0\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";

pub async fn run(
    listener: TcpListener,
    forwarder: SocketAddr,
    auth: Option<(String, String)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let auth = Arc::new(auth.map(|(user, pass)| format!("{user}:{pass}")));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("client listener closing");
                return;
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept client connection");
                        continue;
                    }
                };
                debug!(peer = %peer, "client connection accepted");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                }
                let auth = Arc::clone(&auth);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, forwarder, auth).await {
                        debug!(peer = %peer, error = %e, "client connection ended");
                    }
                });
            }
        }
    }
}

async fn handle_client(
    mut client: TcpStream,
    forwarder: SocketAddr,
    auth: Arc<Option<String>>,
) -> std::io::Result<()> {
    let head = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut client)).await {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) => {
            client.write_all(BAD_REQUEST).await?;
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!("client request head timed out");
            return Ok(());
        }
    };

    let (stripped, credentials) = strip_proxy_auth(&head);
    if let Some(expected) = &*auth {
        if credentials.as_deref() != Some(expected.as_str()) {
            client.write_all(PROXY_AUTH_REQUIRED).await?;
            return Ok(());
        }
    }

    let mut upstream = TcpStream::connect(forwarder).await?;
    upstream.write_all(&stripped).await?;
    copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Read until the end of the request head; returns everything read so
/// far (head plus any early body bytes). `None` when the head is
/// oversized or the client hangs up first.
async fn read_head(client: &mut TcpStream) -> std::io::Result<Option<BytesMut>> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if client.read_buf(&mut buf).await? == 0 {
            return Ok(None);
        }
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(Some(buf));
        }
        if buf.len() > MAX_HEAD {
            return Ok(None);
        }
    }
}

/// Remove the Proxy-Authorization header from the request head, returning
/// the rewritten bytes and the decoded `user:pass` credentials, if any.
fn strip_proxy_auth(data: &BytesMut) -> (Vec<u8>, Option<String>) {
    let head_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .unwrap_or(data.len());
    let (head, body) = data.split_at(head_end);

    let mut credentials = None;
    let mut rewritten = Vec::with_capacity(data.len());
    for line in head.split_inclusive(|&b| b == b'\n') {
        let text = String::from_utf8_lossy(line);
        if text.to_ascii_lowercase().starts_with("proxy-authorization:") {
            let value = text[text.find(':').unwrap_or(0) + 1..].trim();
            let encoded = value
                .strip_prefix("Basic ")
                .or_else(|| value.strip_prefix("basic "));
            if let Some(encoded) = encoded {
                if let Ok(decoded) = BASE64.decode(encoded.trim()) {
                    credentials = Some(String::from_utf8_lossy(&decoded).into_owned());
                }
            }
            continue;
        }
        rewritten.extend_from_slice(line);
    }
    rewritten.extend_from_slice(body);
    (rewritten, credentials)
}
