//! Stream-multiplexing endpoint over a single tunnel socket.
//!
//! The controller side runs in [`Role::Client`] (opens substreams on
//! demand); a worker runs in [`Role::Server`] (accepts substreams). A
//! dedicated writer task owns the write half, a read loop owns the read
//! half and routes frames to per-stream channels.

pub mod protocol;
pub mod stream;
mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use self::protocol::{Frame, FrameCodec, MsgType};
use self::stream::{MuxStream, StreamShared};

/// Inbound data buffered per stream, in frames.
const DATA_CHANNEL_CAP: usize = 1024;
/// Inbound streams waiting in `accept`.
const ACCEPT_CHANNEL_CAP: usize = 64;
/// How long a liveness ping may stay unanswered.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Which side of the tunnel this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens substreams (controller side). Odd stream ids.
    Client,
    /// Accepts substreams (worker side). Even stream ids.
    Server,
}

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("endpoint closed")]
    Closed,
    #[error("ping timed out")]
    PingTimeout,
}

pub(crate) struct StreamEntry {
    /// `None` once the peer sent its FIN.
    data_tx: Option<mpsc::Sender<Bytes>>,
    shared: Arc<StreamShared>,
}

type StreamTable = Arc<Mutex<HashMap<u32, StreamEntry>>>;
type PingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;

/// One end of a multiplexed tunnel.
pub struct MuxEndpoint {
    frame_tx: mpsc::UnboundedSender<Frame>,
    streams: StreamTable,
    pending_pings: PingTable,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    next_stream_id: AtomicU32,
    ping_seq: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl MuxEndpoint {
    pub fn new<T>(io: T, role: Role) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Frame>();
        let (accept_tx, accept_rx) = mpsc::channel::<MuxStream>(ACCEPT_CHANNEL_CAP);

        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));
        let pending_pings: PingTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(writer::run(
            FramedWrite::new(write_half, FrameCodec),
            frame_rx,
        ));
        tokio::spawn(read_loop(
            FramedRead::new(read_half, FrameCodec),
            Arc::clone(&streams),
            Arc::clone(&pending_pings),
            accept_tx,
            frame_tx.clone(),
            Arc::clone(&closed),
        ));

        Self {
            frame_tx,
            streams,
            pending_pings,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_stream_id: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
            ping_seq: AtomicU64::new(0),
            closed,
        }
    }

    /// Open a new outbound substream.
    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Closed);
        }
        let id = self.next_stream_id.fetch_add(2, Ordering::AcqRel);
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAP);
        let shared = Arc::new(StreamShared::new());
        self.streams.lock().unwrap().insert(
            id,
            StreamEntry {
                data_tx: Some(data_tx),
                shared: Arc::clone(&shared),
            },
        );
        self.frame_tx
            .send(Frame::open(id))
            .map_err(|_| MuxError::Closed)?;
        Ok(MuxStream::new(
            id,
            shared,
            self.frame_tx.clone(),
            data_rx,
            Arc::clone(&self.streams),
        ))
    }

    /// Wait for the next inbound substream. `None` once the endpoint is done.
    pub async fn accept(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Round-trip liveness check.
    pub async fn ping(&self) -> Result<(), MuxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Closed);
        }
        let seq = self.ping_seq.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().unwrap().insert(seq, tx);

        let payload = Bytes::copy_from_slice(&seq.to_be_bytes());
        if self
            .frame_tx
            .send(Frame::control(MsgType::Ping, payload))
            .is_err()
        {
            self.pending_pings.lock().unwrap().remove(&seq);
            return Err(MuxError::Closed);
        }

        match tokio::time::timeout(PING_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MuxError::Closed),
            Err(_) => {
                self.pending_pings.lock().unwrap().remove(&seq);
                Err(MuxError::PingTimeout)
            }
        }
    }

    /// Number of currently tracked substreams. Observable, not authoritative.
    pub fn num_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Close the endpoint: send GoAway, fail every live stream and pending
    /// ping. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .frame_tx
            .send(Frame::control(MsgType::GoAway, Bytes::new()));
        teardown(&self.streams, &self.pending_pings);
    }
}

/// Fail and forget all streams and pending pings.
fn teardown(streams: &StreamTable, pending_pings: &PingTable) {
    let mut table = streams.lock().unwrap();
    for (_, entry) in table.drain() {
        entry.shared.fail();
    }
    drop(table);
    pending_pings.lock().unwrap().clear();
}

async fn read_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    streams: StreamTable,
    pending_pings: PingTable,
    accept_tx: mpsc::Sender<MuxStream>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    while let Some(result) = frames.next().await {
        let frame = match result {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "tunnel read failed");
                break;
            }
        };

        match frame.msg_type {
            MsgType::OpenStream => {
                if closed.load(Ordering::Acquire) {
                    let _ = frame_tx.send(Frame::reset(frame.stream_id));
                    continue;
                }
                let id = frame.stream_id;
                let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAP);
                let shared = Arc::new(StreamShared::new());
                let stream = MuxStream::new(
                    id,
                    Arc::clone(&shared),
                    frame_tx.clone(),
                    data_rx,
                    Arc::clone(&streams),
                );
                streams.lock().unwrap().insert(
                    id,
                    StreamEntry {
                        data_tx: Some(data_tx),
                        shared,
                    },
                );
                // Dropping the rejected stream unregisters it and resets
                // the peer's half.
                if accept_tx.try_send(stream).is_err() {
                    warn!(stream = id, "inbound stream rejected, accept queue full");
                }
            }

            MsgType::Data => {
                let mut table = streams.lock().unwrap();
                let mut kill = false;
                if let Some(entry) = table.get(&frame.stream_id) {
                    if let Some(tx) = &entry.data_tx {
                        match tx.try_send(frame.payload) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(
                                    stream = frame.stream_id,
                                    "peer overran receive window, resetting stream"
                                );
                                kill = true;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => kill = true,
                        }
                    }
                }
                if kill {
                    if let Some(entry) = table.remove(&frame.stream_id) {
                        entry.shared.fail();
                    }
                    drop(table);
                    let _ = frame_tx.send(Frame::reset(frame.stream_id));
                }
            }

            MsgType::WindowUpdate => {
                if frame.payload.len() == 4 {
                    let delta =
                        u32::from_be_bytes([frame.payload[0], frame.payload[1], frame.payload[2], frame.payload[3]]);
                    if let Some(entry) = streams.lock().unwrap().get(&frame.stream_id) {
                        entry.shared.grow_window(delta);
                    }
                }
            }

            MsgType::StreamEnd => {
                let mut table = streams.lock().unwrap();
                if let Some(entry) = table.get_mut(&frame.stream_id) {
                    entry.data_tx = None;
                    entry.shared.remote_fin.store(true, Ordering::Release);
                    if entry.shared.local_fin.load(Ordering::Acquire) {
                        table.remove(&frame.stream_id);
                    }
                }
            }

            MsgType::StreamReset => {
                if let Some(entry) = streams.lock().unwrap().remove(&frame.stream_id) {
                    entry.shared.fail();
                }
            }

            MsgType::Ping => {
                let _ = frame_tx.send(Frame::control(MsgType::Pong, frame.payload));
            }

            MsgType::Pong => {
                if frame.payload.len() == 8 {
                    let mut seq = [0u8; 8];
                    seq.copy_from_slice(&frame.payload);
                    let seq = u64::from_be_bytes(seq);
                    if let Some(tx) = pending_pings.lock().unwrap().remove(&seq) {
                        let _ = tx.send(());
                    }
                }
            }

            MsgType::GoAway => {
                debug!("peer closed the tunnel");
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
    teardown(&streams, &pending_pings);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn endpoint_pair() -> (MuxEndpoint, Arc<MuxEndpoint>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = MuxEndpoint::new(a, Role::Client);
        let server = Arc::new(MuxEndpoint::new(b, Role::Server));
        (client, server)
    }

    /// Accept every inbound stream and echo it until EOF.
    fn spawn_echo(server: Arc<MuxEndpoint>) {
        tokio::spawn(async move {
            while let Some(stream) = server.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = tokio::io::split(stream);
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                    let _ = wr.shutdown().await;
                });
            }
        });
    }

    #[tokio::test]
    async fn test_open_write_echo() {
        let (client, server) = endpoint_pair();
        spawn_echo(server);

        let mut stream = client.open_stream().unwrap();
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET / HTTP/1.0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_large_transfer_replenishes_windows() {
        let (client, server) = endpoint_pair();
        spawn_echo(server);

        // Several full windows in each direction.
        let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
        let stream = client.open_stream().unwrap();
        let (mut rd, mut wr) = tokio::io::split(stream);

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            wr.write_all(&payload).await.unwrap();
            wr.shutdown().await.unwrap();
        });
        let mut out = Vec::new();
        rd.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (client, server) = endpoint_pair();
        spawn_echo(server);
        client.ping().await.unwrap();
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_fails_on_dead_transport() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let client = MuxEndpoint::new(a, Role::Client);
        drop(b);
        // Let the read loop observe the dead transport.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (client, _server) = endpoint_pair();
        client.close();
        assert!(matches!(client.open_stream(), Err(MuxError::Closed)));
        // close is idempotent
        client.close();
    }

    #[tokio::test]
    async fn test_close_fails_live_streams() {
        let (client, server) = endpoint_pair();
        spawn_echo(server);
        let mut stream = client.open_stream().unwrap();
        client.close();
        let mut out = Vec::new();
        // Reader unblocks with EOF rather than hanging.
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_num_streams_tracks_lifecycle() {
        let (client, server) = endpoint_pair();
        spawn_echo(server);
        assert_eq!(client.num_streams(), 0);
        let s1 = client.open_stream().unwrap();
        let s2 = client.open_stream().unwrap();
        assert_eq!(client.num_streams(), 2);
        drop(s1);
        drop(s2);
        assert_eq!(client.num_streams(), 0);
    }

    #[tokio::test]
    async fn test_stream_ids_by_role() {
        let (client, server) = endpoint_pair();
        let c1 = client.open_stream().unwrap();
        let c2 = client.open_stream().unwrap();
        let s1 = server.open_stream().unwrap();
        assert_eq!(c1.id(), 1);
        assert_eq!(c2.id(), 3);
        assert_eq!(s1.id(), 2);
    }
}
