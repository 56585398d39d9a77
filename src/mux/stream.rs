//! A single multiplexed substream with byte-window flow control.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use super::protocol::{Frame, MAX_PAYLOAD};
use super::StreamEntry;

/// Initial flow-control window, per stream and direction.
pub const DEFAULT_WINDOW: u32 = 256 * 1024;

/// State shared between a `MuxStream` and the endpoint's read loop.
pub(crate) struct StreamShared {
    /// Bytes we may still send before the peer replenishes the window.
    pub(crate) send_window: AtomicU32,
    /// Woken when the window grows or the stream fails.
    pub(crate) write_waker: Mutex<Option<Waker>>,
    /// Peer reset the stream, or the endpoint died.
    pub(crate) reset: AtomicBool,
    pub(crate) local_fin: AtomicBool,
    pub(crate) remote_fin: AtomicBool,
}

impl StreamShared {
    pub(crate) fn new() -> Self {
        Self {
            send_window: AtomicU32::new(DEFAULT_WINDOW),
            write_waker: Mutex::new(None),
            reset: AtomicBool::new(false),
            local_fin: AtomicBool::new(false),
            remote_fin: AtomicBool::new(false),
        }
    }

    /// Replenish the send window and wake a suspended writer.
    pub(crate) fn grow_window(&self, delta: u32) {
        self.send_window.fetch_add(delta, Ordering::AcqRel);
        self.wake_writer();
    }

    /// Mark the stream unusable and wake a suspended writer.
    pub(crate) fn fail(&self) {
        self.reset.store(true, Ordering::Release);
        self.wake_writer();
    }

    fn wake_writer(&self) {
        if let Some(waker) = self.write_waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// One flow-controlled logical channel inside a tunnel.
///
/// Implements `AsyncRead`/`AsyncWrite`; used for exactly one client
/// request or connection and then dropped.
pub struct MuxStream {
    id: u32,
    shared: Arc<StreamShared>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    data_rx: mpsc::Receiver<Bytes>,
    read_buf: Bytes,
    /// Receive-window bytes consumed since the last WindowUpdate.
    consumed: u32,
    streams: Arc<Mutex<HashMap<u32, StreamEntry>>>,
}

impl MuxStream {
    pub(crate) fn new(
        id: u32,
        shared: Arc<StreamShared>,
        frame_tx: mpsc::UnboundedSender<Frame>,
        data_rx: mpsc::Receiver<Bytes>,
        streams: Arc<Mutex<HashMap<u32, StreamEntry>>>,
    ) -> Self {
        Self {
            id,
            shared,
            frame_tx,
            data_rx,
            read_buf: Bytes::new(),
            consumed: 0,
            streams,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn replenish_peer_window(&mut self) {
        if self.consumed >= DEFAULT_WINDOW / 2 {
            let _ = self
                .frame_tx
                .send(Frame::window_update(self.id, self.consumed));
            self.consumed = 0;
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                let chunk = this.read_buf.split_to(n);
                buf.put_slice(&chunk);
                this.consumed = this.consumed.saturating_add(n as u32);
                this.replenish_peer_window();
                return Poll::Ready(Ok(()));
            }
            match this.data_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.read_buf = chunk,
                // Peer FIN, peer reset, or endpoint closed: surface EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.local_fin.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let window = loop {
            if self.shared.reset.load(Ordering::Acquire) {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            let window = self.shared.send_window.load(Ordering::Acquire);
            if window > 0 {
                break window;
            }
            // Park, then re-check: a WindowUpdate or reset may have raced in
            // between the load above and the waker being stored.
            *self.shared.write_waker.lock().unwrap() = Some(cx.waker().clone());
            if self.shared.send_window.load(Ordering::Acquire) == 0
                && !self.shared.reset.load(Ordering::Acquire)
            {
                return Poll::Pending;
            }
        };

        let n = buf.len().min(window as usize).min(MAX_PAYLOAD);
        self.shared.send_window.fetch_sub(n as u32, Ordering::AcqRel);
        self.frame_tx
            .send(Frame::data(self.id, Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.shared.local_fin.swap(true, Ordering::AcqRel) {
            let _ = self.frame_tx.send(Frame::end(self.id));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.streams.lock().unwrap().remove(&self.id);

        let clean = self.shared.local_fin.load(Ordering::Acquire)
            && self.shared.remote_fin.load(Ordering::Acquire);
        if !clean && !self.shared.reset.load(Ordering::Acquire) {
            let _ = self.frame_tx.send(Frame::reset(self.id));
        }
    }
}
