//! Dedicated frame writer task.
//!
//! All frame writes go through one channel to a single task owning the
//! write half of the tunnel socket, avoiding contention on the sink.

use futures_util::SinkExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tracing::debug;

use super::protocol::{Frame, FrameCodec, MsgType};

pub(crate) async fn run<W>(mut sink: FramedWrite<W, FrameCodec>, mut rx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = rx.recv().await {
        let last = frame.msg_type == MsgType::GoAway;
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "tunnel write failed");
            break;
        }
        if last {
            break;
        }
    }
    debug!("tunnel writer exiting");
    let _ = sink.into_inner().shutdown().await;
}
