//! RPC framing over any byte stream

use crate::{FrameReceiver, FrameSender, TransportError, TransportResult};
use async_trait::async_trait;
use bytes::BytesMut;
use edgetunnel_proto::{RpcCodec, RpcFrame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Writes length-prefixed RPC frames to a byte stream
pub struct FramedSender<W> {
    inner: W,
    stream_id: u64,
    finished: bool,
}

impl<W> FramedSender<W> {
    pub fn new(inner: W, stream_id: u64) -> Self {
        Self {
            inner,
            stream_id,
            finished: false,
        }
    }
}

#[async_trait]
impl<W> FrameSender for FramedSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: &RpcFrame) -> TransportResult<()> {
        if self.finished {
            return Err(TransportError::StreamClosed);
        }

        let encoded = RpcCodec::encode(frame)?;
        self.inner.write_all(&encoded).await?;
        self.inner.flush().await?;

        trace!(
            stream_id = self.stream_id,
            id = frame.id,
            method = frame.body.method(),
            "Sent frame"
        );
        Ok(())
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reads length-prefixed RPC frames from a byte stream
pub struct FramedReceiver<R> {
    inner: R,
    stream_id: u64,
    closed: bool,
    // Buffer for accumulating received data for frame decoding
    recv_buffer: BytesMut,
}

impl<R> FramedReceiver<R> {
    pub fn new(inner: R, stream_id: u64) -> Self {
        Self {
            inner,
            stream_id,
            closed: false,
            recv_buffer: BytesMut::with_capacity(8192),
        }
    }
}

#[async_trait]
impl<R> FrameReceiver for FramedReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv_frame(&mut self) -> TransportResult<Option<RpcFrame>> {
        if self.closed {
            return Ok(None);
        }

        loop {
            if let Some(frame) = RpcCodec::decode(&mut self.recv_buffer)? {
                trace!(
                    stream_id = self.stream_id,
                    id = frame.id,
                    method = frame.body.method(),
                    "Received frame"
                );
                return Ok(Some(frame));
            }

            let read = self.inner.read_buf(&mut self.recv_buffer).await?;
            if read == 0 {
                self.closed = true;
                if self.recv_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::ProtocolError(
                    "Incomplete frame in buffer".to_string(),
                ));
            }
        }
    }
}
