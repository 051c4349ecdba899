//! RPC framing over HTTP/2 request/response bodies

use async_trait::async_trait;
use bytes::BytesMut;
use edgetunnel_proto::{RpcCodec, RpcFrame};
use edgetunnel_transport::{FrameReceiver, FrameSender, TransportError, TransportResult};
use h2::{RecvStream, SendStream};
use tracing::trace;

/// Request-body half of the control stream
pub struct H2FrameSender {
    send: SendStream<bytes::Bytes>,
    stream_id: u64,
    closed: bool,
}

impl H2FrameSender {
    pub fn new(send: SendStream<bytes::Bytes>, stream_id: u64) -> Self {
        Self {
            send,
            stream_id,
            closed: false,
        }
    }
}

#[async_trait]
impl FrameSender for H2FrameSender {
    async fn send_frame(&mut self, frame: &RpcFrame) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        let encoded = RpcCodec::encode(frame)?;

        // h2 queues beyond the window and flushes as capacity is granted
        self.send.reserve_capacity(encoded.len());
        self.send
            .send_data(encoded, false)
            .map_err(|e| TransportError::ConnectionError(format!("H2 send error: {}", e)))?;

        trace!("Sent frame {} on H2 stream {}", frame.id, self.stream_id);
        Ok(())
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }

        // Send empty data with END_STREAM flag
        self.send
            .send_data(bytes::Bytes::new(), true)
            .map_err(|e| TransportError::ConnectionError(format!("H2 finish error: {}", e)))?;

        self.closed = true;
        Ok(())
    }
}

/// Response-body half of the control stream
pub struct H2FrameReceiver {
    recv: RecvStream,
    stream_id: u64,
    closed: bool,
    recv_buffer: BytesMut,
}

impl H2FrameReceiver {
    pub fn new(recv: RecvStream, stream_id: u64) -> Self {
        Self {
            recv,
            stream_id,
            closed: false,
            recv_buffer: BytesMut::with_capacity(8192),
        }
    }
}

#[async_trait]
impl FrameReceiver for H2FrameReceiver {
    async fn recv_frame(&mut self) -> TransportResult<Option<RpcFrame>> {
        if self.closed && self.recv_buffer.is_empty() {
            return Ok(None);
        }

        loop {
            if let Some(frame) = RpcCodec::decode(&mut self.recv_buffer)? {
                trace!("Received frame {} on H2 stream {}", frame.id, self.stream_id);
                return Ok(Some(frame));
            }

            match self.recv.data().await {
                Some(Ok(data)) => {
                    // Release flow control capacity
                    let _ = self.recv.flow_control().release_capacity(data.len());
                    self.recv_buffer.extend_from_slice(&data);
                }
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(TransportError::ConnectionError(format!(
                        "H2 receive error: {}",
                        e
                    )));
                }
                None => {
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
}
