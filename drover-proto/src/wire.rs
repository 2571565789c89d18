//! Box-level duplex channel over a transport.

use crate::error::ProtocolError;
use crate::frame;
use crate::message::Message;
use crate::transport::Transport;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Initial capacity of the read buffer.
const READ_BUFFER_SIZE: usize = 8192;

/// Sends and receives whole boxes over a transport, buffering partial reads.
///
/// Reads are buffered across calls: bytes beyond one frame are retained for
/// the next [`Wire::recv`], so several boxes arriving in one underlying read
/// are delivered one at a time, in order.
pub struct Wire<T> {
    transport: T,
    read_buf: BytesMut,
}

impl<T: Transport> Wire<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Encodes `msg` and writes the whole frame before returning.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        tracing::trace!(">> {:?}", msg);
        let encoded = frame::encode(msg)?;
        self.transport.write_all(&encoded).await?;
        self.transport.flush().await?;
        Ok(())
    }

    /// Reads the next box, blocking until one is complete.
    ///
    /// Returns `Ok(None)` on a clean EOF (no partial frame pending). EOF in
    /// the middle of a frame is [`ProtocolError::UnexpectedEof`], never a
    /// silently truncated box.
    pub async fn recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            // Drain the buffer before touching the transport.
            if let Some(msg) = frame::decode(&mut self.read_buf)? {
                tracing::trace!("<< {:?}", msg);
                return Ok(Some(msg));
            }

            let n = self.transport.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::UnexpectedEof);
            }
        }
    }

    /// Shuts down the write side of the transport.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.transport.shutdown().await?;
        Ok(())
    }

    /// Consumes the wire, returning the transport and any buffered bytes.
    pub fn into_parts(self) -> (T, BytesMut) {
        (self.transport, self.read_buf)
    }
}
