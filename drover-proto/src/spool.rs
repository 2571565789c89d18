//! Spooled wire: a background reader feeding an internal queue.
//!
//! Same external contract as [`crate::Wire`], but callers never touch the
//! transport directly: a dedicated task decodes boxes into a queue as they
//! arrive, and a write lock lets any number of tasks send without further
//! coordination. Box ordering and EOF semantics are unchanged.

use crate::error::ProtocolError;
use crate::frame;
use crate::message::Message;
use crate::transport::Transport;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Queue depth between the reader task and `recv` callers.
const SPOOL_CAPACITY: usize = 64;

/// A wire whose reads are serviced by a background task.
pub struct SpooledWire<T> {
    incoming: mpsc::Receiver<Result<Message, ProtocolError>>,
    writer: Mutex<WriteHalf<T>>,
    reader_task: JoinHandle<()>,
    /// Set once the queue has drained after a clean EOF.
    eof: bool,
}

impl<T: Transport + 'static> SpooledWire<T> {
    /// Splits the transport and spawns the reader task.
    pub fn new(transport: T) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let (tx, rx) = mpsc::channel(SPOOL_CAPACITY);
        let reader_task = tokio::spawn(read_loop(read_half, tx));
        Self {
            incoming: rx,
            writer: Mutex::new(write_half),
            reader_task,
            eof: false,
        }
    }

    /// Encodes `msg` and writes the whole frame under the write lock.
    ///
    /// Safe to call from several tasks; frames never interleave.
    pub async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        tracing::trace!(">> {:?}", msg);
        let encoded = frame::encode(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Returns the next queued box, or `None` on clean EOF (sticky).
    pub async fn recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        if self.eof {
            return Ok(None);
        }
        match self.incoming.recv().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e),
            None => {
                self.eof = true;
                Ok(None)
            }
        }
    }

    /// Stops the reader task and shuts down the write side.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.reader_task.abort();
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

impl<T> Drop for SpooledWire<T> {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Decodes boxes off the transport until EOF or error, pushing each into
/// the queue. Closing the channel without a trailing error is the clean-EOF
/// signal.
async fn read_loop<T: Transport>(
    mut read_half: ReadHalf<T>,
    tx: mpsc::Sender<Result<Message, ProtocolError>>,
) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        loop {
            match frame::decode(&mut buf) {
                Ok(Some(msg)) => {
                    tracing::trace!("<< {:?}", msg);
                    if tx.send(Ok(msg)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                if !buf.is_empty() {
                    let _ = tx.send(Err(ProtocolError::UnexpectedEof)).await;
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Err(ProtocolError::Io(e))).await;
                return;
            }
        }
    }
}
