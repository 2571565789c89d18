//! Transport abstraction.
//!
//! A transport is any duplex byte stream: a TCP socket to a remote slave, or
//! one end of an in-process pipe for tests and local slaves. The wire layer
//! is generic over it and the master stores connections type-erased.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Capability bundle for a duplex byte stream usable under a [`crate::Wire`].
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A type-erased transport, used where TCP and in-process connections mix.
pub type BoxedTransport = Box<dyn Transport>;

/// Buffer capacity of one direction of an in-process transport pair.
const LOCAL_PIPE_CAPACITY: usize = 64 * 1024;

/// Creates a connected in-process transport pair.
///
/// Bytes written to one end become readable on the other; dropping an end
/// surfaces as EOF to its peer, matching socket semantics.
pub fn local_pair() -> (BoxedTransport, BoxedTransport) {
    let (a, b) = tokio::io::duplex(LOCAL_PIPE_CAPACITY);
    (Box::new(a), Box::new(b))
}

/// Boxes a connected TCP stream for use alongside in-process transports.
pub fn from_tcp(stream: TcpStream) -> BoxedTransport {
    stream.set_nodelay(true).ok();
    Box::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_local_pair_duplex() {
        let (mut a, mut b) = local_pair();

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_local_pair_eof_on_drop() {
        let (mut a, b) = local_pair();
        drop(b);

        let mut buf = [0u8; 1];
        assert_eq!(a.read(&mut buf).await.unwrap(), 0);
    }
}
