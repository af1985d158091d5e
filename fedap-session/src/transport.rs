//! Transports are the byte streams a session runs over.
//!
//! A transport is nothing more than a reader and a writer plus a description of the peer for
//! logging.  Framing is layered on top by the session, so the same type serves the stdio case
//! (the whole process is handling a single client on stdin/stdout), TCP connections accepted by a
//! listener, and in-memory pipes in tests.

use std::fmt::{Debug, Formatter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A transport built from any pair of async streams, one for reading and one for writing
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
    peer: String,
}

impl<R, W> Debug for StreamTransport<R, W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, peer: impl Into<String>) -> Self {
        Self {
            reader,
            writer,
            peer: peer.into(),
        }
    }

    /// Who is on the other end, for logging only
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

/// The embedded case: one session over this process's stdin and stdout
pub type StdioTransport = StreamTransport<tokio::io::Stdin, tokio::io::Stdout>;

impl StdioTransport {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), "stdio")
    }
}

/// One accepted TCP connection
pub type TcpTransport = StreamTransport<OwnedReadHalf, OwnedWriteHalf>;

impl TcpTransport {
    pub fn tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (reader, writer) = stream.into_split();

        Self::new(reader, writer, peer)
    }
}
