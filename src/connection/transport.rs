//! Abstract duplex byte stream a hub connection runs over.
//!
//! Anything implementing tokio's `AsyncRead` / `AsyncWrite` qualifies, so a
//! `TcpStream` split or a `tokio::io::duplex` pair plugs in unchanged.

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::TRANSPORT_READ_BUFFER_SIZE;

/// Inbound half of a transport.
#[async_trait]
pub trait TransportReader: Send {
    /// Next chunk of bytes, or `None` at end of stream.
    async fn read(&mut self) -> io::Result<Option<Bytes>>;
}

/// Outbound half of a transport.
#[async_trait]
pub trait TransportWriter: Send {
    /// Write all of `data`, returning once it has been flushed.
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Signal end of stream to the peer.
    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<R> TransportReader for R
where
    R: AsyncRead + Unpin + Send,
{
    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(TRANSPORT_READ_BUFFER_SIZE);
        let n = self.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }
}

#[async_trait]
impl<W> TransportWriter for W
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await?;
        self.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }
}
