//! Byte streams under the frame codec.
//!
//! A connection picks plain or compressed once, right after the handshake,
//! and keeps it for its whole life.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::Result;
use crate::utils::compression::Lz4BlockCodec;

/// Read buffer size of plain connections.
pub const PLAIN_BUFFER_SIZE: usize = 4096;

/// Read side of a connection.
pub enum InboundStream<R> {
    Plain(BufReader<R>),
    Compressed(FramedRead<BufReader<R>, Lz4BlockCodec>),
}

impl<R: AsyncRead + Unpin> InboundStream<R> {
    /// Wrap a reader that already finished the handshake. Bytes it buffered
    /// during the handshake are kept.
    pub fn new(reader: BufReader<R>, compressed: bool) -> Self {
        if compressed {
            InboundStream::Compressed(FramedRead::new(reader, Lz4BlockCodec))
        } else {
            InboundStream::Plain(reader)
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, InboundStream::Compressed(_))
    }

    /// Append whatever is available to `buf`. `Ok(0)` is end of stream.
    pub async fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize> {
        match self {
            InboundStream::Plain(reader) => Ok(reader.read_buf(buf).await?),
            InboundStream::Compressed(framed) => loop {
                match framed.next().await {
                    // an empty block is not end of stream
                    Some(Ok(block)) if block.is_empty() => continue,
                    Some(Ok(block)) => {
                        buf.extend_from_slice(&block);
                        return Ok(block.len());
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(0),
                }
            },
        }
    }

    pub fn into_inner(self) -> R {
        match self {
            InboundStream::Plain(reader) => reader.into_inner(),
            InboundStream::Compressed(framed) => framed.into_inner().into_inner(),
        }
    }
}

/// Write side of a connection.
pub enum OutboundStream<W> {
    Plain(BufWriter<W>),
    Compressed(FramedWrite<W, Lz4BlockCodec>),
}

impl<W: AsyncWrite + Unpin> OutboundStream<W> {
    pub fn new(writer: W, compressed: bool) -> Self {
        if compressed {
            OutboundStream::Compressed(FramedWrite::new(writer, Lz4BlockCodec))
        } else {
            OutboundStream::Plain(BufWriter::with_capacity(PLAIN_BUFFER_SIZE, writer))
        }
    }

    /// Write one encoded frame and flush it.
    pub async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        match self {
            OutboundStream::Plain(writer) => {
                writer.write_all(&frame).await?;
                writer.flush().await?;
            }
            OutboundStream::Compressed(framed) => framed.send(frame).await?,
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            OutboundStream::Plain(writer) => writer.shutdown().await?,
            OutboundStream::Compressed(framed) => framed.get_mut().shutdown().await?,
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn roundtrip(compressed: bool) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut out = OutboundStream::new(client, compressed);
        let mut inbound = InboundStream::new(BufReader::new(server), compressed);

        let payload = Bytes::from(vec![9u8; 10_000]);
        out.write_frame(payload.clone()).await.unwrap();
        out.shutdown().await.unwrap();

        let mut buf = BytesMut::new();
        while inbound.read_into(&mut buf).await.unwrap() > 0 {}
        assert_eq!(buf.freeze(), payload);
    }

    #[tokio::test]
    async fn test_plain_stream() {
        roundtrip(false).await;
    }

    #[tokio::test]
    async fn test_compressed_stream() {
        roundtrip(true).await;
    }
}
