//! Connection preamble, version exchange and endpoint identity.
//!
//! A connecting node opens with the preamble (magic plus a header word
//! carrying its protocol version and the compression flag). The acceptor then
//! writes its own max version, and the connecting node answers with its max
//! version followed by its endpoint identity. Everything after that is framed
//! messages, optionally inside the compressed block stream.
//!
//! All reads here are exact and fail with [`ProtocolError::HandshakeError`]
//! or an I/O error; none of them buffer past what they need.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::config::PROTOCOL_MAGIC;
use crate::error::{constants, ProtocolError, Result};

const COMPRESSION_BIT: i32 = 1 << 2;
const VERSION_SHIFT: i32 = 8;
const VERSION_MASK: i32 = 0xFF;

const IPV4_IDENTITY_LEN: u8 = 4 + 2;
const IPV6_IDENTITY_LEN: u8 = 16 + 2;

/// What a connecting node announces before the version exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub version: i32,
    pub compressed: bool,
}

impl Preamble {
    pub fn new(version: i32, compressed: bool) -> Self {
        Self {
            version,
            compressed,
        }
    }

    /// Pack into the header word: version in bits 8..15, compression in bit 2.
    pub fn header(&self) -> i32 {
        let mut header = (self.version & VERSION_MASK) << VERSION_SHIFT;
        if self.compressed {
            header |= COMPRESSION_BIT;
        }
        header
    }

    pub fn from_header(header: i32) -> Self {
        Self {
            version: (header >> VERSION_SHIFT) & VERSION_MASK,
            compressed: header & COMPRESSION_BIT != 0,
        }
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32(PROTOCOL_MAGIC).await?;
        writer.write_i32(self.header()).await?;
        Ok(())
    }

    /// Read and validate the preamble on an accepted stream.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_i32().await?;
        if magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        let header = reader.read_i32().await?;
        Ok(Self::from_header(header))
    }
}

pub async fn write_version<W: AsyncWrite + Unpin>(writer: &mut W, version: i32) -> Result<()> {
    writer.write_i32(version).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the peer's max version. EOF here means the peer hung up on us.
pub async fn read_version<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32> {
    match reader.read_i32().await {
        Ok(v) => Ok(v),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            ProtocolError::HandshakeError(constants::ERR_PEER_REJECTED_VERSION.into()),
        ),
        Err(e) => Err(e.into()),
    }
}

/// Append the compact endpoint identity: length, address octets, port.
pub fn encode_endpoint(endpoint: &SocketAddr, out: &mut BytesMut) {
    match endpoint.ip() {
        IpAddr::V4(ip) => {
            out.put_u8(IPV4_IDENTITY_LEN);
            out.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.put_u8(IPV6_IDENTITY_LEN);
            out.put_slice(&ip.octets());
        }
    }
    out.put_u16(endpoint.port());
}

pub async fn write_endpoint<W: AsyncWrite + Unpin>(
    writer: &mut W,
    endpoint: &SocketAddr,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(1 + IPV6_IDENTITY_LEN as usize);
    encode_endpoint(endpoint, &mut buf);
    writer.write_all(&buf).await?;
    Ok(())
}

pub async fn read_endpoint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<SocketAddr> {
    let len = reader.read_u8().await?;
    let ip = match len {
        IPV4_IDENTITY_LEN => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IPV6_IDENTITY_LEN => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(ProtocolError::HandshakeError(format!(
                "{}: {other}",
                constants::ERR_ENDPOINT_LENGTH
            )));
        }
    };
    let port = reader.read_u16().await?;
    Ok(SocketAddr::new(ip, port))
}

/// Connecting side of the handshake, run right after the preamble.
///
/// Returns the acceptor's max version. When that is older than the version we
/// announced, nothing else is written: the caller is expected to reconnect
/// with the older version.
#[instrument(level = "debug", skip(stream), fields(version = preamble.version))]
pub async fn connect_handshake<S>(
    stream: &mut S,
    preamble: Preamble,
    own_max_version: i32,
    local: &SocketAddr,
) -> Result<i32>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    preamble.write(stream).await?;
    stream.flush().await?;

    let peer_max = read_version(stream).await?;
    if peer_max < preamble.version {
        debug!(peer_max, "Peer is older than the announced version");
        return Ok(peer_max);
    }

    stream.write_i32(own_max_version).await?;
    write_endpoint(stream, local).await?;
    stream.flush().await?;
    Ok(peer_max)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{CURRENT_VERSION, VERSION_1};

    #[test]
    fn test_header_bits() {
        let p = Preamble::new(2, true);
        assert_eq!(p.header(), (2 << 8) | 4);
        assert_eq!(Preamble::from_header(p.header()), p);
        assert_eq!(Preamble::from_header(1 << 8), Preamble::new(1, false));
    }

    #[tokio::test]
    async fn test_preamble_rejects_bad_magic() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_i32(0x1234).await.unwrap();
        a.write_i32(0).await.unwrap();
        assert!(matches!(
            Preamble::read(&mut b).await,
            Err(ProtocolError::InvalidMagic(0x1234))
        ));
    }

    #[tokio::test]
    async fn test_endpoint_roundtrip() {
        for endpoint in [
            "10.1.2.3:7000".parse::<SocketAddr>().unwrap(),
            "[fe80::1]:9042".parse::<SocketAddr>().unwrap(),
        ] {
            let (mut a, mut b) = tokio::io::duplex(64);
            write_endpoint(&mut a, &endpoint).await.unwrap();
            assert_eq!(read_endpoint(&mut b).await.unwrap(), endpoint);
        }
    }

    #[tokio::test]
    async fn test_endpoint_bad_length() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u8(5).await.unwrap();
        assert!(matches!(
            read_endpoint(&mut b).await,
            Err(ProtocolError::HandshakeError(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_handshake_against_older_peer() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let local: SocketAddr = "127.0.0.1:7001".parse().unwrap();

        let acceptor = tokio::spawn(async move {
            let preamble = Preamble::read(&mut server).await.unwrap();
            write_version(&mut server, VERSION_1).await.unwrap();
            preamble
        });

        let peer = connect_handshake(
            &mut client,
            Preamble::new(CURRENT_VERSION, false),
            CURRENT_VERSION,
            &local,
        )
        .await
        .unwrap();
        assert_eq!(peer, VERSION_1);
        assert_eq!(acceptor.await.unwrap().version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_connect_handshake_sends_identity() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let local: SocketAddr = "127.0.0.1:7001".parse().unwrap();

        let acceptor = tokio::spawn(async move {
            Preamble::read(&mut server).await.unwrap();
            write_version(&mut server, CURRENT_VERSION).await.unwrap();
            let max = read_version(&mut server).await.unwrap();
            let from = read_endpoint(&mut server).await.unwrap();
            (max, from)
        });

        connect_handshake(
            &mut client,
            Preamble::new(CURRENT_VERSION, true),
            CURRENT_VERSION,
            &local,
        )
        .await
        .unwrap();
        assert_eq!(acceptor.await.unwrap(), (CURRENT_VERSION, local));
    }
}
