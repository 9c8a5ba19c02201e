//! Connections this node opens to its peers.
//!
//! Outbound connections only write: replies come back on the peer's own
//! outbound connection to us.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio_util::codec::Encoder;
use tracing::{debug, info, instrument};

use crate::config::{CURRENT_VERSION, MAX_FRAME_SIZE};
use crate::core::codec::{FrameCodec, RawFrame};
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{connect_handshake, Preamble};
use crate::protocol::versions::VersionTable;
use crate::transport::stream::OutboundStream;
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::time::current_millis;

/// Settings for opening an outbound connection.
#[derive(Debug, Clone)]
pub struct OutboundOptions {
    /// Endpoint identity sent to the peer, i.e. our listening address.
    pub local: SocketAddr,
    pub compress: bool,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
}

impl OutboundOptions {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            compress: false,
            connect_timeout: Duration::from_secs(2),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

pub struct OutboundConnection {
    target: SocketAddr,
    version: i32,
    codec: FrameCodec,
    writer: OutboundStream<TcpStream>,
    metrics: Arc<Metrics>,
}

impl OutboundConnection {
    /// Connect to `target` and complete the handshake, each attempt bounded
    /// by `connect_timeout`.
    ///
    /// Announces the version recorded for `target`. If the peer turns out to
    /// be older, its version is recorded and the connection is retried once
    /// with it.
    #[instrument(skip(versions, options, metrics), fields(local = %options.local))]
    pub async fn connect(
        target: SocketAddr,
        versions: &VersionTable,
        options: &OutboundOptions,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let _timer = Timer::start("outbound_connect");
        let mut version = versions.get_version(&target);
        let mut retried = false;

        loop {
            metrics.handshake_attempt();
            let (stream, peer_max) =
                match tokio::time::timeout(options.connect_timeout, open(target, version, options))
                    .await
                {
                    Ok(Ok(opened)) => opened,
                    Ok(Err(e)) => {
                        metrics.handshake_failed();
                        if matches!(e, ProtocolError::HandshakeError(_)) {
                            // forget it so the next attempt announces our own version
                            versions.reset_version(&target);
                        }
                        return Err(e);
                    }
                    Err(_) => {
                        metrics.handshake_failed();
                        debug!(peer = %target, timeout = ?options.connect_timeout, "Handshake timed out");
                        return Err(ProtocolError::Timeout);
                    }
                };
            versions.set_version(target, peer_max);

            if peer_max < version {
                if retried {
                    metrics.handshake_failed();
                    return Err(ProtocolError::UnsupportedVersion(peer_max));
                }
                info!(peer = %target, peer_max, announced = version, "Peer is older, reconnecting");
                version = peer_max;
                retried = true;
                continue;
            }

            metrics.handshake_success();
            metrics.connection_established();
            debug!(peer = %target, version, compressed = options.compress, "Outbound connection ready");
            return Ok(Self {
                target,
                version,
                codec: FrameCodec::new(options.max_frame_size),
                writer: OutboundStream::new(stream, options.compress),
                metrics,
            });
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Version packets are encoded with on this connection.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Frame, write and flush one message.
    pub async fn send(&mut self, packet: &Packet, id: i32) -> Result<()> {
        let frame = RawFrame::from_packet(id, current_millis(), packet, self.version);
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        self.codec.encode(frame, &mut buf)?;
        let len = buf.len() as u64;
        self.writer.write_frame(buf.freeze()).await?;
        self.metrics.message_sent(len);
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(peer = %self.target, error = %e, "Error closing outbound connection");
        }
        self.metrics.connection_closed();
    }
}

/// Dial `target` and run our side of the handshake.
async fn open(
    target: SocketAddr,
    version: i32,
    options: &OutboundOptions,
) -> Result<(TcpStream, i32)> {
    let mut stream = TcpStream::connect(target).await?;
    stream.set_nodelay(true)?;
    let preamble = Preamble::new(version, options.compress);
    let peer_max = connect_handshake(&mut stream, preamble, CURRENT_VERSION, &options.local).await?;
    Ok((stream, peer_max))
}

impl std::fmt::Debug for OutboundConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConnection")
            .field("target", &self.target)
            .field("version", &self.version)
            .finish()
    }
}
