//! Accepted internode connections.
//!
//! One [`IncomingConnection`] runs per accepted socket, after the preamble has
//! been read. It goes through
//! `Connecting -> HandshakeSent -> VersionReconciled -> Streaming -> Closed`
//! and then reads frames in arrival order until the stream ends.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, Span};

use crate::config::{CURRENT_VERSION, MAX_FRAME_SIZE};
use crate::core::codec::{FrameCodec, RawFrame};
use crate::core::packet::PacketType;
use crate::core::registry::PacketRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{DispatchOutcome, Dispatcher, InboundMessage};
use crate::protocol::handshake::{read_endpoint, read_version, write_version};
use crate::protocol::membership::Membership;
use crate::protocol::versions::VersionTable;
use crate::transport::stream::{InboundStream, PLAIN_BUFFER_SIZE};
use crate::utils::metrics::Metrics;
use crate::utils::time::{current_millis, reconcile_timestamp};

/// Shared services a connection reads from and delivers to.
#[derive(Clone)]
pub struct ConnectionContext {
    pub versions: Arc<VersionTable>,
    pub dispatcher: Arc<Dispatcher>,
    pub membership: Arc<dyn Membership>,
    pub registry: Arc<PacketRegistry>,
    pub metrics: Arc<Metrics>,
    /// Rebuild sender timestamps instead of stamping local receive time.
    pub cross_node_timeout: bool,
    pub max_frame_size: usize,
}

impl ConnectionContext {
    /// Fresh registries around `membership`.
    pub fn new(membership: Arc<dyn Membership>) -> Self {
        Self {
            versions: Arc::new(VersionTable::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            membership,
            registry: Arc::new(PacketRegistry::with_defaults()),
            metrics: Arc::new(Metrics::new()),
            cross_node_timeout: false,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    HandshakeSent,
    VersionReconciled,
    Streaming,
    Closed,
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The peer closed the stream.
    EndOfStream,
    /// The peer speaks a newer version; it was saved for reconnection.
    PeerAhead,
    Framing(String),
    Handshake(String),
    Io(String),
    Cancelled,
}

/// Per-connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_received: u64,
    pub messages_dispatched: u64,
    pub expired_dropped: u64,
    pub version_dropped: u64,
    /// Stale requests and requests without a handler.
    pub requests_dropped: u64,
}

/// What a finished connection reports back.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub peer: Option<SocketAddr>,
    pub peer_version: Option<i32>,
    /// Last state reached before closing.
    pub reached: ConnectionState,
    pub end: ConnectionEnd,
    pub stats: ConnectionStats,
}

enum Io<S> {
    Handshaking(BufReader<S>),
    Streaming(InboundStream<S>),
    Closed,
}

pub struct IncomingConnection<S> {
    io: Io<S>,
    /// Version from the preamble.
    version: i32,
    compressed: bool,
    state: ConnectionState,
    peer: Option<SocketAddr>,
    peer_version: Option<i32>,
    stats: ConnectionStats,
    ctx: ConnectionContext,
}

fn enter(state: &mut ConnectionState, next: ConnectionState) {
    trace!(from = ?*state, to = ?next, "Connection state change");
    *state = next;
}

impl<S> IncomingConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// `version` and `compressed` come from the preamble.
    pub fn new(stream: S, version: i32, compressed: bool, ctx: ConnectionContext) -> Self {
        Self {
            io: Io::Handshaking(BufReader::with_capacity(PLAIN_BUFFER_SIZE, stream)),
            version,
            compressed,
            state: ConnectionState::Connecting,
            peer: None,
            peer_version: None,
            stats: ConnectionStats::default(),
            ctx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serve the connection until it ends or `cancel` fires. The transport is
    /// shut down exactly once, on return.
    #[instrument(
        name = "incoming",
        skip_all,
        fields(version = self.version, compressed = self.compressed, peer = tracing::field::Empty)
    )]
    pub async fn run(mut self, cancel: CancellationToken) -> ConnectionSummary {
        self.ctx.metrics.connection_established();

        let end = tokio::select! {
            _ = cancel.cancelled() => ConnectionEnd::Cancelled,
            end = self.serve() => end,
        };

        let reached = self.state;
        self.close().await;
        self.ctx.metrics.connection_closed();

        match &end {
            ConnectionEnd::EndOfStream => trace!("Peer closed the connection"),
            ConnectionEnd::PeerAhead | ConnectionEnd::Cancelled => {
                debug!(end = ?end, "Connection closed")
            }
            other => debug!(end = ?other, "Connection ended with error"),
        }

        ConnectionSummary {
            peer: self.peer,
            peer_version: self.peer_version,
            reached,
            end,
            stats: self.stats,
        }
    }

    async fn serve(&mut self) -> ConnectionEnd {
        self.ctx.metrics.handshake_attempt();
        match self.handshake().await {
            Ok(true) => self.ctx.metrics.handshake_success(),
            Ok(false) => return ConnectionEnd::PeerAhead,
            Err(e) => {
                self.ctx.metrics.handshake_failed();
                return match e {
                    e if e.is_end_of_stream() => ConnectionEnd::EndOfStream,
                    ProtocolError::Io(e) => ConnectionEnd::Io(e.to_string()),
                    e => ConnectionEnd::Handshake(e.to_string()),
                };
            }
        }

        match self.read_loop().await {
            Ok(()) => ConnectionEnd::EndOfStream,
            Err(e) if e.is_end_of_stream() => ConnectionEnd::EndOfStream,
            Err(e) if e.is_framing() => {
                self.ctx.metrics.framing_error();
                ConnectionEnd::Framing(e.to_string())
            }
            Err(e) => ConnectionEnd::Io(e.to_string()),
        }
    }

    /// Returns `false` when the peer is ahead of us and nothing more should
    /// be read.
    async fn handshake(&mut self) -> Result<bool> {
        let Io::Handshaking(reader) = &mut self.io else {
            return Err(ProtocolError::ConnectionClosed);
        };

        write_version(reader, CURRENT_VERSION).await?;
        enter(&mut self.state, ConnectionState::HandshakeSent);

        let max_version = read_version(reader).await?;
        let from = read_endpoint(reader).await?;
        Span::current().record("peer", tracing::field::display(from));
        self.peer = Some(from);
        self.peer_version = Some(max_version);
        self.ctx.versions.set_version(from, max_version);
        enter(&mut self.state, ConnectionState::VersionReconciled);

        if self.version > CURRENT_VERSION {
            // keep the endpoint so membership reconnects with a version we speak
            self.ctx.membership.add_saved_endpoint(from);
            info!(%from, version = self.version, "Received messages from newer protocol version, ignoring");
            return Ok(false);
        }

        if let Io::Handshaking(reader) = std::mem::replace(&mut self.io, Io::Closed) {
            let stream = InboundStream::new(reader, self.compressed);
            trace!(%from, compressed = stream.is_compressed(), "Handshake complete");
            self.io = Io::Streaming(stream);
        }
        enter(&mut self.state, ConnectionState::Streaming);
        Ok(true)
    }

    async fn read_loop(&mut self) -> Result<()> {
        let Io::Streaming(stream) = &mut self.io else {
            return Err(ProtocolError::ConnectionClosed);
        };
        let from = self.peer.ok_or(ProtocolError::ConnectionClosed)?;
        let mut codec = FrameCodec::new(self.ctx.max_frame_size);
        let mut buf = BytesMut::with_capacity(PLAIN_BUFFER_SIZE);

        loop {
            while let Some(frame) = codec.decode(&mut buf)? {
                receive(&self.ctx, &mut self.stats, self.version, from, frame)?;
            }
            if stream.read_into(&mut buf).await? == 0 {
                if !buf.is_empty() {
                    trace!(leftover = buf.len(), "Stream ended inside a frame");
                }
                return Ok(());
            }
        }
    }

    async fn close(&mut self) {
        let mut stream = match std::mem::replace(&mut self.io, Io::Closed) {
            Io::Handshaking(reader) => reader.into_inner(),
            Io::Streaming(stream) => stream.into_inner(),
            Io::Closed => return,
        };
        if let Err(e) = stream.shutdown().await {
            trace!(error = %e, "Shutdown after close failed");
        }
        enter(&mut self.state, ConnectionState::Closed);
    }
}

/// Handle one frame read off the stream.
fn receive(
    ctx: &ConnectionContext,
    stats: &mut ConnectionStats,
    version: i32,
    from: SocketAddr,
    frame: RawFrame,
) -> Result<()> {
    ctx.metrics.frame_received(frame.encoded_len() as u64);
    stats.frames_received += 1;

    let now = current_millis();
    let timestamp = if ctx.cross_node_timeout {
        reconcile_timestamp(now, frame.timestamp)
    } else {
        now
    };

    let is_response = PacketType::from_byte(frame.packet_type).is_some_and(PacketType::is_response);
    if is_response && !ctx.dispatcher.is_expecting(frame.id) {
        trace!(id = frame.id, "Response arrived after its caller gave up");
        stats.expired_dropped += 1;
        ctx.metrics.expired_drop();
        return Ok(());
    }

    if version > CURRENT_VERSION {
        debug!(id = frame.id, version, "Dropping message from unsupported version");
        stats.version_dropped += 1;
        ctx.metrics.version_drop();
        return Ok(());
    }

    let packet = ctx.registry.decode(frame.packet_type, &frame.payload, version)?;
    let message = InboundMessage {
        packet,
        id: frame.id,
        timestamp,
        from,
        version,
    };
    match ctx.dispatcher.dispatch(message)? {
        DispatchOutcome::Delivered | DispatchOutcome::Handled => {
            stats.messages_dispatched += 1;
            ctx.metrics.message_dispatched();
        }
        DispatchOutcome::Expired => {
            stats.expired_dropped += 1;
            ctx.metrics.expired_drop();
        }
        DispatchOutcome::Stale | DispatchOutcome::Unhandled => stats.requests_dropped += 1,
    }
    Ok(())
}
