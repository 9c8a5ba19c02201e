//! Incoming connection loop driven over in-memory pipes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use internode_protocol::config::CURRENT_VERSION;
use internode_protocol::core::codec::{FrameCodec, RawFrame};
use internode_protocol::core::packet::{
    Packet, PacketType, StatementUpdate, StatementUpdateAck,
};
use internode_protocol::protocol::handshake::{read_version, write_endpoint, write_version};
use internode_protocol::protocol::{Dispatcher, InboundMessage, SavedEndpoints};
use internode_protocol::transport::{
    ConnectionContext, ConnectionEnd, ConnectionState, ConnectionSummary, IncomingConnection,
    OutboundStream,
};
use internode_protocol::utils::time::current_millis;

const PIPE_CAPACITY: usize = 256 * 1024;

fn peer() -> SocketAddr {
    "10.0.0.7:7000".parse().unwrap()
}

fn update(sql: &str) -> Packet {
    StatementUpdate {
        page_keys: Vec::new(),
        sql: sql.to_string(),
        replication_name: None,
    }
    .into()
}

fn frame_at(id: i32, packet: &Packet, now_ms: i64) -> Bytes {
    let mut buf = BytesMut::new();
    FrameCodec::default()
        .encode(RawFrame::from_packet(id, now_ms, packet, CURRENT_VERSION), &mut buf)
        .unwrap();
    buf.freeze()
}

fn frame(id: i32, packet: &Packet) -> Bytes {
    frame_at(id, packet, current_millis())
}

fn spawn_connection(
    ctx: ConnectionContext,
    version: i32,
    compressed: bool,
) -> (DuplexStream, JoinHandle<ConnectionSummary>) {
    let (client, server) = duplex(PIPE_CAPACITY);
    let connection = IncomingConnection::new(server, version, compressed, ctx);
    assert_eq!(connection.state(), ConnectionState::Connecting);
    let task = tokio::spawn(connection.run(CancellationToken::new()));
    (client, task)
}

/// Complete the connector side of the handshake.
async fn handshake(client: &mut DuplexStream) {
    assert_eq!(read_version(client).await.unwrap(), CURRENT_VERSION);
    write_version(client, CURRENT_VERSION).await.unwrap();
    write_endpoint(client, &peer()).await.unwrap();
}

fn collect_requests(
    ctx: &ConnectionContext,
    packet_type: PacketType,
) -> mpsc::UnboundedReceiver<InboundMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    ctx.dispatcher
        .register_handler(packet_type, move |message| {
            let _ = tx.send(message);
        })
        .unwrap();
    rx
}

#[tokio::test]
async fn request_reaches_its_handler() {
    let ctx = ConnectionContext::new(Arc::new(SavedEndpoints::new()));
    let mut requests = collect_requests(&ctx, PacketType::StatementUpdate);
    let (mut client, task) = spawn_connection(ctx.clone(), CURRENT_VERSION, false);

    handshake(&mut client).await;
    let mut writer = OutboundStream::new(client, false);
    writer.write_frame(frame(5, &update("DELETE FROM t"))).await.unwrap();
    writer.shutdown().await.unwrap();

    let message = requests.recv().await.unwrap();
    assert_eq!(message.id, 5);
    assert_eq!(message.from, peer());
    assert_eq!(message.version, CURRENT_VERSION);
    assert_eq!(message.packet, update("DELETE FROM t"));

    let summary = task.await.unwrap();
    assert_eq!(summary.end, ConnectionEnd::EndOfStream);
    assert_eq!(summary.peer, Some(peer()));
    assert_eq!(summary.peer_version, Some(CURRENT_VERSION));
    assert_eq!(summary.reached, ConnectionState::Streaming);
    assert_eq!(summary.stats.messages_dispatched, 1);
    assert_eq!(ctx.versions.known_version(&peer()), Some(CURRENT_VERSION));
}

#[tokio::test]
async fn compressed_stream_preserves_order() {
    let ctx = ConnectionContext::new(Arc::new(SavedEndpoints::new()));
    let mut requests = collect_requests(&ctx, PacketType::StatementUpdate);
    let (mut client, task) = spawn_connection(ctx.clone(), CURRENT_VERSION, true);

    handshake(&mut client).await;
    let mut writer = OutboundStream::new(client, true);
    // large enough to span several compressed blocks
    let big = "x".repeat(150 * 1024);
    for (id, sql) in [(1, "A"), (2, big.as_str()), (3, "C")] {
        writer.write_frame(frame(id, &update(sql))).await.unwrap();
    }
    writer.shutdown().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(requests.recv().await.unwrap().id);
    }
    assert_eq!(ids, vec![1, 2, 3]);

    let summary = task.await.unwrap();
    assert_eq!(summary.end, ConnectionEnd::EndOfStream);
    assert_eq!(summary.stats.frames_received, 3);
}

#[tokio::test]
async fn peer_ahead_is_saved_and_never_dispatched() {
    let membership = Arc::new(SavedEndpoints::new());
    let ctx = ConnectionContext::new(membership.clone());
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    ctx.dispatcher
        .register_handler(PacketType::StatementUpdate, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let (mut client, task) = spawn_connection(ctx.clone(), CURRENT_VERSION + 1, false);

    handshake(&mut client).await;
    // whatever follows the handshake must be ignored
    let mut writer = OutboundStream::new(client, false);
    for id in 0..4 {
        let _ = writer.write_frame(frame(id, &update("INSERT"))).await;
    }
    let _ = writer.shutdown().await;

    let summary = task.await.unwrap();
    assert_eq!(summary.end, ConnectionEnd::PeerAhead);
    assert_eq!(summary.reached, ConnectionState::VersionReconciled);
    assert_eq!(summary.stats.frames_received, 0);
    assert_eq!(handled.load(Ordering::SeqCst), 0);
    assert_eq!(membership.saved(), vec![peer()]);
    assert_eq!(ctx.metrics.snapshot().messages_dispatched, 0);
}

#[tokio::test]
async fn bad_magic_ends_connection_without_dispatch() {
    let ctx = ConnectionContext::new(Arc::new(SavedEndpoints::new()));
    let mut requests = collect_requests(&ctx, PacketType::StatementUpdate);
    let (mut client, task) = spawn_connection(ctx.clone(), CURRENT_VERSION, false);

    handshake(&mut client).await;
    let mut corrupt = BytesMut::from(&frame(1, &update("UPDATE t"))[..]);
    corrupt[..4].copy_from_slice(&0x0BAD_F00D_i32.to_be_bytes());
    let mut writer = OutboundStream::new(client, false);
    let _ = writer.write_frame(corrupt.freeze()).await;
    let _ = writer.write_frame(frame(2, &update("UPDATE t"))).await;

    let summary = task.await.unwrap();
    assert!(matches!(summary.end, ConnectionEnd::Framing(_)));
    assert_eq!(summary.stats.messages_dispatched, 0);
    assert_eq!(ctx.metrics.snapshot().framing_errors, 1);
    assert!(requests.try_recv().is_err());
}

#[tokio::test]
async fn late_response_is_dropped_before_decode() {
    let ctx = ConnectionContext::new(Arc::new(SavedEndpoints::new()));
    let waiting = ctx.dispatcher.register_callback(peer(), Duration::from_secs(5));
    let (mut client, task) = spawn_connection(ctx.clone(), CURRENT_VERSION, false);

    handshake(&mut client).await;
    let mut writer = OutboundStream::new(client, false);
    // nobody waits for id 9999; its undecodable payload must never be decoded
    let orphan = RawFrame {
        id: 9999,
        timestamp: 0,
        packet_type: PacketType::StatementUpdateAck.as_byte(),
        payload: Bytes::from_static(&[0xFF]),
    };
    let mut buf = BytesMut::new();
    FrameCodec::default().encode(orphan, &mut buf).unwrap();
    writer.write_frame(buf.freeze()).await.unwrap();
    let ack: Packet = StatementUpdateAck { update_count: 3 }.into();
    writer.write_frame(frame(waiting.id(), &ack)).await.unwrap();
    writer.shutdown().await.unwrap();

    assert_eq!(waiting.wait().await.unwrap(), ack);
    let summary = task.await.unwrap();
    assert_eq!(summary.stats.expired_dropped, 1);
    assert_eq!(summary.stats.messages_dispatched, 1);
    assert_eq!(ctx.dispatcher.pending(), 0);
}

#[tokio::test]
async fn stale_request_is_dropped_with_cross_node_timeout() {
    let mut ctx = ConnectionContext::new(Arc::new(SavedEndpoints::new()));
    ctx.cross_node_timeout = true;
    ctx.dispatcher =
        Arc::new(Dispatcher::new().with_request_timeout(Some(Duration::from_millis(500))));
    let mut requests = collect_requests(&ctx, PacketType::StatementUpdate);
    let (mut client, task) = spawn_connection(ctx.clone(), CURRENT_VERSION, false);

    handshake(&mut client).await;
    let mut writer = OutboundStream::new(client, false);
    let sent_long_ago = current_millis() - 10_000;
    writer
        .write_frame(frame_at(1, &update("UPDATE t"), sent_long_ago))
        .await
        .unwrap();
    writer.write_frame(frame(2, &update("UPDATE t"))).await.unwrap();
    writer.shutdown().await.unwrap();

    assert_eq!(requests.recv().await.unwrap().id, 2);
    let summary = task.await.unwrap();
    assert_eq!(summary.stats.requests_dropped, 1);
    assert_eq!(summary.stats.messages_dispatched, 1);
}

#[tokio::test]
async fn cancellation_stops_an_idle_connection() {
    let ctx = ConnectionContext::new(Arc::new(SavedEndpoints::new()));
    let (client, server) = duplex(PIPE_CAPACITY);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(
        IncomingConnection::new(server, CURRENT_VERSION, false, ctx.clone()).run(cancel.clone()),
    );

    cancel.cancel();
    let summary = task.await.unwrap();
    assert_eq!(summary.end, ConnectionEnd::Cancelled);
    assert_eq!(ctx.metrics.snapshot().connections_active, 0);
    drop(client);
}
