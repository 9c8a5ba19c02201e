//! Property-based tests using proptest
//!
//! Packets, frames and compressed blocks must survive encoding and arbitrary
//! read fragmentation unchanged.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use internode_protocol::config::{CURRENT_VERSION, VERSION_1};
use internode_protocol::core::codec::{FrameCodec, RawFrame};
use internode_protocol::core::packet::{
    ErrorPacket, Packet, PreparedStatementPrepare, PreparedStatementPrepareAck,
    PreparedStatementQuery, PreparedStatementUpdate, QueryHeader, StatementQuery,
    StatementQueryAck, StatementUpdate, StatementUpdateAck,
};
use internode_protocol::core::registry::PacketRegistry;
use internode_protocol::core::value::{PageKey, Value};
use internode_protocol::utils::compression::Lz4BlockCodec;
use internode_protocol::utils::time::reconcile_timestamp;
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Boolean),
        any::<i32>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::Long),
        (-1.0e12f64..1.0e12).prop_map(Value::Double),
        ".{0,24}".prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
    ]
}

fn page_keys() -> impl Strategy<Value = Vec<PageKey>> {
    prop::collection::vec(
        (value(), any::<bool>()).prop_map(|(key, first)| PageKey::new(key, first)),
        0..4,
    )
}

fn header() -> impl Strategy<Value = QueryHeader> {
    (page_keys(), any::<i32>(), any::<i32>(), any::<i32>(), any::<bool>()).prop_map(
        |(page_keys, result_id, max_rows, fetch_size, scrollable)| QueryHeader {
            page_keys,
            result_id,
            max_rows,
            fetch_size,
            scrollable,
        },
    )
}

fn sql() -> impl Strategy<Value = String> {
    "[A-Za-z0-9 ,=?*()']{0,80}"
}

/// Well-formed result sets: a result without columns has no rows.
fn rows() -> impl Strategy<Value = (i32, Vec<Vec<Value>>)> {
    (0usize..5).prop_flat_map(|columns| {
        let max_rows = if columns == 0 { 1 } else { 8 };
        prop::collection::vec(prop::collection::vec(value(), columns), 0..max_rows)
            .prop_map(move |rows| (columns as i32, rows))
    })
}

/// Result sets whose rows disagree with the column count.
fn misshapen_ack() -> impl Strategy<Value = StatementQueryAck> {
    prop_oneof![
        (1usize..6).prop_map(|n| (0i32, vec![Vec::<Value>::new(); n])),
        (1usize..5, 1usize..6, 0usize..6)
            .prop_filter("one row must be off", |(columns, _, odd)| odd != columns)
            .prop_flat_map(|(columns, n, odd)| {
                (
                    prop::collection::vec(prop::collection::vec(value(), columns), n),
                    prop::collection::vec(value(), odd),
                    0..=n,
                )
                    .prop_map(move |(mut rows, bad, at)| {
                        rows.insert(at, bad);
                        (columns as i32, rows)
                    })
            }),
    ]
    .prop_map(|(column_count, rows)| StatementQueryAck {
        result_id: 1,
        column_count,
        rows,
    })
}

/// Packets as they exist at `version`: the replication name is only carried
/// from version 2 on.
fn packet(version: i32) -> impl Strategy<Value = Packet> {
    let replication = if version >= 2 {
        prop::option::of("[a-z]{1,12}").boxed()
    } else {
        Just(None).boxed()
    };
    prop_oneof![
        (any::<i32>(), sql()).prop_map(|(command_id, sql)| {
            PreparedStatementPrepare { command_id, sql }.into()
        }),
        (any::<bool>(), any::<i32>()).prop_map(|(is_query, parameter_count)| {
            PreparedStatementPrepareAck {
                is_query,
                parameter_count,
            }
            .into()
        }),
        (header(), any::<i32>(), prop::collection::vec(value(), 0..6)).prop_map(
            |(query, command_id, parameters)| {
                PreparedStatementQuery {
                    query,
                    command_id,
                    parameters,
                }
                .into()
            }
        ),
        (
            page_keys(),
            any::<i32>(),
            prop::collection::vec(value(), 0..6),
            replication.clone()
        )
            .prop_map(|(page_keys, command_id, parameters, replication_name)| {
                PreparedStatementUpdate {
                    page_keys,
                    command_id,
                    parameters,
                    replication_name,
                }
                .into()
            }),
        (header(), sql()).prop_map(|(query, sql)| StatementQuery { query, sql }.into()),
        (page_keys(), sql(), replication).prop_map(|(page_keys, sql, replication_name)| {
            StatementUpdate {
                page_keys,
                sql,
                replication_name,
            }
            .into()
        }),
        (any::<i32>(), rows()).prop_map(|(result_id, (column_count, rows))| {
            StatementQueryAck {
                result_id,
                column_count,
                rows,
            }
            .into()
        }),
        any::<i32>().prop_map(|update_count| StatementUpdateAck { update_count }.into()),
        (any::<i32>(), ".{0,40}").prop_map(|(code, message)| ErrorPacket { code, message }.into()),
    ]
}

proptest! {
    #[test]
    fn prop_packet_roundtrip_current(packet in packet(CURRENT_VERSION)) {
        let registry = PacketRegistry::with_defaults();
        let payload = packet.encode_to_bytes(CURRENT_VERSION);
        let decoded = registry
            .decode(packet.packet_type().as_byte(), &payload, CURRENT_VERSION)
            .expect("decode");
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn prop_packet_roundtrip_v1(packet in packet(VERSION_1)) {
        let registry = PacketRegistry::with_defaults();
        let payload = packet.encode_to_bytes(VERSION_1);
        let decoded = registry
            .decode(packet.packet_type().as_byte(), &payload, VERSION_1)
            .expect("decode");
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn prop_query_ack_shape_matches_decodability(ack in misshapen_ack()) {
        prop_assert!(ack.check_shape().is_err());
        let registry = PacketRegistry::with_defaults();
        let packet = Packet::from(ack);
        let payload = packet.encode_to_bytes(CURRENT_VERSION);
        let decoded = registry.decode(packet.packet_type().as_byte(), &payload, CURRENT_VERSION);
        prop_assert!(decoded.map_or(true, |p| p != packet));
    }

    #[test]
    fn prop_generated_acks_are_well_formed((column_count, rows) in rows()) {
        let ack = StatementQueryAck { result_id: 0, column_count, rows };
        prop_assert!(ack.check_shape().is_ok());
    }

    #[test]
    fn prop_truncated_payload_never_decodes(packet in packet(CURRENT_VERSION), cut in 1usize..64) {
        let registry = PacketRegistry::with_defaults();
        let payload = packet.encode_to_bytes(CURRENT_VERSION);
        prop_assume!(cut <= payload.len());
        let truncated = &payload[..payload.len() - cut];
        prop_assert!(registry
            .decode(packet.packet_type().as_byte(), truncated, CURRENT_VERSION)
            .is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_frames_survive_fragmentation(
        packets in prop::collection::vec(packet(CURRENT_VERSION), 1..6),
        chunk in 1usize..97,
    ) {
        let mut codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        let mut expected = Vec::new();
        for (id, packet) in packets.iter().enumerate() {
            let frame = RawFrame::from_packet(id as i32, 1_700_000_000_000, packet, CURRENT_VERSION);
            codec.encode(frame.clone(), &mut wire).unwrap();
            expected.push(frame);
        }

        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        prop_assert!(buf.is_empty());
        prop_assert_eq!(frames, expected);
    }

    #[test]
    fn prop_lz4_block_stream_roundtrip(
        data in prop::collection::vec(any::<u8>(), 0..200_000),
        chunk in 1usize..5000,
    ) {
        let mut codec = Lz4BlockCodec;
        let mut wire = BytesMut::new();
        codec.encode(bytes::Bytes::from(data.clone()), &mut wire).unwrap();

        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(block) = codec.decode(&mut buf).unwrap() {
                out.extend_from_slice(&block);
            }
        }
        prop_assert!(buf.is_empty());
        prop_assert_eq!(out, data);
    }
}

proptest! {
    #[test]
    fn prop_reconcile_keeps_low_bits(now in 0i64..(1i64 << 50), partial in any::<i32>()) {
        let reconciled = reconcile_timestamp(now, partial);
        prop_assert_eq!(reconciled as i32, partial);
        prop_assert_eq!(reconciled >> 32, now >> 32);
    }
}
