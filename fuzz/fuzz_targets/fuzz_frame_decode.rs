#![no_main]

use bytes::BytesMut;
use internode_protocol::config::CURRENT_VERSION;
use internode_protocol::core::codec::FrameCodec;
use internode_protocol::core::registry::PacketRegistry;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Frames and packet payloads must reject garbage without panicking
    let registry = PacketRegistry::with_defaults();
    let mut codec = FrameCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let _ = registry.decode(frame.packet_type, &frame.payload, CURRENT_VERSION);
    }

    if let Some((&tag, payload)) = data.split_first() {
        let _ = registry.decode(tag, payload, 1);
    }
});
