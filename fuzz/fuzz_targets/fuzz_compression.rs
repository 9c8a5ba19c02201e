#![no_main]

use bytes::{Bytes, BytesMut};
use internode_protocol::utils::compression::Lz4BlockCodec;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::{Decoder, Encoder};

fuzz_target!(|data: &[u8]| {
    // Round trip must be lossless
    let mut wire = BytesMut::new();
    if Lz4BlockCodec.encode(Bytes::copy_from_slice(data), &mut wire).is_ok() {
        let mut out = Vec::with_capacity(data.len());
        while let Ok(Some(block)) = Lz4BlockCodec.decode(&mut wire) {
            out.extend_from_slice(&block);
        }
        assert_eq!(out, data);
    }

    // Malformed block streams must fail cleanly
    let mut raw = BytesMut::from(data);
    while let Ok(Some(_)) = Lz4BlockCodec.decode(&mut raw) {}
});
