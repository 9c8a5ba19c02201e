#![no_main]

use internode_protocol::protocol::handshake::{read_endpoint, read_version, Preamble};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(_) => return,
    };
    runtime.block_on(async {
        let mut input = data;
        if Preamble::read(&mut input).await.is_ok() {
            let _ = read_version(&mut input).await;
            let _ = read_endpoint(&mut input).await;
        }

        let mut input = data;
        let _ = read_endpoint(&mut input).await;
    });
});
