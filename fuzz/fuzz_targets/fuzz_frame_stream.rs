#![no_main]

use libfuzzer_sys::fuzz_target;
use tiered_netcore::transport::connection::ConnectionState;
use tiered_netcore::utils::crypto::Cipher;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes through framing and decryption; must never panic
    let conn = ConnectionState::new(1, 65_600);
    if conn.append_received(data).is_err() {
        return;
    }
    let _ = conn.extract_frames();
    let cipher = Cipher::lobby_default();
    while let Some(frame) = conn.pop_inbound() {
        let _ = cipher.open(&frame);
    }
});
