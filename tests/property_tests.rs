//! Property-based tests using proptest
//!
//! Framing must not depend on how the byte stream is chunked, sealing must be
//! reversible for every opcode, and arbitrary input must never panic.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::{Duration, Instant};

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use tiered_netcore::core::codec::DEFAULT_CAPACITY;
use tiered_netcore::protocol::throttle::ThrottleState;
use tiered_netcore::transport::connection::ConnectionState;
use tiered_netcore::utils::crypto::{Cipher, KeyTable, DIALOG_OPCODES};
use tiered_netcore::{Direction, Frame, ThrottleResult, ThrottleRule};

fn client_frame() -> impl Strategy<Value = Frame> {
    (
        any::<u8>(),
        any::<u8>(),
        prop::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(opcode, ordinal, payload)| {
            let mut frame = Frame::client(opcode, payload);
            if frame.should_encrypt() {
                frame.ordinal = ordinal;
            }
            frame
        })
}

// Property: frames come out the same however the stream is split
proptest! {
    #[test]
    fn prop_extraction_ignores_chunking(
        frames in prop::collection::vec(client_frame(), 1..16),
        chunk in 1usize..700,
    ) {
        let mut stream = Vec::new();
        for frame in &frames {
            stream.extend(frame.to_bytes().unwrap());
        }

        let conn = ConnectionState::new(1, DEFAULT_CAPACITY);
        for piece in stream.chunks(chunk) {
            conn.append_received(piece).unwrap();
            conn.extract_frames().unwrap();
        }

        let decoded: Vec<Frame> = std::iter::from_fn(|| conn.pop_inbound()).collect();
        prop_assert_eq!(decoded, frames);
        prop_assert_eq!(conn.buffered_len(), 0);
    }
}

// Property: a sealed frame opens to the original for either direction
proptest! {
    #[test]
    fn prop_seal_open_recovers_payload(
        opcode in any::<u8>(),
        ordinal in any::<u8>(),
        seed in 0u8..10,
        from_client in any::<bool>(),
        payload in prop::collection::vec(any::<u8>(), 0..1024),
        rng_seed in any::<u64>(),
    ) {
        // the dialog layer rewrites its own header bytes
        prop_assume!(!(from_client && DIALOG_OPCODES.contains(&opcode)));
        let direction = if from_client { Direction::Client } else { Direction::Server };
        let cipher = Cipher::new(seed, b"abcdefghi".to_vec())
            .unwrap()
            .with_key_table(KeyTable::generate("Aisling"));
        let frame = Frame::new(direction, opcode, payload);
        let mut rng = StdRng::seed_from_u64(rng_seed);

        let sealed = cipher.seal(&frame, ordinal, &mut rng).unwrap();
        let wire = sealed.to_bytes().unwrap();
        let parsed = Frame::from_bytes(&wire, direction).unwrap();
        let opened = cipher.open(&parsed).unwrap();

        prop_assert_eq!(opened.opcode, frame.opcode);
        prop_assert_eq!(opened.payload, frame.payload);
    }
}

// Property: arbitrary bytes never panic the receive path
proptest! {
    #[test]
    fn prop_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let conn = ConnectionState::new(1, 1024);
        if conn.append_received(&data).is_ok() {
            let _ = conn.extract_frames();
        }
        prop_assert!(conn.buffered_len() <= 1024);
    }
}

// Property: a burst inside the interval forwards one frame, then throttles
// until the threshold is passed
proptest! {
    #[test]
    fn prop_burst_hits_threshold(threshold in 1u32..20) {
        let rule = ThrottleRule::new(0x06, Duration::from_millis(500), Duration::ZERO, threshold);
        let mut state = ThrottleState::default();
        let now = Instant::now();

        prop_assert_eq!(state.evaluate(&rule, &[], now), ThrottleResult::Ok);
        for _ in 0..threshold {
            prop_assert_eq!(state.evaluate(&rule, &[], now), ThrottleResult::Throttled);
        }
        prop_assert_eq!(state.evaluate(&rule, &[], now), ThrottleResult::Disconnect);
    }
}

// Property: frames spaced wider than the interval are always forwarded
proptest! {
    #[test]
    fn prop_spaced_frames_pass(gaps in prop::collection::vec(501u64..5_000, 1..32)) {
        let rule = ThrottleRule::new(0x06, Duration::from_millis(500), Duration::ZERO, 1);
        let mut state = ThrottleState::default();
        let mut now = Instant::now();

        prop_assert!(state.evaluate(&rule, &[], now).is_forwarded());
        for gap in gaps {
            now += Duration::from_millis(gap);
            prop_assert_eq!(state.evaluate(&rule, &[], now), ThrottleResult::Ok);
        }
    }
}
