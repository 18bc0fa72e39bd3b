#![cfg(not(target_arch = "wasm32"))]

//! Instruction lengths must agree with `iced-x86` wherever both decoders accept the encoding.

use iced_x86::{Decoder, DecoderOptions};
use proptest::prelude::*;
use vx64_x86::{decode, MAX_INST_LEN};

fn iced_len(rip: u64, bytes: &[u8]) -> Option<usize> {
    let mut decoder = Decoder::with_ip(64, bytes, rip, DecoderOptions::NONE);
    let inst = decoder.decode();
    (!inst.is_invalid()).then(|| inst.len())
}

const SAMPLES: &[&[u8]] = &[
    &[0x0f, 0x2f, 0xc1],
    &[0x66, 0x44, 0x0f, 0xd4, 0xc9],
    &[0x48, 0x89, 0xe5],
    &[0x48, 0x83, 0xec, 0x10],
    &[0x64, 0x48, 0x8b, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00],
    &[0x48, 0x8d, 0x05, 0x10, 0x00, 0x00, 0x00],
    &[0x42, 0x8b, 0x44, 0xa5, 0xf0],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x2e, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0xf3, 0x48, 0xab],
    &[0x48, 0xb8, 1, 2, 3, 4, 5, 6, 7, 8],
    &[0x66, 0xb8, 0x34, 0x12],
    &[0x48, 0xc7, 0x45, 0xf8, 0xff, 0xff, 0xff, 0xff],
    &[0x48, 0x69, 0xc0, 0x10, 0x00, 0x00, 0x00],
    &[0xc1, 0xe0, 0x04],
    &[0xf7, 0xf1],
    &[0x0f, 0xb6, 0x07],
    &[0x48, 0x63, 0xc7],
    &[0x0f, 0x94, 0xc0],
    &[0x48, 0x0f, 0x44, 0xc1],
    &[0xe8, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x84, 0x00, 0x01, 0x00, 0x00],
    &[0xc2, 0x08, 0x00],
    &[0xf2, 0x0f, 0x10, 0x05, 0x00, 0x00, 0x00, 0x00],
    &[0xf3, 0x0f, 0x58, 0xc1],
    &[0x66, 0x0f, 0x6f, 0x06],
    &[0x66, 0x0f, 0x73, 0xd8, 0x08],
    &[0x66, 0x48, 0x0f, 0x7e, 0xc0],
    &[0xf3, 0x0f, 0x7e, 0xc1],
    &[0x66, 0x0f, 0xd7, 0xc1],
    &[0xc5, 0xfd, 0x6f, 0x07],
    &[0xc5, 0xf5, 0xef, 0xc2],
    &[0xc4, 0xc1, 0x79, 0xd4, 0xc0],
    &[0xc5, 0xf8, 0x77],
];

#[test]
fn sample_lengths_match_iced() {
    for bytes in SAMPLES {
        let ours = decode(0x40_0000, bytes)
            .unwrap_or_else(|e| panic!("failed to decode {bytes:02x?}: {e}"));
        assert_eq!(
            Some(ours.len() as usize),
            iced_len(0x40_0000, bytes),
            "length mismatch for {bytes:02x?} ({ours})"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 4096,
        .. ProptestConfig::default()
    })]

    #[test]
    fn decode_never_panics_and_agrees_with_iced(
        rip in any::<u64>(),
        bytes in proptest::collection::vec(any::<u8>(), 1..=20),
    ) {
        match decode(rip, &bytes) {
            Ok(inst) => {
                prop_assert!(inst.len() >= 1);
                prop_assert!(inst.len() as usize <= MAX_INST_LEN);
                prop_assert_eq!(inst.bytes.as_slice(), &bytes[..inst.len() as usize]);
                prop_assert_eq!(inst.next_rip(), rip.wrapping_add(inst.len() as u64));
                if let Some(len) = iced_len(rip, &bytes) {
                    prop_assert_eq!(inst.len() as usize, len, "bytes={:02x?} inst={}", bytes, inst);
                }
            }
            Err(err) => {
                prop_assert_eq!(err.addr, rip);
                prop_assert!(err.bytes.len() <= MAX_INST_LEN);
            }
        }
    }
}
