// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use anyhow::Result;
use weft::transport::frame::{
    FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_VERSION, FrameHeader, encode_frame,
    encode_frame_vectored,
};

const MAX: usize = 2 * 1024 * 1024;

// Known-good frame for the payload "hi": magic, version 1, length 2.
const HI_FRAME_HEX: &str = "a5a5a5a5000000010000000268 69";

fn header_of(framed: &[u8]) -> [u8; FRAME_HEADER_LEN] {
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    hdr.copy_from_slice(&framed[..FRAME_HEADER_LEN]);
    hdr
}

#[test]
fn wire_layout_is_pinned() -> Result<()> {
    let cleaned: String = HI_FRAME_HEX.split_whitespace().collect();
    let expected = hex::decode(cleaned)?;
    assert_eq!(encode_frame(b"hi").as_ref(), &expected[..]);
    Ok(())
}

#[test]
fn round_trip_up_to_a_mebibyte() {
    for len in [0usize, 1, 11, 4096, 1 << 20] {
        let payload: Vec<u8> = (0..len).map(|i| (i * 31) as u8).collect();
        let framed = encode_frame(&payload);

        let parsed = FrameHeader::parse(&header_of(&framed), MAX).expect("header");
        assert_eq!(parsed, payload.len());
        assert_eq!(&framed[FRAME_HEADER_LEN..], &payload[..]);
    }
}

#[test]
fn vectored_send_behaves_as_concatenation() {
    let whole = encode_frame(b"one two three");
    let parts = encode_frame_vectored(&[b"one ", b"two ", b"three"]);
    assert_eq!(whole, parts);
}

#[test]
fn corrupt_magic_never_parses() {
    let framed = encode_frame(b"payload");
    let mut hdr = header_of(&framed);
    for byte in 0..4 {
        let mut bad = hdr;
        bad[byte] ^= 0xFF;
        assert!(FrameHeader::parse(&bad, MAX).is_err(), "byte {byte}");
    }
    // Sanity: the untouched header still parses.
    hdr.copy_from_slice(&framed[..FRAME_HEADER_LEN]);
    assert_eq!(FrameHeader::parse(&hdr, MAX).expect("ok"), 7);
}

#[test]
fn constants_match_the_wire_contract() {
    assert_eq!(FRAME_MAGIC, 0xA5A5_A5A5);
    assert_eq!(FRAME_VERSION, 1);
    assert_eq!(FRAME_HEADER_LEN, 12);
}
