// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use anyhow::Result;
use bytes::BytesMut;
use weft::codec::{CodecKind, HeadCodec, MsgType, RpcException, RpcHead};

const ALL: [CodecKind; 3] = [CodecKind::Binary, CodecKind::Json, CodecKind::Proto];

// Binary head for CALL, session 7, "Echo:echo".
const BINARY_CALL_HEX: &str = "0001000000000000000700094563686f3a6563686f";

#[test]
fn binary_wire_layout_is_pinned() -> Result<()> {
    let codec = CodecKind::Binary.codec();
    let head = RpcHead::new(MsgType::Call, 7, "Echo:echo");

    let mut out = BytesMut::new();
    codec.encode_head(&head, &mut out)?;
    assert_eq!(out.as_ref(), hex::decode(BINARY_CALL_HEX)?);
    Ok(())
}

#[test]
fn heads_round_trip_with_payload_intact() {
    let heads = [
        RpcHead::new(MsgType::Call, 1, "Store:put"),
        RpcHead::new(MsgType::Reply, 1, "Store:put"),
        RpcHead::new(MsgType::Exception, 999, "Store:put"),
        RpcHead::new(MsgType::Oneway, 0, "Audit:append"),
    ];
    for kind in ALL {
        let codec = kind.codec();
        for head in &heads {
            let mut wire = BytesMut::new();
            codec.encode_head(head, &mut wire).expect("encode");
            wire.extend_from_slice(b"\x00\x01raw payload \xff");

            let (decoded, consumed) = codec.decode_head(&wire).expect("decode");
            assert_eq!(&decoded, head, "{kind:?}");
            assert_eq!(&wire[consumed..], b"\x00\x01raw payload \xff", "{kind:?}");
        }
    }
}

#[test]
fn exceptions_round_trip() {
    let cases = [
        RpcException::new(0, ""),
        RpcException::new(-4009, "rpc: request timeout"),
        RpcException::new(i32::MIN, "worst case"),
    ];
    for kind in ALL {
        let codec = kind.codec();
        for ex in &cases {
            let mut wire = BytesMut::new();
            codec.encode_exception(ex, &mut wire).expect("encode");
            assert_eq!(&codec.decode_exception(&wire).expect("decode"), ex, "{kind:?}");
        }
    }
}

#[test]
fn codecs_do_not_decode_each_other() {
    let head = RpcHead::new(MsgType::Call, 3, "A:b");
    let mut binary = BytesMut::new();
    CodecKind::Binary
        .codec()
        .encode_head(&head, &mut binary)
        .expect("encode");

    // A JSON decoder fed binary bytes must fail cleanly, not panic.
    assert!(CodecKind::Json.codec().decode_head(&binary).is_err());
}

#[test]
fn empty_input_fails_for_every_codec() {
    for kind in ALL {
        assert!(kind.codec().decode_head(&[]).is_err(), "{kind:?}");
    }
}
