//! Round-trip property checks for the wire codec (C2): for every frame kind,
//! `build(parse(s)) == s`, per SPEC_FULL §8.

use juicepass_bridge::frame::{build_command, classify, Frame};

#[test]
fn legacy_command_round_trips() {
    let wire = "CMD52324A20M16C006S001!5RE$";
    let frame = classify(wire.as_bytes()).unwrap();
    let command = match frame {
        Frame::Command(c) => c,
        other => panic!("expected a command frame, got {other:?}"),
    };
    assert_eq!(build_command(&command), wire);
}

#[test]
fn modern_command_round_trips() {
    let wire = "CMD52324A0020M016C006S001!YUK$";
    let frame = classify(wire.as_bytes()).unwrap();
    let command = match frame {
        Frame::Command(c) => c,
        other => panic!("expected a command frame, got {other:?}"),
    };
    assert_eq!(build_command(&command), wire);
}

#[test]
fn malformed_datagram_is_rejected() {
    let err = classify(b"not-a-juicebox-frame").unwrap_err();
    assert!(matches!(err, juicepass_bridge::error::CodecError::MalformedFrame(_)));
}

#[test]
fn encrypted_dialect_is_recognized_but_not_decoded() {
    let mut raw = vec![0u8; 40];
    raw[..33].copy_from_slice(b"0910000000000000000000000000:v09e");
    // Non-UTF8 byte forces the encrypted path even if the header were ASCII.
    raw[33] = 0xFF;
    let frame = classify(&raw).unwrap();
    match frame {
        Frame::Encrypted(e) => {
            assert_eq!(e.protocol_version, "v09e");
            assert_eq!(e.raw, raw);
        }
        other => panic!("expected an encrypted frame, got {other:?}"),
    }
}
