//! Property-based tests for the segment codec.

use proptest::prelude::*;

use rudp::packet::{seq_lt, PacketError, Segment, SegmentKind, HEADER_LEN, MAX_PAYLOAD};

fn kind_strategy() -> impl Strategy<Value = SegmentKind> {
    prop_oneof![
        Just(SegmentKind::Normal),
        Just(SegmentKind::Conn),
        Just(SegmentKind::ConnAck),
        Just(SegmentKind::Fin),
        Just(SegmentKind::FinAck),
        Just(SegmentKind::Ack),
        Just(SegmentKind::Heartbeat),
    ]
}

proptest! {
    /// Decoding arbitrary bytes returns a value or an error, never panics,
    /// and never yields a payload above the limit.
    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..600)) {
        if let Ok(segment) = Segment::decode(&bytes) {
            prop_assert!(segment.payload.len() <= MAX_PAYLOAD);
            prop_assert!(bytes.len() >= HEADER_LEN + segment.payload.len());
        }
    }

    /// Every well-formed segment survives the wire, even with trailing junk.
    #[test]
    fn wire_preserves_segment(
        seq in any::<u32>(),
        ack in any::<u32>(),
        kind in kind_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD),
        junk in prop::collection::vec(any::<u8>(), 0..8),
    ) {
        let segment = Segment { seq, ack, kind, payload };
        let mut wire = segment.encode().unwrap();
        prop_assert_eq!(wire.len(), segment.encoded_len());
        wire.extend_from_slice(&junk);
        prop_assert_eq!(Segment::decode(&wire).unwrap(), segment);
    }

    /// Payloads over the limit are refused by the encoder.
    #[test]
    fn oversized_payload_rejected(extra in 1usize..64) {
        let segment = Segment::data(1, vec![0; MAX_PAYLOAD + extra]);
        prop_assert_eq!(
            segment.encode(),
            Err(PacketError::PayloadTooLarge(MAX_PAYLOAD + extra))
        );
    }

    /// Wrap-aware ordering is a strict order on nearby numbers.
    #[test]
    fn seq_lt_is_antisymmetric(a in any::<u32>(), delta in 1u32..(1 << 30)) {
        let b = a.wrapping_add(delta);
        prop_assert!(seq_lt(a, b));
        prop_assert!(!seq_lt(b, a));
        prop_assert!(!seq_lt(a, a));
    }
}
