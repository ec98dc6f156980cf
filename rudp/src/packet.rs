//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a [`Segment`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |C|A|F|H| rsvd  |   Reserved    |        Payload Length         |
//! |O|C|I|B|       |               |                               |
//! |N|K|N|T|       |               |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 12 bytes.
//! seq(4) + ack(4) + flags(1) + reserved(1) + payload_len(2)

use thiserror::Error;

/// Bit-flag constants for the `flags` header byte.
///
/// Kinds that need two bits (ConnAck, FinAck) OR them together.
pub mod flags {
    /// Handshake initiation.
    pub const CONN: u8 = 0b1000_0000;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0100_0000;
    /// Sender is tearing the connection down.
    pub const FIN: u8 = 0b0010_0000;
    /// Idle keep-alive.
    pub const HEARTBEAT: u8 = 0b0001_0000;
    /// Bits that carry meaning; the low nibble is reserved.
    pub const MASK: u8 = CONN | ACK | FIN | HEARTBEAT;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 12;

/// Largest datagram we ever put on the wire (576 − 8 − 60).
pub const MAX_DATAGRAM: usize = 508;

/// Largest payload a single segment may carry.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_RESERVED: usize = 9;
const OFF_PAYLOAD_LEN: usize = 10;

/// What a segment means to the connection engine.
///
/// Derived from the header flag bits only, never from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Application data; the only kind that is acknowledged and resent.
    Normal,
    Conn,
    ConnAck,
    Fin,
    FinAck,
    Ack,
    Heartbeat,
}

impl SegmentKind {
    /// Flag byte for this kind.
    pub fn flags(self) -> u8 {
        match self {
            SegmentKind::Normal => 0,
            SegmentKind::Conn => flags::CONN,
            SegmentKind::ConnAck => flags::CONN | flags::ACK,
            SegmentKind::Fin => flags::FIN,
            SegmentKind::FinAck => flags::FIN | flags::ACK,
            SegmentKind::Ack => flags::ACK,
            SegmentKind::Heartbeat => flags::HEARTBEAT,
        }
    }

    /// Map a header flag byte back to a kind.
    ///
    /// Reserved bits are ignored. Any other combination (e.g. CONN|FIN) is
    /// rejected rather than silently read as [`SegmentKind::Normal`].
    pub fn from_flags(raw: u8) -> Result<Self, PacketError> {
        match raw & flags::MASK {
            0 => Ok(SegmentKind::Normal),
            flags::CONN => Ok(SegmentKind::Conn),
            f if f == flags::CONN | flags::ACK => Ok(SegmentKind::ConnAck),
            flags::FIN => Ok(SegmentKind::Fin),
            f if f == flags::FIN | flags::ACK => Ok(SegmentKind::FinAck),
            flags::ACK => Ok(SegmentKind::Ack),
            flags::HEARTBEAT => Ok(SegmentKind::Heartbeat),
            _ => Err(PacketError::InvalidFlags(raw)),
        }
    }
}

impl std::fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SegmentKind::Normal => "DATA",
            SegmentKind::Conn => "CONN",
            SegmentKind::ConnAck => "CONN-ACK",
            SegmentKind::Fin => "FIN",
            SegmentKind::FinAck => "FIN-ACK",
            SegmentKind::Ack => "ACK",
            SegmentKind::Heartbeat => "HEARTBEAT",
        };
        f.write_str(name)
    }
}

/// A complete protocol datagram: header fields + payload bytes.
///
/// The payload length is not stored; it is always `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Sender-assigned sequence number.
    pub seq: u32,
    /// Sequence number being acknowledged (control segments only).
    pub ack: u32,
    pub kind: SegmentKind,
    pub payload: Vec<u8>,
}

impl Segment {
    /// A data segment.
    pub fn data(seq: u32, payload: Vec<u8>) -> Self {
        Self::control(SegmentKind::Normal, seq, 0).with_payload(payload)
    }

    /// Handshake request carrying the client's initial sequence number.
    pub fn conn(seq: u32) -> Self {
        Self::control(SegmentKind::Conn, seq, 0)
    }

    /// Handshake reply: `seq` is the server's initial sequence number,
    /// `ack` echoes the client's `Conn` sequence number.
    pub fn conn_ack(seq: u32, ack: u32) -> Self {
        Self::control(SegmentKind::ConnAck, seq, ack)
    }

    pub fn fin(seq: u32) -> Self {
        Self::control(SegmentKind::Fin, seq, 0)
    }

    /// Teardown reply; `ack` echoes the `Fin` sequence number.
    pub fn fin_ack(seq: u32, ack: u32) -> Self {
        Self::control(SegmentKind::FinAck, seq, ack)
    }

    /// Acknowledges the data segment numbered `ack`.
    pub fn ack(seq: u32, ack: u32) -> Self {
        Self::control(SegmentKind::Ack, seq, ack)
    }

    pub fn heartbeat(seq: u32) -> Self {
        Self::control(SegmentKind::Heartbeat, seq, 0)
    }

    fn control(kind: SegmentKind, seq: u32, ack: u32) -> Self {
        Self {
            seq,
            ack,
            kind,
            payload: Vec::new(),
        }
    }

    fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Length of this segment once encoded.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialise this segment into a newly allocated byte vector.
    ///
    /// Fails only when the payload exceeds [`MAX_PAYLOAD`].
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }
        let mut buf = vec![0u8; HEADER_LEN + payload_len];

        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_FLAGS] = self.kind.flags();
        buf[OFF_RESERVED] = 0;
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload_len as u16).to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        Ok(buf)
    }

    /// Parse a [`Segment`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the flag byte is not one of the defined kinds,
    /// - the declared payload length exceeds [`MAX_PAYLOAD`], or
    /// - the declared payload length exceeds the bytes actually present.
    ///
    /// Bytes past the declared payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::TooShort(buf.len()));
        }

        let seq = read_u32(buf, OFF_SEQ);
        let ack = read_u32(buf, OFF_ACK);
        let kind = SegmentKind::from_flags(buf[OFF_FLAGS])?;
        let declared =
            u16::from_be_bytes([buf[OFF_PAYLOAD_LEN], buf[OFF_PAYLOAD_LEN + 1]]) as usize;

        if declared > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(declared));
        }
        let available = buf.len() - HEADER_LEN;
        if declared > available {
            return Err(PacketError::LengthMismatch {
                declared,
                available,
            });
        }

        Ok(Segment {
            seq,
            ack,
            kind,
            payload: buf[HEADER_LEN..HEADER_LEN + declared].to_vec(),
        })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// `true` when `a` comes strictly before `b` in wrap-around sequence space.
///
/// Correct as long as the two values are less than `u32::MAX / 2` apart.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Errors that can arise when parsing or building a datagram.
///
/// Every variant is a malformed segment: the datagram is dropped and the
/// connection carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer of {0} bytes is too short to contain a header")]
    TooShort(usize),
    #[error("payload_len field claims {declared} bytes but only {available} follow the header")]
    LengthMismatch { declared: usize, available: usize },
    #[error("payload of {0} bytes exceeds the 496-byte limit")]
    PayloadTooLarge(usize),
    #[error("flag byte {0:#04x} does not name a segment kind")]
    InvalidFlags(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [SegmentKind; 7] = [
        SegmentKind::Normal,
        SegmentKind::Conn,
        SegmentKind::ConnAck,
        SegmentKind::Fin,
        SegmentKind::FinAck,
        SegmentKind::Ack,
        SegmentKind::Heartbeat,
    ];

    #[test]
    fn encode_decode_roundtrip() {
        let seg = Segment::data(42, b"hello".to_vec());
        let decoded = Segment::decode(&seg.encode().unwrap()).unwrap();
        assert_eq!(decoded, seg);
    }

    #[test]
    fn every_kind_survives_the_wire() {
        for kind in ALL_KINDS {
            let seg = Segment {
                seq: 7,
                ack: 9,
                kind,
                payload: vec![],
            };
            let decoded = Segment::decode(&seg.encode().unwrap()).unwrap();
            assert_eq!(decoded.kind, kind, "kind {kind} changed on the wire");
        }
    }

    #[test]
    fn encode_sets_correct_payload_len() {
        let bytes = Segment::data(1, b"world".to_vec()).encode().unwrap();
        let len_field = u16::from_be_bytes([bytes[OFF_PAYLOAD_LEN], bytes[OFF_PAYLOAD_LEN + 1]]);
        assert_eq!(len_field, 5);
    }

    #[test]
    fn control_flags_are_or_combined() {
        let conn_ack = Segment::conn_ack(1, 2).encode().unwrap();
        assert_eq!(conn_ack[OFF_FLAGS], 0b1100_0000);

        let fin_ack = Segment::fin_ack(1, 2).encode().unwrap();
        assert_eq!(fin_ack[OFF_FLAGS], 0b0110_0000);

        let hb = Segment::heartbeat(1).encode().unwrap();
        assert_eq!(hb[OFF_FLAGS], 0b0001_0000);
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(Segment::decode(&[]), Err(PacketError::TooShort(0)));
    }

    #[test]
    fn decode_short_header_returns_error() {
        for len in 0..HEADER_LEN {
            assert_eq!(
                Segment::decode(&vec![0u8; len]),
                Err(PacketError::TooShort(len))
            );
        }
    }

    #[test]
    fn decode_truncated_payload_returns_error() {
        let mut bytes = Segment::data(0, b"data".to_vec()).encode().unwrap();
        bytes.pop();
        assert_eq!(
            Segment::decode(&bytes),
            Err(PacketError::LengthMismatch {
                declared: 4,
                available: 3
            })
        );
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut bytes = Segment::data(3, b"abc".to_vec()).encode().unwrap();
        bytes.extend_from_slice(&[0xee; 20]);
        let decoded = Segment::decode(&bytes).unwrap();
        assert_eq!(decoded.payload, b"abc");
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        let mut bytes = Segment::conn(5).encode().unwrap();
        bytes[OFF_FLAGS] = flags::CONN | flags::FIN;
        assert_eq!(
            Segment::decode(&bytes),
            Err(PacketError::InvalidFlags(flags::CONN | flags::FIN))
        );

        bytes[OFF_FLAGS] = flags::HEARTBEAT | flags::ACK;
        assert!(Segment::decode(&bytes).is_err());
    }

    #[test]
    fn reserved_bits_are_ignored() {
        let mut bytes = Segment::heartbeat(5).encode().unwrap();
        bytes[OFF_FLAGS] |= 0b0000_0101;
        bytes[OFF_RESERVED] = 0xff;
        assert_eq!(Segment::decode(&bytes).unwrap().kind, SegmentKind::Heartbeat);
    }

    #[test]
    fn oversized_payload_is_rejected_both_ways() {
        let seg = Segment::data(0, vec![0u8; MAX_PAYLOAD + 1]);
        assert_eq!(seg.encode(), Err(PacketError::PayloadTooLarge(MAX_PAYLOAD + 1)));

        let mut bytes = vec![0u8; MAX_DATAGRAM + 16];
        bytes[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&((MAX_PAYLOAD + 1) as u16).to_be_bytes());
        assert_eq!(
            Segment::decode(&bytes),
            Err(PacketError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn full_payload_fits_max_datagram() {
        let bytes = Segment::data(0, vec![1u8; MAX_PAYLOAD]).encode().unwrap();
        assert_eq!(bytes.len(), MAX_DATAGRAM);
    }

    #[test]
    fn header_constants_are_consistent() {
        assert_eq!(HEADER_LEN, 12);
        assert_eq!(MAX_DATAGRAM, 508);
        assert_eq!(MAX_PAYLOAD, 496);
    }

    #[test]
    fn seq_ack_big_endian_on_wire() {
        let bytes = Segment::ack(0x0102_0304, 0x0506_0708).encode().unwrap();
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[OFF_ACK..OFF_ACK + 4], &[0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn seq_lt_handles_wrap() {
        assert!(seq_lt(1, 2));
        assert!(!seq_lt(2, 1));
        assert!(!seq_lt(5, 5));
        assert!(seq_lt(u32::MAX, 0));
        assert!(!seq_lt(0, u32::MAX));
    }
}
