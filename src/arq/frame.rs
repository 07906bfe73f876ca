//! Frames exchanged by the ARQ layer, and their wire format.
//!
//! Every frame starts with a single flags byte:
//!
//! ```ascii
//! 0: flags (8 bits):
//!     * bit 0-1: kind of frame:
//!       * 00 DATA
//!       * 01 ACK
//!       * 10 UNSEQUENCED - passed through without acknowledgement
//!       * 11 (invalid)
//!     * bit 2-6: unused, must be 0
//!     * bit 7: sequence bit - must be 0 for UNSEQUENCED
//! 1: payload (DATA and UNSEQUENCED only, extends to the end of the frame)
//! ```
//!
//! NB: There is no length field - framing is the link's job, i.e. one frame per UDP datagram.
use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Alternating-bit sequence number. Since stop-and-wait has at most one frame in flight, two
///  values are enough to tell a new frame from a retransmission of the previous one.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SequenceBit(bool);

impl SequenceBit {
    pub const ZERO: SequenceBit = SequenceBit(false);
    pub const ONE: SequenceBit = SequenceBit(true);

    #[must_use]
    pub fn flipped(self) -> SequenceBit {
        SequenceBit(!self.0)
    }

    pub fn flip(&mut self) {
        self.0 = !self.0;
    }
}

impl Debug for SequenceBit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0 as u8)
    }
}

#[derive(Clone, Eq, PartialEq)]
pub enum ArqFrame {
    Data { bit: SequenceBit, payload: Bytes },
    /// NB: `bit` is the receiver's *currently expected* inbound bit, i.e. the bit of the next
    ///  DATA frame it will accept. A sender treats an ACK as confirmation iff its bit differs
    ///  from the bit of the frame in flight.
    Ack { bit: SequenceBit },
    Unsequenced { payload: Bytes },
}

impl Debug for ArqFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ArqFrame::Data { bit, payload } => write!(f, "DATA({:?}, {} bytes)", bit, payload.len()),
            ArqFrame::Ack { bit } => write!(f, "ACK({:?})", bit),
            ArqFrame::Unsequenced { payload } => write!(f, "UNSEQUENCED({} bytes)", payload.len()),
        }
    }
}

impl ArqFrame {
    pub const HEADER_LEN: usize = 1;

    const KIND_MASK: u8 = 0b0000_0011;
    const KIND_DATA: u8 = 0b00;
    const KIND_ACK: u8 = 0b01;
    const KIND_UNSEQUENCED: u8 = 0b10;
    const RESERVED_MASK: u8 = 0b0111_1100;
    const SEQUENCE_BIT: u8 = 0b1000_0000;

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + match self {
            ArqFrame::Data { payload, .. } => payload.len(),
            ArqFrame::Ack { .. } => 0,
            ArqFrame::Unsequenced { payload } => payload.len(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            ArqFrame::Data { bit, payload } => {
                buf.put_u8(Self::KIND_DATA | Self::bit_flag(*bit));
                buf.put_slice(payload);
            }
            ArqFrame::Ack { bit } => {
                buf.put_u8(Self::KIND_ACK | Self::bit_flag(*bit));
            }
            ArqFrame::Unsequenced { payload } => {
                buf.put_u8(Self::KIND_UNSEQUENCED);
                buf.put_slice(payload);
            }
        }
    }

    pub fn deser(buf: &mut Bytes) -> anyhow::Result<ArqFrame> {
        if !buf.has_remaining() {
            bail!("empty frame");
        }
        let flags = buf.get_u8();

        if flags & Self::RESERVED_MASK != 0 {
            bail!("reserved flag bits are set: {:08b}", flags);
        }
        let bit = SequenceBit(flags & Self::SEQUENCE_BIT != 0);

        match flags & Self::KIND_MASK {
            Self::KIND_DATA => {
                Ok(ArqFrame::Data { bit, payload: buf.split_to(buf.len()) })
            }
            Self::KIND_ACK => {
                if buf.has_remaining() {
                    bail!("ACK frame with {} trailing bytes", buf.remaining());
                }
                Ok(ArqFrame::Ack { bit })
            }
            Self::KIND_UNSEQUENCED => {
                if bit == SequenceBit::ONE {
                    bail!("sequence bit set on unsequenced frame");
                }
                Ok(ArqFrame::Unsequenced { payload: buf.split_to(buf.len()) })
            }
            _ => bail!("invalid frame kind in flags {:08b}", flags),
        }
    }

    fn bit_flag(bit: SequenceBit) -> u8 {
        if bit.0 { Self::SEQUENCE_BIT } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::data_0(ArqFrame::Data { bit: SequenceBit::ZERO, payload: Bytes::from_static(b"abc") }, vec![0x00, b'a', b'b', b'c'])]
    #[case::data_1(ArqFrame::Data { bit: SequenceBit::ONE, payload: Bytes::from_static(b"abc") }, vec![0x80, b'a', b'b', b'c'])]
    #[case::data_empty(ArqFrame::Data { bit: SequenceBit::ONE, payload: Bytes::new() }, vec![0x80])]
    #[case::ack_0(ArqFrame::Ack { bit: SequenceBit::ZERO }, vec![0x01])]
    #[case::ack_1(ArqFrame::Ack { bit: SequenceBit::ONE }, vec![0x81])]
    #[case::unsequenced(ArqFrame::Unsequenced { payload: Bytes::from_static(b"xy") }, vec![0x02, b'x', b'y'])]
    fn test_ser(#[case] frame: ArqFrame, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.to_vec(), expected);
        assert_eq!(frame.serialized_len(), expected.len());

        let mut b = buf.freeze();
        assert_eq!(ArqFrame::deser(&mut b).unwrap(), frame);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::invalid_kind(vec![0x03])]
    #[case::reserved_bits(vec![0x04])]
    #[case::reserved_bits_high(vec![0x40, 1, 2])]
    #[case::ack_with_payload(vec![0x01, 9])]
    #[case::unsequenced_with_bit(vec![0x82, 9])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut b = Bytes::from(raw);
        assert!(ArqFrame::deser(&mut b).is_err());
    }

    #[test]
    fn test_flip() {
        let mut bit = SequenceBit::ZERO;
        bit.flip();
        assert_eq!(bit, SequenceBit::ONE);
        assert_eq!(bit.flipped(), SequenceBit::ZERO);
        assert_eq!(format!("{:?}", bit), "1");
    }
}
