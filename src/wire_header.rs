use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::safe_converter::PrecheckedCast;

/// Message id reserved for heartbeat ping / pong probes. Never assigned to an application call.
pub const PING_MESSAGE_ID: u64 = u64::MAX;
/// Message id reserved for protocol version probes. Never assigned to an application call.
pub const VERSION_MESSAGE_ID: u64 = u64::MAX - 1;

/// The fixed-size framing record preceding every message on the wire. All fields are serialized
///  in network byte order (BE).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireHeader {
    pub payload_len: u32,
    pub message_id: u64,
}

impl WireHeader {
    pub const MAGIC: u16 = 0xdaf4;
    pub const PROTOCOL_VERSION_1: u16 = 1;
    pub const SERIALIZED_LEN: usize = 2 * std::mem::size_of::<u16>() + std::mem::size_of::<u32>() + std::mem::size_of::<u64>();

    pub fn for_payload(message_id: u64, payload: &[u8]) -> WireHeader {
        WireHeader {
            payload_len: payload.len().prechecked_cast(),
            message_id,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(Self::MAGIC);
        buf.put_u16(Self::PROTOCOL_VERSION_1);
        buf.put_u32(self.payload_len);
        buf.put_u64(self.message_id);
    }

    /// Parse and validate a header. Any failure here is fatal to the connection it was
    ///  received on - there is no way to re-synchronize on a byte stream with a corrupt header.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<WireHeader> {
        let magic = buf.try_get_u16()?;
        if magic != Self::MAGIC {
            bail!("message does not start with magic {:#06x} (was {:#06x})", Self::MAGIC, magic);
        }
        let version = buf.try_get_u16()?;
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("message uses protocol version {}, but this code only understands version {}", version, Self::PROTOCOL_VERSION_1);
        }
        let payload_len = buf.try_get_u32()?;
        let message_id = buf.try_get_u64()?;
        Ok(WireHeader {
            payload_len,
            message_id,
        })
    }

    /// The payload length cap is configured rather than part of the wire format, so it is
    ///  checked separately from [WireHeader::deser] - before any payload buffer is allocated.
    pub fn check_payload_len(&self, max_message_size: u32) -> anyhow::Result<()> {
        if self.payload_len > max_message_size {
            bail!("message is too long to receive (message is {} bytes, limit is {} bytes)", self.payload_len, max_message_size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(9999, 17)]
    #[case(u32::MAX, u64::MAX)]
    #[case(12345, PING_MESSAGE_ID)]
    fn test_ser_deser_round_trip(#[case] payload_len: u32, #[case] message_id: u64) {
        let original = WireHeader { payload_len, message_id };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), WireHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = WireHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_deser_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        WireHeader { payload_len: 4, message_id: 7 }.ser(&mut buf);
        buf[0] = 0x12;
        buf[1] = 0x34;

        let mut b: &[u8] = &buf;
        assert!(WireHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_deser_rejects_unsupported_version() {
        let mut buf = BytesMut::new();
        WireHeader { payload_len: 4, message_id: 7 }.ser(&mut buf);
        buf[2] = 0;
        buf[3] = 2;

        let mut b: &[u8] = &buf;
        assert!(WireHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_deser_rejects_truncated_header() {
        let mut buf = BytesMut::new();
        WireHeader { payload_len: 4, message_id: 7 }.ser(&mut buf);

        let mut b: &[u8] = &buf[..WireHeader::SERIALIZED_LEN - 1];
        assert!(WireHeader::deser(&mut b).is_err());
    }

    #[rstest]
    #[case(100, 100, true)]
    #[case(100, 101, false)]
    #[case(100, 0, true)]
    fn test_check_payload_len(#[case] max: u32, #[case] len: u32, #[case] expected_ok: bool) {
        let header = WireHeader { payload_len: len, message_id: 1 };
        assert_eq!(header.check_payload_len(max).is_ok(), expected_ok);
    }

    #[test]
    fn test_for_payload() {
        let header = WireHeader::for_payload(42, &[1, 2, 3]);
        assert_eq!(header, WireHeader { payload_len: 3, message_id: 42 });
    }
}
