use bytes::{BufMut, Bytes, BytesMut};

use crate::wire_header::WireHeader;

/// Send-side progress tracking for one outbound message. Header and payload are serialized
///  into one contiguous buffer up front so a short write can resume anywhere in the frame,
///  mirroring the receive side's progress counter.
pub struct SendBuffer {
    frame: Bytes,
    written: usize,
}

impl SendBuffer {
    pub fn new(message_id: u64, payload: &[u8]) -> SendBuffer {
        let mut buf = BytesMut::with_capacity(WireHeader::SERIALIZED_LEN + payload.len());
        WireHeader::for_payload(message_id, payload).ser(&mut buf);
        buf.put_slice(payload);
        SendBuffer {
            frame: buf.freeze(),
            written: 0,
        }
    }

    /// The bytes still to be written, starting at the current progress counter.
    pub fn remaining(&self) -> &[u8] {
        &self.frame[self.written..]
    }

    pub fn advance(&mut self, num_written: usize) {
        self.written += num_written;
        debug_assert!(self.written <= self.frame.len());
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.frame.len()
    }
}
