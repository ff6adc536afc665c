use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::safe_converter::SafeCast;
use crate::wire_header::WireHeader;

/// One fully framed message taken off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    pub message_id: u64,
    pub payload: Bytes,
}

enum AssemblyPhase {
    /// Accumulating the fixed-size header.
    Header,
    /// Header is parsed and validated, accumulating `payload_len` payload bytes.
    Payload { message_id: u64, payload_len: usize },
}

/// Receive-side framing state machine: `ReadingHeader -> ReadingPayload -> message complete ->
///  ReadingHeader`. Bytes are fed in whatever chunk sizes the transport delivers them in; each
///  partial chunk just advances the accumulation progress.
///
/// The header and the payload are read in two phases because the payload length is not known
///  until the header is parsed. The payload buffer is sized per message from the declared
///  length, after that length passed the configured cap.
///
/// This is deliberately free of I/O so the framing logic can be tested byte by byte.
pub struct MessageAssembler {
    max_message_size: u32,
    phase: AssemblyPhase,
    buf: BytesMut,
}

impl MessageAssembler {
    pub fn new(max_message_size: u32) -> MessageAssembler {
        MessageAssembler {
            max_message_size,
            phase: AssemblyPhase::Header,
            buf: BytesMut::with_capacity(WireHeader::SERIALIZED_LEN),
        }
    }

    /// Feed freshly received bytes into the state machine, returning all messages that became
    ///  complete. An `Err` means the framing is broken (bad magic / version / oversized payload)
    ///  and the connection must be closed - the stream cannot be re-synchronized.
    pub fn on_bytes(&mut self, mut chunk: &[u8]) -> anyhow::Result<Vec<AssembledMessage>> {
        let mut completed = Vec::new();

        loop {
            match self.phase {
                AssemblyPhase::Header => {
                    let missing = WireHeader::SERIALIZED_LEN - self.buf.len();
                    if missing > 0 {
                        if chunk.is_empty() {
                            break;
                        }
                        let n = missing.min(chunk.len());
                        self.buf.extend_from_slice(&chunk[..n]);
                        chunk = &chunk[n..];
                        if self.buf.len() < WireHeader::SERIALIZED_LEN {
                            break;
                        }
                    }

                    let mut b: &[u8] = &self.buf;
                    let header = WireHeader::deser(&mut b)?;
                    header.check_payload_len(self.max_message_size)?;
                    trace!("received header for message {} with payload length {}", header.message_id, header.payload_len);

                    self.buf.clear();
                    self.buf.reserve(header.payload_len.safe_cast());
                    self.phase = AssemblyPhase::Payload {
                        message_id: header.message_id,
                        payload_len: header.payload_len.safe_cast(),
                    };
                }
                AssemblyPhase::Payload { message_id, payload_len } => {
                    let missing = payload_len - self.buf.len();
                    if missing > 0 {
                        if chunk.is_empty() {
                            break;
                        }
                        let n = missing.min(chunk.len());
                        self.buf.extend_from_slice(&chunk[..n]);
                        chunk = &chunk[n..];
                        if self.buf.len() < payload_len {
                            break;
                        }
                    }

                    completed.push(AssembledMessage {
                        message_id,
                        payload: self.buf.split().freeze(),
                    });
                    self.phase = AssemblyPhase::Header;
                }
            }
        }

        Ok(completed)
    }
}
