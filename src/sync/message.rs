//! Synchronization-protocol message types.
//!
//! Six message kinds travel inside encrypted transport frames, packed
//! back to back into batches of at most [`MAX_SP_SIZE`] bytes:
//!
//! ```text
//! Info:  [ 0x00 | nice (1) | size (8, BE) | hash (32) ]
//! Freq:  [ 0x01 | hash (32) | offset (8, BE) ]
//! File:  [ 0x02 | hash (32) | offset (8, BE) | len (4, BE) | payload ]
//! Done:  [ 0x03 | hash (32) ]
//! Halt:  [ 0x04 ]
//! Ping:  [ 0x05 ]
//! ```
//!
//! A batch that fails to parse is a protocol violation and terminates
//! the session.

use crate::core::{HASH_SIZE, MAX_SP_SIZE, ProtocolError, SP_HEAD_OVERHEAD};

/// Content hash of a queued packet, the join key of all transfer state.
pub type PktHash = [u8; HASH_SIZE];

/// Wire size of an Info message.
pub const SP_INFO_OVERHEAD: usize = SP_HEAD_OVERHEAD + 1 + 8 + HASH_SIZE;
/// Wire size of a Freq message.
pub const SP_FREQ_OVERHEAD: usize = SP_HEAD_OVERHEAD + HASH_SIZE + 8;
/// Wire size of a File message, excluding its payload.
pub const SP_FILE_OVERHEAD: usize = SP_HEAD_OVERHEAD + HASH_SIZE + 8 + 4;
/// Wire size of a Done message.
pub const SP_DONE_OVERHEAD: usize = SP_HEAD_OVERHEAD + HASH_SIZE;

/// Largest File chunk payload that still fits a batch.
pub const MAX_FILE_CHUNK: usize = MAX_SP_SIZE - SP_FILE_OVERHEAD;

const TYPE_INFO: u8 = 0x00;
const TYPE_FREQ: u8 = 0x01;
const TYPE_FILE: u8 = 0x02;
const TYPE_DONE: u8 = 0x03;
const TYPE_HALT: u8 = 0x04;
const TYPE_PING: u8 = 0x05;

/// One synchronization-protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpMessage {
    /// Advertisement of one queued packet.
    Info {
        /// Niceness the packet was queued at.
        nice: u8,
        /// Full size of the stored file.
        size: u64,
        /// Content hash.
        hash: PktHash,
    },
    /// Request for an advertised packet, from a resume offset.
    Freq {
        /// Content hash previously advertised to us.
        hash: PktHash,
        /// Offset transfer should resume from.
        offset: u64,
    },
    /// One chunk of a requested file.
    File {
        /// Content hash being served.
        hash: PktHash,
        /// Offset this chunk starts at.
        offset: u64,
        /// Chunk bytes; may be empty when the request was already
        /// satisfied.
        payload: Vec<u8>,
    },
    /// Receipt confirmation: the peer durably verified the packet.
    Done {
        /// Content hash the peer verified.
        hash: PktHash,
    },
    /// Clears the sender's belief about our request queue.
    Halt,
    /// Keepalive; does not touch the non-ping activity timers.
    Ping,
}

impl SpMessage {
    /// Whether this message is a keepalive.
    pub fn is_ping(&self) -> bool {
        matches!(self, SpMessage::Ping)
    }

    /// Encoded size of this message.
    pub fn wire_size(&self) -> usize {
        match self {
            SpMessage::Info { .. } => SP_INFO_OVERHEAD,
            SpMessage::Freq { .. } => SP_FREQ_OVERHEAD,
            SpMessage::File { payload, .. } => SP_FILE_OVERHEAD + payload.len(),
            SpMessage::Done { .. } => SP_DONE_OVERHEAD,
            SpMessage::Halt | SpMessage::Ping => SP_HEAD_OVERHEAD,
        }
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        match self {
            SpMessage::Info { nice, size, hash } => {
                buf.push(TYPE_INFO);
                buf.push(*nice);
                buf.extend_from_slice(&size.to_be_bytes());
                buf.extend_from_slice(hash);
            }
            SpMessage::Freq { hash, offset } => {
                buf.push(TYPE_FREQ);
                buf.extend_from_slice(hash);
                buf.extend_from_slice(&offset.to_be_bytes());
            }
            SpMessage::File { hash, offset, payload } => {
                buf.push(TYPE_FILE);
                buf.extend_from_slice(hash);
                buf.extend_from_slice(&offset.to_be_bytes());
                buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                buf.extend_from_slice(payload);
            }
            SpMessage::Done { hash } => {
                buf.push(TYPE_DONE);
                buf.extend_from_slice(hash);
            }
            SpMessage::Halt => buf.push(TYPE_HALT),
            SpMessage::Ping => buf.push(TYPE_PING),
        }
        buf
    }

    /// Decode one message from the front of `data`, returning it and the
    /// bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let Some(&typ) = data.first() else {
            return Err(ProtocolError::Truncated { expected: SP_HEAD_OVERHEAD, actual: 0 });
        };
        match typ {
            TYPE_INFO => {
                need(data, SP_INFO_OVERHEAD)?;
                let nice = data[1];
                let size = be64(&data[2..10]);
                let hash = hash_at(&data[10..42]);
                Ok((SpMessage::Info { nice, size, hash }, SP_INFO_OVERHEAD))
            }
            TYPE_FREQ => {
                need(data, SP_FREQ_OVERHEAD)?;
                let hash = hash_at(&data[1..33]);
                let offset = be64(&data[33..41]);
                Ok((SpMessage::Freq { hash, offset }, SP_FREQ_OVERHEAD))
            }
            TYPE_FILE => {
                need(data, SP_FILE_OVERHEAD)?;
                let hash = hash_at(&data[1..33]);
                let offset = be64(&data[33..41]);
                let len = u32::from_be_bytes(data[41..45].try_into().unwrap()) as usize;
                if len > MAX_FILE_CHUNK {
                    return Err(ProtocolError::Oversized { size: len, limit: MAX_FILE_CHUNK });
                }
                need(data, SP_FILE_OVERHEAD + len)?;
                let payload = data[SP_FILE_OVERHEAD..SP_FILE_OVERHEAD + len].to_vec();
                Ok((SpMessage::File { hash, offset, payload }, SP_FILE_OVERHEAD + len))
            }
            TYPE_DONE => {
                need(data, SP_DONE_OVERHEAD)?;
                Ok((SpMessage::Done { hash: hash_at(&data[1..33]) }, SP_DONE_OVERHEAD))
            }
            TYPE_HALT => Ok((SpMessage::Halt, SP_HEAD_OVERHEAD)),
            TYPE_PING => Ok((SpMessage::Ping, SP_HEAD_OVERHEAD)),
            other => Err(ProtocolError::UnknownMessage(other)),
        }
    }
}

fn need(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() < expected {
        return Err(ProtocolError::Truncated { expected, actual: data.len() });
    }
    Ok(())
}

fn be64(data: &[u8]) -> u64 {
    u64::from_be_bytes(data.try_into().unwrap())
}

fn hash_at(data: &[u8]) -> PktHash {
    data.try_into().unwrap()
}

/// Pack encoded messages into batches of at most [`MAX_SP_SIZE`] bytes.
///
/// Messages stay in order; a batch is cut when appending the next
/// message would overflow.
pub fn split_payloads(payloads: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut batches = Vec::new();
    let mut batch: Vec<u8> = Vec::with_capacity(MAX_SP_SIZE);
    for payload in payloads {
        if !batch.is_empty() && batch.len() + payload.len() > MAX_SP_SIZE {
            batches.push(std::mem::replace(&mut batch, Vec::with_capacity(MAX_SP_SIZE)));
        }
        batch.extend_from_slice(&payload);
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: SpMessage) {
        let encoded = msg.encode();
        assert_eq!(encoded.len(), msg.wire_size());
        let (decoded, consumed) = SpMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn roundtrip_all_kinds() {
        roundtrip(SpMessage::Info { nice: 64, size: 300 << 10, hash: [0xab; 32] });
        roundtrip(SpMessage::Freq { hash: [0x01; 32], offset: 12345 });
        roundtrip(SpMessage::File { hash: [0x02; 32], offset: 7, payload: vec![9; 1000] });
        roundtrip(SpMessage::File { hash: [0x03; 32], offset: 300 << 10, payload: vec![] });
        roundtrip(SpMessage::Done { hash: [0x04; 32] });
        roundtrip(SpMessage::Halt);
        roundtrip(SpMessage::Ping);
    }

    #[test]
    fn decode_batch_in_order() {
        let mut batch = Vec::new();
        let msgs = vec![
            SpMessage::Info { nice: 1, size: 10, hash: [1; 32] },
            SpMessage::Ping,
            SpMessage::Freq { hash: [1; 32], offset: 0 },
            SpMessage::Halt,
        ];
        for m in &msgs {
            batch.extend_from_slice(&m.encode());
        }

        let mut decoded = Vec::new();
        let mut rest = &batch[..];
        while !rest.is_empty() {
            let (msg, consumed) = SpMessage::decode(rest).unwrap();
            decoded.push(msg);
            rest = &rest[consumed..];
        }
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn unknown_type_is_protocol_violation() {
        let err = SpMessage::decode(&[0x7f]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage(0x7f)));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let encoded = SpMessage::Info { nice: 1, size: 2, hash: [3; 32] }.encode();
        let err = SpMessage::decode(&encoded[..10]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));

        let chunk = SpMessage::File { hash: [0; 32], offset: 0, payload: vec![1; 64] }.encode();
        let err = SpMessage::decode(&chunk[..chunk.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let mut encoded = SpMessage::File { hash: [0; 32], offset: 0, payload: vec![] }.encode();
        encoded[41..45].copy_from_slice(&(MAX_FILE_CHUNK as u32 + 1).to_be_bytes());
        let err = SpMessage::decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { .. }));
    }

    #[test]
    fn split_respects_batch_limit() {
        let info = SpMessage::Info { nice: 0, size: 0, hash: [0; 32] }.encode();
        let count = MAX_SP_SIZE / info.len() + 3;
        let batches = split_payloads(vec![info.clone(); count]);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() <= MAX_SP_SIZE));
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), count * info.len());
    }

    #[test]
    fn split_of_nothing_is_empty() {
        assert!(split_payloads(Vec::new()).is_empty());
    }
}
