//! Wire protocol types for wisp
//!
//! A [`Message`] is framed the same way on every transport:
//!
//! ```text
//! +--------+-------------+-----------+-----------------+---------------+
//! | opcode | key_len u32 | key bytes | payload_len u32 | payload bytes |
//! +--------+-------------+-----------+-----------------+---------------+
//! ```
//!
//! All integers are big-endian. TCP streams frames back to back; RDMA places
//! exactly one frame in each receive slot.
//!
//! [`QueuePairInfo`] is the fixed-width record both RDMA peers exchange over
//! the side channel before their queue pairs can be brought up.

use crate::error::Fault;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opcode byte plus the two length prefixes.
pub const HEADER_LEN: usize = 1 + 4 + 4;

/// Upper bound for a key or a payload.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Encoded size of a message with the given field lengths.
pub fn frame_len(key_len: usize, payload_len: usize) -> usize {
    HEADER_LEN + key_len + payload_len
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Request = 0,
    Response = 1,
}

impl TryFrom<u8> for Opcode {
    type Error = Fault;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::Request),
            1 => Ok(Opcode::Response),
            other => Err(Fault::Malformed(format!("unknown opcode {}", other))),
        }
    }
}

/// A request or response carrying a key and a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    opcode: Opcode,
    key: Bytes,
    payload: Bytes,
}

impl Message {
    pub fn new(opcode: Opcode, key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            key: key.into(),
            payload: payload.into(),
        }
    }

    pub fn request(key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Request, key, payload)
    }

    /// Echo response: same key and payload as the request.
    pub fn response_to(request: &Message) -> Self {
        Self::new(Opcode::Response, request.key.clone(), request.payload.clone())
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn encoded_len(&self) -> usize {
        frame_len(self.key.len(), self.payload.len())
    }

    /// Check field bounds and the total frame size against `max_frame`.
    pub fn validate(&self, max_frame: usize) -> Result<(), Fault> {
        for len in [self.key.len(), self.payload.len()] {
            if len > MAX_FIELD_LEN {
                return Err(Fault::TooLarge {
                    len,
                    max: MAX_FIELD_LEN,
                });
            }
        }
        let len = self.encoded_len();
        if len > max_frame {
            return Err(Fault::TooLarge { len, max: max_frame });
        }
        Ok(())
    }

    /// Append the framed message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Fault> {
        self.validate(usize::MAX)?;
        dst.reserve(self.encoded_len());
        dst.put_u8(self.opcode as u8);
        dst.put_u32(self.key.len() as u32);
        dst.put_slice(&self.key);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Write the framed message into a fixed buffer, returning the bytes used.
    pub fn encode_into(&self, mut dst: &mut [u8]) -> Result<usize, Fault> {
        self.validate(dst.len())?;
        let len = self.encoded_len();
        dst.put_u8(self.opcode as u8);
        dst.put_u32(self.key.len() as u32);
        dst.put_slice(&self.key);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        Ok(len)
    }

    /// Parse one frame off the front of a stream buffer.
    ///
    /// Returns `Ok(None)` while the buffer holds less than a full frame; the
    /// buffer is left untouched in that case.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Message>, Fault> {
        let Some(total) = Self::peek_frame_len(src)? else {
            return Ok(None);
        };
        if src.len() < total {
            return Ok(None);
        }
        let frame = src.split_to(total).freeze();
        Self::decode_frame(frame).map(Some)
    }

    /// Parse a buffer that must hold exactly one frame.
    pub fn decode_exact(src: &[u8]) -> Result<Message, Fault> {
        match Self::peek_frame_len(src)? {
            Some(total) if total == src.len() => {
                Self::decode_frame(Bytes::copy_from_slice(src))
            }
            Some(total) => Err(Fault::Malformed(format!(
                "frame declares {} bytes but buffer holds {}",
                total,
                src.len()
            ))),
            None => Err(Fault::Malformed(format!(
                "truncated frame of {} bytes",
                src.len()
            ))),
        }
    }

    /// Total frame length if enough of the header is present to know it.
    fn peek_frame_len(src: &[u8]) -> Result<Option<usize>, Fault> {
        if src.is_empty() {
            return Ok(None);
        }
        Opcode::try_from(src[0])?;
        if src.len() < 5 {
            return Ok(None);
        }
        let key_len = read_len(&src[1..5])?;
        let payload_at = 5 + key_len;
        if src.len() < payload_at + 4 {
            return Ok(None);
        }
        let payload_len = read_len(&src[payload_at..payload_at + 4])?;
        Ok(Some(frame_len(key_len, payload_len)))
    }

    fn decode_frame(mut frame: Bytes) -> Result<Message, Fault> {
        let opcode = Opcode::try_from(frame.get_u8())?;
        let key_len = frame.get_u32() as usize;
        let key = frame.split_to(key_len);
        let payload_len = frame.get_u32() as usize;
        let payload = frame.split_to(payload_len);
        Ok(Message {
            opcode,
            key,
            payload,
        })
    }
}

fn read_len(mut raw: &[u8]) -> Result<usize, Fault> {
    let len = raw.get_u32() as usize;
    if len > MAX_FIELD_LEN {
        return Err(Fault::Malformed(format!(
            "field length {} exceeds {}",
            len, MAX_FIELD_LEN
        )));
    }
    Ok(len)
}

/// Remote key for RDMA memory access
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryRegionRemoteKey(pub u32);

/// 128-bit port GID.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gid(pub [u8; 16]);

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

/// Everything a peer needs to bring its queue pair up against ours.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePairInfo {
    pub qp_num: u32,
    pub psn: u32,
    pub lid: u16,
    pub gid: Gid,
    pub lkey: u32,
    pub rkey: MemoryRegionRemoteKey,
    /// Base address of the registered region
    pub addr: u64,
    /// Largest frame the peer can receive in one slot
    pub slot_size: u32,
    pub recv_depth: u32,
}

impl QueuePairInfo {
    pub const MAGIC: [u8; 4] = *b"WSP1";
    pub const ENCODED_LEN: usize = 4 + 4 + 4 + 2 + 16 + 4 + 4 + 8 + 4 + 4;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        let mut dst = &mut bytes[..];
        dst.put_slice(&Self::MAGIC);
        dst.put_u32(self.qp_num);
        dst.put_u32(self.psn);
        dst.put_u16(self.lid);
        dst.put_slice(&self.gid.0);
        dst.put_u32(self.lkey);
        dst.put_u32(self.rkey.0);
        dst.put_u64(self.addr);
        dst.put_u32(self.slot_size);
        dst.put_u32(self.recv_depth);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::ENCODED_LEN]) -> Result<Self, Fault> {
        let mut src = &bytes[..];
        if src[..4] != Self::MAGIC {
            return Err(Fault::Malformed(format!(
                "bad side channel magic {:02x?}",
                &src[..4]
            )));
        }
        src.advance(4);
        let qp_num = src.get_u32();
        let psn = src.get_u32();
        let lid = src.get_u16();
        let mut gid = [0u8; 16];
        src.copy_to_slice(&mut gid);
        Ok(Self {
            qp_num,
            psn,
            lid,
            gid: Gid(gid),
            lkey: src.get_u32(),
            rkey: MemoryRegionRemoteKey(src.get_u32()),
            addr: src.get_u64(),
            slot_size: src.get_u32(),
            recv_depth: src.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_frame_round_trip() {
        for (key_len, payload_len) in [(0, 0), (3, 10), (0, 4096), (255, 1)] {
            let msg = Message::request(pattern(key_len), pattern(payload_len));
            let mut buf = BytesMut::new();
            msg.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), frame_len(key_len, payload_len));

            let decoded = Message::decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_frame_layout_is_big_endian() {
        let msg = Message::new(Opcode::Response, &b"ab"[..], &b"xyz"[..]);
        let mut buf = BytesMut::new();
        msg.encode(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[1, 0, 0, 0, 2, b'a', b'b', 0, 0, 0, 3, b'x', b'y', b'z'][..]
        );
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let msg = Message::request(&b"key"[..], &b"0123456789"[..]);
        let mut full = BytesMut::new();
        msg.encode(&mut full).unwrap();

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(Message::decode(&mut partial).unwrap().is_none());
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn test_back_to_back_frames_split() {
        let first = Message::request(&b"k1"[..], &b"first"[..]);
        let second = Message::request(&b"k2"[..], &b"second"[..]);
        let mut buf = BytesMut::new();
        first.encode(&mut buf).unwrap();
        second.encode(&mut buf).unwrap();

        assert_eq!(Message::decode(&mut buf).unwrap(), Some(first));
        assert_eq!(Message::decode(&mut buf).unwrap(), Some(second));
        assert_eq!(Message::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut buf = BytesMut::from(&[7u8, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            Message::decode(&mut buf),
            Err(Fault::Malformed(_))
        ));
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u32((MAX_FIELD_LEN + 1) as u32);
        assert!(matches!(
            Message::decode(&mut buf),
            Err(Fault::Malformed(_))
        ));
    }

    #[test]
    fn test_encode_into_respects_slot_size() {
        let msg = Message::request(pattern(8), pattern(64));
        let mut slot = vec![0u8; 32];
        assert!(matches!(
            msg.encode_into(&mut slot),
            Err(Fault::TooLarge { len: 81, max: 32 })
        ));

        let mut slot = vec![0u8; 128];
        let used = msg.encode_into(&mut slot).unwrap();
        assert_eq!(used, msg.encoded_len());
        assert_eq!(Message::decode_exact(&slot[..used]).unwrap(), msg);
        assert!(Message::decode_exact(&slot[..used - 1]).is_err());
    }

    #[test]
    fn test_queue_pair_info_round_trip() {
        let info = QueuePairInfo {
            qp_num: 0x1234,
            psn: 0x00ab_cdef,
            lid: 7,
            gid: Gid([0xfe; 16]),
            lkey: 11,
            rkey: MemoryRegionRemoteKey(12),
            addr: 0xdead_beef_0000,
            slot_size: 4096,
            recv_depth: 16,
        };
        let bytes = info.to_bytes();
        assert_eq!(&bytes[..4], b"WSP1");
        assert_eq!(QueuePairInfo::from_bytes(&bytes).unwrap(), info);

        let mut corrupt = bytes;
        corrupt[0] = b'X';
        assert!(QueuePairInfo::from_bytes(&corrupt).is_err());
    }
}
