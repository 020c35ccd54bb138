//! # Frame Wire Format
//!
//! Every datagram carries one or more segments. The session and listener
//! layers only ever look at the first four bytes (the conversation id) and at
//! [`OVERHEAD`]; the remaining fields belong to the reference engine in
//! [`crate::arq`].
//!
//! ## Segment Header (24 bytes, little endian)
//!
//! ```text
//!  0               4       5       6               8
//! +---------------+-------+-------+---------------+
//! |     conv      |  cmd  |  frg  |      wnd      |
//! +---------------+-------+-------+---------------+
//! |      ts       |      sn       |      una      |
//! +---------------+---------------+---------------+
//! |      len      |  payload (len bytes) ...
//! +---------------+
//! ```

use bytes::{Buf, BufMut};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Size of the segment header. Anything shorter cannot be a valid frame.
pub const OVERHEAD: usize = 24;

/// Size of the conversation id prefix.
pub const CONV_LEN: usize = 4;

/// Largest datagram read from a socket.
pub const MAX_DATAGRAM: usize = 1500;

// ─── Commands ────────────────────────────────────────────────────────────────

/// Segment command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Application data.
    Push = 81,
    /// Acknowledgement of one pushed segment.
    Ack = 82,
    /// Ask the peer to advertise its receive window.
    WindowProbe = 83,
    /// Advertise our receive window.
    WindowTell = 84,
}

impl Command {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            81 => Some(Command::Push),
            82 => Some(Command::Ack),
            83 => Some(Command::WindowProbe),
            84 => Some(Command::WindowTell),
            _ => None,
        }
    }
}

// ─── Conversation Id ─────────────────────────────────────────────────────────

/// Extract the conversation id from the head of a frame.
///
/// Returns `None` when the frame is shorter than the id itself.
pub fn conversation_id(frame: &[u8]) -> Option<u32> {
    if frame.len() < CONV_LEN {
        return None;
    }
    let mut cursor = frame;
    Some(cursor.get_u32_le())
}

/// Whether a datagram is long enough to hold at least one segment header.
#[inline]
pub fn is_runt(frame: &[u8]) -> bool {
    frame.len() < OVERHEAD
}

// ─── Segment Header ──────────────────────────────────────────────────────────

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub conv: u32,
    pub cmd: Command,
    /// Remaining fragments of the record after this one (0 = last).
    pub frg: u8,
    /// Sender's free receive window, in segments.
    pub wnd: u16,
    /// Millisecond timestamp (echoed back in ACKs).
    pub ts: u32,
    pub sn: u32,
    /// Cumulative acknowledgement: everything below has been received.
    pub una: u32,
    /// Payload length following the header.
    pub len: u32,
}

impl SegmentHeader {
    /// Encode the header into a buffer.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    /// Decode a header. Returns `None` if the buffer is too short or the
    /// command byte is unknown.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < OVERHEAD {
            return None;
        }
        let conv = buf.get_u32_le();
        let cmd = Command::from_byte(buf.get_u8())?;
        let frg = buf.get_u8();
        let wnd = buf.get_u16_le();
        let ts = buf.get_u32_le();
        let sn = buf.get_u32_le();
        let una = buf.get_u32_le();
        let len = buf.get_u32_le();
        Some(SegmentHeader {
            conv,
            cmd,
            frg,
            wnd,
            ts,
            sn,
            una,
            len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn sample() -> SegmentHeader {
        SegmentHeader {
            conv: 0xDEAD_BEEF,
            cmd: Command::Push,
            frg: 2,
            wnd: 128,
            ts: 1234,
            sn: 7,
            una: 5,
            len: 11,
        }
    }

    #[test]
    fn header_is_exactly_overhead_bytes() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        assert_eq!(buf.len(), OVERHEAD);
    }

    #[test]
    fn conv_is_little_endian_prefix() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        assert_eq!(&buf[..4], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(conversation_id(&buf), Some(0xDEAD_BEEF));
    }

    #[test]
    fn conversation_id_needs_four_bytes() {
        assert_eq!(conversation_id(&[1, 2, 3]), None);
        assert_eq!(conversation_id(&[1, 0, 0, 0]), Some(1));
    }

    #[test]
    fn decode_recovers_fields() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        let decoded = SegmentHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        let mut short = &buf[..OVERHEAD - 1];
        assert!(SegmentHeader::decode(&mut short).is_none());
    }

    #[test]
    fn decode_rejects_unknown_command() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        buf[4] = 0x01;
        assert!(SegmentHeader::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn runt_detection() {
        assert!(is_runt(&[0u8; OVERHEAD - 1]));
        assert!(!is_runt(&[0u8; OVERHEAD]));
    }
}
