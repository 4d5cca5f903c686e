//! Length-prefixed binary tick record.
//!
//! Each record on disk is a `u32` little-endian payload length followed by
//! the payload. Payload layout (all fields little-endian):
//!
//! ```text
//! Offset  Size  Field
//! 0       2     magic (0x544B)
//! 2       1     version
//! 3       1     kind (1=last 2=all_last 3=bid_ask 4=mid_point)
//! 4       1     flags (0x1 bid_past_low, 0x2 ask_past_high, 0x4 unreported)
//! 5       3     padding
//! 8       8     ts (broker time, µs)
//! 16      8     st (system time, µs)
//! 24      4     cid
//! 28      4     rid
//! 32      ..    variant doubles:
//!               bid_ask:        bp, bs, ap, as   (32 bytes, total 64)
//!               last/all_last:  p, s             (16 bytes, total 48)
//!               mid_point:      mp               ( 8 bytes, total 40)
//! ```
//!
//! The length prefix and payload are always written in a single buffered
//! write, so a reader never observes a prefix without its payload except at
//! a truncated tail, which it skips.

use std::io::{self, Read, Write};

use crate::types::{TickMessage, TickType};

pub const TICK_MAGIC: u16 = 0x544B;
pub const TICK_VERSION: u8 = 1;

const HEADER_SIZE: usize = 32;

/// Flags byte constants.
pub mod flags {
    pub const BID_PAST_LOW: u8 = 0x01;
    pub const ASK_PAST_HIGH: u8 = 0x02;
    pub const UNREPORTED: u8 = 0x04;
}

/// Kind tags reuse the upstream gateway's inner tick-type codes.
fn kind_tag(tt: TickType) -> u8 {
    match tt {
        TickType::Last => 1,
        TickType::AllLast => 2,
        TickType::BidAsk => 3,
        TickType::MidPoint => 4,
    }
}

fn kind_from_tag(tag: u8) -> Option<TickType> {
    match tag {
        1 => Some(TickType::Last),
        2 => Some(TickType::AllLast),
        3 => Some(TickType::BidAsk),
        4 => Some(TickType::MidPoint),
        _ => None,
    }
}

fn payload_size(tt: TickType) -> usize {
    HEADER_SIZE
        + match tt {
            TickType::BidAsk => 32,
            TickType::Last | TickType::AllLast => 16,
            TickType::MidPoint => 8,
        }
}

/// Errors raised while decoding a stored record.
#[derive(Debug, Clone)]
pub enum RecordError {
    InvalidSize(usize),
    InvalidMagic(u16),
    UnsupportedVersion(u8),
    UnknownKind(u8),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize(s) => write!(f, "invalid record size: {s}"),
            Self::InvalidMagic(m) => {
                write!(f, "invalid magic: 0x{m:04X} (expected 0x{TICK_MAGIC:04X})")
            }
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported version: {v} (expected {TICK_VERSION})")
            }
            Self::UnknownKind(k) => write!(f, "unknown record kind: {k}"),
        }
    }
}

impl std::error::Error for RecordError {}

/// Encode a record as `length prefix + payload` in one buffer.
pub fn encode_framed(msg: &TickMessage) -> Vec<u8> {
    let size = payload_size(msg.tt);
    let mut buf = Vec::with_capacity(4 + size);
    buf.extend_from_slice(&(size as u32).to_le_bytes());

    let mut fl = 0u8;
    if msg.bpl == Some(true) {
        fl |= flags::BID_PAST_LOW;
    }
    if msg.aph == Some(true) {
        fl |= flags::ASK_PAST_HIGH;
    }
    if msg.upt == Some(true) {
        fl |= flags::UNREPORTED;
    }

    buf.extend_from_slice(&TICK_MAGIC.to_le_bytes());
    buf.push(TICK_VERSION);
    buf.push(kind_tag(msg.tt));
    buf.push(fl);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&msg.ts.to_le_bytes());
    buf.extend_from_slice(&msg.st.to_le_bytes());
    buf.extend_from_slice(&msg.cid.to_le_bytes());
    buf.extend_from_slice(&msg.rid.to_le_bytes());

    match msg.tt {
        TickType::BidAsk => {
            for v in [msg.bp, msg.bs, msg.ap, msg.as_] {
                buf.extend_from_slice(&v.unwrap_or(0.0).to_le_bytes());
            }
        }
        TickType::Last | TickType::AllLast => {
            for v in [msg.p, msg.s] {
                buf.extend_from_slice(&v.unwrap_or(0.0).to_le_bytes());
            }
        }
        TickType::MidPoint => {
            buf.extend_from_slice(&msg.mp.unwrap_or(0.0).to_le_bytes());
        }
    }

    debug_assert_eq!(buf.len(), 4 + size);
    buf
}

/// Write one framed record.
pub fn write_framed<W: Write>(w: &mut W, msg: &TickMessage) -> io::Result<()> {
    w.write_all(&encode_framed(msg))
}

fn read_f64(buf: &[u8], offset: usize) -> f64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    f64::from_le_bytes(b)
}

/// Decode a record payload (without the length prefix).
pub fn decode_payload(buf: &[u8]) -> Result<TickMessage, RecordError> {
    if buf.len() < HEADER_SIZE {
        return Err(RecordError::InvalidSize(buf.len()));
    }
    let magic = u16::from_le_bytes([buf[0], buf[1]]);
    if magic != TICK_MAGIC {
        return Err(RecordError::InvalidMagic(magic));
    }
    if buf[2] != TICK_VERSION {
        return Err(RecordError::UnsupportedVersion(buf[2]));
    }
    let tt = kind_from_tag(buf[3]).ok_or(RecordError::UnknownKind(buf[3]))?;
    if buf.len() != payload_size(tt) {
        return Err(RecordError::InvalidSize(buf.len()));
    }
    let fl = buf[4];

    let ts = u64::from_le_bytes(buf[8..16].try_into().unwrap_or_default());
    let st = u64::from_le_bytes(buf[16..24].try_into().unwrap_or_default());
    let cid = u32::from_le_bytes(buf[24..28].try_into().unwrap_or_default());
    let rid = u32::from_le_bytes(buf[28..32].try_into().unwrap_or_default());

    let mut msg = TickMessage::new(ts, st, cid, tt, rid);
    match tt {
        TickType::BidAsk => {
            msg.bp = Some(read_f64(buf, 32));
            msg.bs = Some(read_f64(buf, 40));
            msg.ap = Some(read_f64(buf, 48));
            msg.as_ = Some(read_f64(buf, 56));
            if fl & flags::BID_PAST_LOW != 0 {
                msg.bpl = Some(true);
            }
            if fl & flags::ASK_PAST_HIGH != 0 {
                msg.aph = Some(true);
            }
        }
        TickType::Last | TickType::AllLast => {
            msg.p = Some(read_f64(buf, 32));
            msg.s = Some(read_f64(buf, 40));
            if fl & flags::UNREPORTED != 0 {
                msg.upt = Some(true);
            }
        }
        TickType::MidPoint => {
            msg.mp = Some(read_f64(buf, 32));
        }
    }
    Ok(msg)
}

/// Result of pulling the next record off a reader.
#[derive(Debug)]
pub enum ReadOutcome {
    Record(TickMessage),
    /// Clean end of file.
    Eof,
    /// A partial record at the end of the file; the caller counts and skips.
    TruncatedTail,
}

/// Raw frame pulled off a reader: the payload bytes without the prefix.
#[derive(Debug)]
pub enum FrameOutcome {
    Payload(Vec<u8>),
    Eof,
    TruncatedTail,
}

/// Read the next length-prefixed frame. Payloads above `MAX_PAYLOAD` are
/// treated as corruption (a truncated tail in the middle of a prefix).
pub fn read_frame<R: Read>(r: &mut R) -> FrameOutcome {
    const MAX_PAYLOAD: u32 = 65536;

    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(r, &mut len_buf) {
        ExactRead::Full => {}
        ExactRead::Eof => return FrameOutcome::Eof,
        ExactRead::Partial => return FrameOutcome::TruncatedTail,
    }
    let len = u32::from_le_bytes(len_buf);
    if len == 0 || len > MAX_PAYLOAD {
        return FrameOutcome::TruncatedTail;
    }

    let mut payload = vec![0u8; len as usize];
    match read_exact_or_eof(r, &mut payload) {
        ExactRead::Full => FrameOutcome::Payload(payload),
        ExactRead::Eof | ExactRead::Partial => FrameOutcome::TruncatedTail,
    }
}

/// Read and decode the next compact binary record.
pub fn read_framed<R: Read>(r: &mut R) -> Result<ReadOutcome, RecordError> {
    match read_frame(r) {
        FrameOutcome::Payload(payload) => decode_payload(&payload).map(ReadOutcome::Record),
        FrameOutcome::Eof => Ok(ReadOutcome::Eof),
        FrameOutcome::TruncatedTail => Ok(ReadOutcome::TruncatedTail),
    }
}

enum ExactRead {
    Full,
    Eof,
    Partial,
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> ExactRead {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ExactRead::Eof
                } else {
                    ExactRead::Partial
                }
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return ExactRead::Partial,
        }
    }
    ExactRead::Full
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn bid_ask_sample() -> TickMessage {
        let mut msg = TickMessage::new(1754008313000000, 1754008313037772, 711280073, TickType::BidAsk, 3520);
        msg.bp = Some(23260.0);
        msg.bs = Some(4.0);
        msg.ap = Some(23260.5);
        msg.as_ = Some(2.0);
        msg.aph = Some(true);
        msg
    }

    #[test]
    fn test_roundtrip_all_variants() {
        let mut last = TickMessage::new(1, 2, 3, TickType::Last, 4);
        last.p = Some(100.25);
        last.s = Some(1.0);
        last.upt = Some(true);

        let mut mid = TickMessage::new(5, 6, 7, TickType::MidPoint, 8);
        mid.mp = Some(50.5);

        for msg in [bid_ask_sample(), last, mid] {
            let framed = encode_framed(&msg);
            let mut cursor = Cursor::new(framed);
            match read_framed(&mut cursor).unwrap() {
                ReadOutcome::Record(back) => assert_eq!(back, msg),
                other => panic!("expected record, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_truncated_tail_is_skipped() {
        let mut bytes = encode_framed(&bid_ask_sample());
        bytes.truncate(bytes.len() - 5);
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_framed(&mut cursor).unwrap(),
            ReadOutcome::TruncatedTail
        ));
    }

    #[test]
    fn test_clean_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(matches!(read_framed(&mut cursor).unwrap(), ReadOutcome::Eof));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut framed = encode_framed(&bid_ask_sample());
        framed[4] ^= 0xFF;
        let mut cursor = Cursor::new(framed);
        assert!(read_framed(&mut cursor).is_err());
    }

    #[test]
    fn test_sequential_records() {
        let mut buf = Vec::new();
        let first = bid_ask_sample();
        let mut second = bid_ask_sample();
        second.ts += 1000;
        write_framed(&mut buf, &first).unwrap();
        write_framed(&mut buf, &second).unwrap();

        let mut cursor = Cursor::new(buf);
        let mut seen = Vec::new();
        while let ReadOutcome::Record(msg) = read_framed(&mut cursor).unwrap() {
            seen.push(msg);
        }
        assert_eq!(seen, vec![first, second]);
    }
}
