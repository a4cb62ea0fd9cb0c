/*!
ASCII-hex telegram framing used on the serial link.

A telegram is `AT` + 8 hex digit identifier + 2 hex digit length + payload hex
+ `\r\n`. Bit 31 of the identifier field flags extended addressing.

[`decode_telegram`] and [`encode_telegram`] are pure functions over one line.
[`TelegramAssembler`] sits in front of them on a byte stream: it splits lines
on the terminator and resynchronises when a line overruns the bounded window.
*/

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::can::{CanFrame, CanFrameError};
use crate::protocol::{
    EXTENDED_ID_FLAG, ID_HEX_DIGITS, LEN_HEX_DIGITS, MAX_TELEGRAM_BYTES, RESERVED_ID_BITS,
    TELEGRAM_HEADER, TELEGRAM_TERMINATOR,
};

/// Errors raised for malformed telegrams. The offending line is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Telegram does not end with CR LF")]
    MissingTerminator,

    #[error("Telegram does not start with the AT header")]
    BadHeader,

    #[error("Telegram too short: {0} field digits, need at least 10")]
    Truncated(usize),

    #[error("Non-hex character 0x{byte:02X} at field offset {offset}")]
    InvalidHex { offset: usize, byte: u8 },

    #[error("Odd number of payload hex digits ({0})")]
    OddHexDigits(usize),

    #[error("Declared length {declared} does not match {actual} payload bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Identifier field 0x{0:08X} is not a valid CAN identifier")]
    InvalidId(u32),

    #[error("Payload of {0} bytes exceeds the CAN limit")]
    PayloadTooLong(usize),

    #[error("No terminator within {0} bytes, resynchronising")]
    Overrun(usize),
}

/// Decode one complete telegram line (terminator included) into a frame
pub fn decode_telegram(line: &[u8]) -> Result<CanFrame, FramingError> {
    let body = line
        .strip_suffix(TELEGRAM_TERMINATOR)
        .ok_or(FramingError::MissingTerminator)?;
    let fields = body
        .strip_prefix(TELEGRAM_HEADER)
        .ok_or(FramingError::BadHeader)?;

    let header_digits = ID_HEX_DIGITS + LEN_HEX_DIGITS;
    if fields.len() < header_digits {
        return Err(FramingError::Truncated(fields.len()));
    }
    if let Some(offset) = fields.iter().position(|b| !b.is_ascii_hexdigit()) {
        return Err(FramingError::InvalidHex {
            offset,
            byte: fields[offset],
        });
    }

    let data_digits = &fields[header_digits..];
    if data_digits.len() % 2 != 0 {
        return Err(FramingError::OddHexDigits(data_digits.len()));
    }

    // All bytes were checked as ASCII hex digits above
    let id_field = parse_hex_u32(&fields[..ID_HEX_DIGITS]);
    let declared = parse_hex_u32(&fields[ID_HEX_DIGITS..header_digits]) as usize;
    let payload = hex::decode(data_digits).map_err(|_| FramingError::OddHexDigits(data_digits.len()))?;

    if payload.len() != declared {
        return Err(FramingError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    if id_field & RESERVED_ID_BITS != 0 {
        return Err(FramingError::InvalidId(id_field));
    }

    let is_extended = id_field & EXTENDED_ID_FLAG != 0;
    let arbitration_id = id_field & !EXTENDED_ID_FLAG;

    CanFrame::new(arbitration_id, is_extended, &payload).map_err(|e| match e {
        CanFrameError::IdOutOfRange { .. } => FramingError::InvalidId(id_field),
        CanFrameError::PayloadTooLong(n) => FramingError::PayloadTooLong(n),
    })
}

/// Encode a frame as a telegram, byte-exact with what [`decode_telegram`] accepts
pub fn encode_telegram(frame: &CanFrame) -> Vec<u8> {
    let id_field = if frame.is_extended() {
        frame.arbitration_id() | EXTENDED_ID_FLAG
    } else {
        frame.arbitration_id()
    };

    let mut out = Vec::with_capacity(MAX_TELEGRAM_BYTES);
    out.extend_from_slice(TELEGRAM_HEADER);
    out.extend_from_slice(format!("{:08X}{:02X}", id_field, frame.len()).as_bytes());
    out.extend_from_slice(hex::encode_upper(frame.payload()).as_bytes());
    out.extend_from_slice(TELEGRAM_TERMINATOR);
    out
}

fn parse_hex_u32(digits: &[u8]) -> u32 {
    digits.iter().fold(0u32, |acc, &b| {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => b - b'A' + 10,
        };
        (acc << 4) | nibble as u32
    })
}

/// Counters kept by the assembler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub lines: u64,
    pub overruns: u64,
    pub bytes_discarded: u64,
}

/// Splits a raw byte stream into telegram lines
///
/// Bytes are pushed as they arrive from the transport. When more than
/// [`MAX_TELEGRAM_BYTES`] accumulate without a terminator the buffer is
/// dropped, an [`FramingError::Overrun`] is reported once, and everything up
/// to the next `\n` is discarded.
#[derive(Debug, Default)]
pub struct TelegramAssembler {
    buffer: BytesMut,
    discarding: bool,
    stats: AssemblerStats,
}

impl TelegramAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the transport
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Take the next complete line, if one is buffered
    pub fn next_line(&mut self) -> Option<Result<Bytes, FramingError>> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.discarding {
                    self.stats.bytes_discarded += self.buffer.len() as u64;
                    self.buffer.clear();
                    return None;
                }
                if self.buffer.len() > MAX_TELEGRAM_BYTES {
                    let dropped = self.buffer.len();
                    self.buffer.clear();
                    self.discarding = true;
                    self.stats.overruns += 1;
                    self.stats.bytes_discarded += dropped as u64;
                    return Some(Err(FramingError::Overrun(dropped)));
                }
                return None;
            };

            let line = self.buffer.split_to(pos + 1).freeze();

            if self.discarding {
                debug!("Resynchronised after discarding {} bytes", line.len());
                self.discarding = false;
                self.stats.bytes_discarded += line.len() as u64;
                continue;
            }
            if line.len() > MAX_TELEGRAM_BYTES {
                self.stats.overruns += 1;
                self.stats.bytes_discarded += line.len() as u64;
                return Some(Err(FramingError::Overrun(line.len())));
            }
            if line.as_ref() == TELEGRAM_TERMINATOR || line.as_ref() == b"\n" {
                continue;
            }

            self.stats.lines += 1;
            return Some(Ok(line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_uplink_telegram() {
        let frame = decode_telegram(b"AT0000000104AABBCCDD\r\n").unwrap();
        assert_eq!(frame.arbitration_id(), 0x1);
        assert!(!frame.is_extended());
        assert_eq!(frame.payload(), &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_encode_downlink_telegram() {
        let frame = CanFrame::standard(0x1, &[0x1E]).unwrap();
        assert_eq!(encode_telegram(&frame), b"AT00000001011E\r\n".to_vec());
    }

    #[test]
    fn test_extended_flag_survives_roundtrip() {
        let frame = CanFrame::extended(0x1, &[0x11; 8]).unwrap();
        let wire = encode_telegram(&frame);
        assert_eq!(&wire[..12], b"AT8000000108");
        assert_eq!(decode_telegram(&wire).unwrap(), frame);
    }

    #[test]
    fn test_frame_roundtrip() {
        let frames = [
            CanFrame::standard(0x000, &[]).unwrap(),
            CanFrame::standard(0x7FF, &[0xFF; 8]).unwrap(),
            CanFrame::extended(0x1FFF_FFFF, &[0x00, 0x01]).unwrap(),
        ];
        for frame in frames {
            assert_eq!(decode_telegram(&encode_telegram(&frame)).unwrap(), frame);
        }
    }

    #[test]
    fn test_canonical_bytes_roundtrip() {
        let wire = b"AT0000011003A1B2C3\r\n";
        assert_eq!(encode_telegram(&decode_telegram(wire).unwrap()), wire.to_vec());

        // Lower-case input decodes and re-encodes in canonical upper case
        let lower = decode_telegram(b"AT0000011003a1b2c3\r\n").unwrap();
        assert_eq!(encode_telegram(&lower), wire.to_vec());
    }

    #[test]
    fn test_inconsistent_length_is_rejected() {
        // 0x108 declares 4 bytes but carries 8
        assert_eq!(
            decode_telegram(b"AT0000010804AABBCCDD0000000A\r\n"),
            Err(FramingError::LengthMismatch { declared: 4, actual: 8 })
        );
    }

    #[test]
    fn test_malformed_telegrams() {
        assert_eq!(decode_telegram(b"AT0000000100"), Err(FramingError::MissingTerminator));
        assert_eq!(decode_telegram(b"XT0000000100\r\n"), Err(FramingError::BadHeader));
        assert_eq!(decode_telegram(b"AT000001\r\n"), Err(FramingError::Truncated(6)));
        assert_eq!(
            decode_telegram(b"AT0000000101G0\r\n"),
            Err(FramingError::InvalidHex { offset: 10, byte: b'G' })
        );
        assert_eq!(decode_telegram(b"AT00000001011\r\n"), Err(FramingError::OddHexDigits(1)));
        assert_eq!(decode_telegram(b"AT00000800000\r\n"), Err(FramingError::OddHexDigits(1)));
        assert_eq!(decode_telegram(b"AT0000080000\r\n"), Err(FramingError::InvalidId(0x800)));
        assert_eq!(decode_telegram(b"AT4000000100\r\n"), Err(FramingError::InvalidId(0x4000_0001)));
        assert_eq!(
            decode_telegram(b"AT0000000109000000000000000000\r\n"),
            Err(FramingError::PayloadTooLong(9))
        );
    }

    #[test]
    fn test_assembler_splits_lines_across_pushes() {
        let mut assembler = TelegramAssembler::new();
        assembler.push(b"AT00000001");
        assert!(assembler.next_line().is_none());
        assembler.push(b"011E\r\nAT0000");
        let line = assembler.next_line().unwrap().unwrap();
        assert_eq!(line.as_ref(), b"AT00000001011E\r\n");
        assert!(assembler.next_line().is_none());
        assert_eq!(assembler.pending(), 6);
    }

    #[test]
    fn test_assembler_resyncs_after_overrun() {
        let mut assembler = TelegramAssembler::new();
        assembler.push(&[b'Z'; 40]);
        assert_eq!(assembler.next_line(), Some(Err(FramingError::Overrun(40))));

        // Tail of the garbage line is discarded up to the next terminator
        assembler.push(b"ZZZZ\r\nAT00000001011E\r\n");
        let line = assembler.next_line().unwrap().unwrap();
        assert_eq!(decode_telegram(&line).unwrap().payload(), &[0x1E]);

        let stats = assembler.stats();
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.lines, 1);
        assert_eq!(stats.bytes_discarded, 46);
    }

    #[test]
    fn test_bad_line_does_not_block_next_line() {
        let mut assembler = TelegramAssembler::new();
        assembler.push(b"AT0000000102AA\r\n\r\nAT0000000101AA\r\n");

        let first = assembler.next_line().unwrap().unwrap();
        assert!(matches!(decode_telegram(&first), Err(FramingError::LengthMismatch { .. })));

        let second = assembler.next_line().unwrap().unwrap();
        assert_eq!(decode_telegram(&second).unwrap().payload(), &[0xAA]);
    }
}
