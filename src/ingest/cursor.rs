//! Growable byte cursor with mark/reset semantics.
//!
//! Incoming network bytes are appended with [`ByteCursor::feed`]. Readers
//! record a mark before attempting a read; if the buffered bytes run out the
//! cursor is rewound to the mark and the read is retried once more bytes
//! arrive. Bytes before the mark are released with
//! [`ByteCursor::discard_before_mark`].

use adler2::Adler32;
use thiserror::Error;

/// Longest LEB128 encoding of a u64.
const MAX_VARINT_LEN: usize = 10;

/// Errors returned by cursor reads. A failed read never advances the cursor.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    #[error("insufficient data: need {needed} more bytes")]
    Insufficient { needed: usize },

    #[error("malformed varint")]
    MalformedVarint,
}

/// Ordered byte buffer with a read position and a mark.
///
/// Invariant: `mark <= pos <= buf.len()`.
#[derive(Debug, Default)]
pub struct ByteCursor {
    buf: Vec<u8>,
    mark: usize,
    pos: usize,
}

impl ByteCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            mark: 0,
            pos: 0,
        }
    }

    /// Append bytes to the end of the buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes available for reading after the current position.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Total bytes currently held, including bytes before the position.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Record the current position as the mark.
    pub fn mark(&mut self) {
        self.mark = self.pos;
    }

    /// Release all bytes before the mark. Positions shift down accordingly.
    pub fn discard_before_mark(&mut self) {
        if self.mark == 0 {
            return;
        }
        self.buf.drain(..self.mark);
        self.pos -= self.mark;
        self.mark = 0;
    }

    /// Rewind the read position to the mark.
    pub fn reset_to_mark(&mut self) {
        self.pos = self.mark;
    }

    /// Fold the bytes in `[mark, pos)` into `acc`.
    pub fn checksum_since_mark(&self, acc: &mut Adler32) {
        if let Some(consumed) = self.buf.get(self.mark..self.pos) {
            acc.write_slice(consumed);
        }
    }

    /// Read an unsigned LEB128 varint.
    pub fn read_varint(&mut self) -> Result<u64, CursorError> {
        let (value, len) = decode_varint(self.unread())?;
        self.pos += len;
        Ok(value)
    }

    /// Read exactly `len` bytes.
    pub fn read_slice(&mut self, len: usize) -> Result<&[u8], CursorError> {
        let available = self.remaining();
        if available < len {
            return Err(CursorError::Insufficient {
                needed: len - available,
            });
        }
        let start = self.pos;
        self.pos += len;
        self.buf
            .get(start..start + len)
            .ok_or(CursorError::Insufficient { needed: len })
    }

    /// Read a little-endian u32.
    pub fn read_u32_le(&mut self) -> Result<u32, CursorError> {
        let bytes = self.read_slice(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(raw))
    }

    fn unread(&self) -> &[u8] {
        self.buf.get(self.pos..).unwrap_or_default()
    }
}

impl From<Vec<u8>> for ByteCursor {
    fn from(buf: Vec<u8>) -> Self {
        Self {
            buf,
            mark: 0,
            pos: 0,
        }
    }
}

/// Decode a varint prefix of `data`, returning the value and its length.
fn decode_varint(data: &[u8]) -> Result<(u64, usize), CursorError> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().take(MAX_VARINT_LEN).enumerate() {
        let low = u64::from(byte & 0x7f);
        // The tenth byte may only carry the top bit of a u64.
        if i == MAX_VARINT_LEN - 1 && (byte & 0x80 != 0 || low > 1) {
            return Err(CursorError::MalformedVarint);
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CursorError::Insufficient { needed: 1 })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_single_and_multi_byte() {
        let mut cursor = ByteCursor::new();
        cursor.feed(&[0x05, 0xac, 0x02]);
        assert_eq!(cursor.read_varint().unwrap(), 5);
        assert_eq!(cursor.read_varint().unwrap(), 300);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_varint_insufficient_does_not_advance() {
        let mut cursor = ByteCursor::new();
        cursor.feed(&[0xac]);
        assert_eq!(
            cursor.read_varint(),
            Err(CursorError::Insufficient { needed: 1 })
        );
        assert_eq!(cursor.position(), 0);

        cursor.feed(&[0x02]);
        assert_eq!(cursor.read_varint().unwrap(), 300);
    }

    #[test]
    fn test_varint_overlong_is_malformed() {
        let mut cursor = ByteCursor::new();
        cursor.feed(&[0xff; 11]);
        assert_eq!(cursor.read_varint(), Err(CursorError::MalformedVarint));
    }

    #[test]
    fn test_varint_max_u64() {
        let mut cursor = ByteCursor::new();
        cursor.feed(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
        assert_eq!(cursor.read_varint().unwrap(), u64::MAX);
    }

    #[test]
    fn test_mark_reset_and_discard() {
        let mut cursor = ByteCursor::new();
        cursor.feed(&[1, 2, 3, 4, 5, 6]);

        cursor.read_slice(2).unwrap();
        cursor.mark();
        cursor.read_slice(3).unwrap();
        cursor.reset_to_mark();
        assert_eq!(cursor.position(), 2);

        cursor.discard_before_mark();
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.buffered(), 4);
        assert_eq!(cursor.read_slice(4).unwrap(), &[3, 4, 5, 6]);
    }

    #[test]
    fn test_read_slice_reports_shortfall() {
        let mut cursor = ByteCursor::new();
        cursor.feed(&[1, 2]);
        assert_eq!(
            cursor.read_slice(5),
            Err(CursorError::Insufficient { needed: 3 })
        );
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_checksum_covers_marked_range_only() {
        let mut cursor = ByteCursor::new();
        cursor.feed(b"xxhello");
        cursor.read_slice(2).unwrap();
        cursor.mark();
        cursor.read_slice(5).unwrap();

        let mut acc = Adler32::new();
        cursor.checksum_since_mark(&mut acc);

        let mut expected = Adler32::new();
        expected.write_slice(b"hello");
        assert_eq!(acc.checksum(), expected.checksum());
    }

    #[test]
    fn test_read_u32_le() {
        let mut cursor = ByteCursor::new();
        cursor.feed(&0xdead_beef_u32.to_le_bytes());
        assert_eq!(cursor.read_u32_le().unwrap(), 0xdead_beef);
    }
}
