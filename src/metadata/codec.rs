//! Low-level binary primitives for the metadata file: width-tagged varuints,
//! length-prefixed strings, and a cursor that turns running off the end of
//! the buffer into the exact "expected N bytes, got M" wording callers above
//! this module rely on.

use anyhow::{Result, bail, ensure};

/// A read-only cursor over an in-memory buffer. We load the whole metadata
/// file up front (it's one small `Vec<u8>`, not a multi-gigabyte pack) and
/// parse out of it, the way backpak's index/pack readers work off a fully
/// buffered blob rather than streaming incrementally.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.remaining() >= n,
            "expected {n} bytes, got {}",
            self.remaining()
        );
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn i64(&mut self) -> Result<i64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("took exactly 8 bytes");
        Ok(i64::from_le_bytes(bytes))
    }

    pub fn u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self.take(2)?.try_into().expect("took exactly 2 bytes");
        Ok(u16::from_le_bytes(bytes))
    }

    /// A width-tagged varuint: one tag byte `w in {1,2,4,8}`, then `w`
    /// little-endian bytes.
    pub fn varuint(&mut self) -> Result<u64> {
        let width = self.u8()?;
        let val = match width {
            1 => self.take(1)?[0] as u64,
            2 => {
                let bytes: [u8; 2] = self.take(2)?.try_into().expect("took exactly 2 bytes");
                u16::from_le_bytes(bytes) as u64
            }
            4 => {
                let bytes: [u8; 4] = self.take(4)?.try_into().expect("took exactly 4 bytes");
                u32::from_le_bytes(bytes) as u64
            }
            8 => {
                let bytes: [u8; 8] = self.take(8)?.try_into().expect("took exactly 8 bytes");
                u64::from_le_bytes(bytes)
            }
            other => bail!("invalid varuint width tag {other}"),
        };
        Ok(val)
    }

    /// `length:varuint` then `length` raw bytes.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.varuint()? as usize;
        self.take(len)
    }

    /// Exactly `n` raw bytes, no length prefix (used for inline hash bodies
    /// whose length was already read as `size`).
    pub fn fixed_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }
}

/// Picks the narrowest width tag that fits `val`, the inverse of
/// [`Cursor::varuint`].
pub fn write_varuint(out: &mut Vec<u8>, val: u64) {
    if let Ok(v) = u8::try_from(val) {
        out.push(1);
        out.push(v);
    } else if let Ok(v) = u16::try_from(val) {
        out.push(2);
        out.extend_from_slice(&v.to_le_bytes());
    } else if let Ok(v) = u32::try_from(val) {
        out.push(4);
        out.extend_from_slice(&v.to_le_bytes());
    } else {
        out.push(8);
        out.extend_from_slice(&val.to_le_bytes());
    }
}

pub fn write_i64(out: &mut Vec<u8>, val: i64) {
    out.extend_from_slice(&val.to_le_bytes());
}

pub fn write_u16(out: &mut Vec<u8>, val: u16) {
    out.extend_from_slice(&val.to_le_bytes());
}

pub fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varuint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn varuint_round_trips_every_width() {
        for val in [0u64, 1, 255, 256, 65535, 65536, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varuint(&mut buf, val);
            let mut cur = Cursor::new(&buf);
            assert_eq!(cur.varuint().unwrap(), val);
            assert!(cur.is_empty());
        }
    }

    #[test]
    fn varuint_picks_narrowest_width() {
        let mut buf = Vec::new();
        write_varuint(&mut buf, 5);
        assert_eq!(buf, vec![1, 5]);
    }

    #[test]
    fn truncated_varuint_reports_expected_got() {
        let buf = [1u8]; // tag says one more byte follows, but buffer ends
        let mut cur = Cursor::new(&buf);
        let err = cur.varuint().unwrap_err();
        assert_eq!(err.to_string(), "expected 1 bytes, got 0");
    }

    #[test]
    fn invalid_width_tag_rejected() {
        let buf = [3u8, 0, 0, 0];
        let mut cur = Cursor::new(&buf);
        let err = cur.varuint().unwrap_err();
        assert_eq!(err.to_string(), "invalid varuint width tag 3");
    }

    #[test]
    fn bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hello");
        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.bytes().unwrap(), b"hello");
    }

    #[test]
    fn i64_extremes_round_trip() {
        for val in [i64::MIN, i64::MAX, 0] {
            let mut buf = Vec::new();
            write_i64(&mut buf, val);
            let mut cur = Cursor::new(&buf);
            assert_eq!(cur.i64().unwrap(), val);
        }
    }
}
