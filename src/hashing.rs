//! The hashing primitive: SHA-1 over file bodies, producing a 20-byte
//! `hash[20]`.
//!
//! Deliberately thin, mirroring backpak's `hashing.rs` (a
//! `HashingReader`/`HashingWriter` pair wrapping a streaming digest, plus hex
//! `Display`/`FromStr`) but with SHA-1 instead of SHA-224.

use std::fmt;
use std::io;
use std::io::prelude::*;

use anyhow::{Context, Result, ensure};
use data_encoding::HEXLOWER;
use sha1::{Digest, Sha1};

/// A 20-byte content hash.
///
/// For regular files with `size <= 20` this holds the leading bytes of the
/// file body directly; for larger files it holds the SHA-1 of the body.
/// Either way it's just 20 bytes - this type doesn't know or care which case
/// produced it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hash20(pub [u8; 20]);

impl Hash20 {
    pub const ZERO: Hash20 = Hash20([0u8; 20]);

    /// SHA-1 of the given bytes.
    pub fn sha1(bytes: &[u8]) -> Self {
        let digest = Sha1::digest(bytes);
        Hash20(digest.into())
    }

    /// Build a hash from the file's own bytes for the small-file inlining
    /// case: the leading (here, only) bytes, zero-padded.
    pub fn inline(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= 20);
        let mut buf = [0u8; 20];
        buf[..bytes.len()].copy_from_slice(bytes);
        Hash20(buf)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl fmt::Debug for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash20({})", self.hex())
    }
}

impl fmt::Display for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl std::str::FromStr for Hash20 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = HEXLOWER
            .decode(s.as_bytes())
            .with_context(|| format!("Couldn't decode {s} as hex"))?;
        ensure!(
            bytes.len() == 20,
            "Expected a 20-byte hash, got {}",
            bytes.len()
        );
        let mut buf = [0u8; 20];
        buf.copy_from_slice(&bytes);
        Ok(Hash20(buf))
    }
}

/// Streaming SHA-1 over a `Read`, used when copying a file body into the
/// blob store so we don't have to buffer the whole thing to hash it first.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha1,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
        }
    }

    pub fn finalize(self) -> (Hash20, R) {
        (Hash20(self.hasher.finalize().into()), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

/// Streaming SHA-1 over a `Write`, used on the write side of the same copy.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha1,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
        }
    }

    pub fn finalize(self) -> (Hash20, W) {
        (Hash20(self.hasher.finalize().into()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DEVELOPERS: &[u8] = b"Developers, developers, developers, developers!";

    #[test]
    fn reader_and_writer_agree() -> Result<()> {
        let mut r = HashingReader::new(DEVELOPERS);
        io::copy(&mut r, &mut io::sink())?;
        let (from_reader, _) = r.finalize();

        let mut w = HashingWriter::new(io::sink());
        w.write_all(DEVELOPERS)?;
        let (from_writer, _) = w.finalize();

        assert_eq!(from_reader, from_writer);
        assert_eq!(from_reader, Hash20::sha1(DEVELOPERS));
        Ok(())
    }

    #[test]
    fn hex_round_trips() {
        let h = Hash20::sha1(DEVELOPERS);
        let parsed: Hash20 = h.hex().parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn inline_pads_with_zero() {
        let h = Hash20::inline(b"hello");
        assert_eq!(&h.0[..5], b"hello");
        assert_eq!(&h.0[5..], &[0u8; 15]);
    }

    #[test]
    fn distinct_inputs_differ() {
        assert_ne!(Hash20::sha1(b"a"), Hash20::sha1(b"b"));
    }
}
