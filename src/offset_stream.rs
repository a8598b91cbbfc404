//! A view over a byte stream that rebases offsets so a parser sees position
//! 0 at the start of its assigned region.
//!
//! Parsers for nested formats must not know where in a host file their data
//! lives; rebasing here keeps them composable — an ELF parser carving a
//! module out of a firmware image reads exactly the same way whether that
//! ELF starts at file offset 0 or offset 0x4000.

use std::io::{self, Read, Seek, SeekFrom};

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

/// Wraps any seekable reader, translating absolute operations relative to
/// `base`. Relative (`Current`) and end-relative (`End`) seeks pass through
/// untouched, matching `OffsetInputFile.seek` in the parser this is
/// modeled on: only `SeekFrom::Start` is rebased.
pub struct OffsetStream<R> {
    inner: R,
    base: u64,
    size: u64,
}

impl<R: Read + Seek> OffsetStream<R> {
    /// Builds a stream rebased to `base`. `size` is the logical length
    /// reported to the parser: `underlying_size - base`.
    pub fn new(mut inner: R, base: u64) -> io::Result<Self> {
        let total = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(base))?;
        let size = total.saturating_sub(base);
        Ok(Self { inner, base, size })
    }

    /// Logical size of the region, i.e. bytes available from position 0.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn tell(&mut self) -> io::Result<u64> {
        let pos = self.inner.stream_position()?;
        Ok(pos.saturating_sub(self.base))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for OffsetStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read + Seek> Seek for OffsetStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let translated = match pos {
            SeekFrom::Start(offset) => SeekFrom::Start(self.base + offset),
            other => other,
        };
        let absolute = self.inner.seek(translated)?;
        Ok(absolute.saturating_sub(self.base))
    }
}

#[cfg(unix)]
impl<R: AsRawFd> AsRawFd for OffsetStream<R> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rebases_start_seeks_and_reports_shrunk_size() {
        let data = b"0123456789".to_vec();
        let mut s = OffsetStream::new(Cursor::new(data), 4).unwrap();
        assert_eq!(s.size(), 6);
        let mut buf = [0u8; 3];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"456");
        assert_eq!(s.tell().unwrap(), 3);

        s.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 1];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"4");
    }

    #[test]
    fn end_and_current_seeks_pass_through() {
        let data = b"0123456789".to_vec();
        let mut s = OffsetStream::new(Cursor::new(data), 2).unwrap();
        let pos = s.seek(SeekFrom::End(-2)).unwrap();
        assert_eq!(pos, 6); // 10 - 2(base) - 2 = 6
        let mut buf = [0u8; 2];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"89");
    }
}
