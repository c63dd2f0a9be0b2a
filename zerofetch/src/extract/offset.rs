//! A `Read + Seek` adapter that hides a fixed number of leading bytes.
//!
//! Self-extracting installers embed an archive after a native executable
//! stub; skipping `offset` bytes makes the remainder parse as if the stub
//! had been stripped.

use std::io::{self, Read, Seek, SeekFrom};

/// Presents `inner` from byte `offset` onward as position zero.
#[derive(Debug)]
pub struct OffsetReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read + Seek> OffsetReader<R> {
    /// Wrap `inner`, positioning it at `offset`.
    pub fn new(mut inner: R, offset: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(offset))?;
        Ok(Self { inner, offset })
    }
}

impl<R: Read> Read for OffsetReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for OffsetReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let inner_pos = match pos {
            SeekFrom::Start(n) => self.inner.seek(SeekFrom::Start(self.offset + n))?,
            SeekFrom::End(n) => self.inner.seek(SeekFrom::End(n))?,
            SeekFrom::Current(n) => self.inner.seek(SeekFrom::Current(n))?,
        };
        inner_pos.checked_sub(self.offset).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of offset region",
            )
        })
    }
}
