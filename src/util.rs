use std::io::{Read, Seek, SeekFrom};

use crate::error::{Qcow2Error, Result};

/// Rounds `len` up to the next multiple of 8, the alignment of every
/// variable-length qcow2 metadata record.
pub const fn align8(len: u64) -> u64 {
    (len + 7) & !7
}

pub trait ReaderExt {
    /// Reads exactly `len` bytes, growing the buffer only as data arrives so a
    /// corrupt length cannot force a huge allocation.
    fn read_vec(&mut self, len: u64, what: &'static str) -> Result<Vec<u8>>;
}

impl<R: Read> ReaderExt for R {
    fn read_vec(&mut self, len: u64, what: &'static str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.by_ref().take(len).read_to_end(&mut buf)?;
        if (buf.len() as u64) < len {
            return Err(Qcow2Error::Truncated {
                what,
                expected: len,
                actual: buf.len() as u64,
            });
        }
        Ok(buf)
    }
}

pub trait SeekExt: Seek {
    /// Moves the cursor forward by `n` bytes. Skipping past the end of the
    /// stream is allowed; the next read reports the truncation.
    fn skip(&mut self, n: u64) -> Result<u64> {
        let pos = self.stream_position()?;
        Ok(self.seek(SeekFrom::Start(pos.saturating_add(n)))?)
    }

    /// Runs `f` and seeks back to where the cursor was before it ran.
    fn with_restored_position<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let pos = self.stream_position()?;
        let value = f(self)?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(value)
    }
}

impl<S: Seek + ?Sized> SeekExt for S {}
