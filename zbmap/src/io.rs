//! Stream plumbing shared by the table, the bucket array and the snapshot
//! serializer. Every byte passes through a caller supplied scratch buffer,
//! whatever its size.

use std::io::{self, Read, Write};

use crate::error::{Result, ZbMapError};

/// Consecutive `Interrupted`/`WouldBlock` results tolerated before a read gives up.
pub const MAX_IO_RETRIES: usize = 64;

fn check_scratch(scratch: &[u8]) -> Result<()> {
    if scratch.is_empty() {
        return Err(ZbMapError::InvalidInput(
            "the I/O buffer must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub(crate) struct ChunkedReader<'s, R> {
    inner: R,
    scratch: &'s mut [u8],
    consumed: u64,
}

impl<'s, R: Read> ChunkedReader<'s, R> {
    pub fn new(inner: R, scratch: &'s mut [u8]) -> Result<Self> {
        check_scratch(scratch)?;
        Ok(Self {
            inner,
            scratch,
            consumed: 0,
        })
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Fills `dest` completely or fails with the number of bytes the stream delivered.
    pub fn read_exact(&mut self, dest: &mut [u8]) -> Result<()> {
        let start = self.consumed;
        let mut filled = 0;
        let mut retries = 0;

        while filled < dest.len() {
            let chunk = self.scratch.len().min(dest.len() - filled);
            match self.inner.read(&mut self.scratch[..chunk]) {
                Ok(0) => {
                    return Err(ZbMapError::ShortRead {
                        expected: start + dest.len() as u64,
                        actual: start + filled as u64,
                    });
                }
                Ok(n) => {
                    dest[filled..filled + n].copy_from_slice(&self.scratch[..n]);
                    filled += n;
                    self.consumed += n as u64;
                    retries = 0;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    retries += 1;
                    tracing::trace!(retries, kind = ?e.kind(), "retrying partial read");
                    if retries > MAX_IO_RETRIES {
                        return Err(ZbMapError::Io(e));
                    }
                }
                Err(e) => return Err(ZbMapError::Io(e)),
            }
        }
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read_exact(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }
}

pub(crate) struct ChunkedWriter<'s, W> {
    inner: W,
    scratch: &'s mut [u8],
    written: u64,
}

impl<'s, W: Write> ChunkedWriter<'s, W> {
    pub fn new(inner: W, scratch: &'s mut [u8]) -> Result<Self> {
        check_scratch(scratch)?;
        Ok(Self {
            inner,
            scratch,
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Writes `src` completely. On failure `written` counts every byte the
    /// inner writer accepted, partial writes included.
    pub fn write_all(&mut self, src: &[u8]) -> Result<()> {
        for chunk in src.chunks(self.scratch.len()) {
            let n = chunk.len();
            self.scratch[..n].copy_from_slice(chunk);
            let mut sent = 0;
            while sent < n {
                match self.inner.write(&self.scratch[sent..n]) {
                    Ok(0) => {
                        return Err(ZbMapError::WriteFailed {
                            written: self.written,
                            source: io::ErrorKind::WriteZero.into(),
                        });
                    }
                    Ok(k) => {
                        sent += k;
                        self.written += k as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(source) => {
                        return Err(ZbMapError::WriteFailed {
                            written: self.written,
                            source,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner
            .flush()
            .map_err(|source| ZbMapError::WriteFailed {
                written: self.written,
                source,
            })
    }
}
