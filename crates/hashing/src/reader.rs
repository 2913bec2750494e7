use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};

use crate::DigestSet;

/// Wraps an upload source and digests every byte handed to the uploader.
///
/// Uploaders rewind: by one buffer when a chunk is retried, or to an
/// arbitrary offset when a resumed session reports what the server already
/// holds. Absolute seeks keep the digests consistent with the position by
/// restoring the checkpoint taken before the last read and/or re-reading
/// the bytes in between. An end-relative seek only measures the source;
/// reading before the next absolute seek is an error, because the digests
/// no longer describe the position.
pub struct HashingReader<R> {
    inner: R,
    digests: DigestSet,
    position: u64,
    checkpoint: DigestSet,
    checkpoint_position: u64,
    seek_away: Option<u64>,
}

impl<R: Read + Seek> HashingReader<R> {
    pub fn new(inner: R, digests: DigestSet) -> Self {
        Self {
            checkpoint: digests.clone(),
            inner,
            digests,
            position: 0,
            checkpoint_position: 0,
            seek_away: None,
        }
    }

    /// Offset the digests currently cover.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn digests(&self) -> &DigestSet {
        &self.digests
    }

    /// Encoded digests of everything read so far.
    pub fn finalize(&self) -> BTreeMap<String, String> {
        self.digests.finalize()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn seek_absolute(&mut self, offset: u64) -> io::Result<u64> {
        self.seek_away = None;
        if offset == self.position {
            self.inner.seek(SeekFrom::Start(offset))?;
            return Ok(offset);
        }

        let (mut digests, from) = if offset >= self.position {
            (self.digests.clone(), self.position)
        } else if offset >= self.checkpoint_position {
            (self.checkpoint.clone(), self.checkpoint_position)
        } else {
            let mut fresh = self.digests.clone();
            fresh.reset();
            (fresh, 0)
        };

        self.inner.seek(SeekFrom::Start(from))?;
        let read = digests
            .catch_up(&mut self.inner, offset - from)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let reached = from + read;
        if reached != offset {
            self.inner.seek(SeekFrom::Start(offset))?;
        }

        self.digests = digests;
        self.position = offset;
        self.checkpoint = self.digests.clone();
        self.checkpoint_position = offset;
        Ok(offset)
    }
}

impl<R: Read + Seek> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.seek_away.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read at an unknown position; digests cannot be computed",
            ));
        }
        self.checkpoint = self.digests.clone();
        self.checkpoint_position = self.position;
        let n = self.inner.read(buf)?;
        self.digests.update(&buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for HashingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(offset) => self.seek_absolute(offset),
            SeekFrom::Current(0) => Ok(self.seek_away.unwrap_or(self.position)),
            SeekFrom::Current(delta) => {
                let base = self.seek_away.unwrap_or(self.position);
                let target = base.checked_add_signed(delta).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek before start")
                })?;
                self.seek_absolute(target)
            }
            SeekFrom::End(delta) => {
                let end = self.inner.seek(SeekFrom::End(delta))?;
                self.seek_away = Some(end);
                Ok(end)
            }
        }
    }
}
