//! Raw chunk I/O — the only layer that touches file offsets.
//!
//! Chunk framing is the only unit this layer understands: every read and
//! write happens at a chunk boundary, and the position reported by
//! [`Raw::chunk_tell`] always names one.  [`Raw::chunk_seek`] verifies the
//! target offset by peeking the header there (the end-of-file append position
//! is also legal), so a misaligned seek fails before any payload is touched.
//!
//! In-place rewrites ([`Raw::write_header`], [`Raw::write_payload`]) exist
//! for the back-patch protocol: appending to an item chain rewrites the
//! predecessor's header, and track HEAD chunks are rewritten whenever a
//! summary level gains a chunk.  Both leave the cursor on the same chunk.
//!
//! This layer never logs; every anomaly is surfaced as an error kind.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::chunk::{ChunkHeader, HEADER_SIZE};
use crate::error::{Error, Result};

pub struct Raw<T> {
    inner: T,
    /// Offset of the current chunk boundary.
    pos: u64,
}

impl Raw<File> {
    /// Create `path` for writing (truncating) and position at offset 0.
    /// The file is opened read+write: back-patch seeks verify their target.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { inner, pos: 0 })
    }

    /// Open `path` read-only and position at offset 0.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self { inner: File::open(path)?, pos: 0 })
    }
}

impl<T: Seek> Raw<T> {
    /// Wrap an arbitrary seekable stream (tests use `io::Cursor`).
    pub fn new(inner: T) -> Self {
        Self { inner, pos: 0 }
    }

    /// Offset of the chunk the cursor is on.
    #[inline]
    pub fn chunk_tell(&self) -> u64 {
        self.pos
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Seek> Raw<T> {
    /// Move the cursor to the chunk starting at `offset`.
    ///
    /// `offset` must be an existing chunk boundary or the end-of-file append
    /// position; a mid-chunk offset is `ParameterInvalid`.  The check decodes
    /// the header at `offset`, so a stale or misaligned offset is caught here
    /// rather than corrupting a later read.  An offset past end-of-file, or
    /// one whose header was cut off by truncation, is `Empty`: the chain
    /// continues into a part of the file that no longer exists.
    pub fn chunk_seek(&mut self, offset: u64) -> Result<()> {
        let end = self.inner.seek(SeekFrom::End(0))?;
        if offset > end {
            self.inner.seek(SeekFrom::Start(self.pos))?;
            return Err(Error::Empty);
        }
        if offset < end {
            self.inner.seek(SeekFrom::Start(offset))?;
            let mut buf = [0u8; HEADER_SIZE];
            if let Err(e) = self.inner.read_exact(&mut buf) {
                self.inner.seek(SeekFrom::Start(self.pos))?;
                return match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => Err(Error::Empty),
                    _ => Err(e.into()),
                };
            }
            if ChunkHeader::decode(&buf).is_none() {
                self.inner.seek(SeekFrom::Start(self.pos))?;
                return Err(Error::param(format!(
                    "offset {offset} is not a chunk boundary"
                )));
            }
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        Ok(())
    }

    /// Read the chunk at the cursor: header into the return value, payload
    /// into `buf`.
    ///
    /// - End of file → `Empty` (cursor unchanged).
    /// - `buf` smaller than `payload_length` → `TooBig { needed }` with the
    ///   cursor unchanged; the caller grows and retries.
    /// - Header CRC/tag failure → `ParameterInvalid`.
    /// - File ends mid-payload → `Empty` (a truncated tail chunk is treated
    ///   as absent; everything before it stays readable).
    ///
    /// On success the cursor advances to the next chunk boundary.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ChunkHeader> {
        self.inner.seek(SeekFrom::Start(self.pos))?;
        let mut hdr = [0u8; HEADER_SIZE];
        if let Err(e) = self.inner.read_exact(&mut hdr) {
            return match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Err(Error::Empty),
                _ => Err(e.into()),
            };
        }
        let header = ChunkHeader::decode(&hdr)
            .ok_or_else(|| Error::param(format!("bad chunk header at {}", self.pos)))?;

        let len = header.payload_length as usize;
        if len > buf.len() {
            self.inner.seek(SeekFrom::Start(self.pos))?;
            return Err(Error::TooBig { needed: len });
        }
        if let Err(e) = self.inner.read_exact(&mut buf[..len]) {
            self.inner.seek(SeekFrom::Start(self.pos))?;
            return match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Err(Error::Empty),
                _ => Err(e.into()),
            };
        }
        self.pos += (HEADER_SIZE + len) as u64;
        Ok(header)
    }

    /// Read only the header of the chunk at the cursor and advance past the
    /// whole chunk.  Used by chain walks that do not need every payload.
    pub fn read_header(&mut self) -> Result<ChunkHeader> {
        self.inner.seek(SeekFrom::Start(self.pos))?;
        let mut hdr = [0u8; HEADER_SIZE];
        if let Err(e) = self.inner.read_exact(&mut hdr) {
            return match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Err(Error::Empty),
                _ => Err(e.into()),
            };
        }
        let header = ChunkHeader::decode(&hdr)
            .ok_or_else(|| Error::param(format!("bad chunk header at {}", self.pos)))?;
        self.pos += HEADER_SIZE as u64 + header.payload_length as u64;
        Ok(header)
    }
}

impl<T: Write + Seek> Raw<T> {
    /// Append a complete chunk at the cursor and advance past it.
    pub fn write_chunk(&mut self, header: &ChunkHeader, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(header.payload_length as usize, payload.len());
        self.inner.seek(SeekFrom::Start(self.pos))?;
        self.inner.write_all(&header.encode())?;
        self.inner.write_all(payload)?;
        self.pos += (HEADER_SIZE + payload.len()) as u64;
        Ok(())
    }

    /// Rewrite the header of the chunk at the cursor in place.
    ///
    /// The CRC is recomputed; `payload_length` must match what is on disk.
    /// The cursor stays on this chunk.
    pub fn write_header(&mut self, header: &ChunkHeader) -> Result<()> {
        self.inner.seek(SeekFrom::Start(self.pos))?;
        self.inner.write_all(&header.encode())?;
        self.inner.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }

    /// Rewrite the payload of the chunk at the cursor in place.
    ///
    /// The payload length must not change; the header (and its CRC) is left
    /// untouched.  The cursor stays on this chunk.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.inner
            .seek(SeekFrom::Start(self.pos + HEADER_SIZE as u64))?;
        self.inner.write_all(payload)?;
        self.inner.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{signal_meta, Tag, TrackRole, TrackType};
    use std::io::Cursor;

    fn data_header(payload: &[u8], prev: u64) -> ChunkHeader {
        ChunkHeader {
            item_next:           0,
            item_prev:           prev,
            tag:                 Tag::Track(TrackType::Fsr, TrackRole::Data),
            chunk_meta:          signal_meta(1, 0),
            payload_length:      payload.len() as u32,
            payload_prev_length: 0,
        }
    }

    #[test]
    fn write_then_read() {
        let mut raw = Raw::new(Cursor::new(Vec::new()));
        let payload = b"0123456789";
        raw.write_chunk(&data_header(payload, 0), payload).unwrap();
        raw.chunk_seek(0).unwrap();

        let mut buf = [0u8; 64];
        let h = raw.read_chunk(&mut buf).unwrap();
        assert_eq!(h.payload_length, 10);
        assert_eq!(&buf[..10], payload);
        assert!(matches!(raw.read_chunk(&mut buf), Err(Error::Empty)));
    }

    #[test]
    fn too_big_does_not_advance() {
        let mut raw = Raw::new(Cursor::new(Vec::new()));
        let payload = [7u8; 100];
        raw.write_chunk(&data_header(&payload, 0), &payload).unwrap();
        raw.chunk_seek(0).unwrap();

        let mut small = [0u8; 10];
        match raw.read_chunk(&mut small) {
            Err(Error::TooBig { needed }) => assert_eq!(needed, 100),
            other => panic!("expected TooBig, got {other:?}"),
        }
        assert_eq!(raw.chunk_tell(), 0);

        let mut big = vec![0u8; 100];
        raw.read_chunk(&mut big).unwrap();
        assert_eq!(big, payload);
    }

    #[test]
    fn misaligned_seek_refused() {
        let mut raw = Raw::new(Cursor::new(Vec::new()));
        let payload = [1u8; 16];
        raw.write_chunk(&data_header(&payload, 0), &payload).unwrap();
        assert!(matches!(
            raw.chunk_seek(5),
            Err(Error::ParameterInvalid(_))
        ));
        // Past end-of-file reads as chain-ended, not as a caller bug.
        assert!(matches!(raw.chunk_seek(10_000), Err(Error::Empty)));
        // End-of-file append position is a legal target.
        raw.chunk_seek(HEADER_SIZE as u64 + 16).unwrap();
    }

    #[test]
    fn truncated_payload_reads_empty() {
        let mut raw = Raw::new(Cursor::new(Vec::new()));
        let payload = [9u8; 50];
        raw.write_chunk(&data_header(&payload, 0), &payload).unwrap();
        let mut bytes = raw.into_inner().into_inner();
        bytes.truncate(HEADER_SIZE + 20); // cut mid-payload

        let mut raw = Raw::new(Cursor::new(bytes));
        let mut buf = [0u8; 64];
        assert!(matches!(raw.read_chunk(&mut buf), Err(Error::Empty)));
    }
}
