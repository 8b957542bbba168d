//! Chunk framing shared by transaction logs and archives
//!
//! Every chunk follows the same layout:
//! ChunkHeader (32 bytes) + payload bytes
//!
//! Readers verify the CRC32C of each payload, resynchronize on the next
//! magic after a damaged chunk, and treat an incomplete chunk at the end of
//! the buffer as a torn write.

use std::path::Path;

use crate::error::{StoreError, StoreResult};

/// Magic bytes identifying Keyhive chunks: 'K','H','I','V'
pub const MAGIC_ARRAY: [u8; 4] = [0x4B, 0x48, 0x49, 0x56];

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Largest payload a single chunk may carry (64MB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Chunk payload types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Archive file header
    ArchiveHeader = 0x10,
    /// One stored entry inside an archive
    ArchiveEntry = 0x11,
    /// Transaction: value written
    TxSetValue = 0x20,
    /// Transaction: subkey list replaced
    TxSetSubkeys = 0x21,
    /// Transaction: attribute added
    TxAddAttr = 0x22,
    /// Transaction: key removed
    TxRemove = 0x23,
    /// Transaction: key renamed
    TxRename = 0x24,
}

impl ChunkType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x10 => Some(ChunkType::ArchiveHeader),
            0x11 => Some(ChunkType::ArchiveEntry),
            0x20 => Some(ChunkType::TxSetValue),
            0x21 => Some(ChunkType::TxSetSubkeys),
            0x22 => Some(ChunkType::TxAddAttr),
            0x23 => Some(ChunkType::TxRemove),
            0x24 => Some(ChunkType::TxRename),
            _ => None,
        }
    }
}

/// Fixed-size header for each chunk
///
/// Layout:
///   [0..4]   magic:      [u8;4] - "KHIV"
///   [4..8]   length:     u32    - payload length in bytes
///   [8..12]  checksum:   u32    - CRC32C of payload bytes
///   [12]     chunk_type: u8
///   [13..32] reserved, zero
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub chunk_type: u8,
}

impl ChunkHeader {
    pub fn new(length: u32, checksum: u32, chunk_type: ChunkType) -> Self {
        Self { magic: MAGIC_ARRAY, length, checksum, chunk_type: chunk_type as u8 }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.chunk_type;
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Self {
            magic,
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            chunk_type: bytes[12],
        }
    }
}

/// A verified chunk.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_type: ChunkType,
    pub payload: Vec<u8>,
    /// Byte offset of the header inside the scanned buffer
    pub offset: u64,
}

/// Frame `payload` as a complete chunk.
pub fn encode_chunk(chunk_type: ChunkType, payload: &[u8]) -> StoreResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(StoreError::InvalidArgument(format!(
            "chunk payload of {} bytes exceeds limit of {} bytes",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    let checksum = crc32c::crc32c(payload);
    let header = ChunkHeader::new(payload.len() as u32, checksum, chunk_type);

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Outcome of scanning one buffer: verified chunks and what went wrong.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub chunks: Vec<Chunk>,
    /// One error per damaged region that was skipped
    pub errors: Vec<StoreError>,
    /// True when the buffer ended inside a chunk
    pub torn: bool,
}

/// Scan a whole buffer for chunks.
///
/// Recovery algorithm:
/// 1. Check magic at the current position, resync on the next magic if absent
/// 2. Read payload length; an entry running past the end is a torn write
/// 3. Verify CRC32C and chunk type, resync on failure
pub fn scan_chunks(buffer: &[u8], path: &Path) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    let mut offset = 0usize;

    let corrupt = |offset: usize, reason: String| StoreError::Corrupt {
        path: Some(path.to_path_buf()),
        offset: offset as u64,
        reason,
    };

    while offset + HEADER_SIZE <= buffer.len() {
        if buffer[offset..offset + 4] != MAGIC_ARRAY {
            outcome.errors.push(corrupt(offset, "bad magic".into()));
            match find_next_magic(buffer, offset + 1) {
                Some(next) => { offset = next; continue; }
                None => break,
            }
        }

        let header = ChunkHeader::from_bytes(&buffer[offset..offset + HEADER_SIZE]);
        let length = header.length as usize;

        if length > MAX_PAYLOAD_SIZE {
            outcome.errors.push(corrupt(offset, format!("payload length {} out of range", length)));
            match find_next_magic(buffer, offset + 1) {
                Some(next) => { offset = next; continue; }
                None => break,
            }
        }

        let end = offset + HEADER_SIZE + length;
        if end > buffer.len() {
            tracing::warn!(offset, need = HEADER_SIZE + length, have = buffer.len() - offset, "torn chunk at end of file");
            outcome.errors.push(corrupt(offset, "torn write at end of file".into()));
            outcome.torn = true;
            break;
        }

        let payload = &buffer[offset + HEADER_SIZE..end];
        let computed = crc32c::crc32c(payload);
        if computed != header.checksum {
            outcome.errors.push(corrupt(
                offset,
                format!("checksum mismatch: expected 0x{:08x}, got 0x{:08x}", header.checksum, computed),
            ));
            match find_next_magic(buffer, offset + 1) {
                Some(next) => { offset = next; continue; }
                None => break,
            }
        }

        match ChunkType::from_u8(header.chunk_type) {
            Some(chunk_type) => outcome.chunks.push(Chunk {
                chunk_type,
                payload: payload.to_vec(),
                offset: offset as u64,
            }),
            None => outcome.errors.push(corrupt(offset, format!("unknown chunk type 0x{:02x}", header.chunk_type))),
        }
        offset = end;
    }

    outcome
}

/// Scan forward in buffer to find next occurrence of the magic bytes.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(3)).find(|&i| buffer[i..i + 4] == MAGIC_ARRAY)
}

/// Little-endian cursor over a chunk payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> StoreResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(StoreError::Corrupt {
                path: None,
                offset: self.pos as u64,
                reason: format!("payload too short: need {} bytes, have {}", n, self.buf.len() - self.pos),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> StoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> StoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> StoreResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// A u32 length followed by that many bytes.
    pub fn bytes(&mut self) -> StoreResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }
}

/// Append a u32 length followed by the bytes.
pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p() -> PathBuf {
        PathBuf::from("<buffer>")
    }

    #[test]
    fn test_header_layout() {
        let h = ChunkHeader::new(7, 0xdeadbeef, ChunkType::TxRename);
        let bytes = h.to_bytes();
        assert_eq!(&bytes[0..4], b"KHIV");
        let back = ChunkHeader::from_bytes(&bytes);
        assert_eq!(back.length, 7);
        assert_eq!(back.checksum, 0xdeadbeef);
        assert_eq!(back.chunk_type, ChunkType::TxRename as u8);
    }

    #[test]
    fn test_scan_multiple_chunks() {
        let mut buf = encode_chunk(ChunkType::ArchiveHeader, b"hdr").unwrap();
        buf.extend(encode_chunk(ChunkType::ArchiveEntry, b"one").unwrap());
        buf.extend(encode_chunk(ChunkType::ArchiveEntry, b"").unwrap());

        let out = scan_chunks(&buf, &p());
        assert!(out.errors.is_empty());
        assert_eq!(out.chunks.len(), 3);
        assert_eq!(out.chunks[1].payload, b"one");
        assert_eq!(out.chunks[2].chunk_type, ChunkType::ArchiveEntry);
    }

    #[test]
    fn test_corrupted_payload_skipped_and_resynced() {
        let first = encode_chunk(ChunkType::ArchiveEntry, b"first-entry").unwrap();
        let second = encode_chunk(ChunkType::ArchiveEntry, b"second-entry").unwrap();
        let third = encode_chunk(ChunkType::ArchiveEntry, b"third-entry").unwrap();
        let mut buf = first.clone();
        buf.extend(&second);
        buf.extend(&third);
        let flip = first.len() + HEADER_SIZE + 2;
        buf[flip] ^= 0xFF;

        let out = scan_chunks(&buf, &p());
        assert_eq!(out.chunks.len(), 2);
        assert_eq!(out.chunks[0].payload, b"first-entry");
        assert_eq!(out.chunks[1].payload, b"third-entry");
        assert_eq!(out.errors.len(), 1);
        assert!(!out.torn);
    }

    #[test]
    fn test_torn_write_stops_cleanly() {
        let mut buf = encode_chunk(ChunkType::TxRemove, b"complete").unwrap();
        buf.extend_from_slice(&MAGIC_ARRAY);
        buf.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        buf.extend_from_slice(&[0u8; 24]);

        let out = scan_chunks(&buf, &p());
        assert_eq!(out.chunks.len(), 1);
        assert!(out.torn);
    }

    #[test]
    fn test_payload_reader() {
        let mut out = Vec::new();
        out.push(9u8);
        out.extend_from_slice(&42u64.to_le_bytes());
        put_bytes(&mut out, b"abc");

        let mut r = PayloadReader::new(&out);
        assert_eq!(r.u8().unwrap(), 9);
        assert_eq!(r.u64().unwrap(), 42);
        assert_eq!(r.bytes().unwrap(), b"abc");
        assert!(r.is_exhausted());
        assert!(r.u32().is_err());
    }
}
