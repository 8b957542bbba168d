//! Page allocator over a file, a memory map, or anonymous memory
//!
//! The backing region is an array of fixed-size pages. Page 0 is the
//! superblock; every other page starts with a 16-byte header:
//!
//! ```text
//!   [0]      kind: u8   - Free / RecordHead / RecordTail
//!   [1..4]   reserved
//!   [4..8]   used: u32  - payload bytes in use on this page
//!   [8..16]  next: u64  - next page of the chain, 0 terminates
//! ```
//!
//! Records are stored as page chains. The head page is written last, so a
//! head found on disk always points at a fully written chain. Freed pages
//! are rewritten as `Free` straight away; a reopen therefore never sees a
//! deleted record again.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::error::{StoreError, StoreResult};
use crate::platform_durability::durable_sync;

pub type PageId = u64;

/// Page header size in bytes
pub const PAGE_HEADER_SIZE: usize = 16;

/// Superblock magic
pub const SUPERBLOCK_MAGIC: [u8; 8] = *b"KEYHIVE\0";

/// Longest hash function name the superblock records
pub const HASHER_NAME_LEN: usize = 16;

const FORMAT_VERSION: u32 = 2;
const SUPERBLOCK_SIZE: usize = 44;
const MIN_GROWTH_PAGES: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Free = 0,
    RecordHead = 1,
    RecordTail = 2,
}

impl PageKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PageKind::Free),
            1 => Some(PageKind::RecordHead),
            2 => Some(PageKind::RecordTail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub kind: PageKind,
    pub used: u32,
    pub next: PageId,
}

impl PageHeader {
    fn to_bytes(self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[4..8].copy_from_slice(&self.used.to_le_bytes());
        buf[8..16].copy_from_slice(&self.next.to_le_bytes());
        buf
    }
}

/// Table geometry persisted in page 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub page_size: u32,
    pub mask_bits: u8,
    pub collision_mask_bits: u8,
    pub max_elements: u32,
    /// Name of the table's hash function, NUL padded
    pub hasher: [u8; HASHER_NAME_LEN],
}

impl Superblock {
    /// Pad `name` into the superblock field. Empty names, names with NUL
    /// bytes and names longer than [`HASHER_NAME_LEN`] are rejected.
    pub fn hasher_field(name: &str) -> StoreResult<[u8; HASHER_NAME_LEN]> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > HASHER_NAME_LEN || bytes.contains(&0) {
            return Err(StoreError::Config(format!(
                "hash function name {:?} must be 1 to {} bytes without NUL",
                name, HASHER_NAME_LEN
            )));
        }
        let mut field = [0u8; HASHER_NAME_LEN];
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(field)
    }

    /// Recorded hash function name.
    pub fn hasher_name(&self) -> String {
        let end = self.hasher.iter().position(|&b| b == 0).unwrap_or(HASHER_NAME_LEN);
        String::from_utf8_lossy(&self.hasher[..end]).into_owned()
    }

    /// Layout:
    ///   [0..8]   magic "KEYHIVE\0"
    ///   [8..12]  format version
    ///   [12..16] page size
    ///   [16]     mask bits
    ///   [17]     collision mask bits
    ///   [18..20] reserved
    ///   [20..24] max elements
    ///   [24..40] hash function name, NUL padded
    ///   [40..44] CRC32C of bytes 0..40
    fn to_bytes(self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        buf[0..8].copy_from_slice(&SUPERBLOCK_MAGIC);
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        buf[16] = self.mask_bits;
        buf[17] = self.collision_mask_bits;
        buf[20..24].copy_from_slice(&self.max_elements.to_le_bytes());
        buf[24..40].copy_from_slice(&self.hasher);
        let crc = crc32c::crc32c(&buf[0..40]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; SUPERBLOCK_SIZE], path: Option<&Path>) -> StoreResult<Self> {
        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.map(Path::to_path_buf),
            offset: 0,
            reason,
        };
        if buf[0..8] != SUPERBLOCK_MAGIC {
            return Err(corrupt("not a keyhive file (bad superblock magic)".into()));
        }
        let stored = u32::from_le_bytes([buf[40], buf[41], buf[42], buf[43]]);
        let computed = crc32c::crc32c(&buf[0..40]);
        if stored != computed {
            return Err(corrupt(format!(
                "superblock checksum mismatch: expected 0x{:08x}, got 0x{:08x}",
                stored, computed
            )));
        }
        let version = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", version)));
        }
        let mut hasher = [0u8; HASHER_NAME_LEN];
        hasher.copy_from_slice(&buf[24..40]);
        Ok(Self {
            page_size: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            mask_bits: buf[16],
            collision_mask_bits: buf[17],
            max_elements: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            hasher,
        })
    }
}

/// Random-access byte region the pager stores pages in.
pub trait PageIo: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn len(&self) -> u64;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

/// Positional reads and writes on a plain file.
pub struct FileIo {
    file: File,
}

impl FileIo {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl PageIo for FileIo {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            let n = self.file.seek_read(buf, offset)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short page read"));
            }
            buf = &mut buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&mut self, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            let n = self.file.seek_write(buf, offset)?;
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        durable_sync(&self.file)
    }
}

enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

/// The whole file mapped into memory, remapped on growth.
pub struct MmapIo {
    file: File,
    map: Mapping,
}

impl MmapIo {
    pub fn new(file: File, writable: bool) -> io::Result<Self> {
        let map = Self::map(&file, writable)?;
        Ok(Self { file, map })
    }

    fn map(file: &File, writable: bool) -> io::Result<Mapping> {
        // SAFETY: the file is locked for this handle; no other writer
        // truncates it underneath the mapping.
        unsafe {
            if writable {
                Ok(Mapping::Writable(MmapMut::map_mut(file)?))
            } else {
                Ok(Mapping::ReadOnly(Mmap::map(file)?))
            }
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.map {
            Mapping::ReadOnly(m) => &m[..],
            Mapping::Writable(m) => &m[..],
        }
    }
}

fn out_of_range(offset: u64, len: usize, total: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("access of {} bytes at {} past end {}", len, offset, total),
    )
}

impl PageIo for MmapIo {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let bytes = self.bytes();
        let start = offset as usize;
        let src = bytes
            .get(start..start + buf.len())
            .ok_or_else(|| out_of_range(offset, buf.len(), bytes.len() as u64))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        match &mut self.map {
            Mapping::ReadOnly(_) => Err(io::Error::new(io::ErrorKind::PermissionDenied, "mapping is read-only")),
            Mapping::Writable(m) => {
                let total = m.len() as u64;
                let start = offset as usize;
                let dst = m
                    .get_mut(start..start + buf.len())
                    .ok_or_else(|| out_of_range(offset, buf.len(), total))?;
                dst.copy_from_slice(buf);
                Ok(())
            }
        }
    }

    fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        if let Mapping::Writable(m) = &self.map {
            m.flush()?;
        }
        self.file.set_len(len)?;
        self.map = Self::map(&self.file, true)?;
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        match &self.map {
            Mapping::ReadOnly(_) => Ok(()),
            Mapping::Writable(m) => m.flush(),
        }
    }
}

/// Anonymous memory; nothing survives the handle.
#[derive(Default)]
pub struct MemIo {
    buf: Vec<u8>,
}

impl PageIo for MemIo {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let src = self
            .buf
            .get(start..start + buf.len())
            .ok_or_else(|| out_of_range(offset, buf.len(), self.buf.len() as u64))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let total = self.buf.len() as u64;
        let start = offset as usize;
        let dst = self
            .buf
            .get_mut(start..start + buf.len())
            .ok_or_else(|| out_of_range(offset, buf.len(), total))?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.buf.resize(len as usize, 0);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Page usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub page_size: usize,
    pub page_count: u64,
    pub free_pages: u64,
}

/// Fixed-size page allocator with chained records.
pub struct Pager {
    io: Box<dyn PageIo>,
    path: Option<PathBuf>,
    page_size: usize,
    page_count: u64,
    /// Free page stack; the lowest ids sit on top
    free: Vec<PageId>,
    read_only: bool,
}

impl Pager {
    /// Initialize a fresh region with a superblock.
    pub fn create(mut io: Box<dyn PageIo>, path: Option<PathBuf>, sb: Superblock) -> StoreResult<Self> {
        let page_size = sb.page_size as usize;
        io.set_len(page_size as u64).map_err(|e| wrap_io(&path, &e, "failed to size new store"))?;
        let mut page0 = vec![0u8; page_size];
        page0[..SUPERBLOCK_SIZE].copy_from_slice(&sb.to_bytes());
        io.write_at(0, &page0).map_err(|e| wrap_io(&path, &e, "failed to write superblock"))?;
        io.sync().map_err(|e| wrap_io(&path, &e, "failed to sync superblock"))?;

        Ok(Self { io, path, page_size, page_count: 1, free: Vec::new(), read_only: false })
    }

    /// Attach to an existing region, returning the pager and its superblock.
    /// The free list is empty until [`Pager::rebuild_free_list`] runs.
    pub fn open(io: Box<dyn PageIo>, path: Option<PathBuf>, read_only: bool) -> StoreResult<(Self, Superblock)> {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        io.read_at(0, &mut raw).map_err(|e| wrap_io(&path, &e, "failed to read superblock"))?;
        let sb = Superblock::from_bytes(&raw, path.as_deref())?;

        let page_size = sb.page_size as usize;
        if page_size < crate::config::MIN_PAGE_SIZE || page_size > crate::config::MAX_PAGE_SIZE {
            return Err(StoreError::Corrupt {
                path: path.clone(),
                offset: 12,
                reason: format!("superblock page size {} out of range", page_size),
            });
        }
        let len = io.len();
        if len % page_size as u64 != 0 {
            tracing::warn!(len, page_size, "store length is not page aligned, ignoring trailing bytes");
        }
        let page_count = len / page_size as u64;

        Ok((Self { io, path, page_size, page_count, free: Vec::new(), read_only }, sb))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn payload_size(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn stats(&self) -> PageStats {
        PageStats {
            page_size: self.page_size,
            page_count: self.page_count,
            free_pages: self.free.len() as u64,
        }
    }

    pub fn write_superblock(&mut self, sb: Superblock) -> StoreResult<()> {
        self.check_writable()?;
        self.io
            .write_at(0, &sb.to_bytes())
            .map_err(|e| wrap_io(&self.path, &e, "failed to write superblock"))
    }

    pub fn sync(&self) -> StoreResult<()> {
        self.io.sync().map_err(|e| wrap_io(&self.path, &e, "page sync failed"))
    }

    /// Build a `Corrupt` error pointing at `page`.
    pub fn corrupt(&self, page: PageId, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            path: self.path.clone(),
            offset: page * self.page_size as u64,
            reason: reason.into(),
        }
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly("page write refused".into()));
        }
        Ok(())
    }

    pub fn read_header(&self, page: PageId) -> StoreResult<PageHeader> {
        if page == 0 || page >= self.page_count {
            return Err(self.corrupt(page, format!("page id out of range (count {})", self.page_count)));
        }
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        self.io
            .read_at(page * self.page_size as u64, &mut buf)
            .map_err(|e| wrap_io(&self.path, &e, "failed to read page header"))?;
        let kind = PageKind::from_u8(buf[0])
            .ok_or_else(|| self.corrupt(page, format!("unknown page kind {}", buf[0])))?;
        let used = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut next = [0u8; 8];
        next.copy_from_slice(&buf[8..16]);
        let header = PageHeader { kind, used, next: u64::from_le_bytes(next) };
        if header.used as usize > self.payload_size() {
            return Err(self.corrupt(page, format!("page claims {} used bytes", header.used)));
        }
        Ok(header)
    }

    fn write_page(&mut self, page: PageId, header: PageHeader, payload: &[u8]) -> StoreResult<()> {
        let mut buf = Vec::with_capacity(PAGE_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(payload);
        self.io
            .write_at(page * self.page_size as u64, &buf)
            .map_err(|e| wrap_io(&self.path, &e, "page write failed"))
    }

    /// Take a page off the free stack, growing the region when empty.
    pub fn allocate(&mut self) -> StoreResult<PageId> {
        self.check_writable()?;
        if let Some(page) = self.free.pop() {
            return Ok(page);
        }
        let grow = (self.page_count / 8).max(MIN_GROWTH_PAGES);
        let new_count = self.page_count + grow;
        self.io
            .set_len(new_count * self.page_size as u64)
            .map_err(|e| wrap_io(&self.path, &e, "failed to grow store"))?;
        tracing::debug!(from = self.page_count, to = new_count, "grew page region");

        // fresh pages read back as kind Free (all zero)
        for page in (self.page_count..new_count).rev() {
            self.free.push(page);
        }
        self.page_count = new_count;
        Ok(self.free.pop().unwrap_or(new_count - 1))
    }

    /// Store `bytes` as a new page chain and return its head page.
    pub fn write_chain(&mut self, bytes: &[u8]) -> StoreResult<PageId> {
        self.check_writable()?;
        let payload = self.payload_size();
        let n = bytes.len().div_ceil(payload).max(1);

        let mut pages = Vec::with_capacity(n);
        for _ in 0..n {
            match self.allocate() {
                Ok(p) => pages.push(p),
                Err(e) => {
                    self.free.extend(pages.into_iter().rev());
                    return Err(e);
                }
            }
        }

        // tail pages first, head last
        for i in (0..n).rev() {
            let start = i * payload;
            let end = (start + payload).min(bytes.len());
            let chunk = if start < bytes.len() { &bytes[start..end] } else { &[][..] };
            let header = PageHeader {
                kind: if i == 0 { PageKind::RecordHead } else { PageKind::RecordTail },
                used: chunk.len() as u32,
                next: pages.get(i + 1).copied().unwrap_or(0),
            };
            self.write_page(pages[i], header, chunk)?;
        }
        Ok(pages[0])
    }

    /// Page ids of the chain starting at `head`, verified for kind and loops.
    pub fn chain_pages(&self, head: PageId) -> StoreResult<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut page = head;
        loop {
            let header = self.read_header(page)?;
            let expected = if pages.is_empty() { PageKind::RecordHead } else { PageKind::RecordTail };
            if header.kind != expected {
                return Err(self.corrupt(page, format!("expected {:?} page, found {:?}", expected, header.kind)));
            }
            pages.push(page);
            if header.next == 0 {
                return Ok(pages);
            }
            if pages.len() as u64 >= self.page_count {
                return Err(self.corrupt(head, "page chain loops"));
            }
            page = header.next;
        }
    }

    /// Read the bytes stored in the chain starting at `head`.
    pub fn read_chain(&self, head: PageId) -> StoreResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut page = head;
        let mut hops = 0u64;
        loop {
            let header = self.read_header(page)?;
            let expected = if hops == 0 { PageKind::RecordHead } else { PageKind::RecordTail };
            if header.kind != expected {
                return Err(self.corrupt(page, format!("expected {:?} page, found {:?}", expected, header.kind)));
            }
            let start = out.len();
            out.resize(start + header.used as usize, 0);
            self.io
                .read_at(page * self.page_size as u64 + PAGE_HEADER_SIZE as u64, &mut out[start..])
                .map_err(|e| wrap_io(&self.path, &e, "failed to read page payload"))?;
            if header.next == 0 {
                return Ok(out);
            }
            hops += 1;
            if hops >= self.page_count {
                return Err(self.corrupt(head, "page chain loops"));
            }
            page = header.next;
        }
    }

    /// Release a chain: every page is rewritten as `Free` and reused.
    pub fn free_chain(&mut self, head: PageId) -> StoreResult<()> {
        self.check_writable()?;
        let pages = self.chain_pages(head)?;
        self.free_pages(&pages)
    }

    fn free_pages(&mut self, pages: &[PageId]) -> StoreResult<()> {
        let free = PageHeader { kind: PageKind::Free, used: 0, next: 0 };
        for &page in pages {
            self.write_page(page, free, &[])?;
            self.free.push(page);
        }
        Ok(())
    }

    /// All record head pages, in page order.
    pub fn scan_heads(&self) -> StoreResult<Vec<PageId>> {
        let mut heads = Vec::new();
        for page in 1..self.page_count {
            if self.read_header(page)?.kind == PageKind::RecordHead {
                heads.push(page);
            }
        }
        Ok(heads)
    }

    /// Rebuild the free stack from the set of pages reachable from live
    /// records. Unreachable pages that are not already `Free` are rewritten
    /// when the pager is writable.
    pub fn rebuild_free_list(&mut self, live: &hashbrown::HashSet<PageId>) -> StoreResult<usize> {
        let mut orphans = Vec::new();
        let mut free = Vec::new();
        for page in 1..self.page_count {
            if live.contains(&page) {
                continue;
            }
            if self.read_header(page)?.kind != PageKind::Free {
                orphans.push(page);
            }
            free.push(page);
        }
        if !self.read_only && !orphans.is_empty() {
            tracing::info!(count = orphans.len(), "reclaiming orphaned pages");
            let header = PageHeader { kind: PageKind::Free, used: 0, next: 0 };
            for &page in &orphans {
                self.write_page(page, header, &[])?;
            }
        }
        free.reverse();
        self.free = free;
        Ok(orphans.len())
    }
}

fn wrap_io(path: &Option<PathBuf>, err: &io::Error, context: &str) -> StoreError {
    StoreError::Io {
        path: path.clone(),
        kind: err.kind(),
        message: format!("{}: {}", context, err),
    }
}
