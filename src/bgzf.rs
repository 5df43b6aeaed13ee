//! Seekable decompression of BGZF files.
//!
//! BGZF is a gzip-compatible stream of independently decompressible
//! members, each at most 64KiB of payload. Positions inside the
//! decompressed data are addressed by [`VirtualOffset`]s, which combine
//! the compressed offset of a member with an offset into its payload.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, Read, Seek, SeekFrom};
use std::path::Path;

use libdeflater::Decompressor;
use log::warn;
use thiserror::Error;

use crate::utils::{SeekableRead, Tell};

const GZIP_ID1: u8 = 0x1f;
const GZIP_ID2: u8 = 0x8b;
const GZIP_CM_DEFLATE: u8 = 0x08;
const GZIP_FLG_FEXTRA: u8 = 0x04;

/// Fixed gzip header bytes preceding the extra field.
const HEADER_SIZE: usize = 12;
/// CRC32 and ISIZE trailing every member.
const TRAILER_SIZE: usize = 8;

/// Largest decompressed payload a single BGZF block may carry.
pub const MAX_BLOCK_SIZE: usize = 1 << 16;

/// The canonical 28-byte empty block terminating a BGZF stream.
pub const EOF_BLOCK: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// A position in the virtual coordinate space of a BGZF file: the upper
/// 48 bits are the compressed byte offset of a block, the lower 16 bits
/// the offset into that block's decompressed payload. Ordering is the
/// ordering of the packed integer.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    pub const ZERO: VirtualOffset = VirtualOffset(0);

    pub fn new(coffset: u64, uoffset: u16) -> VirtualOffset {
        debug_assert!(coffset < 1 << 48);
        VirtualOffset(coffset << 16 | u64::from(uoffset))
    }

    /// Compressed byte offset of the block.
    pub fn compressed(self) -> u64 {
        self.0 >> 16
    }

    /// Offset into the block's decompressed payload.
    pub fn uncompressed(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// The packed integer value, as stored in index files.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for VirtualOffset {
    fn from(raw: u64) -> VirtualOffset {
        VirtualOffset(raw)
    }
}

impl fmt::Display for VirtualOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.compressed(), self.uncompressed())
    }
}

impl fmt::Debug for VirtualOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualOffset({})", self)
    }
}

/// Possible errors encountered when reading a BGZF stream
#[derive(Error, Debug)]
pub enum BgzfError {
    #[error("Corrupt BGZF block at offset {offset}: {reason}")]
    CorruptBlock { offset: u64, reason: String },
    #[error("Virtual offset {0} does not address a block payload")]
    InvalidOffset(VirtualOffset),
    #[error("Uncompressed offset {0} is past the end of the stream")]
    OffsetPastEof(u64),
    #[error("Error occurred: {0}")]
    Io(#[from] io::Error),
}

fn corrupt(offset: u64, reason: impl Into<String>) -> BgzfError {
    BgzfError::CorruptBlock {
        offset,
        reason: reason.into(),
    }
}

fn into_io_error(e: BgzfError) -> io::Error {
    match e {
        BgzfError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

struct Block {
    /// File offset of the member's first compressed byte.
    coffset: u64,
    /// Total compressed size of the member.
    csize: u64,
    data: Vec<u8>,
}

/// Reads a BGZF file with random access by [`VirtualOffset`].
///
/// The reader owns its underlying storage and keeps a single current
/// block decompressed; seeking within that block only moves the cursor,
/// seeking elsewhere replaces it. [`Read`] and [`BufRead`] are
/// implemented over the decompressed stream and transparently cross
/// block boundaries.
pub struct BgzfReader<R: SeekableRead> {
    reader: R,
    block: Option<Block>,
    pos: usize,
    /// Where the next sequential block starts.
    next_coffset: u64,
    /// No more data will arrive sequentially.
    eof: bool,
    saw_eof_block: bool,
    blocks_read: u64,
    decompressor: Decompressor,
    /// Memoized `(coffset, uncompressed offset)` of scanned blocks,
    /// ascending; used by [`Self::seek_uncompressed`].
    uindex: Vec<(u64, u64)>,
}

impl BgzfReader<File> {
    /// Opens a BGZF file. The first block is read eagerly, so a file
    /// that is not BGZF fails here rather than on first use.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<BgzfReader<File>, BgzfError> {
        BgzfReader::new(File::open(path)?)
    }
}

impl<R: SeekableRead> BgzfReader<R> {
    /// Wraps a readable, seekable stream positioned at the start of a
    /// BGZF stream.
    pub fn new(mut reader: R) -> Result<BgzfReader<R>, BgzfError> {
        let start = reader.tell()?;
        let mut r = BgzfReader {
            reader,
            block: None,
            pos: 0,
            next_coffset: start,
            eof: false,
            saw_eof_block: false,
            blocks_read: 0,
            decompressor: Decompressor::new(),
            uindex: Vec::new(),
        };
        r.read_block()?;
        Ok(r)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Number of blocks decompressed so far.
    pub fn blocks_read(&self) -> u64 {
        self.blocks_read
    }

    /// The virtual offset of the cursor. A cursor at the end of a block
    /// reports the start of the next one, the convention index files
    /// use for chunk bounds.
    pub fn virtual_position(&self) -> VirtualOffset {
        match &self.block {
            Some(b) if self.pos < b.data.len() => VirtualOffset::new(b.coffset, self.pos as u16),
            Some(b) => VirtualOffset::new(b.coffset + b.csize, 0),
            None => VirtualOffset::new(self.next_coffset, 0),
        }
    }

    /// Positions the cursor at a virtual offset. Seeking within the
    /// current block only moves the cursor; anything else decompresses
    /// the addressed block, replacing the cached one.
    pub fn seek_virtual(&mut self, offset: VirtualOffset) -> Result<(), BgzfError> {
        let coffset = offset.compressed();
        let uoffset = offset.uncompressed() as usize;
        self.eof = false;
        self.saw_eof_block = false;
        let cached = matches!(&self.block, Some(b) if b.coffset == coffset);
        if !cached {
            self.next_coffset = coffset;
            self.block = None;
            self.read_block()?;
            let loaded = matches!(&self.block, Some(b) if b.coffset == coffset);
            if !loaded && uoffset > 0 {
                // empty or absent block: only its start is addressable
                return Err(BgzfError::InvalidOffset(offset));
            }
        }
        let len = self.block.as_ref().map_or(0, |b| b.data.len());
        if uoffset > len {
            return Err(BgzfError::InvalidOffset(offset));
        }
        self.pos = uoffset;
        Ok(())
    }

    /// Positions the cursor at an offset of the *decompressed* stream.
    ///
    /// Blocks are located by hopping members reading only their framing
    /// (header and trailer); only the destination block is inflated.
    /// Visited block positions are memoized so repeated fetches do not
    /// rescan the file.
    pub fn seek_uncompressed(&mut self, upos: u64) -> Result<(), BgzfError> {
        let (mut coffset, mut ucum) = match self.uindex.iter().rev().find(|&&(_, u)| u <= upos) {
            Some(&(c, u)) => (c, u),
            None => (0, 0),
        };
        loop {
            self.reader.seek(SeekFrom::Start(coffset))?;
            let (csize, isize) = match scan_member(&mut self.reader, coffset)? {
                Some(sizes) => sizes,
                None => return Err(BgzfError::OffsetPastEof(upos)),
            };
            if self.uindex.last().map_or(true, |&(c, _)| c < coffset) {
                self.uindex.push((coffset, ucum));
            }
            if isize > 0 && upos < ucum + u64::from(isize) {
                return self.seek_virtual(VirtualOffset::new(coffset, (upos - ucum) as u16));
            }
            ucum += u64::from(isize);
            coffset += csize;
        }
    }

    /// Loads the block starting at `next_coffset`, skipping empty
    /// non-terminator blocks, and leaves the cursor at its first byte.
    fn read_block(&mut self) -> Result<(), BgzfError> {
        loop {
            let coffset = self.next_coffset;
            self.reader.seek(SeekFrom::Start(coffset))?;
            let raw = match read_member_raw(&mut self.reader, coffset)? {
                Some(raw) => raw,
                None => {
                    // underlying stream ended
                    if !self.saw_eof_block {
                        warn!("BGZF stream ends at offset {} without the EOF marker", coffset);
                    }
                    self.eof = true;
                    self.block = None;
                    self.pos = 0;
                    return Ok(());
                }
            };
            let csize = raw.len() as u64;
            self.next_coffset = coffset + csize;
            let tail: [u8; 4] = raw[raw.len() - 4..].try_into().unwrap();
            let isize = u32::from_le_bytes(tail) as usize;
            if isize == 0 {
                if raw[..] == EOF_BLOCK[..] {
                    self.saw_eof_block = true;
                    self.eof = true;
                    self.block = None;
                    self.pos = 0;
                    return Ok(());
                }
                continue;
            }
            if isize > MAX_BLOCK_SIZE {
                return Err(corrupt(
                    coffset,
                    format!("declared payload of {} bytes exceeds the BGZF maximum", isize),
                ));
            }
            let mut data = vec![0u8; isize];
            let n = self
                .decompressor
                .gzip_decompress(&raw, &mut data)
                .map_err(|e| corrupt(coffset, format!("inflate failed: {:?}", e)))?;
            if n != isize {
                return Err(corrupt(
                    coffset,
                    format!("payload inflated to {} bytes, header declared {}", n, isize),
                ));
            }
            self.blocks_read += 1;
            self.block = Some(Block {
                coffset,
                csize,
                data,
            });
            self.pos = 0;
            return Ok(());
        }
    }
}

impl<R: SeekableRead> Read for BgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self.fill_buf()?;
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: SeekableRead> BufRead for BgzfReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        loop {
            let exhausted = self.block.as_ref().map_or(true, |b| self.pos >= b.data.len());
            if !exhausted {
                break;
            }
            if self.eof {
                return Ok(&[]);
            }
            self.read_block().map_err(into_io_error)?;
        }
        match &self.block {
            Some(b) => Ok(&b.data[self.pos..]),
            None => Ok(&[]),
        }
    }

    fn consume(&mut self, amt: usize) {
        let len = self.block.as_ref().map_or(0, |b| b.data.len());
        self.pos = (self.pos + amt).min(len);
    }
}

struct MemberHead {
    header: [u8; HEADER_SIZE],
    extra: Vec<u8>,
    /// Total compressed size of the member.
    bsize: usize,
}

/// Parses a member's gzip header and BGZF extra field. Returns `None`
/// on a clean end of the underlying stream.
fn read_member_head<R: Read>(reader: &mut R, coffset: u64) -> Result<Option<MemberHead>, BgzfError> {
    let mut header = [0u8; HEADER_SIZE];
    match read_full(reader, &mut header)? {
        0 => return Ok(None),
        n if n < HEADER_SIZE => return Err(corrupt(coffset, "truncated gzip header")),
        _ => {}
    }
    if header[0] != GZIP_ID1 || header[1] != GZIP_ID2 {
        return Err(corrupt(coffset, "not a gzip member"));
    }
    if header[2] != GZIP_CM_DEFLATE || header[3] & GZIP_FLG_FEXTRA == 0 {
        return Err(corrupt(coffset, "gzip member carries no extra field"));
    }
    let xlen = u16::from_le_bytes([header[10], header[11]]) as usize;
    let mut extra = vec![0u8; xlen];
    if read_full(reader, &mut extra)? < xlen {
        return Err(corrupt(coffset, "truncated extra field"));
    }
    let bsize = match find_bc_subfield(&extra) {
        Some(bsize) => bsize as usize + 1,
        None => return Err(corrupt(coffset, "extra field has no BC subfield")),
    };
    if bsize < HEADER_SIZE + xlen + TRAILER_SIZE {
        return Err(corrupt(coffset, "declared block size is smaller than its framing"));
    }
    Ok(Some(MemberHead {
        header,
        extra,
        bsize,
    }))
}

/// Reads the raw bytes of one whole member. Returns `None` on a clean
/// end of the underlying stream.
fn read_member_raw<R: Read>(reader: &mut R, coffset: u64) -> Result<Option<Vec<u8>>, BgzfError> {
    let head = match read_member_head(reader, coffset)? {
        Some(head) => head,
        None => return Ok(None),
    };
    let mut raw = Vec::with_capacity(head.bsize);
    raw.extend_from_slice(&head.header);
    raw.extend_from_slice(&head.extra);
    let rest = head.bsize - HEADER_SIZE - head.extra.len();
    let at = raw.len();
    raw.resize(head.bsize, 0);
    if read_full(reader, &mut raw[at..])? < rest {
        return Err(corrupt(coffset, "block ends before its declared size"));
    }
    Ok(Some(raw))
}

/// Learns a member's compressed and decompressed sizes from its framing
/// alone, without inflating it.
fn scan_member<R: SeekableRead>(
    reader: &mut R,
    coffset: u64,
) -> Result<Option<(u64, u32)>, BgzfError> {
    let head = match read_member_head(reader, coffset)? {
        Some(head) => head,
        None => return Ok(None),
    };
    reader.seek(SeekFrom::Start(coffset + head.bsize as u64 - 4))?;
    let mut tail = [0u8; 4];
    if read_full(reader, &mut tail)? < 4 {
        return Err(corrupt(coffset, "block ends before its declared size"));
    }
    Ok(Some((head.bsize as u64, u32::from_le_bytes(tail))))
}

/// Locates the `BC` subfield in a gzip extra field and returns its
/// payload, the total block size minus one.
fn find_bc_subfield(extra: &[u8]) -> Option<u16> {
    let mut rest = extra;
    while rest.len() >= 4 {
        let slen = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        if rest[0] == b'B' && rest[1] == b'C' && slen == 2 && rest.len() >= 6 {
            return Some(u16::from_le_bytes([rest[4], rest[5]]));
        }
        rest = rest.get(4 + slen..)?;
    }
    None
}

/// True if `buf` starts with a BGZF member header (gzip magic plus the
/// `BC` subfield in the expected position).
pub(crate) fn is_bgzf_header(buf: &[u8]) -> bool {
    buf.len() >= 16
        && buf[0] == GZIP_ID1
        && buf[1] == GZIP_ID2
        && buf[2] == GZIP_CM_DEFLATE
        && buf[3] & GZIP_FLG_FEXTRA != 0
        && buf[12] == b'B'
        && buf[13] == b'C'
        && buf[14..16] == [0x02, 0x00]
}

/// Reads until `buf` is full or the stream ends, returning the number
/// of bytes read.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
