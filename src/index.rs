//! The binned interval index shared by the BAI, CSI and tabix formats.
//!
//! All three formats store, per reference sequence, a mapping from
//! hierarchical coordinate bins to lists of virtual-offset chunks, plus
//! a linear index giving a lower bound on where records overlapping a
//! coordinate window can start. They differ only in framing: magic
//! numbers, where the scheme constants come from, whether reference
//! names are embedded, and whether the payload is itself BGZF
//! compressed. The bin arithmetic lives here, once; the format-specific
//! deserializers are in [`bai`], [`csi`] and [`tbi`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes};
use itertools::Itertools;
use log::{debug, warn};
use smallvec::SmallVec;
use thiserror::Error;

use crate::bgzf::{BgzfError, BgzfReader, VirtualOffset};

pub mod bai;
pub mod csi;
pub mod tbi;

/// Possible errors encountered when loading an index
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Invalid index magic (not a BAI, CSI or tabix index)")]
    UnknownMagic,
    #[error("Index is truncated: {0}")]
    Truncated(&'static str),
    #[error("Index is inconsistent: {0}")]
    Inconsistent(String),
    #[error("{0}")]
    Bgzf(#[from] BgzfError),
    #[error("Error occurred: {0}")]
    Io(#[from] std::io::Error),
}

/// Level and shift constants of the hierarchical binning scheme.
///
/// BAI and tabix fix these at `(14, 5)`; CSI carries its own pair in
/// the header. An interval always maps to the same bin ids under fixed
/// constants, so every query computes bins rather than storing them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BinLimits {
    min_shift: u32,
    depth: u32,
}

impl Default for BinLimits {
    fn default() -> BinLimits {
        BinLimits {
            min_shift: 14,
            depth: 5,
        }
    }
}

/// First bin id of the given level: 0, 1, 9, 73, 585, 4681, ...
fn level_offset(level: u32) -> u64 {
    ((1u64 << (3 * level)) - 1) / 7
}

impl BinLimits {
    pub fn new(min_shift: u32, depth: u32) -> BinLimits {
        BinLimits { min_shift, depth }
    }

    pub fn min_shift(&self) -> u32 {
        self.min_shift
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// One past the highest coordinate the scheme can address.
    pub fn max_position(&self) -> u64 {
        1u64 << (self.min_shift + 3 * self.depth)
    }

    /// One past the largest bin id the scheme can produce.
    pub(crate) fn bin_limit(&self) -> u32 {
        level_offset(self.depth + 1) as u32
    }

    /// Id of the metadata pseudo-bin (37450 at the default constants).
    pub(crate) fn meta_bin(&self) -> u32 {
        self.bin_limit() + 1
    }

    /// The smallest single bin that spans all of `[start, end)`.
    pub fn bin_for(&self, start: u64, end: u64) -> u32 {
        let end = end.saturating_sub(1).max(start);
        let mut level = self.depth;
        while level > 0 {
            let shift = self.min_shift + 3 * (self.depth - level);
            if start >> shift == end >> shift {
                return (level_offset(level) + (start >> shift)) as u32;
            }
            level -= 1;
        }
        0
    }

    /// Every bin that may hold a chunk overlapping `[start, end)`: at
    /// each level, the bins covering `start` through `end - 1`.
    pub fn bins_for(&self, start: u64, end: u64) -> SmallVec<[u32; 16]> {
        let mut bins = SmallVec::new();
        if start >= end {
            return bins;
        }
        let end = end.min(self.max_position()) - 1;
        for level in 0..=self.depth {
            let shift = self.min_shift + 3 * (self.depth - level);
            let first = level_offset(level) + (start >> shift);
            let last = level_offset(level) + (end >> shift);
            for bin in first..=last {
                bins.push(bin as u32);
            }
        }
        bins
    }
}

/// A contiguous range of the virtual-offset space to scan for
/// candidate records.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub begin: VirtualOffset,
    pub end: VirtualOffset,
}

/// The chunks registered under one bin.
#[derive(Clone, Debug, Default)]
pub struct Bin {
    /// Lowest virtual offset of any record in this bin. CSI folds its
    /// linear index into this field; zero for formats that keep a
    /// separate linear index.
    pub loffset: VirtualOffset,
    pub chunks: Vec<Chunk>,
}

/// Contents of the metadata pseudo-bin: placement of the reference's
/// record range and its mapped/unmapped counts.
#[derive(Copy, Clone, Debug)]
pub struct ReferenceMeta {
    pub start: VirtualOffset,
    pub end: VirtualOffset,
    pub mapped: u64,
    pub unmapped: u64,
}

/// Bin and linear tables for one reference sequence.
#[derive(Clone, Debug, Default)]
pub struct ReferenceIndex {
    pub(crate) bins: HashMap<u32, Bin>,
    pub(crate) linear: Vec<VirtualOffset>,
    pub(crate) meta: Option<ReferenceMeta>,
}

impl ReferenceIndex {
    pub fn bins(&self) -> &HashMap<u32, Bin> {
        &self.bins
    }

    pub fn linear(&self) -> &[VirtualOffset] {
        &self.linear
    }

    pub fn meta(&self) -> Option<&ReferenceMeta> {
        self.meta.as_ref()
    }
}

/// Which text preset a tabix index was built with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TabixFormat {
    Generic,
    Sam,
    Vcf,
}

/// Column mapping and line handling for a tabix-indexed text file.
#[derive(Clone, Debug)]
pub struct TabixConfig {
    pub format: TabixFormat,
    /// The begin (and end) columns already use 0-based half-open
    /// coordinates, as in BED.
    pub zero_based: bool,
    /// 1-based column numbers, as stored on disk.
    pub seq_col: usize,
    pub begin_col: usize,
    /// 0 when the format has no end column.
    pub end_col: usize,
    pub meta_char: u8,
    pub line_skip: u32,
}

impl TabixConfig {
    pub(crate) fn from_fields(
        preset: i32,
        seq_col: i32,
        begin_col: i32,
        end_col: i32,
        meta_char: i32,
        line_skip: i32,
    ) -> Result<TabixConfig, IndexError> {
        let format = match preset & 0xffff {
            0 => TabixFormat::Generic,
            1 => TabixFormat::Sam,
            2 => TabixFormat::Vcf,
            other => {
                return Err(IndexError::Inconsistent(format!(
                    "unknown tabix preset {}",
                    other
                )))
            }
        };
        let column = |v: i32, what: &str| {
            usize::try_from(v)
                .map_err(|_| IndexError::Inconsistent(format!("negative {} column", what)))
        };
        Ok(TabixConfig {
            format,
            zero_based: preset & 0x10000 != 0,
            seq_col: column(seq_col, "sequence")?,
            begin_col: column(begin_col, "begin")?,
            end_col: column(end_col, "end")?,
            meta_char: u8::try_from(meta_char).unwrap_or(b'#'),
            line_skip: line_skip.max(0) as u32,
        })
    }
}

/// A loaded binned interval index, immutable once loaded. May be shared
/// read-only across any number of readers.
#[derive(Clone, Debug)]
pub struct BinningIndex {
    pub(crate) limits: BinLimits,
    pub(crate) refs: Vec<ReferenceIndex>,
    /// Reference names, embedded in the tabix flavors only.
    pub(crate) names: Option<Vec<String>>,
    pub(crate) config: Option<TabixConfig>,
    /// Count of records placed on no reference, when recorded.
    pub(crate) unplaced: Option<u64>,
}

impl BinningIndex {
    pub fn limits(&self) -> BinLimits {
        self.limits
    }

    pub fn reference_count(&self) -> usize {
        self.refs.len()
    }

    pub fn reference(&self, ref_id: usize) -> Option<&ReferenceIndex> {
        self.refs.get(ref_id)
    }

    pub fn names(&self) -> Option<&[String]> {
        self.names.as_deref()
    }

    pub fn config(&self) -> Option<&TabixConfig> {
        self.config.as_ref()
    }

    pub fn unplaced(&self) -> Option<u64> {
        self.unplaced
    }

    /// Resolves an embedded reference name to its id.
    pub fn reference_id(&self, name: &str) -> Option<usize> {
        self.names
            .as_ref()
            .and_then(|names| names.iter().position(|n| n == name))
    }

    /// The minimal ordered set of virtual-offset ranges that together
    /// hold every record overlapping `[start, end)` on `ref_id`.
    ///
    /// This is a superset guarantee: the ranges may also cover records
    /// that do not overlap, which callers filter by exact coordinates.
    /// Candidate chunks are pruned against the linear index, sorted,
    /// and coalesced whenever they overlap, touch, or share a
    /// compressed block, to minimize seeks.
    pub fn candidate_chunks(&self, ref_id: usize, start: u64, end: u64) -> Vec<Chunk> {
        let reference = match self.refs.get(ref_id) {
            Some(r) => r,
            None => return Vec::new(),
        };
        if start >= end {
            return Vec::new();
        }
        let end = end.min(self.limits.max_position());
        let min_offset = self.lower_bound(reference, start);
        let mut chunks: Vec<Chunk> = Vec::new();
        for bin in self.limits.bins_for(start, end) {
            if let Some(bin) = reference.bins.get(&bin) {
                chunks.extend(bin.chunks.iter().filter(|c| c.end > min_offset));
            }
        }
        chunks.sort_by_key(|c| c.begin);
        let merged: Vec<Chunk> = chunks
            .into_iter()
            .coalesce(|a, b| {
                if b.begin <= a.end || b.begin.compressed() == a.end.compressed() {
                    Ok(Chunk {
                        begin: a.begin,
                        end: a.end.max(b.end),
                    })
                } else {
                    Err((a, b))
                }
            })
            .collect();
        debug!(
            "reference {} [{}, {}): {} scan ranges after merging",
            ref_id,
            start,
            end,
            merged.len()
        );
        merged
    }

    /// Lowest virtual offset at which a record overlapping a query
    /// starting at `start` can live. Chunks ending at or before this
    /// cannot contribute and are discarded.
    fn lower_bound(&self, reference: &ReferenceIndex, start: u64) -> VirtualOffset {
        if !reference.linear.is_empty() {
            let window = (start >> self.limits.min_shift) as usize;
            return reference.linear[window.min(reference.linear.len() - 1)];
        }
        // CSI: walk up from the finest bin containing `start`; the
        // first ancestor present in the table carries a usable lower
        // bound. Absent ancestry means no bound, which is still safe.
        let mut bin = (level_offset(self.limits.depth) + (start >> self.limits.min_shift)) as u32;
        loop {
            if let Some(bin) = reference.bins.get(&bin) {
                return bin.loffset;
            }
            if bin == 0 {
                return VirtualOffset::ZERO;
            }
            bin = (bin - 1) >> 3;
        }
    }
}

/// Loads an index of any supported flavor, sniffing the magic number
/// (and BGZF envelope) from the file itself.
pub fn read_index_file<P: AsRef<Path>>(path: P) -> Result<BinningIndex, IndexError> {
    let path = path.as_ref();
    debug!("loading index {}", path.display());
    let bytes = read_index_bytes(path)?;
    match bytes.get(..4) {
        Some(magic) if magic == bai::BAI_MAGIC => bai::parse(bytes),
        Some(magic) if magic == csi::CSI_MAGIC => csi::parse(bytes),
        Some(magic) if magic == tbi::TBI_MAGIC => tbi::parse(bytes),
        _ => Err(IndexError::UnknownMagic),
    }
}

/// Index payloads are either raw (BAI) or a BGZF stream (CSI, tabix).
pub(crate) fn read_index_bytes(path: &Path) -> Result<Bytes, IndexError> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    if raw.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        BgzfReader::new(Cursor::new(raw))?.read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    } else {
        Ok(Bytes::from(raw))
    }
}

/// Looks next to `path` for a companion index with one of the given
/// extensions appended to the full file name.
pub(crate) fn find_index(path: &Path, extensions: &[&str]) -> Option<PathBuf> {
    for extension in extensions {
        let mut name = path.as_os_str().to_os_string();
        name.push(".");
        name.push(extension);
        let candidate = PathBuf::from(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// A data file newer than its index is a common source of errors;
/// htslib proceeds anyway, so only warn.
pub(crate) fn check_index_age(path: &Path, index_path: &Path) {
    let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
    if let (Some(data), Some(index)) = (modified(path), modified(index_path)) {
        if data > index {
            warn!(
                "{} is newer than its index {}",
                path.display(),
                index_path.display()
            );
        }
    }
}

/// Decodes a concatenation of NUL-terminated reference names.
pub(crate) fn read_names(raw: &[u8]) -> Result<Vec<String>, IndexError> {
    if !raw.is_empty() && raw.last() != Some(&0) {
        return Err(IndexError::Inconsistent(
            "reference name table is not NUL-terminated".to_string(),
        ));
    }
    raw.split(|&b| b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| {
            std::str::from_utf8(name)
                .map(str::to_string)
                .map_err(|_| {
                    IndexError::Inconsistent("reference name is not valid UTF-8".to_string())
                })
        })
        .collect()
}

pub(crate) fn need(buf: &Bytes, n: usize, what: &'static str) -> Result<(), IndexError> {
    if buf.remaining() < n {
        Err(IndexError::Truncated(what))
    } else {
        Ok(())
    }
}

pub(crate) fn count(value: i32, what: &str) -> Result<usize, IndexError> {
    usize::try_from(value).map_err(|_| IndexError::Inconsistent(format!("negative {}", what)))
}

/// BAI and tabix share the same per-reference layout: bins with chunk
/// lists, then a linear index of 16KiB windows.
pub(crate) fn parse_ref_tables(
    buf: &mut Bytes,
    n_ref: usize,
    limits: BinLimits,
) -> Result<Vec<ReferenceIndex>, IndexError> {
    let mut refs = Vec::with_capacity(n_ref);
    for _ in 0..n_ref {
        need(buf, 4, "bin count")?;
        let n_bin = count(buf.get_i32_le(), "bin count")?;
        let mut reference = ReferenceIndex::default();
        for _ in 0..n_bin {
            need(buf, 8, "bin header")?;
            let id = buf.get_u32_le();
            let n_chunk = count(buf.get_i32_le(), "chunk count")?;
            need(buf, n_chunk * 16, "chunk table")?;
            if id == limits.meta_bin() {
                reference.meta = Some(parse_meta(buf, n_chunk)?);
            } else if id >= limits.bin_limit() {
                return Err(IndexError::Inconsistent(format!("bin id {} out of range", id)));
            } else {
                let chunks = parse_chunks(buf, n_chunk);
                reference.bins.entry(id).or_default().chunks.extend(chunks);
            }
        }
        need(buf, 4, "interval count")?;
        let n_intv = count(buf.get_i32_le(), "interval count")?;
        need(buf, n_intv * 8, "linear index")?;
        reference.linear = (0..n_intv)
            .map(|_| VirtualOffset::from(buf.get_u64_le()))
            .collect();
        refs.push(reference);
    }
    Ok(refs)
}

pub(crate) fn parse_chunks(buf: &mut Bytes, n_chunk: usize) -> Vec<Chunk> {
    (0..n_chunk)
        .map(|_| Chunk {
            begin: VirtualOffset::from(buf.get_u64_le()),
            end: VirtualOffset::from(buf.get_u64_le()),
        })
        .collect()
}

/// The pseudo-bin stores two chunk-shaped entries: the reference's
/// virtual-offset span, then its mapped/unmapped counts.
pub(crate) fn parse_meta(buf: &mut Bytes, n_chunk: usize) -> Result<ReferenceMeta, IndexError> {
    if n_chunk < 2 {
        return Err(IndexError::Truncated("metadata pseudo-bin"));
    }
    let meta = ReferenceMeta {
        start: VirtualOffset::from(buf.get_u64_le()),
        end: VirtualOffset::from(buf.get_u64_le()),
        mapped: buf.get_u64_le(),
        unmapped: buf.get_u64_le(),
    };
    buf.advance((n_chunk - 2) * 16);
    Ok(meta)
}

/// Reads the optional trailing count of unplaced records.
pub(crate) fn parse_unplaced(buf: &mut Bytes) -> Option<u64> {
    (buf.remaining() >= 8).then(|| buf.get_u64_le())
}
