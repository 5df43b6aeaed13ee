//! Reading BCF files: the embedded VCF header's contig dictionary,
//! sequential records, and CSI-indexed region queries.
//!
//! Only record placement and the site fields cheap enough to matter
//! (ID, alleles, QUAL) are decoded; INFO and FORMAT stay raw bytes.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use log::debug;

use crate::bgzf::{read_full, BgzfError, BgzfReader, VirtualOffset};
use crate::index::{check_index_age, find_index, read_index_file, BinningIndex};
use crate::query::{OpenError, ReadError, RecordRead, Records, Region, RegionQuery, RegionRecord};
use crate::utils::SeekableRead;

pub(crate) const BCF_MAGIC: [u8; 3] = *b"BCF";

/// QUAL bit pattern htslib writes for a missing value.
const MISSING_QUAL: u32 = 0x7f80_0001;

/// One `##contig` entry of the embedded VCF header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contig {
    pub name: String,
    pub length: Option<u64>,
}

/// The decoded BCF header: raw VCF header text, the contig dictionary
/// records index into, and the sample names.
#[derive(Clone, Debug)]
pub struct BcfHeader {
    text: String,
    contigs: Vec<Contig>,
    samples: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl BcfHeader {
    /// The VCF-text header, verbatim.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn contigs(&self) -> &[Contig] {
        &self.contigs
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn contig_id(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    fn parse(text: String) -> Result<BcfHeader, OpenError> {
        let mut named: Vec<(Option<usize>, Contig)> = Vec::new();
        let mut samples = Vec::new();
        for line in text.lines() {
            if let Some(body) = line
                .strip_prefix("##contig=<")
                .and_then(|rest| rest.strip_suffix('>'))
            {
                let mut name = None;
                let mut length = None;
                let mut idx = None;
                for attr in split_attributes(body) {
                    match attr.split_once('=') {
                        Some(("ID", v)) => name = Some(v.to_string()),
                        Some(("length", v)) => length = v.parse().ok(),
                        Some(("IDX", v)) => idx = v.parse().ok(),
                        _ => {}
                    }
                }
                let name = name.ok_or_else(|| {
                    OpenError::InvalidHeader(format!("contig line without an ID: {}", line))
                })?;
                named.push((idx, Contig { name, length }));
            } else if let Some(body) = line.strip_prefix("#CHROM\t") {
                // sample names follow the 9 fixed VCF columns
                samples = body.split('\t').skip(8).map(str::to_string).collect();
            }
        }
        // explicit IDX attributes override file order
        let mut contigs: Vec<Option<Contig>> = vec![None; named.len()];
        for (at, (idx, contig)) in named.into_iter().enumerate() {
            let at = idx.unwrap_or(at);
            if at >= contigs.len() {
                contigs.resize(at + 1, None);
            }
            if contigs[at].replace(contig).is_some() {
                return Err(OpenError::InvalidHeader(format!(
                    "two contigs share dictionary index {}",
                    at
                )));
            }
        }
        let contigs: Vec<Contig> = contigs
            .into_iter()
            .map(|c| {
                c.ok_or_else(|| {
                    OpenError::InvalidHeader("contig dictionary has gaps".to_string())
                })
            })
            .collect::<Result<_, _>>()?;
        let by_name = contigs
            .iter()
            .enumerate()
            .map(|(id, c)| (c.name.clone(), id))
            .collect();
        Ok(BcfHeader {
            text,
            contigs,
            samples,
            by_name,
        })
    }
}

/// Splits `a=1,b="x,y",c=2` on commas outside double quotes.
fn split_attributes(body: &str) -> impl Iterator<Item = &str> {
    let mut rest = body;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let mut in_quotes = false;
        for (at, c) in rest.char_indices() {
            match c {
                '"' => in_quotes = !in_quotes,
                ',' if !in_quotes => {
                    let (head, tail) = rest.split_at(at);
                    rest = &tail[1..];
                    return Some(head);
                }
                _ => {}
            }
        }
        let head = rest;
        rest = "";
        Some(head)
    })
}

/// One variant record.
///
/// Placement (contig, position, length) and QUAL are decoded eagerly;
/// ID and alleles on first access. INFO and per-sample data stay raw.
/// Coordinates are 0-based half-open.
#[derive(Debug)]
pub struct BcfRecord {
    shared: Vec<u8>,
    indiv: Vec<u8>,
    end: u64,
    id: OnceCell<String>,
    alleles: OnceCell<Vec<String>>,
}

impl BcfRecord {
    fn decode(shared: Vec<u8>, indiv: Vec<u8>) -> Result<BcfRecord, ReadError> {
        if shared.len() < 24 {
            return Err(ReadError::InvalidRecord(
                "site record is shorter than its fixed fields".to_string(),
            ));
        }
        let pos = i32::from_le_bytes(shared[4..8].try_into().unwrap());
        let rlen = i32::from_le_bytes(shared[8..12].try_into().unwrap());
        let start = pos.max(0) as u64;
        Ok(BcfRecord {
            shared,
            indiv,
            end: start + rlen.max(1) as u64,
            id: OnceCell::new(),
            alleles: OnceCell::new(),
        })
    }

    fn get_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.shared[at..at + 4].try_into().unwrap())
    }

    /// Id of the contig the record is placed on.
    pub fn contig_id(&self) -> Option<usize> {
        let id = self.get_u32(0) as i32;
        (id >= 0).then_some(id as usize)
    }

    /// 0-based position.
    pub fn start(&self) -> u64 {
        (self.get_u32(4) as i32).max(0) as u64
    }

    /// 0-based exclusive end: `start` plus the record's reference
    /// length, at least one base.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// QUAL, `None` when missing.
    pub fn quality(&self) -> Option<f32> {
        let bits = self.get_u32(12);
        (bits != MISSING_QUAL).then(|| f32::from_bits(bits))
    }

    pub fn allele_count(&self) -> usize {
        (self.get_u32(16) >> 16) as usize
    }

    pub fn info_count(&self) -> usize {
        (self.get_u32(16) & 0xffff) as usize
    }

    pub fn sample_count(&self) -> usize {
        (self.get_u32(20) & 0xff_ffff) as usize
    }

    /// The ID column, `.` when missing or malformed. Decoded on first
    /// access.
    pub fn id(&self) -> &str {
        self.id.get_or_init(|| {
            let mut at = 24;
            match read_typed_string(&self.shared, &mut at) {
                Some(id) if !id.is_empty() => id,
                _ => ".".to_string(),
            }
        })
    }

    /// REF and ALT alleles in file order; empty when malformed.
    /// Decoded on first access.
    pub fn alleles(&self) -> &[String] {
        self.alleles
            .get_or_init(|| self.decode_alleles().unwrap_or_default())
    }

    fn decode_alleles(&self) -> Option<Vec<String>> {
        let mut at = 24;
        read_typed_string(&self.shared, &mut at)?; // skip the ID
        let mut alleles = Vec::with_capacity(self.allele_count());
        for _ in 0..self.allele_count() {
            alleles.push(read_typed_string(&self.shared, &mut at)?);
        }
        Some(alleles)
    }

    /// The undecoded remainder of the shared block (filters and INFO).
    pub fn raw_shared(&self) -> &[u8] {
        &self.shared
    }

    /// The undecoded per-sample block.
    pub fn raw_samples(&self) -> &[u8] {
        &self.indiv
    }
}

/// Decodes one typed string (type 7) at `*at`, advancing past it.
fn read_typed_string(buf: &[u8], at: &mut usize) -> Option<String> {
    let descriptor = *buf.get(*at)?;
    *at += 1;
    let ty = descriptor & 0xf;
    let mut len = (descriptor >> 4) as usize;
    if len == 15 {
        len = read_typed_int(buf, at)?;
    }
    if ty != 0x7 {
        return None;
    }
    let bytes = buf.get(*at..*at + len)?;
    *at += len;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Decodes one typed scalar integer at `*at`, advancing past it.
fn read_typed_int(buf: &[u8], at: &mut usize) -> Option<usize> {
    let descriptor = *buf.get(*at)?;
    *at += 1;
    if descriptor >> 4 != 1 {
        return None;
    }
    let value = match descriptor & 0xf {
        0x1 => i64::from(*buf.get(*at)? as i8),
        0x2 => i64::from(i16::from_le_bytes(buf.get(*at..*at + 2)?.try_into().ok()?)),
        0x3 => i64::from(i32::from_le_bytes(buf.get(*at..*at + 4)?.try_into().ok()?)),
        _ => return None,
    };
    *at += match descriptor & 0xf {
        0x1 => 1,
        0x2 => 2,
        _ => 4,
    };
    usize::try_from(value).ok()
}

impl RegionRecord for BcfRecord {
    fn reference_id(&self) -> Option<usize> {
        self.contig_id()
    }

    fn start(&self) -> u64 {
        BcfRecord::start(self)
    }

    fn end(&self) -> u64 {
        BcfRecord::end(self)
    }
}

/// Reads a BCF file.
pub struct BcfReader<R: SeekableRead> {
    bgzf: BgzfReader<R>,
    header: BcfHeader,
    index: Option<BinningIndex>,
}

impl BcfReader<File> {
    /// Opens a BCF file, attaching `<path>.csi` when one exists next
    /// to it.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<BcfReader<File>, OpenError> {
        let path = path.as_ref();
        let mut reader = BcfReader::open(File::open(path)?)?;
        if let Some(index_path) = find_index(path, &["csi"]) {
            check_index_age(path, &index_path);
            reader.index = Some(read_index_file(&index_path)?);
            debug!("attached index {}", index_path.display());
        }
        Ok(reader)
    }
}

impl<R: SeekableRead> BcfReader<R> {
    /// Opens a BCF stream, without an index.
    pub fn open(read: R) -> Result<BcfReader<R>, OpenError> {
        let mut bgzf = BgzfReader::new(read)?;
        let mut magic = [0u8; 5];
        if read_full(&mut bgzf, &mut magic)? < 5 || magic[..3] != BCF_MAGIC {
            return Err(OpenError::UnknownMagic("BCF"));
        }
        if magic[3] != 2 {
            return Err(OpenError::InvalidHeader(format!(
                "unsupported BCF version {}.{}",
                magic[3], magic[4]
            )));
        }
        let mut l_text = [0u8; 4];
        if read_full(&mut bgzf, &mut l_text)? < 4 {
            return Err(OpenError::InvalidHeader("header ends mid-stream".to_string()));
        }
        let mut text = vec![0u8; u32::from_le_bytes(l_text) as usize];
        if read_full(&mut bgzf, &mut text)? < text.len() {
            return Err(OpenError::InvalidHeader("header ends mid-stream".to_string()));
        }
        let text = String::from_utf8_lossy(&text)
            .trim_end_matches('\0')
            .to_string();
        let header = BcfHeader::parse(text)?;
        debug!("BCF header: {} contigs", header.contigs.len());
        Ok(BcfReader {
            bgzf,
            header,
            index: None,
        })
    }

    /// Attaches a previously loaded index.
    pub fn set_index(&mut self, index: BinningIndex) {
        self.index = Some(index);
    }

    pub fn header(&self) -> &BcfHeader {
        &self.header
    }

    pub fn index(&self) -> Option<&BinningIndex> {
        self.index.as_ref()
    }

    /// Sequentially iterates every remaining record.
    pub fn records(&mut self) -> Records<'_, Self> {
        Records::new(self)
    }

    /// Iterates the records overlapping `[start, end)` (0-based) on
    /// the named contig. `end` past the contig length is clipped, not
    /// an error.
    pub fn query(
        &mut self,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<RegionQuery<'_, Self>, ReadError> {
        let (ref_id, chunks, end) = {
            let index = self.index.as_ref().ok_or(ReadError::MissingIndex)?;
            let ref_id = self
                .header
                .contig_id(name)
                .ok_or_else(|| ReadError::InvalidChromosome(name.to_string()))?;
            let end = match self.header.contigs[ref_id].length {
                Some(length) => end.min(length),
                None => end,
            };
            (ref_id, index.candidate_chunks(ref_id, start, end), end)
        };
        Ok(RegionQuery::new(self, chunks, ref_id, start, end))
    }

    /// Queries a parsed region string.
    pub fn query_region(&mut self, region: &Region) -> Result<RegionQuery<'_, Self>, ReadError> {
        self.query(&region.name, region.start, region.end.unwrap_or(u64::MAX))
    }
}

impl<R: SeekableRead> RecordRead for BcfReader<R> {
    type Record = BcfRecord;

    fn read_record(&mut self) -> Result<Option<BcfRecord>, ReadError> {
        let mut prefix = [0u8; 8];
        match read_full(&mut self.bgzf, &mut prefix)? {
            0 => return Ok(None),
            8 => {}
            _ => {
                return Err(ReadError::InvalidRecord(
                    "record length prefix ends mid-stream".to_string(),
                ))
            }
        }
        let l_shared = u32::from_le_bytes(prefix[..4].try_into().unwrap()) as usize;
        let l_indiv = u32::from_le_bytes(prefix[4..].try_into().unwrap()) as usize;
        let mut shared = vec![0u8; l_shared];
        let mut indiv = vec![0u8; l_indiv];
        if read_full(&mut self.bgzf, &mut shared)? < l_shared
            || read_full(&mut self.bgzf, &mut indiv)? < l_indiv
        {
            return Err(ReadError::InvalidRecord(
                "record body ends mid-stream".to_string(),
            ));
        }
        BcfRecord::decode(shared, indiv).map(Some)
    }

    fn virtual_position(&self) -> VirtualOffset {
        self.bgzf.virtual_position()
    }

    fn seek_virtual(&mut self, offset: VirtualOffset) -> Result<(), BgzfError> {
        self.bgzf.seek_virtual(offset)
    }
}
