//! Reading BAM files: header, sequential records, and indexed region
//! queries when a BAI or CSI companion index is present.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::debug;

use crate::bgzf::{read_full, BgzfError, BgzfReader, VirtualOffset};
use crate::index::{check_index_age, find_index, read_index_file, BinningIndex};
use crate::query::{OpenError, ReadError, RecordRead, Records, Region, RegionQuery, RegionRecord};
use crate::utils::SeekableRead;

pub(crate) const BAM_MAGIC: [u8; 4] = *b"BAM\x01";

const CIGAR_OPS: &[u8; 9] = b"MIDNSHP=X";
const SEQ_BASES: &[u8; 16] = b"=ACMGRSVTWYHKDBN";

/// Name and length of one reference sequence in a BAM header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceSequence {
    pub name: String,
    pub length: u32,
}

/// One line of the SAM-text header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderLine {
    /// A keyed record such as `@HD` or `@SQ`, with its `TAG:VALUE`
    /// pairs in file order.
    Record {
        key: String,
        tags: Vec<(String, String)>,
    },
    /// A `@CO` comment.
    Comment(String),
}

/// The decoded BAM header: the raw SAM text plus the binary reference
/// dictionary.
#[derive(Clone, Debug)]
pub struct BamHeader {
    text: String,
    references: Vec<ReferenceSequence>,
    by_name: HashMap<String, usize>,
}

impl BamHeader {
    /// The SAM-text header, verbatim.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn references(&self) -> &[ReferenceSequence] {
        &self.references
    }

    pub fn reference_id(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Parses the SAM-text header into keyed records and comments.
    pub fn lines(&self) -> Vec<HeaderLine> {
        self.text
            .lines()
            .filter(|line| line.starts_with('@'))
            .map(|line| match line.strip_prefix("@CO\t") {
                Some(comment) => HeaderLine::Comment(comment.to_string()),
                None => {
                    let mut parts = line[1..].split('\t');
                    let key = parts.next().unwrap_or_default().to_string();
                    let tags = parts
                        .filter_map(|part| part.split_once(':'))
                        .map(|(tag, value)| (tag.to_string(), value.to_string()))
                        .collect();
                    HeaderLine::Record { key, tags }
                }
            })
            .collect()
    }
}

/// One alignment record.
///
/// Placement coordinates are decoded eagerly; the read name, CIGAR and
/// sequence are decoded on first access and cached. Coordinates are
/// 0-based half-open.
#[derive(Debug)]
pub struct BamRecord {
    /// The record body, without its length prefix.
    buf: Vec<u8>,
    end: u64,
    name: OnceCell<String>,
    cigar: OnceCell<String>,
    sequence: OnceCell<String>,
}

impl BamRecord {
    fn decode(buf: Vec<u8>) -> Result<BamRecord, ReadError> {
        if buf.len() < 32 {
            return Err(ReadError::InvalidRecord(
                "alignment record is shorter than its fixed fields".to_string(),
            ));
        }
        let l_read_name = buf[8] as usize;
        let n_cigar = u16::from_le_bytes([buf[12], buf[13]]) as usize;
        let l_seq = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
        let data_end = 32 + l_read_name + 4 * n_cigar + (l_seq + 1) / 2 + l_seq;
        if l_read_name == 0 || buf.len() < data_end {
            return Err(ReadError::InvalidRecord(
                "alignment record lengths overflow its buffer".to_string(),
            ));
        }
        // reference span of the alignment, per the CIGAR
        let mut span: u64 = 0;
        for i in 0..n_cigar {
            let at = 32 + l_read_name + 4 * i;
            let op = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
            if matches!(op & 0xf, 0 | 2 | 3 | 7 | 8) {
                span += u64::from(op >> 4);
            }
        }
        let pos = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let start = pos.max(0) as u64;
        Ok(BamRecord {
            buf,
            end: start + span.max(1),
            name: OnceCell::new(),
            cigar: OnceCell::new(),
            sequence: OnceCell::new(),
        })
    }

    fn get_i32(&self, at: usize) -> i32 {
        i32::from_le_bytes(self.buf[at..at + 4].try_into().unwrap())
    }

    fn l_read_name(&self) -> usize {
        self.buf[8] as usize
    }

    fn n_cigar(&self) -> usize {
        u16::from_le_bytes([self.buf[12], self.buf[13]]) as usize
    }

    fn l_seq(&self) -> usize {
        u32::from_le_bytes(self.buf[16..20].try_into().unwrap()) as usize
    }

    /// Id of the reference the alignment is placed on.
    pub fn reference_id(&self) -> Option<usize> {
        let id = self.get_i32(0);
        (id >= 0).then_some(id as usize)
    }

    /// 0-based leftmost coordinate of the alignment.
    pub fn start(&self) -> u64 {
        self.get_i32(4).max(0) as u64
    }

    /// 0-based exclusive end of the reference span; `start + 1` for
    /// alignments without reference-consuming CIGAR operations.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn flag(&self) -> u16 {
        u16::from_le_bytes([self.buf[14], self.buf[15]])
    }

    pub fn is_unmapped(&self) -> bool {
        self.flag() & 0x4 != 0
    }

    pub fn mapping_quality(&self) -> u8 {
        self.buf[9]
    }

    pub fn mate_reference_id(&self) -> Option<usize> {
        let id = self.get_i32(20);
        (id >= 0).then_some(id as usize)
    }

    /// 0-based leftmost coordinate of the mate.
    pub fn mate_start(&self) -> u64 {
        self.get_i32(24).max(0) as u64
    }

    pub fn template_length(&self) -> i32 {
        self.get_i32(28)
    }

    /// The read name, decoded on first access.
    pub fn name(&self) -> &str {
        self.name.get_or_init(|| {
            let name = &self.buf[32..32 + self.l_read_name() - 1];
            String::from_utf8_lossy(name).into_owned()
        })
    }

    /// The CIGAR in text form, `*` when absent. Decoded on first
    /// access.
    pub fn cigar(&self) -> &str {
        self.cigar.get_or_init(|| {
            let n = self.n_cigar();
            if n == 0 {
                return "*".to_string();
            }
            let at = 32 + self.l_read_name();
            let mut out = String::with_capacity(n * 4);
            for i in 0..n {
                let op = u32::from_le_bytes(self.buf[at + 4 * i..at + 4 * i + 4].try_into().unwrap());
                let _ = write!(out, "{}", op >> 4);
                let code = (op & 0xf) as usize;
                out.push(char::from(*CIGAR_OPS.get(code).unwrap_or(&b'?')));
            }
            out
        })
    }

    /// The base sequence in text form, `*` when absent. Decoded on
    /// first access.
    pub fn sequence(&self) -> &str {
        self.sequence.get_or_init(|| {
            let l_seq = self.l_seq();
            if l_seq == 0 {
                return "*".to_string();
            }
            let at = 32 + self.l_read_name() + 4 * self.n_cigar();
            let mut out = String::with_capacity(l_seq);
            for i in 0..l_seq {
                let byte = self.buf[at + i / 2];
                let code = if i % 2 == 0 { byte >> 4 } else { byte & 0xf };
                out.push(char::from(SEQ_BASES[code as usize]));
            }
            out
        })
    }

    /// Raw Phred base qualities, no +33 offset; a run of `0xff` means
    /// qualities are absent.
    pub fn qualities(&self) -> &[u8] {
        let at = 32 + self.l_read_name() + 4 * self.n_cigar() + (self.l_seq() + 1) / 2;
        &self.buf[at..at + self.l_seq()]
    }
}

impl RegionRecord for BamRecord {
    fn reference_id(&self) -> Option<usize> {
        BamRecord::reference_id(self)
    }

    fn start(&self) -> u64 {
        BamRecord::start(self)
    }

    fn end(&self) -> u64 {
        BamRecord::end(self)
    }
}

/// Reads a BAM file.
pub struct BamReader<R: SeekableRead> {
    bgzf: BgzfReader<R>,
    header: BamHeader,
    index: Option<BinningIndex>,
}

impl BamReader<File> {
    /// Opens a BAM file, attaching `<path>.bai` or `<path>.csi` when
    /// one exists next to it.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<BamReader<File>, OpenError> {
        let path = path.as_ref();
        let mut reader = BamReader::open(File::open(path)?)?;
        if let Some(index_path) = find_index(path, &["bai", "csi"]) {
            check_index_age(path, &index_path);
            reader.index = Some(read_index_file(&index_path)?);
            debug!("attached index {}", index_path.display());
        }
        Ok(reader)
    }
}

impl<R: SeekableRead> BamReader<R> {
    /// Opens a BAM stream, without an index.
    pub fn open(read: R) -> Result<BamReader<R>, OpenError> {
        let mut bgzf = BgzfReader::new(read)?;
        let header = read_header(&mut bgzf)?;
        debug!(
            "BAM header: {} reference sequences",
            header.references.len()
        );
        Ok(BamReader {
            bgzf,
            header,
            index: None,
        })
    }

    /// Attaches a previously loaded index.
    pub fn set_index(&mut self, index: BinningIndex) {
        self.index = Some(index);
    }

    pub fn header(&self) -> &BamHeader {
        &self.header
    }

    pub fn index(&self) -> Option<&BinningIndex> {
        self.index.as_ref()
    }

    /// Number of BGZF blocks decompressed so far.
    pub fn blocks_read(&self) -> u64 {
        self.bgzf.blocks_read()
    }

    /// Sequentially iterates every remaining record.
    pub fn records(&mut self) -> Records<'_, Self> {
        Records::new(self)
    }

    /// Iterates the records overlapping `[start, end)` (0-based) on
    /// the named reference. `end` past the reference length is clipped,
    /// not an error.
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
                .reference_id(name)
                .ok_or_else(|| ReadError::InvalidChromosome(name.to_string()))?;
            let end = end.min(u64::from(self.header.references[ref_id].length));
            (ref_id, index.candidate_chunks(ref_id, start, end), end)
        };
        Ok(RegionQuery::new(self, chunks, ref_id, start, end))
    }

    /// Queries a parsed region string.
    pub fn query_region(&mut self, region: &Region) -> Result<RegionQuery<'_, Self>, ReadError> {
        self.query(&region.name, region.start, region.end.unwrap_or(u64::MAX))
    }
}

impl<R: SeekableRead> RecordRead for BamReader<R> {
    type Record = BamRecord;

    fn read_record(&mut self) -> Result<Option<BamRecord>, ReadError> {
        let mut prefix = [0u8; 4];
        match read_full(&mut self.bgzf, &mut prefix)? {
            0 => return Ok(None),
            4 => {}
            _ => {
                return Err(ReadError::InvalidRecord(
                    "record length prefix ends mid-stream".to_string(),
                ))
            }
        }
        let block_size = u32::from_le_bytes(prefix) as usize;
        let mut buf = vec![0u8; block_size];
        if read_full(&mut self.bgzf, &mut buf)? < block_size {
            return Err(ReadError::InvalidRecord(
                "record body ends mid-stream".to_string(),
            ));
        }
        BamRecord::decode(buf).map(Some)
    }

    fn virtual_position(&self) -> VirtualOffset {
        self.bgzf.virtual_position()
    }

    fn seek_virtual(&mut self, offset: VirtualOffset) -> Result<(), BgzfError> {
        self.bgzf.seek_virtual(offset)
    }
}

fn read_header<R: SeekableRead>(bgzf: &mut BgzfReader<R>) -> Result<BamHeader, OpenError> {
    let mut magic = [0u8; 4];
    if read_full(bgzf, &mut magic)? < 4 || magic != BAM_MAGIC {
        return Err(OpenError::UnknownMagic("BAM"));
    }
    let l_text = read_u32(bgzf)? as usize;
    let mut text = vec![0u8; l_text];
    read_exactly(bgzf, &mut text, "header text")?;
    let text = String::from_utf8_lossy(&text)
        .trim_end_matches('\0')
        .to_string();
    let n_ref = read_u32(bgzf)? as usize;
    let mut references = Vec::with_capacity(n_ref);
    let mut by_name = HashMap::with_capacity(n_ref);
    for _ in 0..n_ref {
        let l_name = read_u32(bgzf)? as usize;
        if l_name == 0 {
            return Err(OpenError::InvalidHeader(
                "empty reference sequence name".to_string(),
            ));
        }
        let mut name = vec![0u8; l_name];
        read_exactly(bgzf, &mut name, "reference name")?;
        let name = std::str::from_utf8(&name[..l_name - 1])
            .map_err(|_| OpenError::InvalidHeader("reference name is not valid UTF-8".to_string()))?
            .to_string();
        let length = read_u32(bgzf)?;
        by_name.insert(name.clone(), references.len());
        references.push(ReferenceSequence { name, length });
    }
    Ok(BamHeader {
        text,
        references,
        by_name,
    })
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, OpenError> {
    let mut buf = [0u8; 4];
    read_exactly(reader, &mut buf, "header field")?;
    Ok(u32::from_le_bytes(buf))
}

fn read_exactly<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<(), OpenError> {
    if read_full(reader, buf)? < buf.len() {
        return Err(OpenError::InvalidHeader(format!("{} ends mid-stream", what)));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    pub(crate) fn record_bytes(
        ref_id: i32,
        pos: i32,
        name: &str,
        cigar: &[(u32, u8)],
        seq: &str,
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&ref_id.to_le_bytes());
        body.extend_from_slice(&pos.to_le_bytes());
        body.push(name.len() as u8 + 1);
        body.push(30); // mapq
        body.extend_from_slice(&4681u16.to_le_bytes()); // bin
        body.extend_from_slice(&(cigar.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes()); // flag
        body.extend_from_slice(&(seq.len() as u32).to_le_bytes());
        body.extend_from_slice(&(-1i32).to_le_bytes()); // mate ref
        body.extend_from_slice(&(-1i32).to_le_bytes()); // mate pos
        body.extend_from_slice(&0i32.to_le_bytes()); // tlen
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        for &(len, op) in cigar {
            let code = CIGAR_OPS.iter().position(|&c| c == op).unwrap() as u32;
            body.extend_from_slice(&(len << 4 | code).to_le_bytes());
        }
        let mut packed = Vec::new();
        for (i, base) in seq.bytes().enumerate() {
            let code = SEQ_BASES.iter().position(|&c| c == base).unwrap() as u8;
            if i % 2 == 0 {
                packed.push(code << 4);
            } else {
                let last = packed.len() - 1;
                packed[last] |= code;
            }
        }
        body.extend_from_slice(&packed);
        body.extend_from_slice(&vec![0xffu8; seq.len()]); // qualities
        body
    }

    fn record(ref_id: i32, pos: i32, name: &str, cigar: &[(u32, u8)], seq: &str) -> BamRecord {
        BamRecord::decode(record_bytes(ref_id, pos, name, cigar, seq)).unwrap()
    }

    #[test]
    fn end_counts_only_reference_consuming_operations() {
        let r = record(0, 100, "read1", &[(3, b'S'), (10, b'M'), (2, b'I'), (5, b'D')], "ACGT");
        assert_eq!(r.start(), 100);
        assert_eq!(r.end(), 115); // 10M + 5D, the soft clip and insertion do not count
        assert_eq!(r.cigar(), "3S10M2I5D");
    }

    #[test]
    fn alignment_less_record_spans_one_base() {
        let r = record(0, 100, "read1", &[], "ACGT");
        assert_eq!(r.end(), 101);
        assert_eq!(r.cigar(), "*");
    }

    #[test]
    fn lazy_fields_decode_on_demand() {
        let r = record(2, 7, "frag/1", &[(4, b'M')], "ACGT");
        assert_eq!(r.reference_id(), Some(2));
        assert_eq!(r.name(), "frag/1");
        assert_eq!(r.sequence(), "ACGT");
        assert_eq!(r.mapping_quality(), 30);
        assert_eq!(r.flag(), 0);
        assert_eq!(r.qualities(), &[0xff; 4]);
        assert_eq!(r.mate_reference_id(), None);
    }

    #[test]
    fn unplaced_record_has_no_reference() {
        let r = record(-1, -1, "frag/2", &[], "A");
        assert_eq!(r.reference_id(), None);
        assert_eq!(r.start(), 0);
    }

    #[test]
    fn short_records_are_rejected() {
        assert!(matches!(
            BamRecord::decode(vec![0u8; 10]),
            Err(ReadError::InvalidRecord(_))
        ));
        // claims a longer name than the buffer holds
        let mut bytes = record_bytes(0, 1, "x", &[], "A");
        bytes[8] = 200;
        assert!(matches!(
            BamRecord::decode(bytes),
            Err(ReadError::InvalidRecord(_))
        ));
    }

    #[test]
    fn header_lines_split_records_and_comments() {
        let header = BamHeader {
            text: "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:10000\n@CO\tfree text\n"
                .to_string(),
            references: vec![],
            by_name: HashMap::new(),
        };
        let lines = header.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            HeaderLine::Record {
                key: "HD".to_string(),
                tags: vec![
                    ("VN".to_string(), "1.6".to_string()),
                    ("SO".to_string(), "coordinate".to_string()),
                ],
            }
        );
        assert_eq!(lines[2], HeaderLine::Comment("free text".to_string()));
    }
}
