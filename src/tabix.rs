//! Reading tabix-indexed text files: BGZF-compressed TSV (VCF, BED,
//! GFF, SAM, ...) whose lines become records through the column
//! configuration stored in the index.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufRead;
use std::path::Path;

use log::debug;

use crate::bgzf::{BgzfError, BgzfReader, VirtualOffset};
use crate::index::{
    check_index_age, find_index, read_index_file, BinningIndex, TabixConfig, TabixFormat,
};
use crate::query::{OpenError, ReadError, RecordRead, Records, Region, RegionQuery, RegionRecord};
use crate::utils::SeekableRead;

/// One line of a tabix-indexed file, with the coordinates the index
/// configuration extracts from it. Coordinates are 0-based half-open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabixRecord {
    line: String,
    ref_id: usize,
    start: u64,
    end: u64,
}

impl TabixRecord {
    /// The raw line, without its terminator.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// The line's tab-separated columns.
    pub fn fields(&self) -> std::str::Split<'_, char> {
        self.line.split('\t')
    }

    pub fn reference_id(&self) -> usize {
        self.ref_id
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }
}

impl RegionRecord for TabixRecord {
    fn reference_id(&self) -> Option<usize> {
        Some(self.ref_id)
    }

    fn start(&self) -> u64 {
        self.start
    }

    fn end(&self) -> u64 {
        self.end
    }
}

/// Reads a BGZF-compressed, tabix-indexed text file.
pub struct TabixReader<R: SeekableRead> {
    bgzf: BgzfReader<R>,
    index: BinningIndex,
    config: TabixConfig,
    by_name: HashMap<String, usize>,
}

impl TabixReader<File> {
    /// Opens a tabix-indexed file; the `<path>.tbi` or `<path>.csi`
    /// companion is required.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<TabixReader<File>, OpenError> {
        let path = path.as_ref();
        let index_path = find_index(path, &["tbi", "csi"])
            .ok_or_else(|| OpenError::MissingIndex(path.to_path_buf()))?;
        check_index_age(path, &index_path);
        let index = read_index_file(&index_path)?;
        debug!("attached index {}", index_path.display());
        TabixReader::open(File::open(path)?, index)
    }
}

impl<R: SeekableRead> TabixReader<R> {
    /// Opens a BGZF text stream with a loaded tabix-flavored index.
    pub fn open(read: R, index: BinningIndex) -> Result<TabixReader<R>, OpenError> {
        let config = index
            .config()
            .cloned()
            .ok_or_else(|| OpenError::InvalidHeader("index carries no tabix configuration".to_string()))?;
        let names = index.names().ok_or_else(|| {
            OpenError::InvalidHeader("index carries no reference names".to_string())
        })?;
        let by_name = names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();
        Ok(TabixReader {
            bgzf: BgzfReader::new(read)?,
            index,
            config,
            by_name,
        })
    }

    /// The reference names embedded in the index, in id order.
    pub fn reference_names(&self) -> &[String] {
        self.index.names().unwrap_or(&[])
    }

    pub fn index(&self) -> &BinningIndex {
        &self.index
    }

    pub fn config(&self) -> &TabixConfig {
        &self.config
    }

    /// Collects the leading meta-character lines, leaving the cursor at
    /// the first data line.
    pub fn header(&mut self) -> Result<Vec<String>, ReadError> {
        self.bgzf.seek_virtual(VirtualOffset::ZERO)?;
        let mut lines = Vec::new();
        loop {
            let at = self.bgzf.virtual_position();
            match self.read_line()? {
                Some(line) if line.as_bytes().first() == Some(&self.config.meta_char) => {
                    lines.push(line);
                }
                Some(_) => {
                    // one line too far; step back to its start
                    self.bgzf.seek_virtual(at)?;
                    break;
                }
                None => break,
            }
        }
        Ok(lines)
    }

    /// Iterates every data line from the start of the file.
    pub fn records(&mut self) -> Result<Records<'_, Self>, ReadError> {
        self.bgzf.seek_virtual(VirtualOffset::ZERO)?;
        Ok(Records::new(self))
    }

    /// Iterates the lines overlapping `[start, end)` (0-based) on the
    /// named sequence.
    pub fn query(
        &mut self,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<RegionQuery<'_, Self>, ReadError> {
        let ref_id = self
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| ReadError::InvalidChromosome(name.to_string()))?;
        let chunks = self.index.candidate_chunks(ref_id, start, end);
        Ok(RegionQuery::new(self, chunks, ref_id, start, end))
    }

    /// Queries a parsed region string.
    pub fn query_region(&mut self, region: &Region) -> Result<RegionQuery<'_, Self>, ReadError> {
        self.query(&region.name, region.start, region.end.unwrap_or(u64::MAX))
    }

    fn read_line(&mut self) -> Result<Option<String>, ReadError> {
        let mut raw = Vec::new();
        if self.bgzf.read_until(b'\n', &mut raw)? == 0 {
            return Ok(None);
        }
        while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
            raw.pop();
        }
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Extracts `(ref_id, start, end)` from a data line per the
    /// configured preset.
    fn parse_line(&self, line: String) -> Result<TabixRecord, ReadError> {
        let malformed =
            |what: &str| ReadError::InvalidRecord(format!("{} in line {:?}", what, line));
        let mut seq = None;
        let mut begin = None;
        let mut end_col = None;
        let mut ref_len = None;
        let mut info_end = None;
        let mut cigar_span = None;
        for (at, field) in line.split('\t').enumerate() {
            let column = at + 1;
            if column == self.config.seq_col {
                seq = Some(field);
            }
            if column == self.config.begin_col {
                begin = Some(field);
            }
            match self.config.format {
                TabixFormat::Generic => {
                    if self.config.end_col != 0 && column == self.config.end_col {
                        end_col = Some(field);
                    }
                }
                TabixFormat::Vcf => {
                    if column == 4 {
                        ref_len = Some(field.len() as u64);
                    }
                    if column == 8 {
                        info_end = field
                            .split(';')
                            .find_map(|entry| entry.strip_prefix("END="))
                            .and_then(|value| value.parse::<u64>().ok());
                    }
                }
                TabixFormat::Sam => {
                    if column == 6 {
                        cigar_span = Some(cigar_reference_span(field));
                    }
                }
            }
        }
        let seq = seq.ok_or_else(|| malformed("missing sequence column"))?;
        let ref_id = *self
            .by_name
            .get(seq)
            .ok_or_else(|| malformed("unindexed sequence name"))?;
        let begin: u64 = begin
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| malformed("missing or non-numeric begin column"))?;
        let start = if self.config.zero_based {
            begin
        } else {
            begin.saturating_sub(1)
        };
        let end = match self.config.format {
            TabixFormat::Generic => match end_col {
                Some(field) => field
                    .parse::<u64>()
                    .map_err(|_| malformed("non-numeric end column"))?,
                None => start + 1,
            },
            // the record covers its REF allele unless INFO says END=
            TabixFormat::Vcf => match info_end {
                Some(end) => end,
                None => start + ref_len.unwrap_or(1).max(1),
            },
            TabixFormat::Sam => start + cigar_span.unwrap_or(1).max(1),
        };
        Ok(TabixRecord {
            line,
            ref_id,
            start,
            end: end.max(start + 1),
        })
    }
}

/// Number of reference bases a text CIGAR consumes.
fn cigar_reference_span(cigar: &str) -> u64 {
    let mut span = 0u64;
    let mut run = 0u64;
    for c in cigar.chars() {
        if let Some(digit) = c.to_digit(10) {
            run = run * 10 + u64::from(digit);
        } else {
            if matches!(c, 'M' | 'D' | 'N' | '=' | 'X') {
                span += run;
            }
            run = 0;
        }
    }
    span
}

impl<R: SeekableRead> RecordRead for TabixReader<R> {
    type Record = TabixRecord;

    fn read_record(&mut self) -> Result<Option<TabixRecord>, ReadError> {
        loop {
            match self.read_line()? {
                None => return Ok(None),
                Some(line)
                    if line.is_empty()
                        || line.as_bytes().first() == Some(&self.config.meta_char) =>
                {
                    continue
                }
                Some(line) => return self.parse_line(line).map(Some),
            }
        }
    }

    fn virtual_position(&self) -> VirtualOffset {
        self.bgzf.virtual_position()
    }

    fn seek_virtual(&mut self, offset: VirtualOffset) -> Result<(), BgzfError> {
        self.bgzf.seek_virtual(offset)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(format: TabixFormat, zero_based: bool, cols: (usize, usize, usize)) -> TabixConfig {
        TabixConfig {
            format,
            zero_based,
            seq_col: cols.0,
            begin_col: cols.1,
            end_col: cols.2,
            meta_char: b'#',
            line_skip: 0,
        }
    }

    fn reader_with(config: TabixConfig) -> TabixReader<std::io::Cursor<Vec<u8>>> {
        use crate::bgzf::EOF_BLOCK;
        let index = BinningIndex {
            limits: crate::index::BinLimits::default(),
            refs: vec![Default::default(), Default::default()],
            names: Some(vec!["chr1".to_string(), "chr2".to_string()]),
            config: Some(config),
            unplaced: None,
        };
        TabixReader::open(std::io::Cursor::new(EOF_BLOCK.to_vec()), index).unwrap()
    }

    #[test]
    fn generic_one_based_coordinates() {
        let reader = reader_with(config(TabixFormat::Generic, false, (1, 4, 5)));
        let record = reader
            .parse_line("chr1\tgene\texon\t1000\t2000\t.".to_string())
            .unwrap();
        assert_eq!(record.reference_id(), 0);
        assert_eq!(record.start(), 999);
        assert_eq!(record.end(), 2000);
    }

    #[test]
    fn bed_zero_based_coordinates_pass_through() {
        let reader = reader_with(config(TabixFormat::Generic, true, (1, 2, 3)));
        let record = reader
            .parse_line("chr2\t100\t200\tname".to_string())
            .unwrap();
        assert_eq!(record.reference_id(), 1);
        assert_eq!(record.start(), 100);
        assert_eq!(record.end(), 200);
    }

    #[test]
    fn vcf_end_covers_the_ref_allele() {
        let reader = reader_with(config(TabixFormat::Vcf, false, (1, 2, 0)));
        let record = reader
            .parse_line("chr1\t1000\trs1\tACGT\tA\t50\tPASS\tDP=10".to_string())
            .unwrap();
        assert_eq!(record.start(), 999);
        assert_eq!(record.end(), 1003);
    }

    #[test]
    fn vcf_info_end_wins() {
        let reader = reader_with(config(TabixFormat::Vcf, false, (1, 2, 0)));
        let record = reader
            .parse_line("chr1\t1000\t.\tA\t<DEL>\t50\tPASS\tSVTYPE=DEL;END=5000".to_string())
            .unwrap();
        assert_eq!(record.start(), 999);
        assert_eq!(record.end(), 5000);
    }

    #[test]
    fn sam_end_follows_the_cigar() {
        let reader = reader_with(config(TabixFormat::Sam, false, (3, 4, 0)));
        let record = reader
            .parse_line("r1\t0\tchr1\t100\t30\t5S10M3D2I\t*\t0\t0\tACGT\t####".to_string())
            .unwrap();
        assert_eq!(record.start(), 99);
        assert_eq!(record.end(), 99 + 13);
    }

    #[test]
    fn unknown_sequence_names_are_malformed() {
        let reader = reader_with(config(TabixFormat::Generic, true, (1, 2, 3)));
        assert!(matches!(
            reader.parse_line("chrX\t1\t2".to_string()),
            Err(ReadError::InvalidRecord(_))
        ));
    }

    #[test]
    fn cigar_span_counts_reference_operations() {
        assert_eq!(cigar_reference_span("5S10M3D2I"), 13);
        assert_eq!(cigar_reference_span("100M"), 100);
        assert_eq!(cigar_reference_span("*"), 0);
    }
}
