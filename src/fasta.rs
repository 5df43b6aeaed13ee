//! Random access to FAI-indexed FASTA files, plain or BGZF-compressed.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::bgzf::{is_bgzf_header, read_full, BgzfError, BgzfReader};
use crate::query::{Region, RegionParseError};

/// Possible errors encountered when opening an indexed FASTA file
#[derive(Error, Debug)]
pub enum FastaOpenError {
    #[error("FASTA index not found at {0}")]
    MissingIndex(PathBuf),
    #[error("Invalid FASTA index line {0}: {1}")]
    InvalidIndex(usize, String),
    #[error("File is gzip-compressed but not BGZF; random access requires bgzip")]
    NotBgzf,
    #[error("{0}")]
    Bgzf(#[from] BgzfError),
    #[error("Error occurred: {0}")]
    Io(#[from] io::Error),
}

/// Possible errors encountered when fetching sequence
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Unknown sequence name: {0}")]
    UnknownSequence(String),
    #[error("Invalid range [{start}, {end}) for {name} (length {length})")]
    InvalidRange {
        name: String,
        start: u64,
        end: u64,
        length: u64,
    },
    #[error("Sequence data ends before the requested range")]
    Truncated,
    #[error("{0}")]
    Region(#[from] RegionParseError),
    #[error("{0}")]
    Bgzf(#[from] BgzfError),
    #[error("Error occurred: {0}")]
    Io(#[from] io::Error),
}

/// One line of a `.fai` index: enough to address any 0-based range of
/// the sequence inside the line-wrapped text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaiEntry {
    pub name: String,
    /// Length of the sequence, in bases.
    pub length: u64,
    /// File offset of the sequence's first base.
    pub offset: u64,
    /// Bases per line.
    pub line_bases: u64,
    /// Bytes per line, terminator included.
    pub line_width: u64,
}

/// Reads a `.fai` file: a TSV of name, length, offset, bases per line
/// and bytes per line (FASTQ indexes carry an extra column, ignored).
pub fn read_fai<P: AsRef<Path>>(path: P) -> Result<Vec<FaiEntry>, FastaOpenError> {
    let file = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (at, line) in file.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let invalid = |what: &str| FastaOpenError::InvalidIndex(at + 1, what.to_string());
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            return Err(invalid("fewer than five columns"));
        }
        let number =
            |text: &str| text.parse::<u64>().map_err(|_| invalid("non-numeric column"));
        let entry = FaiEntry {
            name: fields[0].to_string(),
            length: number(fields[1])?,
            offset: number(fields[2])?,
            line_bases: number(fields[3])?,
            line_width: number(fields[4])?,
        };
        if entry.line_bases == 0 || entry.line_width < entry.line_bases {
            return Err(invalid("impossible line geometry"));
        }
        entries.push(entry);
    }
    Ok(entries)
}

enum Source {
    Plain(File),
    Bgzf(BgzfReader<File>),
}

impl Source {
    /// Reads `buf.len()` bytes at `offset` of the (decompressed) text.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FetchError> {
        let n = match self {
            Source::Plain(file) => {
                file.seek(SeekFrom::Start(offset))?;
                read_full(file, buf)?
            }
            Source::Bgzf(reader) => {
                reader.seek_uncompressed(offset)?;
                read_full(reader, buf)?
            }
        };
        if n < buf.len() {
            return Err(FetchError::Truncated);
        }
        Ok(())
    }
}

/// Random access to an indexed FASTA file.
pub struct IndexedFasta {
    source: Source,
    entries: Vec<FaiEntry>,
    by_name: HashMap<String, usize>,
}

impl IndexedFasta {
    /// Opens a FASTA file with its required `<path>.fai` companion.
    /// The storage flavor (plain or BGZF) is detected from the file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<IndexedFasta, FastaOpenError> {
        let path = path.as_ref();
        let mut fai = path.as_os_str().to_os_string();
        fai.push(".fai");
        let fai = PathBuf::from(fai);
        if !fai.exists() {
            return Err(FastaOpenError::MissingIndex(fai));
        }
        let entries = read_fai(&fai)?;
        let mut file = File::open(path)?;
        let mut head = [0u8; 18];
        let n = read_full(&mut file, &mut head)?;
        file.seek(SeekFrom::Start(0))?;
        let source = if is_bgzf_header(&head[..n]) {
            debug!("{} is BGZF-compressed", path.display());
            Source::Bgzf(BgzfReader::new(file)?)
        } else if head[..n.min(2)] == [0x1f, 0x8b] {
            return Err(FastaOpenError::NotBgzf);
        } else {
            Source::Plain(file)
        };
        let by_name = entries
            .iter()
            .enumerate()
            .map(|(at, entry)| (entry.name.clone(), at))
            .collect();
        Ok(IndexedFasta {
            source,
            entries,
            by_name,
        })
    }

    pub fn entries(&self) -> &[FaiEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&FaiEntry> {
        self.by_name.get(name).map(|&at| &self.entries[at])
    }

    /// The bases of `[start, end)` (0-based) of the named sequence,
    /// with line terminators stripped. The range must lie inside the
    /// sequence.
    pub fn fetch(&mut self, name: &str, start: u64, end: u64) -> Result<Vec<u8>, FetchError> {
        let entry = match self.entry(name) {
            Some(entry) => entry.clone(),
            None => return Err(FetchError::UnknownSequence(name.to_string())),
        };
        if start >= end || end > entry.length {
            return Err(FetchError::InvalidRange {
                name: name.to_string(),
                start,
                end,
                length: entry.length,
            });
        }
        let locate = |base: u64| {
            entry.offset + (base / entry.line_bases) * entry.line_width + base % entry.line_bases
        };
        let first = locate(start);
        let last = locate(end - 1);
        let mut raw = vec![0u8; (last + 1 - first) as usize];
        self.source.read_at(first, &mut raw)?;
        raw.retain(|&b| b != b'\n' && b != b'\r');
        if raw.len() as u64 != end - start {
            return Err(FetchError::Truncated);
        }
        Ok(raw)
    }

    /// Fetches a 1-based `name:START-END` region string, clamping the
    /// end to the sequence length.
    pub fn fetch_region(&mut self, region: &str) -> Result<Vec<u8>, FetchError> {
        let region: Region = region.parse()?;
        let length = self
            .entry(&region.name)
            .ok_or_else(|| FetchError::UnknownSequence(region.name.clone()))?
            .length;
        let end = region.end.unwrap_or(length).min(length);
        self.fetch(&region.name, region.start, end)
    }
}
