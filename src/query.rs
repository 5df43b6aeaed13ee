//! Region iteration over any positioned record source.
//!
//! The iterator here is format-agnostic: everything that can decode one
//! record at a virtual-offset cursor can be driven across the chunk
//! list produced by a [`BinningIndex`](crate::index::BinningIndex).

use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use log::debug;
use thiserror::Error;

use crate::bgzf::{BgzfError, VirtualOffset};
use crate::index::{Chunk, IndexError};

/// The coordinates every record must expose for overlap filtering.
/// All coordinates are 0-based, half-open.
pub trait RegionRecord {
    /// Id of the reference sequence the record is placed on, `None`
    /// for unplaced records.
    fn reference_id(&self) -> Option<usize>;
    fn start(&self) -> u64;
    fn end(&self) -> u64;
}

/// A positioned source of records: one file handle, one cursor.
///
/// `read_record` must always consume exactly one record so the cursor
/// stays aligned with record boundaries, whether or not the caller
/// keeps the record.
pub trait RecordRead {
    type Record: RegionRecord;

    /// Decodes the record at the cursor; `None` on a clean
    /// end-of-stream.
    fn read_record(&mut self) -> Result<Option<Self::Record>, ReadError>;

    fn virtual_position(&self) -> VirtualOffset;

    fn seek_virtual(&mut self, offset: VirtualOffset) -> Result<(), BgzfError>;
}

/// Possible errors encountered when opening one of the readers
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Invalid magic (not a {0} file)")]
    UnknownMagic(&'static str),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("No index found next to {0}")]
    MissingIndex(PathBuf),
    #[error("{0}")]
    Index(#[from] IndexError),
    #[error("{0}")]
    Bgzf(#[from] BgzfError),
    #[error("Error occurred: {0}")]
    Io(#[from] io::Error),
}

/// Possible errors encountered while reading or querying records
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("The passed chromosome ({0}) was incorrect.")]
    InvalidChromosome(String),
    #[error("The file has no index to query")]
    MissingIndex,
    #[error("Record is malformed: {0}")]
    InvalidRecord(String),
    #[error("{0}")]
    Bgzf(#[from] BgzfError),
    #[error("Error occurred: {0}")]
    Io(#[from] io::Error),
}

/// Sequentially yields every record from the cursor to the end of the
/// stream.
pub struct Records<'a, S: RecordRead> {
    source: &'a mut S,
    done: bool,
}

impl<'a, S: RecordRead> Records<'a, S> {
    pub(crate) fn new(source: &'a mut S) -> Records<'a, S> {
        Records {
            source,
            done: false,
        }
    }
}

impl<'a, S: RecordRead> Iterator for Records<'a, S> {
    type Item = Result<S::Record, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.source.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazily yields the records overlapping one region, in file order.
///
/// Scans only the merged chunk ranges supplied by the index, invoking
/// the decoder for every record so the cursor stays aligned, and
/// discarding records that do not truly overlap. A decode failure is
/// fatal: the iterator yields the error once and then fuses. A fresh
/// query must be issued to re-scan.
pub struct RegionQuery<'a, S: RecordRead> {
    source: &'a mut S,
    chunks: std::vec::IntoIter<Chunk>,
    current: Option<Chunk>,
    pending_seek: bool,
    ref_id: usize,
    start: u64,
    end: u64,
    done: bool,
}

impl<'a, S: RecordRead> RegionQuery<'a, S> {
    pub(crate) fn new(
        source: &'a mut S,
        chunks: Vec<Chunk>,
        ref_id: usize,
        start: u64,
        end: u64,
    ) -> RegionQuery<'a, S> {
        debug!(
            "querying reference {} [{}, {}) across {} scan ranges",
            ref_id,
            start,
            end,
            chunks.len()
        );
        RegionQuery {
            source,
            chunks: chunks.into_iter(),
            current: None,
            pending_seek: false,
            ref_id,
            start,
            end,
            done: false,
        }
    }
}

impl<'a, S: RecordRead> Iterator for RegionQuery<'a, S> {
    type Item = Result<S::Record, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let chunk = match self.current {
                Some(chunk) => chunk,
                None => match self.chunks.next() {
                    Some(chunk) => {
                        self.current = Some(chunk);
                        self.pending_seek = true;
                        chunk
                    }
                    None => {
                        self.done = true;
                        return None;
                    }
                },
            };
            if self.pending_seek {
                if let Err(e) = self.source.seek_virtual(chunk.begin) {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                self.pending_seek = false;
            }
            if self.source.virtual_position() >= chunk.end {
                self.current = None;
                continue;
            }
            match self.source.read_record() {
                Ok(Some(record)) => {
                    if record.reference_id() != Some(self.ref_id) {
                        continue;
                    }
                    if record.start() >= self.end {
                        // records are coordinate sorted: nothing
                        // further can overlap
                        self.done = true;
                        return None;
                    }
                    if record.end() > self.start {
                        return Some(Ok(record));
                    }
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// A genomic region in text form: `name`, `name:START` or
/// `name:START-END`, with 1-based inclusive coordinates and `,`
/// grouping permitted, as accepted by the usual command line tools.
/// Parsed into 0-based half-open coordinates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub name: String,
    /// 0-based inclusive start.
    pub start: u64,
    /// 0-based exclusive end; `None` = through the end of the
    /// sequence.
    pub end: Option<u64>,
}

#[derive(Error, Debug)]
pub enum RegionParseError {
    #[error("Region {0:?} is empty or malformed")]
    Malformed(String),
    #[error("Region {0:?} has an empty or reversed coordinate range")]
    EmptyRange(String),
}

impl FromStr for Region {
    type Err = RegionParseError;

    fn from_str(s: &str) -> Result<Region, RegionParseError> {
        let malformed = || RegionParseError::Malformed(s.to_string());
        let (name, range) = match s.rsplit_once(':') {
            Some((name, range)) => (name, Some(range)),
            None => (s, None),
        };
        if name.is_empty() {
            return Err(malformed());
        }
        let parse = |text: &str| {
            let digits: String = text.chars().filter(|&c| c != ',').collect();
            match digits.parse::<u64>() {
                Ok(0) | Err(_) => Err(malformed()),
                Ok(n) => Ok(n),
            }
        };
        let (start, end) = match range {
            None => (0, None),
            Some(range) => match range.split_once('-') {
                None => (parse(range)? - 1, None),
                Some((from, "")) => (parse(from)? - 1, None),
                Some((from, to)) => {
                    let from = parse(from)?;
                    let to = parse(to)?;
                    if to < from {
                        return Err(RegionParseError::EmptyRange(s.to_string()));
                    }
                    (from - 1, Some(to))
                }
            },
        };
        Ok(Region {
            name: name.to_string(),
            start,
            end,
        })
    }
}
