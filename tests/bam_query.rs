//! End-to-end BAM region queries over a synthetic multi-block file and
//! a hand-built BAI index.

mod common;

use std::fs::File;
use std::io::Cursor;
use std::path::PathBuf;

use htsidx::{BamReader, ReadError};

use common::{bai_bytes, bam_header, bam_record, bgzf_stream, voffset, RefTables};

/// Layout: block 0 = header; block 1 = r1@100, r2@150; block 2 =
/// r3@20000; block 3 = r4@40000, r5@40100. All on chr1 (length
/// 100000), all with 50M CIGARs. The BAI bins each block's records
/// and carries a linear index per 16KiB window.
struct Fixture {
    _dir: tempfile::TempDir,
    path: PathBuf,
    bam: Vec<u8>,
}

fn fixture() -> Fixture {
    let header = bam_header("@HD\tVN:1.6\tSO:coordinate\n", &[("chr1", 100_000)]);
    let block1: Vec<u8> = [bam_record(0, 100, "r1", 50), bam_record(0, 150, "r2", 50)].concat();
    let block2 = bam_record(0, 20_000, "r3", 50);
    let block3: Vec<u8> =
        [bam_record(0, 40_000, "r4", 50), bam_record(0, 40_100, "r5", 50)].concat();
    let (bam, offsets) = bgzf_stream(&[&header, &block1, &block2, &block3]);
    let end = (bam.len() - common::EOF_BLOCK.len()) as u64;
    let [_, b1, b2, b3] = offsets[..] else {
        panic!("expected four blocks")
    };
    let index = bai_bytes(&[RefTables {
        bins: vec![
            (4681, vec![(voffset(b1, 0), voffset(b2, 0))]),
            (4682, vec![(voffset(b2, 0), voffset(b3, 0))]),
            (4683, vec![(voffset(b3, 0), voffset(end, 0))]),
        ],
        linear: vec![voffset(b1, 0), voffset(b2, 0), voffset(b3, 0)],
    }]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("synthetic.bam");
    std::fs::write(&path, &bam).unwrap();
    std::fs::write(dir.path().join("synthetic.bam.bai"), index).unwrap();
    Fixture {
        _dir: dir,
        path,
        bam,
    }
}

fn names(reader: &mut BamReader<File>, chrom: &str, start: u64, end: u64) -> Vec<String> {
    reader
        .query(chrom, start, end)
        .unwrap()
        .map(|r| r.unwrap().name().to_string())
        .collect()
}

#[test]
fn query_touches_only_the_needed_blocks() {
    let fx = fixture();
    let mut reader = BamReader::open_file(&fx.path).unwrap();
    assert!(reader.index().is_some());
    // opening decompressed the header block only
    assert_eq!(reader.blocks_read(), 1);
    assert_eq!(names(&mut reader, "chr1", 90, 300), ["r1", "r2"]);
    // header block + block 1; blocks 2 and 3 stay compressed
    assert_eq!(reader.blocks_read(), 2);
}

#[test]
fn repeated_queries_are_idempotent() {
    let fx = fixture();
    let mut reader = BamReader::open_file(&fx.path).unwrap();
    let first = names(&mut reader, "chr1", 90, 300);
    let second = names(&mut reader, "chr1", 90, 300);
    assert_eq!(first, second);
    assert_eq!(first, ["r1", "r2"]);
    // the block was still cached: no further decompression
    assert_eq!(reader.blocks_read(), 2);
}

#[test]
fn overlap_filter_discards_scanned_non_overlaps() {
    let fx = fixture();
    let mut reader = BamReader::open_file(&fx.path).unwrap();
    // the chunk covers r1 and r2, but only r1 overlaps
    assert_eq!(names(&mut reader, "chr1", 90, 140), ["r1"]);
    // r1 ends at 150 exclusive, so a query from 150 skips it
    assert_eq!(names(&mut reader, "chr1", 150, 210), ["r2"]);
}

#[test]
fn adjacent_chunks_merge_into_one_scan() {
    let fx = fixture();
    let mut reader = BamReader::open_file(&fx.path).unwrap();
    assert_eq!(names(&mut reader, "chr1", 100, 21_000), ["r1", "r2", "r3"]);
    assert_eq!(reader.blocks_read(), 3);
}

#[test]
fn empty_and_clipped_queries() {
    let fx = fixture();
    let mut reader = BamReader::open_file(&fx.path).unwrap();
    assert!(names(&mut reader, "chr1", 500, 500).is_empty());
    assert!(names(&mut reader, "chr1", 0, 50).is_empty());
    // an end far past the reference length is clipped, not an error
    assert_eq!(
        names(&mut reader, "chr1", 150, u64::MAX),
        ["r2", "r3", "r4", "r5"]
    );
}

#[test]
fn region_strings_query_too() {
    let fx = fixture();
    let mut reader = BamReader::open_file(&fx.path).unwrap();
    let region = "chr1:91-300".parse().unwrap();
    let got: Vec<String> = reader
        .query_region(&region)
        .unwrap()
        .map(|r| r.unwrap().name().to_string())
        .collect();
    assert_eq!(got, ["r1", "r2"]);
}

#[test]
fn unknown_chromosome_is_an_error() {
    let fx = fixture();
    let mut reader = BamReader::open_file(&fx.path).unwrap();
    assert!(matches!(
        reader.query("chrX", 0, 100).err(),
        Some(ReadError::InvalidChromosome(name)) if name == "chrX"
    ));
}

#[test]
fn query_without_an_index_fails() {
    let fx = fixture();
    let mut reader = BamReader::open(Cursor::new(fx.bam.clone())).unwrap();
    assert!(matches!(
        reader.query("chr1", 0, 100).err(),
        Some(ReadError::MissingIndex)
    ));
}

#[test]
fn sequential_reading_sees_every_record() {
    let fx = fixture();
    let mut reader = BamReader::open(Cursor::new(fx.bam.clone())).unwrap();
    let names: Vec<String> = reader
        .records()
        .map(|r| r.unwrap().name().to_string())
        .collect();
    assert_eq!(names, ["r1", "r2", "r3", "r4", "r5"]);
    assert_eq!(reader.header().references()[0].name, "chr1");
    assert_eq!(reader.header().references()[0].length, 100_000);
}

#[test]
fn stale_index_still_loads() {
    let fx = fixture();
    // rewrite the data file so it is newer than its index; opening
    // warns but proceeds
    std::fs::write(&fx.path, &fx.bam).unwrap();
    let mut reader = BamReader::open_file(&fx.path).unwrap();
    assert!(reader.index().is_some());
    assert_eq!(names(&mut reader, "chr1", 90, 300), ["r1", "r2"]);
}

#[test]
fn truncated_record_is_a_fatal_decode_error() {
    // a block holding only the first half of a record: the index and
    // the data have come apart
    let header = bam_header("", &[("chr1", 100_000)]);
    let record = bam_record(0, 100, "r1", 50);
    let (bam, _) = bgzf_stream(&[&header, &record[..record.len() / 2]]);
    let mut reader = BamReader::open(Cursor::new(bam)).unwrap();
    let results: Vec<_> = reader.records().collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(ReadError::InvalidRecord(_))));
}
