/*!
htsidx provides indexed, read-only access to the block-compressed file
formats of high-throughput sequencing: BAM alignments, BCF variants,
tabix-indexed text (VCF, BED, GFF, SAM, ...) and FAI-indexed FASTA.

The file format specifications are maintained at
<https://samtools.github.io/hts-specs/>.

## Reading

The entrypoints are [`BamReader::open_file`], [`BcfReader::open_file`],
[`TabixReader::open_file`] and [`IndexedFasta::open`]. Each reader owns
its file handle and a single decompressed BGZF block; dropping the
reader releases both.

The common operation is the region query: given a reference name and a
0-based half-open interval, the companion index (BAI, CSI or tabix)
maps the interval to a minimal set of virtual-offset ranges, and only
those ranges are decompressed and scanned:

```no_run
use htsidx::BamReader;

let mut bam = BamReader::open_file("example.bam").unwrap();
for record in bam.query("chr1", 100_000, 200_000).unwrap() {
    let record = record.unwrap();
    println!("{}\t{}\t{}", record.name(), record.start(), record.cigar());
}
```

Sequential iteration (`records()`) needs no index. Indexes load into an
immutable [`BinningIndex`] that may be shared across readers.

## Lower-level pieces

[`bgzf::BgzfReader`] exposes the BGZF layer itself: virtual-offset
seek/tell over any `Read + Seek` source. [`index`] exposes the binned
interval index and its three on-disk flavors. Region iteration is
generic over the [`RecordRead`] trait, so a custom record format only
needs to implement one-record decoding to gain indexed queries.
*/

pub mod bam;
pub mod bcf;
pub mod bgzf;
pub mod fasta;
pub mod index;
pub mod query;
pub mod tabix;
pub mod utils;

pub use crate::bam::{BamHeader, BamReader, BamRecord, HeaderLine, ReferenceSequence};
pub use crate::bcf::{BcfHeader, BcfReader, BcfRecord, Contig};
pub use crate::bgzf::{BgzfError, BgzfReader, VirtualOffset};
pub use crate::fasta::{FaiEntry, FastaOpenError, FetchError, IndexedFasta};
pub use crate::index::{
    read_index_file, BinLimits, BinningIndex, Chunk, IndexError, TabixConfig, TabixFormat,
};
pub use crate::query::{
    OpenError, ReadError, RecordRead, Region, RegionParseError, RegionQuery, RegionRecord, Records,
};
pub use crate::tabix::{TabixReader, TabixRecord};
