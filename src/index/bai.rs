//! Loader for the legacy BAI flavor: fixed scheme constants, raw
//! (uncompressed) payload, reference names supplied externally by the
//! BAM header.

use std::path::Path;

use bytes::{Buf, Bytes};

use super::{count, need, parse_ref_tables, parse_unplaced, read_index_bytes};
use super::{BinLimits, BinningIndex, IndexError};

pub(crate) const BAI_MAGIC: [u8; 4] = *b"BAI\x01";

/// Reads a `.bai` index file.
pub fn read<P: AsRef<Path>>(path: P) -> Result<BinningIndex, IndexError> {
    parse(read_index_bytes(path.as_ref())?)
}

pub(crate) fn parse(mut buf: Bytes) -> Result<BinningIndex, IndexError> {
    need(&buf, 8, "header")?;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != BAI_MAGIC {
        return Err(IndexError::UnknownMagic);
    }
    let n_ref = count(buf.get_i32_le(), "reference count")?;
    let limits = BinLimits::default();
    let refs = parse_ref_tables(&mut buf, n_ref, limits)?;
    let unplaced = parse_unplaced(&mut buf);
    Ok(BinningIndex {
        limits,
        refs,
        names: None,
        config: None,
        unplaced,
    })
}
