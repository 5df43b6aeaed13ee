//! Loader for the tabix `.tbi` flavor: fixed scheme constants, BGZF
//! payload, text-column configuration and reference names embedded in
//! the header.

use std::path::Path;

use bytes::{Buf, Bytes};

use super::{count, need, parse_ref_tables, parse_unplaced, read_index_bytes, read_names};
use super::{BinLimits, BinningIndex, IndexError, TabixConfig};

pub(crate) const TBI_MAGIC: [u8; 4] = *b"TBI\x01";

/// Reads a `.tbi` index file.
pub fn read<P: AsRef<Path>>(path: P) -> Result<BinningIndex, IndexError> {
    parse(read_index_bytes(path.as_ref())?)
}

pub(crate) fn parse(mut buf: Bytes) -> Result<BinningIndex, IndexError> {
    need(&buf, 36, "header")?;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != TBI_MAGIC {
        return Err(IndexError::UnknownMagic);
    }
    let n_ref = count(buf.get_i32_le(), "reference count")?;
    let config = TabixConfig::from_fields(
        buf.get_i32_le(),
        buf.get_i32_le(),
        buf.get_i32_le(),
        buf.get_i32_le(),
        buf.get_i32_le(),
        buf.get_i32_le(),
    )?;
    let l_nm = count(buf.get_i32_le(), "name table length")?;
    need(&buf, l_nm, "name table")?;
    let names = read_names(&buf.split_to(l_nm))?;
    if names.len() != n_ref {
        return Err(IndexError::Inconsistent(format!(
            "{} reference names for {} references",
            names.len(),
            n_ref
        )));
    }
    let limits = BinLimits::default();
    let refs = parse_ref_tables(&mut buf, n_ref, limits)?;
    let unplaced = parse_unplaced(&mut buf);
    Ok(BinningIndex {
        limits,
        refs,
        names: Some(names),
        config: Some(config),
        unplaced,
    })
}
