//! Loader for the CSI flavor: scheme constants come from the header,
//! the linear index is folded into per-bin lowest offsets, and the
//! payload is a BGZF stream. A CSI built by tabix carries the text
//! configuration and reference names in its aux block.

use std::path::Path;

use bytes::{Buf, Bytes};

use super::{count, need, parse_chunks, parse_meta, parse_unplaced, read_index_bytes, read_names};
use super::{Bin, BinLimits, BinningIndex, IndexError, ReferenceIndex, TabixConfig};
use crate::bgzf::VirtualOffset;

pub(crate) const CSI_MAGIC: [u8; 4] = *b"CSI\x01";

/// Size of a tabix configuration inside the aux block, names excluded.
const TABIX_AUX_SIZE: usize = 28;

/// Reads a `.csi` index file.
pub fn read<P: AsRef<Path>>(path: P) -> Result<BinningIndex, IndexError> {
    parse(read_index_bytes(path.as_ref())?)
}

pub(crate) fn parse(mut buf: Bytes) -> Result<BinningIndex, IndexError> {
    need(&buf, 16, "header")?;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != CSI_MAGIC {
        return Err(IndexError::UnknownMagic);
    }
    let min_shift = buf.get_i32_le();
    let depth = buf.get_i32_le();
    if !(1..=30).contains(&min_shift) || !(0..=10).contains(&depth) {
        return Err(IndexError::Inconsistent(format!(
            "implausible scheme constants ({}, {})",
            min_shift, depth
        )));
    }
    let limits = BinLimits::new(min_shift as u32, depth as u32);
    let l_aux = count(buf.get_i32_le(), "aux length")?;
    need(&buf, l_aux, "aux block")?;
    let mut aux = buf.split_to(l_aux);
    let (config, names) = if l_aux >= TABIX_AUX_SIZE {
        let config = TabixConfig::from_fields(
            aux.get_i32_le(),
            aux.get_i32_le(),
            aux.get_i32_le(),
            aux.get_i32_le(),
            aux.get_i32_le(),
            aux.get_i32_le(),
        )?;
        let l_nm = count(aux.get_i32_le(), "name table length")?;
        need(&aux, l_nm, "name table")?;
        (Some(config), Some(read_names(&aux.split_to(l_nm))?))
    } else {
        (None, None)
    };
    need(&buf, 4, "reference count")?;
    let n_ref = count(buf.get_i32_le(), "reference count")?;
    if let Some(names) = &names {
        if names.len() != n_ref {
            return Err(IndexError::Inconsistent(format!(
                "{} reference names for {} references",
                names.len(),
                n_ref
            )));
        }
    }
    let mut refs = Vec::with_capacity(n_ref);
    for _ in 0..n_ref {
        need(&buf, 4, "bin count")?;
        let n_bin = count(buf.get_i32_le(), "bin count")?;
        let mut reference = ReferenceIndex::default();
        for _ in 0..n_bin {
            need(&buf, 16, "bin header")?;
            let id = buf.get_u32_le();
            let loffset = VirtualOffset::from(buf.get_u64_le());
            let n_chunk = count(buf.get_i32_le(), "chunk count")?;
            need(&buf, n_chunk * 16, "chunk table")?;
            if id == limits.meta_bin() {
                reference.meta = Some(parse_meta(&mut buf, n_chunk)?);
            } else if id >= limits.bin_limit() {
                return Err(IndexError::Inconsistent(format!("bin id {} out of range", id)));
            } else {
                let chunks = parse_chunks(&mut buf, n_chunk);
                let bin = reference.bins.entry(id).or_insert_with(|| Bin {
                    loffset,
                    chunks: Vec::new(),
                });
                bin.chunks.extend(chunks);
            }
        }
        refs.push(reference);
    }
    let unplaced = parse_unplaced(&mut buf);
    Ok(BinningIndex {
        limits,
        refs,
        names,
        config,
        unplaced,
    })
}
