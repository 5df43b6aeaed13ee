//! Builders for synthetic BGZF files and the structures layered on
//! them, used by the scenario tests.

#![allow(dead_code)]

use flate2::{Compress, Compression, FlushCompress};

pub use htsidx::bgzf::EOF_BLOCK;

fn deflate(payload: &[u8]) -> Vec<u8> {
    let mut compress = Compress::new(Compression::default(), false);
    let mut out = Vec::with_capacity(payload.len() * 2 + 128);
    compress
        .compress_vec(payload, &mut out, FlushCompress::Finish)
        .unwrap();
    out
}

fn crc32(payload: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(payload);
    crc.sum()
}

/// One BGZF member holding the whole payload.
pub fn bgzf_block(payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 1 << 16);
    let cdata = deflate(payload);
    let bsize = 12 + 6 + cdata.len() + 8;
    let mut out = Vec::with_capacity(bsize);
    out.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
    out.extend_from_slice(&6u16.to_le_bytes());
    out.extend_from_slice(b"BC");
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&((bsize - 1) as u16).to_le_bytes());
    out.extend_from_slice(&cdata);
    out.extend_from_slice(&crc32(payload).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out
}

/// A terminated BGZF stream with one block per payload. Returns the
/// stream and the compressed offset of each block.
pub fn bgzf_stream(payloads: &[&[u8]]) -> (Vec<u8>, Vec<u64>) {
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    for payload in payloads {
        offsets.push(out.len() as u64);
        out.extend_from_slice(&bgzf_block(payload));
    }
    out.extend_from_slice(&EOF_BLOCK);
    (out, offsets)
}

/// A terminated BGZF stream of `data` split into blocks of at most
/// `per_block` payload bytes.
pub fn bgzf_compress(data: &[u8], per_block: usize) -> Vec<u8> {
    let payloads: Vec<&[u8]> = data.chunks(per_block).collect();
    bgzf_stream(&payloads).0
}

/// A virtual offset addressing the start of the block at `coffset`.
pub fn voffset(coffset: u64, uoffset: u16) -> u64 {
    coffset << 16 | u64::from(uoffset)
}

/// The binary BAM header for the given reference dictionary.
pub fn bam_header(text: &str, refs: &[(&str, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"BAM\x01");
    out.extend_from_slice(&(text.len() as u32).to_le_bytes());
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(&(refs.len() as u32).to_le_bytes());
    for (name, length) in refs {
        out.extend_from_slice(&((name.len() + 1) as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(&length.to_le_bytes());
    }
    out
}

/// One length-prefixed alignment record with a single `<m_len>M` CIGAR
/// and no sequence.
pub fn bam_record(ref_id: i32, pos: i32, name: &str, m_len: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&ref_id.to_le_bytes());
    body.extend_from_slice(&pos.to_le_bytes());
    body.push(name.len() as u8 + 1);
    body.push(30); // mapq
    body.extend_from_slice(&0u16.to_le_bytes()); // bin, unused on read
    body.extend_from_slice(&1u16.to_le_bytes()); // one cigar op
    body.extend_from_slice(&0u16.to_le_bytes()); // flag
    body.extend_from_slice(&0u32.to_le_bytes()); // no sequence
    body.extend_from_slice(&(-1i32).to_le_bytes());
    body.extend_from_slice(&(-1i32).to_le_bytes());
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(&(m_len << 4).to_le_bytes()); // op 0 = M
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

pub struct RefTables {
    /// `(bin id, chunks)` with chunks as raw virtual offsets.
    pub bins: Vec<(u32, Vec<(u64, u64)>)>,
    /// Linear index, raw virtual offsets.
    pub linear: Vec<u64>,
}

fn put_ref_tables(out: &mut Vec<u8>, refs: &[RefTables]) {
    for tables in refs {
        out.extend_from_slice(&(tables.bins.len() as i32).to_le_bytes());
        for (id, chunks) in &tables.bins {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(chunks.len() as i32).to_le_bytes());
            for (begin, end) in chunks {
                out.extend_from_slice(&begin.to_le_bytes());
                out.extend_from_slice(&end.to_le_bytes());
            }
        }
        out.extend_from_slice(&(tables.linear.len() as i32).to_le_bytes());
        for offset in &tables.linear {
            out.extend_from_slice(&offset.to_le_bytes());
        }
    }
}

/// A raw `.bai` index.
pub fn bai_bytes(refs: &[RefTables]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"BAI\x01");
    out.extend_from_slice(&(refs.len() as i32).to_le_bytes());
    put_ref_tables(&mut out, refs);
    out
}

/// A BGZF-compressed `.tbi` index with the VCF preset.
pub fn tbi_vcf_bytes(names: &[&str], refs: &[RefTables]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"TBI\x01");
    out.extend_from_slice(&(refs.len() as i32).to_le_bytes());
    for value in [2i32, 1, 2, 0, i32::from(b'#'), 0] {
        out.extend_from_slice(&value.to_le_bytes());
    }
    let mut name_table = Vec::new();
    for name in names {
        name_table.extend_from_slice(name.as_bytes());
        name_table.push(0);
    }
    out.extend_from_slice(&(name_table.len() as i32).to_le_bytes());
    out.extend_from_slice(&name_table);
    put_ref_tables(&mut out, refs);
    bgzf_compress(&out, 1 << 15)
}

/// A BGZF-compressed `.csi` index at the default scheme constants,
/// without a tabix aux block.
pub fn csi_bytes(refs: &[Vec<(u32, u64, Vec<(u64, u64)>)>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"CSI\x01");
    out.extend_from_slice(&14i32.to_le_bytes());
    out.extend_from_slice(&5i32.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes()); // l_aux
    out.extend_from_slice(&(refs.len() as i32).to_le_bytes());
    for bins in refs {
        out.extend_from_slice(&(bins.len() as i32).to_le_bytes());
        for (id, loffset, chunks) in bins {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&loffset.to_le_bytes());
            out.extend_from_slice(&(chunks.len() as i32).to_le_bytes());
            for (begin, end) in chunks {
                out.extend_from_slice(&begin.to_le_bytes());
                out.extend_from_slice(&end.to_le_bytes());
            }
        }
    }
    bgzf_compress(&out, 1 << 15)
}
