//! # Sub-BAM materialization
//!
//! Turns one [`ParseRecord`] into a standalone BAM file: the original
//! header bytes, a recompressed leading partial block, a raw range of
//! whole BGZF blocks, a recompressed trailing partial block, and a single
//! EOF marker.
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::bgzf;
use crate::chunk::ParseRecord;
use crate::error::{EcError, Result};

/// Create `dst` from the byte ranges `record` describes within `src`.
pub fn write_chunk(src: &Path, dst: &Path, record: &ParseRecord) -> Result<()> {
    let _ = fs::remove_file(dst);
    debug!("materializing {} from {}", dst.display(), src.display());

    copy_header(src, dst, record.header_size)?;

    if record.begin_read_offset > 0 {
        let data = read_decompressed(
            src,
            record.begin_read_offset,
            record.begin_read_size as usize,
        )?;
        append_compressed(dst, &data)?;
    }

    if record.file_bytes != 0 {
        append_raw_range(src, dst, record.file_offset, record.file_bytes)?;
    }

    if record.end_read_offset > 0 {
        let data = read_decompressed(src, record.end_read_offset, record.end_read_size as usize)?;
        append_compressed(dst, &data)?;
    }

    bgzf::fix_bam(dst)
}

/// Copy the header prefix `[0, header_size)` of `src` into a fresh `dst`.
fn copy_header(src: &Path, dst: &Path, header_size: u64) -> Result<()> {
    let mut reader = File::open(src).map_err(|_| EcError::MissingFile(src.to_path_buf()))?;
    let mut writer = BufWriter::new(File::create(dst)?);
    std::io::copy(&mut reader.by_ref().take(header_size), &mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Read `len` uncompressed bytes starting at the virtual offset
/// `voffset`, spilling into following blocks when the first block does not
/// hold them all.
fn read_decompressed(src: &Path, voffset: i64, len: usize) -> Result<Vec<u8>> {
    let mut file = File::open(src)?;
    let mut block_offset = (voffset as u64) >> 16;
    let mut within = (voffset & 0xffff) as usize;

    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        let (payload, next_offset) = bgzf::inflate_block_at(&mut file, block_offset)?;
        if within > payload.len() {
            return Err(EcError::malformed(
                block_offset,
                "virtual offset beyond block payload",
            ));
        }
        let take = (len - data.len()).min(payload.len() - within);
        data.extend_from_slice(&payload[within..within + take]);
        block_offset = next_offset;
        within = 0;
    }
    Ok(data)
}

/// Append `data` to `dst` as freshly compressed BGZF blocks, stripping a
/// trailing EOF marker first so blocks are never written after one.
fn append_compressed(dst: &Path, data: &[u8]) -> Result<()> {
    if bgzf::ends_with_eof(dst)? {
        bgzf::truncate_eof(dst)?;
    }
    let mut writer = BufWriter::new(OpenOptions::new().append(true).open(dst)?);
    for piece in data.chunks(bgzf::MAX_BLOCK_DATA) {
        bgzf::write_block(&mut writer, piece)?;
    }
    writer.flush()?;
    Ok(())
}

/// Append the raw bytes `[offset, offset + len)` of `src` to `dst`
/// (`len == -1` reads to the end of `src`), stripping a trailing EOF
/// marker from `dst` first.
fn append_raw_range(src: &Path, dst: &Path, offset: u64, len: i64) -> Result<()> {
    if bgzf::ends_with_eof(dst)? {
        bgzf::truncate_eof(dst)?;
    }
    let mut reader = File::open(src)?;
    reader.seek(SeekFrom::Start(offset))?;
    let mut writer = BufWriter::new(OpenOptions::new().append(true).open(dst)?);
    if len < 0 {
        std::io::copy(&mut reader, &mut writer)?;
    } else {
        std::io::copy(&mut reader.by_ref().take(len as u64), &mut writer)?;
    }
    writer.flush()?;
    Ok(())
}
