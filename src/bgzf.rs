//! # BGZF block handling
//!
//! A BAM file is a BGZF stream: a sequence of independently decodable gzip
//! blocks, each carrying a `BC` extra subfield with the compressed block
//! size. This module walks that framing without inflating payloads
//! ([`BgzfBlocks`]), inflates and re-emits single blocks for the sub-BAM
//! splicer, and repairs the 28-byte EOF marker when it is missing.
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{EcError, Result};

/// First 16 bytes of every BAM file: BGZF magic, FEXTRA flags, and the
/// `BC` subfield header.
pub const BAM_SIGNATURE: [u8; 16] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, b'B', b'C', 0x02, 0x00,
];

/// The canonical 28-byte empty BGZF block that terminates a BAM file.
pub const BGZF_EOF: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, b'B', b'C', 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const BGZF_MAGIC: [u8; 4] = [0x1f, 0x8b, 0x08, 0x04];

/// Maximum uncompressed payload per emitted block.
pub const MAX_BLOCK_DATA: usize = 0xff00;

/// One BGZF block located in the raw byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BgzfBlock {
    /// Raw file offset of the block start.
    pub offset: u64,
    /// Compressed block length (`BSIZE + 1`).
    pub block_len: u32,
    /// Cumulative uncompressed offset of the block's first payload byte.
    pub data_offset: u64,
    /// Uncompressed payload length (`ISIZE`).
    pub data_len: u32,
}

/// Lazy scanner over the blocks of a BGZF stream.
///
/// Only block headers and trailers are read; compressed payloads are
/// seeked over. The iterator ends cleanly at end of stream and yields
/// `MalformedBgzf` on framing errors.
pub struct BgzfBlocks<R> {
    inner: R,
    offset: u64,
    data_offset: u64,
    done: bool,
}

impl<R: Read + Seek> BgzfBlocks<R> {
    pub fn new(inner: R) -> Self {
        BgzfBlocks {
            inner,
            offset: 0,
            data_offset: 0,
            done: false,
        }
    }

    fn next_block(&mut self) -> Result<Option<BgzfBlock>> {
        let mut magic = [0u8; 4];
        if !read_exact_or_eof(&mut self.inner, &mut magic)? {
            return Ok(None);
        }
        let offset = self.offset;
        let (block_len, data_len) = read_block_meta(&mut self.inner, offset, &magic)?;
        self.inner
            .seek(SeekFrom::Start(offset + u64::from(block_len)))?;

        let block = BgzfBlock {
            offset,
            block_len,
            data_offset: self.data_offset,
            data_len,
        };
        self.offset += u64::from(block_len);
        self.data_offset += u64::from(data_len);
        Ok(Some(block))
    }
}

impl<R: Read + Seek> Iterator for BgzfBlocks<R> {
    type Item = Result<BgzfBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_block() {
            Ok(Some(block)) => Some(Ok(block)),
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

/// Scan the whole file at `path` and collect its block index.
pub fn block_index(path: &Path) -> Result<Vec<BgzfBlock>> {
    let file = File::open(path).map_err(|_| EcError::MissingFile(path.to_path_buf()))?;
    BgzfBlocks::new(file).collect()
}

/// Read the 4 bytes into `buf`, reporting a clean end of stream when no
/// bytes remain. A short read mid-magic is an error.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(EcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated BGZF block header",
            )));
        }
        filled += n;
    }
    Ok(true)
}

/// Parse the remainder of a block header whose 4-byte magic is already in
/// hand. Leaves the reader positioned at the start of the deflate payload
/// and returns `(block_len, data_len)` by seeking over it.
fn read_block_meta<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    magic: &[u8; 4],
) -> Result<(u32, u32)> {
    if magic != &BGZF_MAGIC {
        return Err(EcError::malformed(offset, "bad gzip magic"));
    }
    let _mod_time = reader.read_u32::<LittleEndian>()?;
    let _xfl = reader.read_u8()?;
    let _os = reader.read_u8()?;
    let extra_len = reader.read_u16::<LittleEndian>()?;

    let mut consumed = 0u32;
    let mut block_size: Option<u16> = None;
    while consumed < u32::from(extra_len) {
        let mut subfield_id = [0u8; 2];
        reader.read_exact(&mut subfield_id)?;
        let subfield_len = reader.read_u16::<LittleEndian>()?;
        if subfield_id == [b'B', b'C'] {
            if subfield_len != 2 {
                return Err(EcError::malformed(offset, "wrong BC payload length"));
            }
            block_size = Some(reader.read_u16::<LittleEndian>()?);
        } else {
            reader.seek(SeekFrom::Current(i64::from(subfield_len)))?;
        }
        consumed += u32::from(subfield_len) + 4;
    }
    if consumed != u32::from(extra_len) {
        return Err(EcError::malformed(offset, "inconsistent extra field length"));
    }
    let Some(bsize) = block_size else {
        return Err(EcError::malformed(offset, "missing BC subfield"));
    };

    let block_len = u32::from(bsize) + 1;
    // deflate payload = whole block minus header, extra fields, and trailer
    let deflate_len = i64::from(block_len) - i64::from(extra_len) - 20;
    if deflate_len < 0 {
        return Err(EcError::malformed(offset, "block size smaller than framing"));
    }
    reader.seek(SeekFrom::Current(deflate_len + 4))?; // payload + CRC32
    let data_len = reader.read_u32::<LittleEndian>()?;

    Ok((block_len, data_len))
}

/// Inflate the single block starting at `offset`, returning its payload
/// and the offset of the next block.
pub fn inflate_block_at<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<(Vec<u8>, u64)> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut magic = [0u8; 4];
    if !read_exact_or_eof(reader, &mut magic)? {
        return Err(EcError::malformed(offset, "block offset past end of file"));
    }
    if magic != BGZF_MAGIC {
        return Err(EcError::malformed(offset, "bad gzip magic"));
    }
    let _mod_time = reader.read_u32::<LittleEndian>()?;
    let _xfl = reader.read_u8()?;
    let _os = reader.read_u8()?;
    let extra_len = reader.read_u16::<LittleEndian>()?;

    let mut consumed = 0u32;
    let mut block_size: Option<u16> = None;
    while consumed < u32::from(extra_len) {
        let mut subfield_id = [0u8; 2];
        reader.read_exact(&mut subfield_id)?;
        let subfield_len = reader.read_u16::<LittleEndian>()?;
        let mut subfield = vec![0u8; usize::from(subfield_len)];
        reader.read_exact(&mut subfield)?;
        if subfield_id == [b'B', b'C'] {
            if subfield_len != 2 {
                return Err(EcError::malformed(offset, "wrong BC payload length"));
            }
            block_size = Some(u16::from_le_bytes([subfield[0], subfield[1]]));
        }
        consumed += u32::from(subfield_len) + 4;
    }
    let Some(bsize) = block_size else {
        return Err(EcError::malformed(offset, "missing BC subfield"));
    };
    let block_len = u32::from(bsize) + 1;
    let deflate_len = i64::from(block_len) - i64::from(extra_len) - 20;
    if deflate_len < 0 {
        return Err(EcError::malformed(offset, "block size smaller than framing"));
    }

    let mut compressed = vec![0u8; deflate_len as usize];
    reader.read_exact(&mut compressed)?;
    let expected_crc = reader.read_u32::<LittleEndian>()?;
    let expected_len = reader.read_u32::<LittleEndian>()?;

    let mut payload = Vec::with_capacity(expected_len as usize);
    DeflateDecoder::new(&compressed[..]).read_to_end(&mut payload)?;
    if payload.len() != expected_len as usize {
        return Err(EcError::malformed(offset, "payload length mismatch"));
    }
    if crc32fast::hash(&payload) != expected_crc {
        return Err(EcError::malformed(offset, "payload checksum mismatch"));
    }

    Ok((payload, offset + u64::from(block_len)))
}

/// Compress `data` (at most [`MAX_BLOCK_DATA`] bytes) into one BGZF block.
pub fn write_block<W: Write>(writer: &mut W, data: &[u8]) -> Result<()> {
    assert!(data.len() <= MAX_BLOCK_DATA, "block payload too large");

    let compressed = {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()?
    };
    // An incompressible payload can exceed the 64 KiB block limit once
    // framed; fall back to a stored deflate block.
    let compressed = if compressed.len() + 26 > 65536 {
        let len = data.len() as u16;
        let mut stored = Vec::with_capacity(5 + data.len());
        stored.push(0x01);
        stored.extend_from_slice(&len.to_le_bytes());
        stored.extend_from_slice(&(!len).to_le_bytes());
        stored.extend_from_slice(data);
        stored
    } else {
        compressed
    };

    let block_len = 18 + compressed.len() + 8;
    writer.write_all(&BAM_SIGNATURE)?;
    writer.write_u16::<LittleEndian>((block_len - 1) as u16)?;
    writer.write_all(&compressed)?;
    writer.write_u32::<LittleEndian>(crc32fast::hash(data))?;
    writer.write_u32::<LittleEndian>(data.len() as u32)?;
    Ok(())
}

/// Check whether the file ends with the canonical EOF marker.
pub fn ends_with_eof(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size < 28 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(size - 28))?;
    let mut tail = [0u8; 28];
    file.read_exact(&mut tail)?;
    Ok(tail == BGZF_EOF)
}

/// Make sure the EOF marker is present, appending it when missing.
///
/// Fails with `NotBam` when the file does not start with the BAM
/// signature.
pub fn fix_bam(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(EcError::MissingFile(path.to_path_buf()));
    }
    check_signature(path)?;
    if !ends_with_eof(path)? {
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(&BGZF_EOF)?;
    }
    Ok(())
}

/// Like [`fix_bam`], but a missing EOF marker is an error instead of a
/// repair. Used to reject truncated inputs before streaming them.
pub fn validate_bam(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(EcError::MissingFile(path.to_path_buf()));
    }
    check_signature(path)?;
    if !ends_with_eof(path)? {
        let size = std::fs::metadata(path)?.len();
        return Err(EcError::malformed(
            size.saturating_sub(28),
            "missing EOF marker",
        ));
    }
    Ok(())
}

fn check_signature(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let mut head = [0u8; 16];
    match file.read_exact(&mut head) {
        Ok(()) if head == BAM_SIGNATURE => Ok(()),
        _ => Err(EcError::NotBam(path.to_path_buf())),
    }
}

/// Remove the trailing EOF marker. Does not check that it is present.
pub fn truncate_eof(path: &Path) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let size = file.metadata()?.len();
    file.set_len(size.saturating_sub(28))?;
    Ok(())
}
