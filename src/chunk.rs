//! # Chunk planning
//!
//! Partitions a BAM file into byte ranges that can be decoded
//! independently. Each chunk is described by a [`ParseRecord`]: the header
//! prefix to copy, an optional partial leading block, a raw range of whole
//! BGZF blocks, and an optional partial trailing block. Boundaries are
//! adjusted so that all alignments of one read land in the same chunk.
use log::debug;
use rust_htslib::bam::{self, Read};
use std::path::Path;

use crate::bgzf::{self, BgzfBlock};
use crate::error::{EcError, Result};

/// Byte ranges describing one self-contained sub-BAM.
///
/// Offsets named `*_read_offset` are virtual: the raw offset of a BGZF
/// block in the high 48 bits and the uncompressed offset within that block
/// in the low 16 bits. `file_bytes == -1` means "to the end of the file".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseRecord {
    pub header_size: u64,
    pub begin_read_offset: i64,
    pub begin_read_size: u32,
    pub file_offset: u64,
    pub file_bytes: i64,
    pub end_read_offset: i64,
    pub end_read_size: u32,
}

impl ParseRecord {
    /// A chunk with no alignment content: just the header and an EOF
    /// marker.
    fn empty(header_size: u64) -> Self {
        ParseRecord {
            header_size,
            begin_read_offset: 0,
            begin_read_size: 0,
            file_offset: 0,
            file_bytes: 0,
            end_read_offset: 0,
            end_read_size: 0,
        }
    }
}

fn make_virtual_offset(block_offset: u64, within: u16) -> i64 {
    ((block_offset << 16) | u64::from(within)) as i64
}

fn split_virtual_offset(voffset: i64) -> (u64, u16) {
    ((voffset as u64) >> 16, (voffset & 0xffff) as u16)
}

/// Raw offset of the first BGZF block holding alignment records, i.e. the
/// size of the header prefix in bytes.
pub fn header_size(bam_path: &Path) -> Result<u64> {
    let reader = bam::Reader::from_path(bam_path)?;
    let (block, within) = split_virtual_offset(reader.tell());
    if within != 0 {
        return Err(EcError::malformed(
            block,
            "header does not end on a BGZF block boundary",
        ));
    }
    Ok(block)
}

/// Partition `bam_path` into `num_chunks` [`ParseRecord`]s.
///
/// With `split_on_read` the boundary between two chunks is moved forward
/// to the first alignment whose read name differs from the read straddling
/// the raw block boundary, so no read is split across chunks. Without it,
/// boundaries stay on raw block starts.
pub fn calculate_chunks(
    bam_path: &Path,
    num_chunks: usize,
    split_on_read: bool,
) -> Result<Vec<ParseRecord>> {
    let blocks = bgzf::block_index(bam_path)?;
    if blocks.is_empty() {
        return Err(EcError::NotBam(bam_path.to_path_buf()));
    }
    let header_size = header_size(bam_path)?;

    let first_data = blocks
        .binary_search_by_key(&header_size, |b| b.offset)
        .map_err(|_| {
            EcError::malformed(header_size, "header does not end on a BGZF block boundary")
        })?;

    if num_chunks <= 1 {
        // degenerate whole-file chunk: the raw range already starts with
        // the header, so no prefix is copied separately
        return Ok(vec![ParseRecord {
            header_size: 0,
            begin_read_offset: 0,
            begin_read_size: 0,
            file_offset: 0,
            file_bytes: -1,
            end_read_offset: 0,
            end_read_size: 0,
        }]);
    }

    // blocks holding alignment records; the final entry is the EOF marker
    let data = &blocks[first_data..];
    let data_count = data.len().saturating_sub(1).max(1);

    let mut boundaries = if split_on_read {
        adjusted_boundaries(bam_path, data, data_count, header_size, num_chunks)?
    } else {
        block_boundaries(data, data_count, header_size, num_chunks)
    };
    // adjustment only moves boundaries forward; if one overtakes its
    // neighbor, the chunk between them is empty
    for i in 1..boundaries.len() {
        if boundaries[i] < boundaries[i - 1] {
            boundaries[i] = boundaries[i - 1];
        }
    }
    debug!("chunk boundaries: {boundaries:?}");

    build_records(&blocks, header_size, &boundaries)
}

/// Boundary block offsets with no read adjustment: a near-equal partition
/// of the data blocks.
fn block_boundaries(
    data: &[BgzfBlock],
    data_count: usize,
    header_size: u64,
    num_chunks: usize,
) -> Vec<(u64, u16)> {
    let mut boundaries = vec![(header_size, 0u16)];
    let div = data_count / num_chunks;
    let rem = data_count % num_chunks;
    for i in 1..num_chunks {
        let index = (div * i + i.min(rem)).min(data_count - 1);
        boundaries.push((data[index].offset, 0));
    }
    boundaries
}

/// Boundary virtual offsets adjusted to read-name switches.
fn adjusted_boundaries(
    bam_path: &Path,
    data: &[BgzfBlock],
    data_count: usize,
    header_size: u64,
    num_chunks: usize,
) -> Result<Vec<(u64, u16)>> {
    let mut reader = bam::Reader::from_path(bam_path)?;
    let mut boundaries = vec![(header_size, 0u16)];

    let div = data_count / num_chunks;
    let rem = data_count % num_chunks;
    let eof_offset = data[data.len() - 1].offset;

    for i in 1..num_chunks {
        let index = (div * i + i.min(rem)).min(data_count - 1);
        reader.seek(make_virtual_offset(data[index].offset, 0))?;

        let mut record = bam::Record::new();
        let Some(first) = reader.read(&mut record) else {
            // boundary is at or past the last alignment
            boundaries.push((eof_offset, 0));
            continue;
        };
        first?;
        let first_name = record.qname().to_vec();

        // advance to the first alignment belonging to a different read
        let mut voffset = reader.tell();
        while let Some(res) = reader.read(&mut record) {
            res?;
            if record.qname() != first_name.as_slice() {
                break;
            }
            voffset = reader.tell();
        }
        boundaries.push(split_virtual_offset(voffset));
    }

    Ok(boundaries)
}

fn build_records(
    blocks: &[BgzfBlock],
    header_size: u64,
    boundaries: &[(u64, u16)],
) -> Result<Vec<ParseRecord>> {
    let num_chunks = boundaries.len();
    let mut records = Vec::with_capacity(num_chunks);

    let lookup = |offset: u64| -> Result<usize> {
        blocks
            .binary_search_by_key(&offset, |b| b.offset)
            .map_err(|_| EcError::malformed(offset, "boundary is not a BGZF block start"))
    };

    for i in 0..num_chunks {
        let (begin_block, begin_within) = boundaries[i];
        let index = lookup(begin_block)?;
        let last = i == num_chunks - 1;

        if !last {
            let (end_block, end_within) = boundaries[i + 1];
            if (begin_block, begin_within) == (end_block, end_within) {
                // adjacent boundaries collapsed onto the same position
                records.push(ParseRecord::empty(header_size));
                continue;
            }
            if begin_block == end_block {
                // both boundaries inside one block: the chunk is a single
                // slice of that block's payload
                records.push(ParseRecord {
                    header_size,
                    begin_read_offset: make_virtual_offset(begin_block, begin_within),
                    begin_read_size: u32::from(end_within - begin_within),
                    file_offset: 0,
                    file_bytes: 0,
                    end_read_offset: 0,
                    end_read_size: 0,
                });
                continue;
            }

            let (begin_read_offset, begin_read_size, file_offset) = if begin_within == 0 {
                (0, 0, begin_block)
            } else {
                (
                    make_virtual_offset(begin_block, begin_within),
                    blocks[index].data_len - u32::from(begin_within),
                    next_block_offset(blocks, index),
                )
            };
            let (end_read_offset, end_read_size) = if end_within == 0 {
                (0, 0)
            } else {
                (make_virtual_offset(end_block, 0), u32::from(end_within))
            };
            records.push(ParseRecord {
                header_size,
                begin_read_offset,
                begin_read_size,
                file_offset,
                file_bytes: end_block as i64 - file_offset as i64,
                end_read_offset,
                end_read_size,
            });
        } else {
            let (begin_read_offset, begin_read_size, file_offset) = if begin_within == 0 {
                (0, 0, begin_block)
            } else {
                (
                    make_virtual_offset(begin_block, begin_within),
                    blocks[index].data_len - u32::from(begin_within),
                    next_block_offset(blocks, index),
                )
            };
            records.push(ParseRecord {
                header_size,
                begin_read_offset,
                begin_read_size,
                file_offset,
                file_bytes: -1,
                end_read_offset: 0,
                end_read_size: 0,
            });
        }
    }

    Ok(records)
}

fn next_block_offset(blocks: &[BgzfBlock], index: usize) -> u64 {
    if index + 1 < blocks.len() {
        blocks[index + 1].offset
    } else {
        blocks[index].offset + u64::from(blocks[index].block_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(offset: u64, block_len: u32, data_len: u32) -> BgzfBlock {
        BgzfBlock {
            offset,
            block_len,
            data_offset: 0,
            data_len,
        }
    }

    #[test]
    fn virtual_offsets_round_trip() {
        let voffset = make_virtual_offset(123_456, 789);
        assert_eq!((123_456, 789), split_virtual_offset(voffset));
    }

    #[test]
    fn records_for_aligned_boundaries_carry_no_partials() {
        // header block, three data blocks, EOF
        let blocks = vec![
            block(0, 100, 500),
            block(100, 200, 6000),
            block(300, 200, 6000),
            block(500, 200, 6000),
            block(700, 28, 0),
        ];
        let boundaries = vec![(100, 0), (300, 0), (500, 0)];
        let records = build_records(&blocks, 100, &boundaries).unwrap();

        assert_eq!(3, records.len());
        assert_eq!(
            ParseRecord {
                header_size: 100,
                begin_read_offset: 0,
                begin_read_size: 0,
                file_offset: 100,
                file_bytes: 200,
                end_read_offset: 0,
                end_read_size: 0,
            },
            records[0]
        );
        assert_eq!(
            ParseRecord {
                header_size: 100,
                begin_read_offset: 0,
                begin_read_size: 0,
                file_offset: 300,
                file_bytes: 200,
                end_read_offset: 0,
                end_read_size: 0,
            },
            records[1]
        );
        assert_eq!(-1, records[2].file_bytes);
        assert_eq!(500, records[2].file_offset);
    }

    #[test]
    fn records_for_intra_block_boundaries_carry_partials() {
        let blocks = vec![
            block(0, 100, 500),
            block(100, 200, 6000),
            block(300, 200, 6000),
            block(500, 28, 0),
        ];
        let boundaries = vec![(100, 0), (300, 1500)];
        let records = build_records(&blocks, 100, &boundaries).unwrap();

        assert_eq!(2, records.len());
        // first chunk: raw blocks up to the boundary block, then the
        // boundary block's leading reads
        assert_eq!(100, records[0].file_offset);
        assert_eq!(200, records[0].file_bytes);
        assert_eq!(make_virtual_offset(300, 0), records[0].end_read_offset);
        assert_eq!(1500, records[0].end_read_size);
        // last chunk: the boundary block's tail, then everything after it
        assert_eq!(make_virtual_offset(300, 1500), records[1].begin_read_offset);
        assert_eq!(4500, records[1].begin_read_size);
        assert_eq!(500, records[1].file_offset);
        assert_eq!(-1, records[1].file_bytes);
    }

    #[test]
    fn collapsed_boundaries_produce_empty_chunks() {
        let blocks = vec![
            block(0, 100, 500),
            block(100, 200, 6000),
            block(300, 28, 0),
        ];
        let boundaries = vec![(100, 0), (100, 2000), (100, 2000)];
        let records = build_records(&blocks, 100, &boundaries).unwrap();

        assert_eq!(3, records.len());
        // chunk 0 and chunk 1 share block 100; chunk 1 is empty
        assert_eq!(make_virtual_offset(100, 0), records[0].begin_read_offset);
        assert_eq!(2000, records[0].begin_read_size);
        assert_eq!(0, records[0].file_bytes);
        assert_eq!(ParseRecord::empty(100), records[1]);
        assert_eq!(make_virtual_offset(100, 2000), records[2].begin_read_offset);
        assert_eq!(4000, records[2].begin_read_size);
    }
}
