//! # Binary output dialects
//!
//! Two little-endian formats carry the merged equivalence classes. The
//! single-sample v1 file is uncompressed: main targets, haplotypes, class
//! counts, and one `(class, target, haplotype mask)` triple per
//! class/target pair. The multi-sample v2 file is gzip-wrapped: haplotypes,
//! targets with per-haplotype lengths, cell barcodes, a CSR matrix of
//! class × target haplotype masks, and a CSC matrix of class × barcode
//! counts.
//!
//! The two dialects encode haplotype masks differently and both encodings
//! are fixed: v1 treats the first sorted haplotype as the most significant
//! bit, v2 gives haplotype `h` the value `2^h`.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use log::{debug, info};
use ndarray::Array2;

use crate::ec::ConvertResults;
use crate::error::{EcError, Result};
use crate::sparse::{CscMatrix, CsrMatrix};
use crate::utils::bits_to_int;

fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    writer.write_i32::<LittleEndian>(s.len() as i32)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = reader.read_i32::<LittleEndian>()?;
    if len < 0 {
        return Err(EcError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "negative string length",
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| {
        EcError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

/// Distinct main targets of one class key, in order of first appearance.
pub(crate) fn main_targets_of_key<'a>(
    key: &'a str,
    target_to_main: &'a HashMap<String, String>,
) -> Result<(Vec<&'a str>, Vec<&'a str>)> {
    let tids: Vec<&str> = key.split(',').collect();
    let mut mains: Vec<&str> = Vec::new();
    for tid in &tids {
        let main = target_to_main
            .get(*tid)
            .ok_or_else(|| EcError::UnknownTarget((*tid).to_string()))?;
        if !mains.contains(&main.as_str()) {
            mains.push(main);
        }
    }
    Ok((tids, mains))
}

/// Write the single-sample v1 file.
///
/// `name_to_tid` maps full reference names (`<target>_<haplotype>`) to
/// their decimal target ids as assigned by the BAM header.
pub fn write_v1(
    path: &Path,
    main_targets: &IndexMap<String, usize>,
    results: &ConvertResults,
    name_to_tid: &HashMap<String, String>,
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    writer.write_i32::<LittleEndian>(1)?;

    info!("NUMBER OF TARGETS: {}", main_targets.len());
    writer.write_i32::<LittleEndian>(main_targets.len() as i32)?;
    for main_target in main_targets.keys() {
        write_string(&mut writer, main_target)?;
    }

    info!("NUMBER OF HAPLOTYPES: {}", results.haplotypes.len());
    writer.write_i32::<LittleEndian>(results.haplotypes.len() as i32)?;
    for haplotype in &results.haplotypes {
        write_string(&mut writer, haplotype)?;
    }

    info!("NUMBER OF EQUIVALENCE CLASSES: {}", results.ec.len());
    writer.write_i32::<LittleEndian>(results.ec.len() as i32)?;
    for (_, count) in results.ec.iter() {
        writer.write_i32::<LittleEndian>(count as i32)?;
    }

    let mut num_mappings = 0usize;
    for (key, _) in results.ec.iter() {
        let (_, mains) = main_targets_of_key(key, &results.target_to_main)?;
        num_mappings += mains.len();
    }
    info!("NUMBER OF EQUIVALENCE CLASS MAPPINGS: {num_mappings}");
    writer.write_i32::<LittleEndian>(num_mappings as i32)?;

    for (ec_idx, (key, _)) in results.ec.iter().enumerate() {
        let (tids, mains) = main_targets_of_key(key, &results.target_to_main)?;
        for main_target in mains {
            let bits: Vec<u8> = results
                .haplotypes
                .iter()
                .map(|hap| {
                    let reference_name = format!("{main_target}_{hap}");
                    let present = name_to_tid
                        .get(&reference_name)
                        .map(|tid| tids.contains(&tid.as_str()))
                        .unwrap_or(false);
                    u8::from(present)
                })
                .collect();
            let target_idx = *main_targets
                .get(main_target)
                .ok_or_else(|| EcError::UnknownTarget(main_target.to_string()))?;

            writer.write_i32::<LittleEndian>(ec_idx as i32)?;
            writer.write_i32::<LittleEndian>(target_idx as i32)?;
            writer.write_i32::<LittleEndian>(bits_to_int(&bits))?;
        }
    }

    writer.flush()?;
    Ok(())
}

/// In-memory image of a v1 file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct V1Contents {
    pub targets: Vec<String>,
    pub haplotypes: Vec<String>,
    pub counts: Vec<i32>,
    /// `(ec_idx, target_idx, haplotype mask)` triples.
    pub mappings: Vec<(i32, i32, i32)>,
}

pub fn read_v1(path: &Path) -> Result<V1Contents> {
    let mut reader = BufReader::new(
        File::open(path).map_err(|_| EcError::MissingFile(path.to_path_buf()))?,
    );

    let version = reader.read_i32::<LittleEndian>()?;
    if version != 1 {
        return Err(EcError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected format version {version}"),
        )));
    }

    let mut contents = V1Contents::default();
    let num_targets = reader.read_i32::<LittleEndian>()?;
    for _ in 0..num_targets {
        contents.targets.push(read_string(&mut reader)?);
    }
    let num_haplotypes = reader.read_i32::<LittleEndian>()?;
    for _ in 0..num_haplotypes {
        contents.haplotypes.push(read_string(&mut reader)?);
    }
    let num_classes = reader.read_i32::<LittleEndian>()?;
    for _ in 0..num_classes {
        contents.counts.push(reader.read_i32::<LittleEndian>()?);
    }
    let num_mappings = reader.read_i32::<LittleEndian>()?;
    for _ in 0..num_mappings {
        let ec_idx = reader.read_i32::<LittleEndian>()?;
        let target_idx = reader.read_i32::<LittleEndian>()?;
        let mask = reader.read_i32::<LittleEndian>()?;
        contents.mappings.push((ec_idx, target_idx, mask));
    }

    Ok(contents)
}

fn write_sparse_sections<W: Write>(
    writer: &mut W,
    indptr: &[i32],
    indices: &[i32],
    data: &[i32],
) -> Result<()> {
    writer.write_i32::<LittleEndian>(indptr.len() as i32)?;
    writer.write_i32::<LittleEndian>(data.len() as i32)?;
    for value in indptr {
        writer.write_i32::<LittleEndian>(*value)?;
    }
    for value in indices {
        writer.write_i32::<LittleEndian>(*value)?;
    }
    for value in data {
        writer.write_i32::<LittleEndian>(*value)?;
    }
    Ok(())
}

fn read_sparse_sections<R: Read>(reader: &mut R) -> Result<(Vec<i32>, Vec<i32>, Vec<i32>)> {
    let indptr_len = reader.read_i32::<LittleEndian>()?;
    let nnz = reader.read_i32::<LittleEndian>()?;
    let mut indptr = Vec::with_capacity(indptr_len as usize);
    for _ in 0..indptr_len {
        indptr.push(reader.read_i32::<LittleEndian>()?);
    }
    let mut indices = Vec::with_capacity(nnz as usize);
    for _ in 0..nnz {
        indices.push(reader.read_i32::<LittleEndian>()?);
    }
    let mut data = Vec::with_capacity(nnz as usize);
    for _ in 0..nnz {
        data.push(reader.read_i32::<LittleEndian>()?);
    }
    Ok((indptr, indices, data))
}

/// Write the gzip-wrapped multi-sample v2 file.
///
/// `target_lengths` is indexed `[target, haplotype]`; `mask_matrix` is the
/// class × target matrix of LSB-first haplotype masks; `count_matrix` is
/// the class × barcode count matrix.
#[allow(clippy::too_many_arguments)]
pub fn write_v2(
    path: &Path,
    haplotypes: &[String],
    main_targets: &IndexMap<String, usize>,
    target_lengths: &Array2<i32>,
    barcodes: &IndexMap<String, usize>,
    mask_matrix: &CsrMatrix,
    count_matrix: &CscMatrix,
) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut writer = GzEncoder::new(file, Compression::default());

    writer.write_i32::<LittleEndian>(2)?;

    info!("NUMBER OF HAPLOTYPES: {}", haplotypes.len());
    writer.write_i32::<LittleEndian>(haplotypes.len() as i32)?;
    for haplotype in haplotypes {
        write_string(&mut writer, haplotype)?;
    }

    info!("NUMBER OF TARGETS: {}", main_targets.len());
    writer.write_i32::<LittleEndian>(main_targets.len() as i32)?;
    for (main_target, target_idx) in main_targets {
        write_string(&mut writer, main_target)?;
        for hap_idx in 0..haplotypes.len() {
            writer.write_i32::<LittleEndian>(target_lengths[[*target_idx, hap_idx]])?;
        }
    }

    info!("NUMBER OF BARCODES: {}", barcodes.len());
    writer.write_i32::<LittleEndian>(barcodes.len() as i32)?;
    for barcode in barcodes.keys() {
        write_string(&mut writer, barcode)?;
    }

    debug!(
        "mask matrix: {} x {}, {} nonzero",
        mask_matrix.nrows,
        mask_matrix.ncols,
        mask_matrix.nnz()
    );
    write_sparse_sections(
        &mut writer,
        &mask_matrix.indptr,
        &mask_matrix.indices,
        &mask_matrix.data,
    )?;

    debug!(
        "count matrix: {} x {}, {} nonzero",
        count_matrix.nrows,
        count_matrix.ncols,
        count_matrix.nnz()
    );
    write_sparse_sections(
        &mut writer,
        &count_matrix.indptr,
        &count_matrix.indices,
        &count_matrix.data,
    )?;

    writer.finish()?.flush()?;
    Ok(())
}

/// In-memory image of a v2 file.
#[derive(Debug, Default)]
pub struct V2Contents {
    pub haplotypes: Vec<String>,
    /// Target names with their per-haplotype lengths.
    pub targets: Vec<(String, Vec<i32>)>,
    pub barcodes: Vec<String>,
    pub mask_matrix: CsrMatrix,
    pub count_matrix: CscMatrix,
}

pub fn read_v2(path: &Path) -> Result<V2Contents> {
    let file = File::open(path).map_err(|_| EcError::MissingFile(path.to_path_buf()))?;
    let mut reader = GzDecoder::new(BufReader::new(file));

    let version = reader.read_i32::<LittleEndian>()?;
    if version != 2 {
        return Err(EcError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected format version {version}"),
        )));
    }

    let mut contents = V2Contents::default();
    let num_haplotypes = reader.read_i32::<LittleEndian>()?;
    for _ in 0..num_haplotypes {
        contents.haplotypes.push(read_string(&mut reader)?);
    }
    let num_targets = reader.read_i32::<LittleEndian>()?;
    for _ in 0..num_targets {
        let name = read_string(&mut reader)?;
        let mut lengths = Vec::with_capacity(num_haplotypes as usize);
        for _ in 0..num_haplotypes {
            lengths.push(reader.read_i32::<LittleEndian>()?);
        }
        contents.targets.push((name, lengths));
    }
    let num_barcodes = reader.read_i32::<LittleEndian>()?;
    for _ in 0..num_barcodes {
        contents.barcodes.push(read_string(&mut reader)?);
    }

    let (indptr, indices, data) = read_sparse_sections(&mut reader)?;
    let num_classes = indptr.len().saturating_sub(1);
    contents.mask_matrix = CsrMatrix {
        nrows: num_classes,
        ncols: num_targets as usize,
        indptr,
        indices,
        data,
    };

    let (indptr, indices, data) = read_sparse_sections(&mut reader)?;
    contents.count_matrix = CscMatrix {
        nrows: num_classes,
        ncols: indptr.len().saturating_sub(1),
        indptr,
        indices,
        data,
    };

    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::CooMatrix;

    fn sample_results() -> (IndexMap<String, usize>, ConvertResults, HashMap<String, String>) {
        let mut main_targets = IndexMap::new();
        main_targets.insert("T1".to_string(), 0);
        main_targets.insert("T2".to_string(), 1);

        let mut results = ConvertResults {
            haplotypes: vec!["A".to_string(), "C".to_string()],
            ..Default::default()
        };
        results.ec.observe("0,1".to_string());
        results.ec.observe("0,1".to_string());
        results.ec.observe("2".to_string());
        results
            .target_to_main
            .insert("0".to_string(), "T1".to_string());
        results
            .target_to_main
            .insert("1".to_string(), "T1".to_string());
        results
            .target_to_main
            .insert("2".to_string(), "T2".to_string());

        let mut name_to_tid = HashMap::new();
        name_to_tid.insert("T1_A".to_string(), "0".to_string());
        name_to_tid.insert("T1_C".to_string(), "1".to_string());
        name_to_tid.insert("T2_A".to_string(), "2".to_string());

        (main_targets, results, name_to_tid)
    }

    #[test]
    fn v1_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ec");
        let (main_targets, results, name_to_tid) = sample_results();

        write_v1(&path, &main_targets, &results, &name_to_tid).unwrap();
        let contents = read_v1(&path).unwrap();

        assert_eq!(vec!["T1".to_string(), "T2".to_string()], contents.targets);
        assert_eq!(
            vec!["A".to_string(), "C".to_string()],
            contents.haplotypes
        );
        assert_eq!(vec![2, 1], contents.counts);
        // class 0 covers T1 on both haplotypes; class 1 covers T2 on A only
        assert_eq!(vec![(0, 0, 3), (1, 1, 2)], contents.mappings);
    }

    #[test]
    fn v2_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ec.gz");

        let haplotypes = vec!["A".to_string(), "B".to_string()];
        let mut main_targets = IndexMap::new();
        main_targets.insert("T1".to_string(), 0);
        main_targets.insert("T2".to_string(), 1);
        let target_lengths =
            Array2::from_shape_vec((2, 2), vec![100, 101, 200, 0]).unwrap();
        let mut barcodes = IndexMap::new();
        barcodes.insert("AAA".to_string(), 0);
        barcodes.insert("BBB".to_string(), 1);

        let mut masks = CooMatrix::new(2, 2);
        masks.push(0, 0, 3);
        masks.push(1, 1, 1);
        let mask_matrix = masks.to_csr();

        let mut counts = CooMatrix::new(2, 2);
        counts.push(0, 0, 7);
        counts.push(1, 1, 2);
        let count_matrix = counts.to_csr().to_csc();

        write_v2(
            &path,
            &haplotypes,
            &main_targets,
            &target_lengths,
            &barcodes,
            &mask_matrix,
            &count_matrix,
        )
        .unwrap();
        let contents = read_v2(&path).unwrap();

        assert_eq!(haplotypes, contents.haplotypes);
        assert_eq!(
            vec![
                ("T1".to_string(), vec![100, 101]),
                ("T2".to_string(), vec![200, 0]),
            ],
            contents.targets
        );
        assert_eq!(vec!["AAA".to_string(), "BBB".to_string()], contents.barcodes);
        assert_eq!(mask_matrix, contents.mask_matrix);
        assert_eq!(vec![0, 1, 2], contents.mask_matrix.indptr);
        assert_eq!(count_matrix, contents.count_matrix);
    }
}
