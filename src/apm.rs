//! # Alignment property matrix
//!
//! The narrow collaborator the conversion pipelines hand their results to
//! when an APM output is requested: a sparse 3-tensor of
//! `target × haplotype × class` incidence plus either per-class totals
//! (single-sample) or a class × barcode count matrix (multi-sample). Only
//! construction, value setting, finalization, and saving are exposed.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;

use crate::error::Result;
use crate::sparse::{CooMatrix, CscMatrix, CsrMatrix};

const MAGIC: &[u8; 4] = b"APM1";

/// Per-class counts: totals in single-sample mode, a class × barcode
/// matrix in multi-sample mode.
#[derive(Debug)]
pub enum ApmCounts {
    None,
    Totals(Vec<i32>),
    Cells(CscMatrix),
}

pub struct AlignmentPropertyMatrix {
    /// `(targets, haplotypes, classes)`.
    pub shape: (usize, usize, usize),
    haplotype_names: Vec<String>,
    locus_names: Vec<String>,
    sample_names: Vec<String>,
    /// Per-haplotype class × target incidence.
    incidence: Vec<CooMatrix>,
    finalized: Vec<CsrMatrix>,
    counts: ApmCounts,
}

impl AlignmentPropertyMatrix {
    pub fn new(
        shape: (usize, usize, usize),
        haplotype_names: Vec<String>,
        locus_names: Vec<String>,
        sample_names: Vec<String>,
    ) -> Self {
        let (targets, haplotypes, classes) = shape;
        AlignmentPropertyMatrix {
            shape,
            haplotype_names,
            locus_names,
            sample_names,
            incidence: (0..haplotypes)
                .map(|_| CooMatrix::new(classes, targets))
                .collect(),
            finalized: Vec::new(),
            counts: ApmCounts::None,
        }
    }

    /// Record that class `ec_idx` touches `target_idx` on haplotype
    /// `hap_idx`.
    pub fn set_value(&mut self, target_idx: usize, hap_idx: usize, ec_idx: usize, value: i32) {
        self.incidence[hap_idx].push(ec_idx, target_idx, value);
    }

    /// Install a pre-built per-haplotype incidence matrix.
    pub fn set_incidence(&mut self, hap_idx: usize, matrix: CooMatrix) {
        self.incidence[hap_idx] = matrix;
    }

    pub fn set_counts(&mut self, counts: ApmCounts) {
        self.counts = counts;
    }

    /// Convert the accumulated triplets into their compressed form.
    pub fn finalize(&mut self) {
        self.finalized = self.incidence.iter().map(CooMatrix::to_csr).collect();
    }

    /// Write the matrix to `path` as a gzip-wrapped little-endian
    /// container.
    pub fn save(&mut self, path: &Path, title: &str) -> Result<()> {
        if self.finalized.len() != self.incidence.len() {
            self.finalize();
        }
        info!("writing {title} to {}", path.display());

        let file = BufWriter::new(File::create(path)?);
        let mut writer = GzEncoder::new(file, Compression::default());

        writer.write_all(MAGIC)?;
        write_string(&mut writer, title)?;
        writer.write_i32::<LittleEndian>(self.shape.0 as i32)?;
        writer.write_i32::<LittleEndian>(self.shape.1 as i32)?;
        writer.write_i32::<LittleEndian>(self.shape.2 as i32)?;

        write_names(&mut writer, &self.haplotype_names)?;
        write_names(&mut writer, &self.locus_names)?;
        write_names(&mut writer, &self.sample_names)?;

        for matrix in &self.finalized {
            writer.write_i32::<LittleEndian>(matrix.indptr.len() as i32)?;
            writer.write_i32::<LittleEndian>(matrix.nnz() as i32)?;
            for value in &matrix.indptr {
                writer.write_i32::<LittleEndian>(*value)?;
            }
            for value in &matrix.indices {
                writer.write_i32::<LittleEndian>(*value)?;
            }
            for value in &matrix.data {
                writer.write_i32::<LittleEndian>(*value)?;
            }
        }

        match &self.counts {
            ApmCounts::None => writer.write_i32::<LittleEndian>(0)?,
            ApmCounts::Totals(totals) => {
                writer.write_i32::<LittleEndian>(1)?;
                writer.write_i32::<LittleEndian>(totals.len() as i32)?;
                for total in totals {
                    writer.write_i32::<LittleEndian>(*total)?;
                }
            }
            ApmCounts::Cells(matrix) => {
                writer.write_i32::<LittleEndian>(2)?;
                writer.write_i32::<LittleEndian>(matrix.indptr.len() as i32)?;
                writer.write_i32::<LittleEndian>(matrix.nnz() as i32)?;
                for value in &matrix.indptr {
                    writer.write_i32::<LittleEndian>(*value)?;
                }
                for value in &matrix.indices {
                    writer.write_i32::<LittleEndian>(*value)?;
                }
                for value in &matrix.data {
                    writer.write_i32::<LittleEndian>(*value)?;
                }
            }
        }

        writer.finish()?.flush()?;
        Ok(())
    }
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    writer.write_i32::<LittleEndian>(s.len() as i32)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn write_names<W: Write>(writer: &mut W, names: &[String]) -> Result<()> {
    writer.write_i32::<LittleEndian>(names.len() as i32)?;
    for name in names {
        write_string(writer, name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_produces_a_gzip_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.apm");

        let mut apm = AlignmentPropertyMatrix::new(
            (2, 2, 3),
            vec!["A".to_string(), "B".to_string()],
            vec!["T1".to_string(), "T2".to_string()],
            vec![],
        );
        apm.set_value(0, 0, 0, 1);
        apm.set_value(1, 1, 2, 1);
        apm.set_counts(ApmCounts::Totals(vec![4, 1, 2]));
        apm.finalize();
        apm.save(&path, "test").unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // gzip magic
        assert_eq!(&[0x1f, 0x8b], &bytes[..2]);
        assert!(bytes.len() > 10);
    }
}
