//! # Multi-sample conversion
//!
//! Converts a directory of per-sample BAM files into the v2 dialect
//! and/or a property matrix. One worker streams each file whole;
//! reference metadata is parsed once from the first file's header, and
//! per-cell counts are keyed by the barcode embedded in read names.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use log::{debug, error, info};
use ndarray::Array2;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use rust_htslib::bam::{self, Read};

use crate::aggregate;
use crate::apm::{AlignmentPropertyMatrix, ApmCounts};
use crate::ec::MergedCellResults;
use crate::serialize;
use crate::sparse::{CooMatrix, CscMatrix, CsrMatrix};
use crate::utils::{bits_to_int_lsb, io_utils};

#[derive(Debug, Default)]
pub struct MultisampleOptions {
    /// Keep only barcodes with at least this many reads in total.
    pub min_count: u64,
    /// Worker count; `0` means one per CPU, capped at the file count.
    pub num_processes: usize,
    /// Optional per-target range report.
    pub range_file: Option<PathBuf>,
}

/// Reference metadata shared by every worker, parsed from one header.
struct HeaderMetadata {
    main_targets: IndexMap<String, usize>,
    haplotypes: Vec<String>,
    target_to_main: HashMap<String, String>,
    /// Indexed `[target, haplotype]`.
    target_lengths: Array2<i32>,
    name_to_tid: HashMap<String, String>,
}

/// Convert every `*.bam` in `bam_dir`. At least one of `ec_file` (v2
/// output) and `emase_file` (property-matrix output) should be given.
pub fn convert_multisample(
    bam_dir: &Path,
    ec_file: Option<&Path>,
    emase_file: Option<&Path>,
    options: &MultisampleOptions,
) -> Result<()> {
    if !bam_dir.is_dir() {
        bail!("{} is not a directory of BAM files", bam_dir.display());
    }
    let bam_files = collect_bam_files(bam_dir)?;
    if bam_files.is_empty() {
        bail!("No BAM files found in directory {}", bam_dir.display());
    }
    info!("Found {} BAM files", bam_files.len());

    let metadata = parse_header_metadata(&bam_files[0])
        .with_context(|| format!("Error parsing header of {}", bam_files[0].display()))?;

    let num_processes = if options.num_processes == 0 {
        num_cpus::get().min(bam_files.len()).max(1)
    } else {
        options.num_processes.min(bam_files.len()).max(1)
    };
    info!("Starting {num_processes} workers");
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_processes)
        .build()
        .context("Error building thread pool")?;

    let track_ranges = options.range_file.is_some();
    let partials: Vec<_> = pool.install(|| {
        bam_files
            .par_iter()
            .map(|path| aggregate::collect_cell_counts(path, track_ranges))
            .collect()
    });

    let mut merged = MergedCellResults::default();
    for (idx, partial) in partials.into_iter().enumerate() {
        match partial {
            Ok(partial) => {
                debug!(
                    "{}: {} equivalence classes",
                    bam_files[idx].display(),
                    partial.ec.len()
                );
                merged.absorb(partial);
            }
            // a failed sample is logged and skipped, the rest still count
            Err(e) => error!("Error processing {}: {e}", bam_files[idx].display()),
        }
    }

    info!("# Valid Alignments: {}", merged.valid_alignments);
    info!("# Main Targets: {}", metadata.main_targets.len());
    info!("# Haplotypes: {}", metadata.haplotypes.len());
    info!("# Equivalence Classes: {}", merged.ec.len());
    info!("# Barcodes: {}", merged.barcodes.len());

    merged.filter_min_count(options.min_count);
    if options.min_count > 0 {
        info!("# Equivalence Classes after filtering: {}", merged.ec.len());
        info!("# Barcodes after filtering: {}", merged.barcodes.len());
    }

    if let Some(range_file) = &options.range_file {
        io_utils::write_range_file(
            range_file,
            &metadata.haplotypes,
            &metadata.main_targets,
            &merged.tid_ranges,
            &metadata.name_to_tid,
        )?;
        info!("Range report written to {}", range_file.display());
    }

    let (mask_matrix, incidence) = build_mask_matrix(&metadata, &merged)?;
    let count_matrix = build_count_matrix(&merged);

    if let Some(path) = ec_file {
        let _ = fs::remove_file(path);
        serialize::write_v2(
            path,
            &metadata.haplotypes,
            &metadata.main_targets,
            &metadata.target_lengths,
            &merged.barcodes,
            &mask_matrix,
            &count_matrix,
        )
        .with_context(|| format!("Error writing {}", path.display()))?;
        info!("{} created", path.display());
    }

    if let Some(path) = emase_file {
        let _ = fs::remove_file(path);
        let mut apm = AlignmentPropertyMatrix::new(
            (
                metadata.main_targets.len(),
                metadata.haplotypes.len(),
                merged.ec.len(),
            ),
            metadata.haplotypes.clone(),
            metadata.main_targets.keys().cloned().collect(),
            merged.barcodes.keys().cloned().collect(),
        );
        for (hap_idx, matrix) in incidence.into_iter().enumerate() {
            apm.set_incidence(hap_idx, matrix);
        }
        apm.set_counts(ApmCounts::Cells(count_matrix));
        apm.finalize();
        apm.save(path, "Multisample APM")
            .with_context(|| format!("Error writing {}", path.display()))?;
        info!("{} created", path.display());
    }

    Ok(())
}

fn collect_bam_files(bam_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut bam_files: Vec<PathBuf> = fs::read_dir(bam_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|e| e == "bam").unwrap_or(false))
        .collect();
    bam_files.sort();
    Ok(bam_files)
}

fn parse_header_metadata(bam_path: &Path) -> Result<HeaderMetadata> {
    let reader = bam::Reader::from_path(bam_path)?;
    let header = reader.header();

    let mut reference_names = Vec::with_capacity(header.target_count() as usize);
    let mut reference_lengths = Vec::with_capacity(header.target_count() as usize);
    for tid in 0..header.target_count() {
        reference_names.push(String::from_utf8_lossy(header.tid2name(tid)).into_owned());
        reference_lengths.push(header.target_len(tid).unwrap_or(0) as i32);
    }

    let mut main_targets: IndexMap<String, usize> = IndexMap::new();
    let mut haplotypes: Vec<String> = Vec::new();
    let mut target_to_main = HashMap::new();
    let mut name_to_tid = HashMap::new();

    for (tid, name) in reference_names.iter().enumerate() {
        let (target, haplotype) = split_lenient(name);
        target_to_main.insert(tid.to_string(), target.to_string());
        name_to_tid.insert(name.clone(), tid.to_string());
        if !haplotypes.iter().any(|h| h == haplotype) {
            haplotypes.push(haplotype.to_string());
        }
        let next = main_targets.len();
        main_targets.entry(target.to_string()).or_insert(next);
    }
    haplotypes.sort_unstable();

    let mut target_lengths: Array2<i32> = Array2::zeros((main_targets.len(), haplotypes.len()));
    for (tid, name) in reference_names.iter().enumerate() {
        let (target, haplotype) = split_lenient(name);
        let target_idx = main_targets[target];
        let hap_idx = haplotypes.iter().position(|h| h == haplotype).unwrap();
        target_lengths[[target_idx, hap_idx]] = reference_lengths[tid];
    }

    Ok(HeaderMetadata {
        main_targets,
        haplotypes,
        target_to_main,
        target_lengths,
        name_to_tid,
    })
}

/// Split a reference name at its last underscore; names without one (or
/// starting with it) carry the empty haplotype.
fn split_lenient(name: &str) -> (&str, &str) {
    match name.rfind('_') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx + 1..]),
        _ => (name, ""),
    }
}

/// Build the class × target mask matrix (haplotype `h` contributes
/// `2^h`) together with the per-haplotype 0/1 incidence matrices the
/// property matrix consumes.
fn build_mask_matrix(
    metadata: &HeaderMetadata,
    merged: &MergedCellResults,
) -> Result<(CsrMatrix, Vec<CooMatrix>)> {
    let num_classes = merged.ec.len();
    let num_targets = metadata.main_targets.len();

    let mut combined = CooMatrix::new(num_classes, num_targets);
    let mut incidence: Vec<CooMatrix> = (0..metadata.haplotypes.len())
        .map(|_| CooMatrix::new(num_classes, num_targets))
        .collect();

    for (ec_idx, (key, _)) in merged.ec.iter().enumerate() {
        let (tids, mains) = serialize::main_targets_of_key(key, &metadata.target_to_main)?;
        for main_target in mains {
            let target_idx = metadata.main_targets[main_target];
            let bits: Vec<u8> = metadata
                .haplotypes
                .iter()
                .map(|haplotype| {
                    let reference_name = if haplotype.is_empty() {
                        main_target.to_string()
                    } else {
                        format!("{main_target}_{haplotype}")
                    };
                    let present = metadata
                        .name_to_tid
                        .get(&reference_name)
                        .map(|tid| tids.contains(&tid.as_str()))
                        .unwrap_or(false);
                    u8::from(present)
                })
                .collect();
            let mask = bits_to_int_lsb(&bits);
            if mask != 0 {
                combined.push(ec_idx, target_idx, mask);
            }
            for (hap_idx, bit) in bits.iter().enumerate() {
                if *bit == 1 {
                    incidence[hap_idx].push(ec_idx, target_idx, 1);
                }
            }
        }
    }

    Ok((combined.to_csr(), incidence))
}

/// Build the class × barcode count matrix in compressed-column form.
fn build_count_matrix(merged: &MergedCellResults) -> CscMatrix {
    let mut columns: Vec<Vec<(i32, i32)>> = vec![Vec::new(); merged.barcodes.len()];
    for (ec_idx, (_, cells)) in merged.ec.iter().enumerate() {
        for (barcode, count) in cells {
            let column = merged.barcodes[barcode];
            columns[column].push((ec_idx as i32, *count as i32));
        }
    }
    CscMatrix::from_columns(merged.ec.len(), columns)
}
