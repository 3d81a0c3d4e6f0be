//! # Single-sample conversion
//!
//! Drives the whole pipeline for one BAM file: plan chunks, fan sub-BAM
//! materialization and aggregation out over a thread pool, merge the
//! partial results in pool order, and emit the v1 binary or the property
//! matrix. Also home of the plain `split` operation.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use log::{debug, error, info};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use rust_htslib::bam::{self, Read};

use crate::aggregate;
use crate::apm::{AlignmentPropertyMatrix, ApmCounts};
use crate::chunk::{self, ParseRecord};
use crate::ec::ConvertResults;
use crate::error::EcError;
use crate::serialize;
use crate::splice;
use crate::utils::{self, io_utils};

/// Hard ceiling on the number of chunks a file is split into.
const MAX_CHUNKS: usize = 1000;

#[derive(Debug, Default)]
pub struct ConvertOptions {
    /// Requested chunk count; `0` means one per CPU.
    pub num_chunks: usize,
    /// Optional authoritative main-target list file.
    pub targets: Option<PathBuf>,
    /// Directory for temporary sub-BAMs; defaults to the output's parent.
    pub temp_dir: Option<PathBuf>,
}

/// Convert `bam_path` and write either a v1 binary (`emase == false`) or
/// a property-matrix file (`emase == true`) to `output`.
pub fn convert(bam_path: &Path, output: &Path, emase: bool, options: &ConvertOptions) -> Result<()> {
    let num_chunks = clamp_chunks(options.num_chunks);
    let temp_dir = match &options.temp_dir {
        Some(dir) => dir.clone(),
        None => output.parent().unwrap_or_else(|| Path::new(".")).to_path_buf(),
    };

    let reference_names = header_reference_names(bam_path)?;
    let name_to_tid = name_to_tid_map(&reference_names);
    let (main_targets, targets_authoritative) = match &options.targets {
        Some(path) => {
            let targets = io_utils::parse_targets(path)?;
            if targets.is_empty() {
                bail!("unable to parse target file {}", path.display());
            }
            (targets, true)
        }
        None => (main_targets_from_names(&reference_names)?, false),
    };

    let results = convert_results(bam_path, num_chunks, &main_targets, targets_authoritative, &temp_dir)?;

    info!("# Unique Reads: {}", results.unique_reads.len());
    info!("# Main Targets: {}", main_targets.len());
    info!("# Haplotypes: {}", results.haplotypes.len());
    info!("# Unique Targets: {}", results.unique_tids.len());
    info!("# Equivalence Classes: {}", results.ec.len());

    let _ = fs::remove_file(output);
    if emase {
        write_apm(output, &main_targets, &results, &name_to_tid)
    } else {
        serialize::write_v1(output, &main_targets, &results, &name_to_tid)
            .with_context(|| format!("Error writing {}", output.display()))
    }
}

/// Run the chunked aggregation and return the merged tables. This is the
/// testable core of [`convert`].
pub fn convert_results(
    bam_path: &Path,
    num_chunks: usize,
    main_targets: &IndexMap<String, usize>,
    targets_authoritative: bool,
    temp_dir: &Path,
) -> Result<ConvertResults> {
    info!("Calculating {num_chunks} chunks");
    let chunks = chunk::calculate_chunks(bam_path, num_chunks, true)?;
    info!("{} chunks calculated", chunks.len());

    let num_threads = num_cpus::get().min(chunks.len()).max(1);
    info!("Starting {num_threads} threads");
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .context("Error building thread pool")?;

    let partials: Vec<std::result::Result<ConvertResults, EcError>> = pool.install(|| {
        chunks
            .par_iter()
            .enumerate()
            .map(|(idx, record)| aggregate_chunk(bam_path, temp_dir, idx, record, main_targets, targets_authoritative))
            .collect()
    });

    let mut merged = ConvertResults::default();
    for (idx, partial) in partials.into_iter().enumerate() {
        let partial = match partial {
            Ok(partial) => partial,
            // a chunk with an unparseable haplotype contributes nothing,
            // the remaining chunks still count
            Err(e @ EcError::MissingHaplotypeSuffix(_)) => {
                error!("Error processing chunk {idx}: {e}");
                ConvertResults::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Error processing chunk {idx}"));
            }
        };
        debug!("chunk {idx}: {} equivalence classes", partial.ec.len());
        merged.absorb(partial);
    }
    Ok(merged)
}

/// One worker: materialize the sub-BAM, aggregate it, clean up.
fn aggregate_chunk(
    bam_path: &Path,
    temp_dir: &Path,
    idx: usize,
    record: &ParseRecord,
    main_targets: &IndexMap<String, usize>,
    targets_authoritative: bool,
) -> std::result::Result<ConvertResults, EcError> {
    let temp_file = temp_dir.join(format!("_bam2ec.{idx}.bam"));
    debug!("creating alignment file {}", temp_file.display());
    io_utils::delete_file(&temp_file);
    splice::write_chunk(bam_path, &temp_file, record)?;

    let results = aggregate::collect_from_bam(&temp_file, main_targets, targets_authoritative);
    io_utils::delete_file(&temp_file);
    results
}

/// Split `bam_path` into `number` standalone BAM files named
/// `<stem>_<i>.<ext>` in `output_dir` (default: next to the input). With
/// `boundary`, chunk edges are moved so no read is split across files.
pub fn split_bam(bam_path: &Path, number: usize, boundary: bool, output_dir: Option<&Path>) -> Result<()> {
    let output_dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => bam_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf(),
    };
    let Some((stem, ext)) = bam_path.to_str().and_then(utils::stem_and_extension) else {
        bail!("cannot derive output names from {}", bam_path.display());
    };

    info!("Calculating {number} chunks");
    let chunks = chunk::calculate_chunks(bam_path, number, boundary)?;

    for (idx, record) in chunks.iter().enumerate() {
        let new_file = output_dir.join(format!("{stem}_{idx}.{ext}"));
        info!("Creating alignment file {}", new_file.display());
        splice::write_chunk(bam_path, &new_file, record)
            .with_context(|| format!("Error writing {}", new_file.display()))?;
    }
    info!("{} files created", chunks.len());
    Ok(())
}

fn clamp_chunks(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get()
    } else if requested > MAX_CHUNKS {
        info!("Modifying number of chunks from {requested} to {MAX_CHUNKS}");
        MAX_CHUNKS
    } else {
        requested
    }
}

/// All reference names from the BAM header, in target-id order.
pub fn header_reference_names(bam_path: &Path) -> Result<Vec<String>> {
    let reader = bam::Reader::from_path(bam_path)
        .with_context(|| format!("Error opening {}", bam_path.display()))?;
    let header = reader.header();
    Ok((0..header.target_count())
        .map(|tid| String::from_utf8_lossy(header.tid2name(tid)).into_owned())
        .collect())
}

/// Reference name → decimal target id, as assigned by the header.
pub fn name_to_tid_map(reference_names: &[String]) -> HashMap<String, String> {
    reference_names
        .iter()
        .enumerate()
        .map(|(tid, name)| (name.clone(), tid.to_string()))
        .collect()
}

/// Derive the main-target table from the header: strip haplotype
/// suffixes, deduplicate, sort, and assign dense indices.
fn main_targets_from_names(reference_names: &[String]) -> Result<IndexMap<String, usize>> {
    let mut unique: Vec<&str> = Vec::new();
    for name in reference_names {
        let Some(idx) = name.rfind('_') else {
            return Err(EcError::MissingHaplotypeSuffix(name.clone()).into());
        };
        let main_target = &name[..idx];
        if !unique.contains(&main_target) {
            unique.push(main_target);
        }
    }
    unique.sort_unstable();

    Ok(unique
        .into_iter()
        .enumerate()
        .map(|(idx, name)| (name.to_string(), idx))
        .collect())
}

/// Populate and save the property matrix for the EMASE output path.
fn write_apm(
    output: &Path,
    main_targets: &IndexMap<String, usize>,
    results: &ConvertResults,
    name_to_tid: &HashMap<String, String>,
) -> Result<()> {
    info!("Constructing property matrix");
    let shape = (main_targets.len(), results.haplotypes.len(), results.ec.len());
    debug!("shape: {shape:?}");

    let mut apm = AlignmentPropertyMatrix::new(
        shape,
        results.haplotypes.clone(),
        main_targets.keys().cloned().collect(),
        Vec::new(),
    );
    apm.set_counts(ApmCounts::Totals(
        results.ec.iter().map(|(_, count)| count as i32).collect(),
    ));

    for (ec_idx, (key, _)) in results.ec.iter().enumerate() {
        let (tids, mains) = serialize::main_targets_of_key(key, &results.target_to_main)?;
        for main_target in mains {
            for (hap_idx, haplotype) in results.haplotypes.iter().enumerate() {
                let reference_name = format!("{main_target}_{haplotype}");
                let present = name_to_tid
                    .get(&reference_name)
                    .map(|tid| tids.contains(&tid.as_str()))
                    .unwrap_or(false);
                if present {
                    let target_idx = *main_targets
                        .get(main_target)
                        .ok_or_else(|| EcError::UnknownTarget(main_target.to_string()))?;
                    apm.set_value(target_idx, hap_idx, ec_idx, 1);
                }
            }
        }
    }

    apm.finalize();
    apm.save(output, "bam2ec")
        .with_context(|| format!("Error writing {}", output.display()))
}
