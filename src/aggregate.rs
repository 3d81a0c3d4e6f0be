//! # Alignment aggregation
//!
//! Streams the alignments of one BAM (or sub-BAM) in order, coalesces the
//! alignments of each read, and tallies the resulting equivalence
//! classes. Two policies exist: the single-sample policy used on chunked
//! sub-BAMs, and the multi-sample policy used on whole per-sample files,
//! which additionally filters mates and keys counts by cell barcode.
use std::collections::HashMap;
use std::path::Path;

use indexmap::IndexMap;
use log::debug;
use rust_htslib::bam::{self, Read};

use crate::bgzf;
use crate::ec::{canonical_key, CellConvertResults, ConvertResults};
use crate::error::{EcError, Result};

/// Delimiter between the tag fields embedded in multi-sample read names.
const TAG_DELIMITER: &str = "|||";
/// 0-based position of the cell barcode among those fields.
const TAG_INDEX_CR: usize = 2;

/// Truncate a read name at its first space.
fn normalize_name(qname: &[u8]) -> &[u8] {
    match qname.iter().position(|&b| b == b' ') {
        Some(i) => &qname[..i],
        None => qname,
    }
}

/// Split a reference name `<main_target>_<haplotype>` at its last
/// underscore.
fn split_reference_name(name: &str) -> Option<(&str, &str)> {
    let idx = name.rfind('_')?;
    Some((&name[..idx], &name[idx + 1..]))
}

/// Aggregate one sub-BAM under the single-sample policy.
///
/// `main_targets` is the shared read-only main-target table. When
/// `targets_authoritative` is set (the table came from a target list
/// file), a main target absent from it is fatal; otherwise the table was
/// derived from the header and always covers the file.
pub fn collect_from_bam(
    bam_path: &Path,
    main_targets: &IndexMap<String, usize>,
    targets_authoritative: bool,
) -> Result<ConvertResults> {
    let mut reader = bam::Reader::from_path(bam_path)?;
    let target_names: Vec<String> = {
        let header = reader.header();
        if header.target_count() == 0 {
            return Err(EcError::MissingHeader);
        }
        (0..header.target_count())
            .map(|tid| String::from_utf8_lossy(header.tid2name(tid)).into_owned())
            .collect()
    };

    let mut results = ConvertResults::default();
    let mut haplotypes: Vec<String> = Vec::new();

    let mut current_read: Option<Vec<u8>> = None;
    let mut target_ids: Vec<String> = Vec::new();

    let mut record = bam::Record::new();
    while let Some(res) = reader.read(&mut record) {
        res?;
        results.all_alignments += 1;

        if record.is_unmapped() {
            continue;
        }
        results.valid_alignments += 1;

        let reference_name = target_names[record.tid() as usize].as_str();
        let tid = record.tid().to_string();

        let Some((main_target, haplotype)) = split_reference_name(reference_name) else {
            return Err(EcError::MissingHaplotypeSuffix(reference_name.to_string()));
        };
        if targets_authoritative && !main_targets.contains_key(main_target) {
            return Err(EcError::UnknownTarget(main_target.to_string()));
        }

        *results.unique_tids.entry(tid.clone()).or_insert(0) += 1;
        results
            .target_to_main
            .entry(tid.clone())
            .or_insert_with(|| main_target.to_string());
        if !haplotypes.iter().any(|h| h == haplotype) {
            haplotypes.push(haplotype.to_string());
        }

        let name = normalize_name(record.qname());
        *results
            .unique_reads
            .entry(String::from_utf8_lossy(name).into_owned())
            .or_insert(0) += 1;

        match &current_read {
            Some(current) if current.as_slice() == name => {
                if target_ids.contains(&tid) {
                    results.duplicate_targets += 1;
                } else {
                    target_ids.push(tid);
                }
            }
            Some(_) => {
                results.ec.observe(canonical_key(&target_ids));
                results.read_switches += 1;
                current_read = Some(name.to_vec());
                target_ids.clear();
                target_ids.push(tid);
            }
            None => {
                current_read = Some(name.to_vec());
                target_ids.push(tid);
            }
        }

        if results.all_alignments % 100_000 == 0 {
            debug!(
                "{}: {} valid alignments processed out of {}, with {} equivalence classes",
                bam_path.display(),
                results.valid_alignments,
                results.all_alignments,
                results.ec.len()
            );
        }
    }

    // flush the final read group
    if current_read.is_some() {
        results.ec.observe(canonical_key(&target_ids));
    }

    haplotypes.sort_unstable();
    results.haplotypes = haplotypes;

    debug!(
        "{}: done, {} valid alignments out of {}, {} equivalence classes",
        bam_path.display(),
        results.valid_alignments,
        results.all_alignments,
        results.ec.len()
    );
    Ok(results)
}

/// Extract the cell barcode from a normalized read name.
fn barcode_of(name: &str) -> Result<&str> {
    name.split(TAG_DELIMITER)
        .nth(TAG_INDEX_CR)
        .ok_or_else(|| EcError::MissingBarcode(name.to_string()))
}

/// Aggregate one whole BAM under the multi-sample policy.
///
/// Counts are keyed by cell barcode; paired-end mates, improper pairs,
/// and cross-reference pairs contribute nothing. With `track_ranges`,
/// the span of alignment start positions per target is recorded.
pub fn collect_cell_counts(bam_path: &Path, track_ranges: bool) -> Result<CellConvertResults> {
    bgzf::validate_bam(bam_path)?;

    let mut reader = bam::Reader::from_path(bam_path)?;
    if reader.header().target_count() == 0 {
        return Err(EcError::MissingHeader);
    }

    let mut results = CellConvertResults::default();
    let mut ranges: HashMap<String, (i64, i64)> = HashMap::new();

    let mut current_read: Option<String> = None;
    let mut current_barcode = String::new();
    let mut target_ids: Vec<String> = Vec::new();

    let mut record = bam::Record::new();
    while let Some(res) = reader.read(&mut record) {
        res?;
        results.all_alignments += 1;

        if record.is_unmapped() {
            continue;
        }
        if record.is_paired()
            && (record.is_last_in_template()
                || !record.is_proper_pair()
                || record.tid() != record.mtid()
                || record.mpos() < 0)
        {
            continue;
        }
        results.valid_alignments += 1;

        let tid = record.tid().to_string();
        if track_ranges {
            let pos = record.pos();
            ranges
                .entry(tid.clone())
                .and_modify(|range| {
                    range.0 = range.0.min(pos);
                    range.1 = range.1.max(pos);
                })
                .or_insert((pos, pos));
        }

        let name = String::from_utf8_lossy(normalize_name(record.qname())).into_owned();
        *results.unique_reads.entry(name.clone()).or_insert(0) += 1;

        match &current_read {
            Some(current) if *current == name => {
                if target_ids.contains(&tid) {
                    results.duplicate_targets += 1;
                } else {
                    target_ids.push(tid);
                }
            }
            Some(_) => {
                results
                    .ec
                    .observe(canonical_key(&target_ids), current_barcode.clone());
                results.read_switches += 1;
                current_barcode = barcode_of(&name)?.to_string();
                current_read = Some(name);
                target_ids.clear();
                target_ids.push(tid);
            }
            None => {
                current_barcode = barcode_of(&name)?.to_string();
                current_read = Some(name);
                target_ids.push(tid);
            }
        }

        if results.all_alignments % 100_000 == 0 {
            debug!(
                "{}: {} valid alignments processed out of {}, with {} equivalence classes",
                bam_path.display(),
                results.valid_alignments,
                results.all_alignments,
                results.ec.len()
            );
        }
    }

    // flush the final read group
    if current_read.is_some() {
        results
            .ec
            .observe(canonical_key(&target_ids), current_barcode);
    }

    results.tid_ranges = ranges;
    debug!(
        "{}: done, {} valid alignments out of {}, {} equivalence classes",
        bam_path.display(),
        results.valid_alignments,
        results.all_alignments,
        results.ec.len()
    );
    Ok(results)
}
