//! # IO Utils
//!
//! Home of small I/O helpers: parsing the main-target list file and
//! writing the per-target range report.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use csv::WriterBuilder;
use indexmap::IndexMap;

use crate::error::{EcError, Result};

/// Read one main target per line into an insertion-ordered
/// `name → dense index` table. Blank lines are skipped; on lines with
/// multiple columns only the first is used.
pub fn parse_targets(path: &Path) -> Result<IndexMap<String, usize>> {
    let file = File::open(path).map_err(|_| EcError::MissingFile(path.to_path_buf()))?;
    let reader = BufReader::new(file);

    let mut targets = IndexMap::new();
    for line in reader.lines() {
        let line = line?;
        let Some(name) = line.split_whitespace().next() else {
            continue;
        };
        let next = targets.len();
        targets.entry(name.to_string()).or_insert(next);
    }
    Ok(targets)
}

/// Write the per-target range report: a tab-separated table with one
/// column per haplotype holding the span of alignment start positions
/// observed on that haplotype's reference, `0` when unseen.
pub fn write_range_file(
    path: &Path,
    haplotypes: &[String],
    main_targets: &IndexMap<String, usize>,
    tid_ranges: &HashMap<String, (i64, i64)>,
    name_to_tid: &HashMap<String, String>,
) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .map_err(|e| EcError::Io(std::io::Error::other(e)))?;

    let mut header = vec!["#".to_string()];
    header.extend(haplotypes.iter().cloned());
    writer
        .write_record(&header)
        .map_err(|e| EcError::Io(std::io::Error::other(e)))?;

    for main_target in main_targets.keys() {
        let mut row = vec![main_target.clone()];
        for haplotype in haplotypes {
            let reference_name = if haplotype.is_empty() {
                main_target.clone()
            } else {
                format!("{main_target}_{haplotype}")
            };
            let span = name_to_tid
                .get(&reference_name)
                .and_then(|tid| tid_ranges.get(tid))
                .map(|(min, max)| max - min + 1)
                .unwrap_or(0);
            row.push(span.to_string());
        }
        writer
            .write_record(&row)
            .map_err(|e| EcError::Io(std::io::Error::other(e)))?;
    }
    writer
        .flush()
        .map_err(EcError::Io)?;
    Ok(())
}

/// Remove a file, ignoring every failure.
pub fn delete_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn targets_keep_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.txt");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "ENSMUST00000000003").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "ENSMUST00000000001\textra").unwrap();
        writeln!(file, "ENSMUST00000000003").unwrap();
        drop(file);

        let targets = parse_targets(&path).unwrap();
        assert_eq!(2, targets.len());
        assert_eq!(Some(0), targets.get("ENSMUST00000000003").copied());
        assert_eq!(Some(1), targets.get("ENSMUST00000000001").copied());
    }

    #[test]
    fn range_report_lists_spans_per_haplotype() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranges.tsv");

        let haplotypes = vec!["A".to_string(), "B".to_string()];
        let mut main_targets = IndexMap::new();
        main_targets.insert("T1".to_string(), 0);

        let mut name_to_tid = HashMap::new();
        name_to_tid.insert("T1_A".to_string(), "0".to_string());
        name_to_tid.insert("T1_B".to_string(), "1".to_string());

        let mut tid_ranges = HashMap::new();
        tid_ranges.insert("0".to_string(), (10, 40));

        write_range_file(&path, &haplotypes, &main_targets, &tid_ranges, &name_to_tid).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!("#\tA\tB", lines[0]);
        assert_eq!("T1\t31\t0", lines[1]);
    }
}
