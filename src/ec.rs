//! # Equivalence classes
//!
//! An equivalence class is the set of references a read maps to,
//! canonicalized as the comma-joined, lexicographically sorted list of its
//! distinct target-id strings. Tables here preserve insertion order: the
//! position at which a key first appears is its dense index in the
//! serialized output.
use std::collections::HashMap;

use indexmap::IndexMap;
use log::info;

/// Canonical class key for the accumulated target ids of one read.
///
/// Target ids are compared as *strings* (`"10" < "2"`), which is the sort
/// order the on-disk formats are defined over.
pub fn canonical_key(target_ids: &[String]) -> String {
    let mut unique: Vec<&str> = Vec::with_capacity(target_ids.len());
    for tid in target_ids {
        if !unique.contains(&tid.as_str()) {
            unique.push(tid);
        }
    }
    unique.sort_unstable();
    unique.join(",")
}

/// Insertion-ordered `class key → read count` table.
#[derive(Debug, Default, Clone)]
pub struct EcTable {
    counts: IndexMap<String, u32>,
}

impl EcTable {
    pub fn observe(&mut self, key: String) {
        self.add(key, 1);
    }

    pub fn add(&mut self, key: String, count: u32) {
        *self.counts.entry(key).or_insert(0) += count;
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<u32> {
        self.counts.get(key).copied()
    }

    /// Dense index of `key`, i.e. its insertion position.
    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.counts.get_index_of(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Fold `other` into `self`: known keys add counts, new keys take the
    /// next dense index.
    pub fn absorb(&mut self, other: EcTable) {
        for (key, count) in other.counts {
            self.add(key, count);
        }
    }
}

/// Insertion-ordered `class key → (cell barcode → read count)` table.
#[derive(Debug, Default, Clone)]
pub struct CellEcTable {
    counts: IndexMap<String, IndexMap<String, u32>>,
}

impl CellEcTable {
    pub fn observe(&mut self, key: String, barcode: String) {
        self.add(key, barcode, 1);
    }

    pub fn add(&mut self, key: String, barcode: String, count: u32) {
        *self
            .counts
            .entry(key)
            .or_default()
            .entry(barcode)
            .or_insert(0) += count;
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&IndexMap<String, u32>> {
        self.counts.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &IndexMap<String, u32>)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total count of `key` across all barcodes.
    pub fn total(&self, key: &str) -> u64 {
        self.counts
            .get(key)
            .map(|cells| cells.values().map(|c| u64::from(*c)).sum())
            .unwrap_or(0)
    }
}

/// Partial result of aggregating one sub-BAM in single-sample mode.
#[derive(Debug, Default)]
pub struct ConvertResults {
    pub ec: EcTable,
    /// Sorted haplotype suffixes observed so far.
    pub haplotypes: Vec<String>,
    /// Decimal target id → main target name.
    pub target_to_main: HashMap<String, String>,
    /// Decimal target id → number of alignments observed on it.
    pub unique_tids: HashMap<String, u32>,
    /// Normalized read name → number of alignments carrying it.
    pub unique_reads: HashMap<String, u32>,
    pub read_switches: u64,
    pub duplicate_targets: u64,
    pub all_alignments: u64,
    pub valid_alignments: u64,
}

impl ConvertResults {
    pub fn absorb(&mut self, other: ConvertResults) {
        self.ec.absorb(other.ec);

        let mut haplotypes = std::mem::take(&mut self.haplotypes);
        for hap in other.haplotypes {
            if !haplotypes.contains(&hap) {
                haplotypes.push(hap);
            }
        }
        haplotypes.sort_unstable();
        self.haplotypes = haplotypes;

        for (tid, main) in other.target_to_main {
            self.target_to_main.entry(tid).or_insert(main);
        }
        for (tid, count) in other.unique_tids {
            *self.unique_tids.entry(tid).or_insert(0) += count;
        }
        for (name, count) in other.unique_reads {
            *self.unique_reads.entry(name).or_insert(0) += count;
        }
        self.read_switches += other.read_switches;
        self.duplicate_targets += other.duplicate_targets;
        self.all_alignments += other.all_alignments;
        self.valid_alignments += other.valid_alignments;
    }
}

/// Partial result of aggregating one BAM in multi-sample mode.
#[derive(Debug, Default)]
pub struct CellConvertResults {
    pub ec: CellEcTable,
    pub unique_reads: HashMap<String, u32>,
    /// Decimal target id → (min, max) alignment start observed.
    pub tid_ranges: HashMap<String, (i64, i64)>,
    pub read_switches: u64,
    pub duplicate_targets: u64,
    pub all_alignments: u64,
    pub valid_alignments: u64,
}

/// Globally merged multi-sample state.
///
/// Barcode dense indices are assigned on first insertion and only change
/// through [`MergedCellResults::filter_min_count`].
#[derive(Debug, Default)]
pub struct MergedCellResults {
    pub ec: CellEcTable,
    pub barcodes: IndexMap<String, usize>,
    pub barcode_totals: IndexMap<String, u64>,
    pub ec_totals: IndexMap<String, u64>,
    pub tid_ranges: HashMap<String, (i64, i64)>,
    pub all_alignments: u64,
    pub valid_alignments: u64,
}

impl MergedCellResults {
    pub fn absorb(&mut self, part: CellConvertResults) {
        for (key, cells) in part.ec.counts {
            for (barcode, count) in cells {
                let next = self.barcodes.len();
                self.barcodes.entry(barcode.clone()).or_insert(next);
                *self.barcode_totals.entry(barcode.clone()).or_insert(0) += u64::from(count);
                *self.ec_totals.entry(key.clone()).or_insert(0) += u64::from(count);
                self.ec.add(key.clone(), barcode, count);
            }
        }
        for (tid, (min, max)) in part.tid_ranges {
            self.tid_ranges
                .entry(tid)
                .and_modify(|range| {
                    range.0 = range.0.min(min);
                    range.1 = range.1.max(max);
                })
                .or_insert((min, max));
        }
        self.all_alignments += part.all_alignments;
        self.valid_alignments += part.valid_alignments;
    }

    /// Drop barcodes whose total count is below `min_count`, then drop
    /// classes left without any barcode. Surviving barcodes and classes
    /// are re-indexed in their original insertion order.
    pub fn filter_min_count(&mut self, min_count: u64) {
        if min_count == 0 {
            return;
        }
        info!("filtering {} barcodes", self.barcodes.len());

        let mut barcodes = IndexMap::new();
        for (barcode, total) in &self.barcode_totals {
            if *total >= min_count {
                let next = barcodes.len();
                barcodes.entry(barcode.clone()).or_insert(next);
            }
        }

        let mut ec = CellEcTable::default();
        let mut ec_totals = IndexMap::new();
        for (key, cells) in &self.ec.counts {
            let mut total = 0u64;
            for (barcode, count) in cells {
                if barcodes.contains_key(barcode) {
                    ec.add(key.clone(), barcode.clone(), *count);
                    total += u64::from(*count);
                }
            }
            if total > 0 {
                ec_totals.insert(key.clone(), total);
            }
        }

        self.barcodes = barcodes;
        self.ec = ec;
        self.ec_totals = ec_totals;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_target_id_strings() {
        let tids: Vec<String> = ["5", "2", "10", "2"].iter().map(|s| s.to_string()).collect();
        assert_eq!("10,2,5", canonical_key(&tids));
    }

    #[test]
    fn keys_are_idempotent_under_recanonicalization() {
        let tids: Vec<String> = ["7", "31", "7", "0"].iter().map(|s| s.to_string()).collect();
        let key = canonical_key(&tids);
        let again: Vec<String> = key.split(',').map(|s| s.to_string()).collect();
        assert_eq!(key, canonical_key(&again));
    }

    #[test]
    fn table_indices_are_stable_across_merges() {
        let mut left = EcTable::default();
        left.observe("1,2".into());
        left.observe("3".into());

        let mut right = EcTable::default();
        right.observe("3".into());
        right.observe("4,5".into());
        right.observe("1,2".into());

        left.absorb(right);
        assert_eq!(Some(0), left.index_of("1,2"));
        assert_eq!(Some(1), left.index_of("3"));
        assert_eq!(Some(2), left.index_of("4,5"));
        assert_eq!(Some(2), left.get("1,2"));
        assert_eq!(Some(2), left.get("3"));
    }

    #[test]
    fn merged_counts_are_sums_of_partials() {
        let mut merged = MergedCellResults::default();

        let mut a = CellConvertResults::default();
        a.ec.observe("1,2".into(), "AAA".into());
        a.ec.observe("1,2".into(), "AAA".into());
        a.ec.observe("3".into(), "BBB".into());
        merged.absorb(a);

        let mut b = CellConvertResults::default();
        b.ec.observe("1,2".into(), "BBB".into());
        b.ec.observe("1,2".into(), "AAA".into());
        merged.absorb(b);

        assert_eq!(4, merged.ec.total("1,2"));
        assert_eq!(1, merged.ec.total("3"));
        assert_eq!(Some(&3), merged.ec.get("1,2").unwrap().get("AAA"));
        assert_eq!(Some(0), merged.barcodes.get("AAA").copied());
        assert_eq!(Some(1), merged.barcodes.get("BBB").copied());
    }

    #[test]
    fn min_count_filter_drops_barcodes_and_empty_classes() {
        let mut merged = MergedCellResults::default();
        let mut part = CellConvertResults::default();
        for _ in 0..7 {
            part.ec.observe("1,2".into(), "AAA".into());
        }
        part.ec.observe("9".into(), "BBB".into());
        part.ec.observe("9".into(), "BBB".into());
        merged.absorb(part);

        merged.filter_min_count(3);

        assert_eq!(1, merged.barcodes.len());
        assert_eq!(Some(0), merged.barcodes.get("AAA").copied());
        assert_eq!(1, merged.ec.len());
        assert!(merged.ec.get("9").is_none());
        assert_eq!(7, merged.ec.total("1,2"));
    }

    #[test]
    fn range_merge_takes_min_and_max() {
        let mut merged = MergedCellResults::default();

        let mut a = CellConvertResults::default();
        a.tid_ranges.insert("4".into(), (100, 250));
        merged.absorb(a);

        let mut b = CellConvertResults::default();
        b.tid_ranges.insert("4".into(), (50, 180));
        b.tid_ranges.insert("7".into(), (10, 10));
        merged.absorb(b);

        assert_eq!(Some(&(50, 250)), merged.tid_ranges.get("4"));
        assert_eq!(Some(&(10, 10)), merged.tid_ranges.get("7"));
    }
}
