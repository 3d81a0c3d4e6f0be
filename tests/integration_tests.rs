use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use rust_htslib::bam::{self, Read};
use tempfile::TempDir;

use ectools::convert::{self, ConvertOptions};
use ectools::multisample::{self, MultisampleOptions};
use ectools::{aggregate, bgzf, chunk, serialize};

/// Write a BAM file with the given references and SAM-formatted records.
fn write_bam(path: &Path, references: &[(&str, u64)], sam_lines: &[String]) {
    let mut header = bam::Header::new();
    for (name, length) in references {
        let mut record = bam::header::HeaderRecord::new(b"SQ");
        record.push_tag(b"SN", *name);
        record.push_tag(b"LN", *length);
        header.push_record(&record);
    }
    let header_view = bam::HeaderView::from_header(&header);
    let mut writer = bam::Writer::from_path(path, &header, bam::Format::Bam).unwrap();
    for line in sam_lines {
        let record = bam::Record::from_sam(&header_view, line.as_bytes()).unwrap();
        writer.write(&record).unwrap();
    }
}

fn sam_line(qname: &str, flag: u16, rname: &str, pos: i64) -> String {
    format!("{qname}\t{flag}\t{rname}\t{pos}\t60\t10M\t*\t0\t0\tACGTACGTAC\tFFFFFFFFFF")
}

fn paired_sam_line(qname: &str, flag: u16, rname: &str, pos: i64, mate_pos: i64) -> String {
    format!("{qname}\t{flag}\t{rname}\t{pos}\t60\t10M\t=\t{mate_pos}\t0\tACGTACGTAC\tFFFFFFFFFF")
}

/// All alignments of a BAM in stream order as `(qname, tid, pos)`.
fn read_alignments(path: &Path) -> Vec<(String, i32, i64)> {
    let mut reader = bam::Reader::from_path(path).unwrap();
    let mut record = bam::Record::new();
    let mut alignments = Vec::new();
    while let Some(res) = reader.read(&mut record) {
        res.unwrap();
        alignments.push((
            String::from_utf8_lossy(record.qname()).into_owned(),
            record.tid(),
            record.pos(),
        ));
    }
    alignments
}

/// A BAM large enough to span several BGZF blocks: 20 main targets with
/// two haplotypes each and 3000 reads, some of them multimapping.
fn write_large_bam(path: &Path) {
    let names: Vec<String> = (0..20)
        .flat_map(|i| {
            ["A", "B"]
                .iter()
                .map(move |hap| format!("ENSMUST{i:05}_{hap}"))
        })
        .collect();
    let references: Vec<(&str, u64)> = names.iter().map(|n| (n.as_str(), 1000)).collect();

    let mut lines = Vec::new();
    for i in 0..3000usize {
        let qname = format!("READ{i:05}");
        let main = i % 20;
        let pos = 1 + (i % 100) as i64;
        lines.push(sam_line(&qname, 0, &format!("ENSMUST{main:05}_A"), pos));
        if i % 3 == 0 {
            lines.push(sam_line(&qname, 0, &format!("ENSMUST{main:05}_B"), pos));
        }
        if i % 7 == 0 {
            let other = (main + 1) % 20;
            lines.push(sam_line(&qname, 0, &format!("ENSMUST{other:05}_A"), pos));
        }
    }
    write_bam(path, &references, &lines);
}

fn ec_counts(results: &ectools::ec::ConvertResults) -> HashMap<String, u32> {
    results
        .ec
        .iter()
        .map(|(key, count)| (key.to_string(), count))
        .collect()
}

#[test]
fn header_ends_on_a_block_boundary() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("input.bam");
    write_large_bam(&bam_path);

    let header_size = chunk::header_size(&bam_path).unwrap();
    assert!(header_size > 0);

    let blocks = bgzf::block_index(&bam_path).unwrap();
    assert!(blocks.iter().any(|b| b.offset == header_size));
    // large input spans several data blocks
    assert!(blocks.len() > 3, "expected several blocks, got {}", blocks.len());
}

#[test]
fn split_preserves_the_alignment_stream() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("input.bam");
    write_large_bam(&bam_path);
    let expected = read_alignments(&bam_path);

    convert::split_bam(&bam_path, 3, true, Some(dir.path())).unwrap();

    let mut observed = Vec::new();
    let mut names_per_chunk: Vec<HashSet<String>> = Vec::new();
    for idx in 0..3 {
        let chunk_path = dir.path().join(format!("input_{idx}.bam"));
        assert!(bgzf::ends_with_eof(&chunk_path).unwrap());
        let alignments = read_alignments(&chunk_path);
        names_per_chunk.push(alignments.iter().map(|a| a.0.clone()).collect());
        observed.extend(alignments);
    }

    assert_eq!(expected, observed);

    // no read name is shared between two chunks
    for i in 0..names_per_chunk.len() {
        for j in i + 1..names_per_chunk.len() {
            assert!(names_per_chunk[i].is_disjoint(&names_per_chunk[j]));
        }
    }
}

#[test]
fn chunked_counts_match_the_whole_file() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("input.bam");
    write_large_bam(&bam_path);

    let main_targets = IndexMap::new();
    let whole =
        convert::convert_results(&bam_path, 1, &main_targets, false, dir.path()).unwrap();
    let chunked =
        convert::convert_results(&bam_path, 4, &main_targets, false, dir.path()).unwrap();

    assert_eq!(ec_counts(&whole), ec_counts(&chunked));
    assert_eq!(whole.haplotypes, chunked.haplotypes);
    assert_eq!(whole.unique_reads, chunked.unique_reads);
    assert_eq!(whole.target_to_main, chunked.target_to_main);
    assert_eq!(whole.valid_alignments, chunked.valid_alignments);
    assert_eq!(3000, whole.unique_reads.len());
}

#[test]
fn boundary_split_keeps_reads_together() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("tiny.bam");
    let references = [("T1_A", 1000), ("T2_A", 1000)];
    let lines = vec![
        sam_line("R1", 0, "T1_A", 10),
        sam_line("R1", 0, "T2_A", 20),
        sam_line("R1", 0, "T1_A", 30),
        sam_line("R2", 0, "T1_A", 40),
        sam_line("R2", 0, "T2_A", 50),
    ];
    write_bam(&bam_path, &references, &lines);

    convert::split_bam(&bam_path, 2, true, Some(dir.path())).unwrap();

    let chunk0 = read_alignments(&dir.path().join("tiny_0.bam"));
    let chunk1 = read_alignments(&dir.path().join("tiny_1.bam"));

    let names0: Vec<&str> = chunk0.iter().map(|a| a.0.as_str()).collect();
    let names1: Vec<&str> = chunk1.iter().map(|a| a.0.as_str()).collect();
    assert_eq!(vec!["R1", "R1", "R1"], names0);
    assert_eq!(vec!["R2", "R2"], names1);
}

#[test]
fn multimapped_read_canonicalizes_its_targets() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("multi.bam");
    let names: Vec<String> = (0..11).map(|i| format!("G{i:02}_A")).collect();
    let references: Vec<(&str, u64)> = names.iter().map(|n| (n.as_str(), 1000)).collect();

    // alignments to target ids 5, 2, 10, 2 in that order
    let lines = vec![
        sam_line("R1", 0, "G05_A", 10),
        sam_line("R1", 0, "G02_A", 10),
        sam_line("R1", 0, "G10_A", 10),
        sam_line("R1", 0, "G02_A", 50),
    ];
    write_bam(&bam_path, &references, &lines);

    let main_targets = IndexMap::new();
    let results = aggregate::collect_from_bam(&bam_path, &main_targets, false).unwrap();

    assert_eq!(1, results.ec.len());
    assert_eq!(Some(1), results.ec.get("10,2,5"));
    assert_eq!(1, results.duplicate_targets as usize);
}

#[test]
fn eof_repair_restores_a_readable_file() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("repair.bam");
    let references = [("T1_A", 1000)];
    let lines = vec![sam_line("R1", 0, "T1_A", 10)];
    write_bam(&bam_path, &references, &lines);
    let expected = read_alignments(&bam_path);

    bgzf::truncate_eof(&bam_path).unwrap();
    assert!(!bgzf::ends_with_eof(&bam_path).unwrap());
    let truncated_size = std::fs::metadata(&bam_path).unwrap().len();

    bgzf::fix_bam(&bam_path).unwrap();
    assert_eq!(
        truncated_size + 28,
        std::fs::metadata(&bam_path).unwrap().len()
    );
    assert_eq!(expected, read_alignments(&bam_path));
}

const V1_REFERENCES: &[(&str, u64)] = &[
    ("ENSMUST1_A", 1000),
    ("ENSMUST1_B", 1000),
    ("ENSMUST1_C", 1000),
    ("ENSMUST2_A", 1000),
    ("ENSMUST2_B", 1000),
    ("ENSMUST2_C", 1000),
];

fn write_v1_fixture(bam_path: &Path) {
    // RA and RB each hit ENSMUST1 on haplotypes A and C; RC hits
    // ENSMUST2 on haplotype B only
    let lines = vec![
        sam_line("RA", 0, "ENSMUST1_A", 10),
        sam_line("RA", 0, "ENSMUST1_C", 10),
        sam_line("RB", 0, "ENSMUST1_A", 20),
        sam_line("RB", 0, "ENSMUST1_C", 20),
        sam_line("RC", 0, "ENSMUST2_B", 30),
    ];
    write_bam(bam_path, V1_REFERENCES, &lines);
}

#[test]
fn v1_output_round_trips() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("input.bam");
    write_v1_fixture(&bam_path);

    let ec_path = dir.path().join("output.ec");
    let options = ConvertOptions {
        num_chunks: 1,
        ..Default::default()
    };
    convert::convert(&bam_path, &ec_path, false, &options).unwrap();

    let contents = serialize::read_v1(&ec_path).unwrap();
    assert_eq!(
        vec!["ENSMUST1".to_string(), "ENSMUST2".to_string()],
        contents.targets
    );
    assert_eq!(
        vec!["A".to_string(), "B".to_string(), "C".to_string()],
        contents.haplotypes
    );
    assert_eq!(vec![2, 1], contents.counts);
    // haplotype incidence [1,0,1] reads as 5, [0,1,0] as 2
    assert_eq!(vec![(0, 0, 5), (1, 1, 2)], contents.mappings);
}

#[test]
fn target_file_fixes_indices_and_rejects_unknowns() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("input.bam");
    write_v1_fixture(&bam_path);

    // reversed order relative to the sorted default
    let targets_path = dir.path().join("targets.txt");
    std::fs::write(&targets_path, "ENSMUST2\nENSMUST1\n").unwrap();

    let ec_path = dir.path().join("output.ec");
    let options = ConvertOptions {
        num_chunks: 1,
        targets: Some(targets_path),
        ..Default::default()
    };
    convert::convert(&bam_path, &ec_path, false, &options).unwrap();
    let contents = serialize::read_v1(&ec_path).unwrap();
    assert_eq!(
        vec!["ENSMUST2".to_string(), "ENSMUST1".to_string()],
        contents.targets
    );
    assert_eq!(vec![(0, 1, 5), (1, 0, 2)], contents.mappings);

    // a target list that does not cover the file is fatal
    let partial_path = dir.path().join("partial.txt");
    std::fs::write(&partial_path, "ENSMUST1\n").unwrap();
    let options = ConvertOptions {
        num_chunks: 1,
        targets: Some(partial_path),
        ..Default::default()
    };
    assert!(convert::convert(&bam_path, &ec_path, false, &options).is_err());
}

#[test]
fn suffixless_reference_is_logged_not_fatal() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("input.bam");
    let references = [("T1_A", 1000), ("PLAIN", 1000)];
    let lines = vec![
        sam_line("R1", 0, "T1_A", 10),
        sam_line("R2", 0, "PLAIN", 20),
    ];
    write_bam(&bam_path, &references, &lines);

    let targets_path = dir.path().join("targets.txt");
    std::fs::write(&targets_path, "T1\n").unwrap();

    // the affected chunk is dropped with a logged error, the run finishes
    let ec_path = dir.path().join("output.ec");
    let options = ConvertOptions {
        num_chunks: 1,
        targets: Some(targets_path),
        ..Default::default()
    };
    convert::convert(&bam_path, &ec_path, false, &options).unwrap();

    let contents = serialize::read_v1(&ec_path).unwrap();
    assert_eq!(vec!["T1".to_string()], contents.targets);
    assert!(contents.counts.is_empty());
    assert!(contents.mappings.is_empty());
}

#[test]
fn emase_output_is_created() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("input.bam");
    write_v1_fixture(&bam_path);

    let emase_path = dir.path().join("output.apm");
    let options = ConvertOptions {
        num_chunks: 1,
        ..Default::default()
    };
    convert::convert(&bam_path, &emase_path, true, &options).unwrap();

    let bytes = std::fs::read(&emase_path).unwrap();
    assert_eq!(&[0x1f, 0x8b], &bytes[..2]);
}

const MULTI_REFERENCES: &[(&str, u64)] = &[
    ("T1_A", 100),
    ("T1_B", 150),
    ("T2_A", 200),
    ("T2_B", 250),
];

/// Two samples: barcode AAA contributes 7 reads on class `0,1`, barcode
/// BBB 2 reads on class `2`. One paired read-2 record must be ignored.
fn write_multisample_dir(dir: &Path) -> PathBuf {
    let bam_dir = dir.join("bams");
    std::fs::create_dir(&bam_dir).unwrap();

    let mut sample1 = Vec::new();
    for i in 0..4 {
        let qname = format!("RA{i}|||x|||AAA|||y");
        sample1.push(sam_line(&qname, 0, "T1_A", 10 + i));
        sample1.push(sam_line(&qname, 0, "T1_B", 30 + i));
    }
    for i in 0..2 {
        let qname = format!("RB{i}|||x|||BBB|||y");
        sample1.push(sam_line(&qname, 0, "T2_A", 50 + i * 5));
    }
    // paired read 2: skipped by the mate policy
    sample1.push(paired_sam_line("RP|||x|||AAA|||y", 131, "T1_A", 15, 5));
    write_bam(&bam_dir.join("sample1.bam"), MULTI_REFERENCES, &sample1);

    let mut sample2 = Vec::new();
    for i in 0..3 {
        let qname = format!("RC{i}|||x|||AAA|||y");
        sample2.push(sam_line(&qname, 0, "T1_A", 20 + i));
        sample2.push(sam_line(&qname, 0, "T1_B", 40 + i));
    }
    write_bam(&bam_dir.join("sample2.bam"), MULTI_REFERENCES, &sample2);

    bam_dir
}

#[test]
fn multisample_output_filters_low_count_barcodes() {
    let dir = TempDir::new().unwrap();
    let bam_dir = write_multisample_dir(dir.path());

    let ec_path = dir.path().join("output.ec.gz");
    let range_path = dir.path().join("ranges.tsv");
    let options = MultisampleOptions {
        min_count: 3,
        num_processes: 2,
        range_file: Some(range_path.clone()),
    };
    multisample::convert_multisample(&bam_dir, Some(&ec_path), None, &options).unwrap();

    let contents = serialize::read_v2(&ec_path).unwrap();
    assert_eq!(vec!["A".to_string(), "B".to_string()], contents.haplotypes);
    assert_eq!(
        vec![
            ("T1".to_string(), vec![100, 150]),
            ("T2".to_string(), vec![200, 250]),
        ],
        contents.targets
    );
    // BBB (2 reads) is below the threshold, its only class disappears
    assert_eq!(vec!["AAA".to_string()], contents.barcodes);

    // one surviving class covering T1 on both haplotypes
    assert_eq!(vec![0, 1], contents.mask_matrix.indptr);
    assert_eq!(vec![0], contents.mask_matrix.indices);
    assert_eq!(vec![3], contents.mask_matrix.data);

    // seven reads for AAA
    assert_eq!(vec![0, 1], contents.count_matrix.indptr);
    assert_eq!(vec![0], contents.count_matrix.indices);
    assert_eq!(vec![7], contents.count_matrix.data);

    // range report covers all observed alignments, unseen haplotypes are 0
    let report = std::fs::read_to_string(&range_path).unwrap();
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!("#\tA\tB", lines[0]);
    assert_eq!("T1\t13\t13", lines[1]);
    assert_eq!("T2\t6\t0", lines[2]);
}

#[test]
fn multisample_counts_are_kept_per_barcode() {
    let dir = TempDir::new().unwrap();
    let bam_dir = write_multisample_dir(dir.path());

    let ec_path = dir.path().join("output.ec.gz");
    let emase_path = dir.path().join("output.apm");
    let options = MultisampleOptions::default();
    multisample::convert_multisample(&bam_dir, Some(&ec_path), Some(&emase_path), &options)
        .unwrap();

    let contents = serialize::read_v2(&ec_path).unwrap();
    assert_eq!(
        vec!["AAA".to_string(), "BBB".to_string()],
        contents.barcodes
    );

    // class 0 ("0,1") belongs to AAA, class 1 ("2") to BBB
    assert_eq!(vec![0, 1, 2], contents.count_matrix.indptr);
    assert_eq!(vec![0, 1], contents.count_matrix.indices);
    assert_eq!(vec![7, 2], contents.count_matrix.data);

    // masks: T1 on A+B for class 0, T2 on A only for class 1
    assert_eq!(vec![0, 1, 2], contents.mask_matrix.indptr);
    assert_eq!(vec![0, 1], contents.mask_matrix.indices);
    assert_eq!(vec![3, 1], contents.mask_matrix.data);

    assert!(emase_path.is_file());
}

#[test]
fn multisample_rejects_truncated_inputs() {
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("broken.bam");
    write_bam(
        &bam_path,
        MULTI_REFERENCES,
        &[sam_line("R1|||x|||AAA|||y", 0, "T1_A", 10)],
    );
    bgzf::truncate_eof(&bam_path).unwrap();

    let result = aggregate::collect_cell_counts(&bam_path, false);
    assert!(result.is_err());
}

#[test]
fn barcode_is_taken_from_the_read_name(){
    let dir = TempDir::new().unwrap();
    let bam_path = dir.path().join("single.bam");
    write_bam(
        &bam_path,
        MULTI_REFERENCES,
        &[sam_line("R1|||x|||CR_ACGT|||rest", 0, "T1_A", 10)],
    );

    let results = aggregate::collect_cell_counts(&bam_path, false).unwrap();
    assert_eq!(1, results.ec.len());
    let cells = results.ec.get("0").unwrap();
    assert_eq!(Some(&1), cells.get("CR_ACGT"));
}
