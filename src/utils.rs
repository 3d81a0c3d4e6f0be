//! # Root for utility functions in `ectools`
//!
//! This top-level module contains miscellaneous utility functions,
//! the sub-modules contain functions related to specific functionality.
use log::LevelFilter;

pub mod io_utils;

/// Interpret a 0/1 incidence list as a binary number, first element most
/// significant.
///
/// # Examples
///
/// ```
/// assert_eq!(5, ectools::utils::bits_to_int(&[1, 0, 1]));
/// assert_eq!(0, ectools::utils::bits_to_int(&[]));
/// ```
pub fn bits_to_int(bits: &[u8]) -> i32 {
    bits.iter().fold(0, |acc, &bit| (acc << 1) | i32::from(bit))
}

/// Interpret a 0/1 incidence list with element `h` contributing `2^h`.
///
/// # Examples
///
/// ```
/// assert_eq!(5, ectools::utils::bits_to_int_lsb(&[1, 0, 1]));
/// assert_eq!(2, ectools::utils::bits_to_int_lsb(&[0, 1]));
/// ```
pub fn bits_to_int_lsb(bits: &[u8]) -> i32 {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (h, &bit)| acc | (i32::from(bit) << h))
}

/// Map the number of `-v` occurrences to a log level filter.
pub fn verbosity_filter(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// File stem and extension for naming derived files.
///
/// # Examples
///
/// ```
/// let (stem, ext) = ectools::utils::stem_and_extension("./path/to/alignment.bam").unwrap();
/// assert_eq!("alignment", stem);
/// assert_eq!("bam", ext);
/// ```
pub fn stem_and_extension(filepath: &str) -> Option<(String, String)> {
    let path = std::path::Path::new(filepath);
    let stem = path.file_stem()?.to_str()?.to_string();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_string();
    Some((stem, ext))
}
