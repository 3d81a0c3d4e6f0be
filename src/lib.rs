//! # ectools
//!
//! Converts aligned sequencing reads (BAM files) into a compact
//! equivalence-class representation for downstream allele-specific
//! expression analysis. A BAM file is partitioned on BGZF block
//! boundaries into self-contained chunks that workers decode in
//! parallel; each worker groups alignments by read name and tallies the
//! set of references every read maps to; the partial tables are merged
//! and written as a binary EC file or a property matrix.
pub mod aggregate;
pub mod apm;
pub mod bgzf;
pub mod chunk;
pub mod cli;
pub mod convert;
pub mod ec;
pub mod error;
pub mod multisample;
pub mod serialize;
pub mod sparse;
pub mod splice;
pub mod utils;

pub use error::{EcError, Result};
