//! # Error types for `ectools`
//!
//! Leaf modules return [`EcError`] so callers can tell the failure kinds
//! apart; the coordinators and the binary wrap these in `anyhow` errors
//! with added context.
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EcError {
    #[error("malformed BGZF block at offset {offset}: {reason}")]
    MalformedBgzf { offset: u64, reason: String },

    #[error("file {} is not a BAM file", .0.display())]
    NotBam(PathBuf),

    #[error("alignment file has no header information")]
    MissingHeader,

    #[error("unexpected target found in BAM file: {0}")]
    UnknownTarget(String),

    #[error("unable to parse haplotype from reference name {0}")]
    MissingHaplotypeSuffix(String),

    #[error("read name {0} carries no cell barcode")]
    MissingBarcode(String),

    #[error("missing file {}", .0.display())]
    MissingFile(PathBuf),

    #[error("alignment file error")]
    Hts(#[from] rust_htslib::errors::Error),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl EcError {
    pub(crate) fn malformed(offset: u64, reason: impl Into<String>) -> Self {
        EcError::MalformedBgzf {
            offset,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EcError>;
