//! # Command line interface for `ectools`
use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};

use crate::utils;

#[derive(Parser)]
#[command(
    name = "ectools",
    author,
    version,
    about = "Convert aligned reads into equivalence-class files",
    long_about = None,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// The more times listed, the more output
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl Cli {
    /// Initialize logging from the number of `-v` occurrences.
    pub fn setup_logging(&self) {
        env_logger::Builder::new()
            .filter_level(utils::verbosity_filter(self.verbose))
            .init();
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Split a BAM file into many
    Split(SplitArgs),
    /// Convert a BAM file to an EC file
    Bam2ec(ConvertArgs),
    /// Convert a directory of BAM files to a multisample EC file
    Bam2ecMultisample(MultisampleArgs),
    /// Convert a BAM file to an EMASE file
    Bam2emase(ConvertArgs),
    /// Convert an EMASE file to an EC file (not yet implemented)
    Emase2ec(RoundTripArgs),
    /// Convert an EC file to an EMASE file (not yet implemented)
    Ec2emase(RoundTripArgs),
}

#[derive(Args)]
pub struct SplitArgs {
    /// BAM file to split
    pub bam_file: String,

    /// Number of files to split into
    #[arg(value_parser = number_in_range)]
    pub number: usize,

    /// Make sure each output file contains whole reads
    #[arg(short, long)]
    pub boundary: bool,

    /// Output directory, defaults to the input file's directory
    #[arg(short, long)]
    pub directory: Option<String>,
}

#[derive(Args)]
pub struct ConvertArgs {
    /// BAM file to convert
    pub bam_file: String,

    /// Output file
    pub output_file: String,

    /// Number of chunks to process, defaults to the number of CPUs
    #[arg(short, long, default_value_t = 0)]
    pub chunks: usize,

    /// Target file, one main target per line
    #[arg(short, long)]
    pub targets: Option<String>,

    /// Temp directory, defaults to the output file's directory
    #[arg(short, long)]
    pub directory: Option<String>,
}

#[derive(Args)]
pub struct MultisampleArgs {
    /// Directory containing the per-sample BAM files
    pub bam_dir: String,

    /// Output EC file
    pub ec_file: String,

    /// Also write an EMASE file
    #[arg(short, long)]
    pub emase: Option<String>,

    /// Keep only cell barcodes with at least this many reads
    #[arg(short, long, default_value_t = 0)]
    pub min_count: u64,

    /// Number of worker threads, defaults to one per CPU
    #[arg(short, long, default_value_t = 0)]
    pub processes: usize,

    /// Write a per-target range report to this file
    #[arg(short, long)]
    pub range: Option<String>,
}

#[derive(Args)]
pub struct RoundTripArgs {
    /// Input file
    pub input_file: String,

    /// Output file
    pub output_file: String,
}

fn number_in_range(s: &str) -> Result<usize> {
    let number: usize = s
        .parse()
        .context("Could not parse value passed to number to integer")?;
    if number < 1 {
        bail!("number must be at least 1");
    }
    Ok(number)
}
