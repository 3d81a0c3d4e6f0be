use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::{Path, PathBuf};

use ectools::cli::{Cli, Commands};
use ectools::convert::{self, ConvertOptions};
use ectools::multisample::{self, MultisampleOptions};

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.setup_logging();

    match &cli.command {
        Commands::Split(args) => convert::split_bam(
            Path::new(&args.bam_file),
            args.number,
            args.boundary,
            args.directory.as_deref().map(Path::new),
        ),
        Commands::Bam2ec(args) => convert::convert(
            Path::new(&args.bam_file),
            Path::new(&args.output_file),
            false,
            &convert_options(args),
        ),
        Commands::Bam2emase(args) => convert::convert(
            Path::new(&args.bam_file),
            Path::new(&args.output_file),
            true,
            &convert_options(args),
        ),
        Commands::Bam2ecMultisample(args) => multisample::convert_multisample(
            Path::new(&args.bam_dir),
            Some(Path::new(&args.ec_file)),
            args.emase.as_deref().map(Path::new),
            &MultisampleOptions {
                min_count: args.min_count,
                num_processes: args.processes,
                range_file: args.range.as_ref().map(PathBuf::from),
            },
        ),
        Commands::Emase2ec(args) => {
            info!(
                "emase2ec is not yet implemented ({} -> {})",
                args.input_file, args.output_file
            );
            Ok(())
        }
        Commands::Ec2emase(args) => {
            info!(
                "ec2emase is not yet implemented ({} -> {})",
                args.input_file, args.output_file
            );
            Ok(())
        }
    }
}

fn convert_options(args: &ectools::cli::ConvertArgs) -> ConvertOptions {
    ConvertOptions {
        num_chunks: args.chunks,
        targets: args.targets.as_ref().map(PathBuf::from),
        temp_dir: args.directory.as_ref().map(PathBuf::from),
    }
}
