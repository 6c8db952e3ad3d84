//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Fetch files published as pieces on interchangeable mirror sites.
///
/// Reads upstream metadata records (a JSON object or array) from the given
/// files, or from stdin when none are given, then downloads, joins and
/// verifies every file they describe.
#[derive(Parser, Debug)]
#[command(name = "mirrordl")]
#[command(author, version, about)]
pub struct Args {
    /// Metadata record files (JSON). Reads stdin when omitted.
    #[arg(value_name = "RECORDS")]
    pub records: Vec<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Maximum simultaneous piece transfers across all files (1-100) [default: 5]
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Attempts per piece before a source is abandoned (1-20) [default: 5]
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(1..=20))]
    pub retry_attempts: Option<u8>,

    /// Seconds to wait between attempts (0-300) [default: 5]
    #[arg(long, value_parser = clap::value_parser!(u16).range(0..=300))]
    pub retry_delay_secs: Option<u16>,

    /// Directory for finished files [default: .]
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Directory for in-progress pieces [default: working]
    #[arg(short = 'w', long)]
    pub working_dir: Option<PathBuf>,

    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Ignore the config file
    #[arg(long, conflicts_with = "config")]
    pub no_config: bool,
}
