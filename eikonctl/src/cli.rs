use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};
use eikon_qc_core::{
    config::{DEFAULT_MIN_SEQUENCE_LEN, SidecarMode},
    sidecar::QcResult,
    summary::DEFAULT_MAX_NOTE_LEN,
};

#[derive(Debug, Parser)]
#[command(
    name = "eikonctl",
    version,
    about = "QC sidecar crawler for media assets and frame sequences"
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct LoggingArgs {
    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long = "log", global = true, default_value = "info")]
    pub level: String,
    /// Only log warnings and errors
    #[arg(long, short, global = true)]
    pub quiet: bool,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Crawl roots, reconcile QC state and write sidecars
    Crawl(CrawlArgs),
    /// Print a human-readable summary of QC sidecars
    Summary(SummaryArgs),
    /// Remove sidecars, hash caches and .qc directories
    Clean(CleanArgs),
    /// Create a zero-byte fake image sequence for testing
    FakeSeq(FakeSeqArgs),
}

#[derive(Debug, Args)]
pub struct CrawlArgs {
    /// Root directories to crawl
    #[arg(required = true, num_args = 1..)]
    pub roots: Vec<PathBuf>,

    /// Operator recorded in sidecars (default: $USER, $USERNAME or "system")
    #[arg(long)]
    pub operator: Option<String>,

    /// Parallel workers per root (default: available CPUs, at least 4)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Minimum frames for a group to count as a sequence
    #[arg(long, default_value_t = DEFAULT_MIN_SEQUENCE_LEN)]
    pub min_seq: usize,

    /// Explicit tracker asset id; give once for all roots or once per root
    #[arg(long = "asset-id")]
    pub asset_ids: Vec<String>,

    /// Where sidecars live: inline, dot or subdir
    #[arg(long, default_value_t = SidecarMode::Subdir)]
    pub sidecar_mode: SidecarMode,

    /// Operator verdict (pass, fail or pending); rewrites every sidecar
    #[arg(long)]
    pub result: Option<QcResult>,

    /// Note stored with the verdict
    #[arg(long)]
    pub note: Option<String>,

    /// Decide sequence re-QC from frame-level changes instead of any hash change
    #[arg(long)]
    pub enable_mutation_detection: bool,

    /// Changed/added frames needed to count as a mutation (default: 1)
    #[arg(long, requires = "enable_mutation_detection")]
    pub mutation_threshold_frames: Option<u64>,

    /// Percentage of frames (0-100) that must change to count as a mutation
    #[arg(long, requires = "enable_mutation_detection")]
    pub mutation_threshold_percent: Option<f64>,

    /// Count removed frames toward the mutation thresholds
    #[arg(long, requires = "enable_mutation_detection")]
    pub mutation_count_removed: bool,

    /// Log changed, added and removed frame spans per sequence
    #[arg(long)]
    pub show_diff: bool,
}

#[derive(Debug, Args)]
pub struct SummaryArgs {
    /// Sidecar files or directories to scan
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<PathBuf>,

    /// Truncate notes longer than this (0 = no limit)
    #[arg(long, default_value_t = DEFAULT_MAX_NOTE_LEN)]
    pub max_note_len: usize,

    /// One compact entry per asset directory
    #[arg(long, short = 'd')]
    pub by_dir: bool,
}

#[derive(Debug, Args)]
pub struct CleanArgs {
    /// Root folder to clean
    pub root: PathBuf,

    /// List what would be removed without deleting anything
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("template").required(true).args(["like", "base"])))]
pub struct FakeSeqArgs {
    /// Sample file name to infer base, padding and extension from
    #[arg(long)]
    pub like: Option<String>,

    /// Base name of the frames
    #[arg(long)]
    pub base: Option<String>,

    /// Extension without the dot (ignored with --like)
    #[arg(long, default_value = "tif")]
    pub ext: String,

    /// Frame number padding (ignored with --like)
    #[arg(long, default_value_t = 6)]
    pub pad: usize,

    /// First frame (inclusive)
    #[arg(long)]
    pub start: u64,

    /// Last frame (inclusive)
    #[arg(long)]
    pub end: u64,

    /// Frame step
    #[arg(long, default_value_t = 1)]
    pub step: u64,

    /// Output directory
    #[arg(long, default_value = ".")]
    pub out: PathBuf,

    /// Print what would be created
    #[arg(long)]
    pub dry_run: bool,

    /// Bump the mtime of frames that already exist
    #[arg(long)]
    pub touch_existing: bool,
}
