//! `scrub` subcommand arguments (spec.md §4.3, §6 CLI surface).

use clap::{Args, Subcommand};

#[derive(Debug, Subcommand)]
pub enum ScrubCommand {
    /// Start a scrub run (spec.md §4.3 "Start algorithm").
    Start(ScrubStartArgs),
    /// Cancel the running scrub (spec.md §4.3 "Cancel").
    Cancel(ScrubTargetArgs),
    /// Resume a canceled/unfinished scrub (spec.md §4.3 "Resume").
    Resume(ScrubStartArgs),
    /// Print per-device or filesystem-wide progress (spec.md §4.3 "Status").
    Status(ScrubTargetArgs),
    /// Read or set the per-device throughput ceiling (spec.md §4.3 "Limit").
    Limit(ScrubLimitArgs),
}

#[derive(Debug, Args)]
pub struct ScrubTargetArgs {
    /// Mount point of the target filesystem.
    pub path: String,
}

#[derive(Debug, Args)]
pub struct ScrubStartArgs {
    pub path: String,

    /// Start even though the status file reports a running scrub, as long
    /// as the kernel driver confirms nothing is actually in-kernel
    /// (spec.md §4.3 step 1).
    #[arg(long)]
    pub force: bool,

    /// Detach into the background after spawning workers (spec.md §4.3
    /// step 6). The daemonization itself happens in the CLI entry point,
    /// not the controller (see `scrub::start`'s doc comment).
    #[arg(short, long)]
    pub background: bool,
}

#[derive(Debug, Args)]
pub struct ScrubLimitArgs {
    pub path: String,

    /// Apply to every device of the filesystem rather than a single one.
    #[arg(long)]
    pub all: bool,

    /// Device id to target when `--all` is not given.
    #[arg(long, required_unless_present = "all")]
    pub devid: Option<u64>,

    /// Bytes per second; 0 means unlimited. Omit to only print the
    /// current limit.
    pub bytes_per_sec: Option<u64>,
}
