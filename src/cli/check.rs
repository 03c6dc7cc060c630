//! `check` subcommand arguments (spec.md §4.2, SPEC_FULL.md §4 "check
//! --mode lowmem is preserved as the only mode").
//!
//! Grounded on
//! `other_examples/79fe6f7b_koverstreet-bcachefs-tools__src-commands-dump.rs`'s
//! derive-clap argument struct shape.

use std::path::PathBuf;

use clap::{Args, ValueEnum};

/// `check --mode lowmem` is the only mode this crate implements; the flag
/// is still required so the CLI surface matches the upstream tool's
/// naming (SPEC_FULL.md §4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CheckMode {
    Lowmem,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Block device or image file to check.
    pub device: PathBuf,

    #[arg(long, value_enum, default_value_t = CheckMode::Lowmem)]
    pub mode: CheckMode,

    /// Apply repairs for detected defects instead of only reporting them.
    #[arg(long)]
    pub repair: bool,

    /// Refuse to write to the device even if `--repair` is given.
    #[arg(long)]
    pub readonly: bool,
}
