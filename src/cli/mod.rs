//! Command registry / dispatcher (spec.md §4 overview table, §6 CLI
//! surface).
//!
//! Grounded on
//! `other_examples/79fe6f7b_koverstreet-bcachefs-tools__src-commands-dump.rs`'s
//! `#[derive(Parser)]` top-level dispatch. Each subcommand's argument
//! struct owns its own parsing (DESIGN NOTES §9 "no shared parser state
//! across calls").

pub mod check;
pub mod scrub;

use clap::{Parser, Subcommand};

use crate::config::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "fsckctl", about = "Offline B-tree filesystem checker and online scrub controller")]
pub struct FsckCli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity; repeatable (spec.md §6 "Environment").
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all but warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub output: OutputFormat,

    /// Spool directory for `scrub.status.<fsid>` and the progress socket.
    #[arg(long, global = true)]
    pub spool_dir: Option<std::path::PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the offline checker (spec.md §4.2).
    Check(check::CheckArgs),
    /// Drive the online scrub controller (spec.md §4.3).
    Scrub(scrub::ScrubCommand),
}

impl FsckCli {
    pub fn to_context(&self) -> crate::config::Context {
        let mut ctx = crate::config::Context {
            verbosity: self.verbose,
            quiet: self.quiet,
            output_format: self.output,
            ..crate::config::Context::default()
        };
        if let Some(dir) = &self.spool_dir {
            ctx.spool_dir = dir.clone();
        }
        ctx
    }
}
