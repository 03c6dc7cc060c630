use std::path::PathBuf;

/// Output format selector (spec.md §6 "Environment").
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Text
    }
}

/// Shared, explicitly-threaded configuration and filesystem handle.
///
/// Per DESIGN NOTES §9 "Global mutable state": this replaces what the
/// original tool kept as process-wide globals (`gfs_info`, `bconf`, repair
/// flags). The authoritative copy lives on the stack of `main` (or a test's
/// setup code) and is passed by reference into the checker and scrub
/// entry points.
#[derive(Debug, Clone)]
pub struct Context {
    /// Spool directory holding `scrub.status.<fsid>` and the progress socket.
    /// Defaults to `/var/lib/fsckctl` outside of tests.
    pub spool_dir: PathBuf,
    pub verbosity: u8,
    pub quiet: bool,
    pub output_format: OutputFormat,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("/var/lib/fsckctl"),
            verbosity: 0,
            quiet: false,
            output_format: OutputFormat::default(),
        }
    }
}

impl Context {
    pub fn status_file_path(&self, fsid: &str) -> PathBuf {
        self.spool_dir.join(format!("scrub.status.{fsid}"))
    }

    pub fn tmp_status_file_path(&self, fsid: &str) -> PathBuf {
        self.spool_dir.join(format!("scrub.status.{fsid}_tmp"))
    }

    pub fn progress_socket_path(&self, fsid: &str) -> PathBuf {
        self.spool_dir.join(format!("scrub.progress.{fsid}"))
    }
}
