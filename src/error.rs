use thiserror::Error;

/// Errors surfaced by the B-tree navigator and the checker engine.
///
/// Mirrors the teacher's `FxfspError` shape: a handful of leaf variants
/// with enough context to print a one-line diagnostic, plus a transparent
/// `Io` wrapper. `Fatal` is distinguished from the other variants because
/// per spec only allocator exhaustion and root/chunk-tree I/O failures
/// abort a check outright (see `errors_taxonomy::ErrorSet::FATAL_ERROR`).
#[derive(Error, Debug)]
pub enum FsckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic number in {0}")]
    BadMagic(&'static str),
    #[error("parse error: {0}")]
    Parse(&'static str),
    #[error("csum mismatch in {0}")]
    CsumMismatch(&'static str),
    #[error("block at bytenr {bytenr} failed structural validation: {reason}")]
    BrokenBlock { bytenr: u64, reason: &'static str },
    #[error("fatal: {0}")]
    Fatal(&'static str),
}

/// Errors surfaced by the scrub controller and its external collaborators.
#[derive(Error, Debug)]
pub enum ScrubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("kernel scrub primitive failed on devid {devid}: {errno}")]
    Kernel { devid: u64, errno: KernelErrno },
    #[error("progress store corrupt: {0}")]
    ProgressStore(&'static str),
    #[error("no scrub record found for this filesystem")]
    NotFound,
    #[error("scrub already running")]
    AlreadyRunning,
}

/// Kernel errno values the control channel (spec.md §6) may return,
/// mapped to the textual meanings spec.md §7 requires
/// ("ENOTCONN" -> "Not running", "ECANCELED" -> "canceled by user",
/// "EINPROGRESS" -> "Already running").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelErrno {
    NotConnected,
    Canceled,
    InProgress,
    Other(i32),
}

impl std::fmt::Display for KernelErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not running"),
            Self::Canceled => write!(f, "canceled by user"),
            Self::InProgress => write!(f, "Already running"),
            Self::Other(errno) => write!(f, "errno {errno}"),
        }
    }
}
