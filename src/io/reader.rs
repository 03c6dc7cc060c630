//! `IoReader` trait, phase labels, and an instrumenting decorator.
//!
//! Grounded on the teacher's top-level `reader.rs` (`IoPhase`, `IoReader`)
//! merged with its `io/reader.rs` (`InstrumentedReader`, `MaybeInstrumented`)
//! into a single module — this crate has no use for keeping the trait and
//! its one decorator in separate files.

use std::fmt;
use std::io::Write;

use crate::error::FsckError;

/// I/O phase labels for analytics/diagnostics, matching the navigator and
/// checker's own traversal stages (spec.md §2 "Dependency order") rather
/// than the teacher's XFS-specific AG/inobt/bmbt phases.
#[derive(Debug, Clone, Copy)]
pub enum IoPhase {
    Superblock,
    ChunkTree,
    RootTree,
    ExtentTree,
    FsTree,
    CsumTree,
    ScrubRead,
}

impl fmt::Display for IoPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superblock => write!(f, "superblock"),
            Self::ChunkTree => write!(f, "chunk_tree"),
            Self::RootTree => write!(f, "root_tree"),
            Self::ExtentTree => write!(f, "extent_tree"),
            Self::FsTree => write!(f, "fs_tree"),
            Self::CsumTree => write!(f, "csum_tree"),
            Self::ScrubRead => write!(f, "scrub_read"),
        }
    }
}

/// Trait for reading raw bytes from a block device or image file.
///
/// Implementations must provide `read_at`. The default
/// `coalesced_read_batch` falls back to sequential `read_at` calls;
/// override for performance (e.g. io_uring with coalescing).
pub trait IoReader {
    fn read_at(&mut self, offset: u64, len: usize, phase: IoPhase) -> Result<&[u8], FsckError>;

    fn coalesced_read_batch<T: Copy, F>(
        &mut self,
        requests: &[(u64, usize, T)],
        mut on_complete: F,
        phase: IoPhase,
    ) -> Result<(), FsckError>
    where
        F: FnMut(&[u8], T) -> Result<(), FsckError>,
    {
        for &(offset, len, tag) in requests {
            let buf = self.read_at(offset, len, phase)?;
            on_complete(buf, tag)?;
        }
        Ok(())
    }
}

/// A decorator that wraps any [`IoReader`] and logs I/O operations to a CSV
/// file, controlled by the `FSCKCTL_IO_LOG`/`FSCKCTL_IO_LOG_LIMIT`
/// environment variables.
pub struct InstrumentedReader<R> {
    inner: R,
    io_log: std::io::BufWriter<std::fs::File>,
    remaining: usize,
}

impl<R> InstrumentedReader<R> {
    pub fn new(inner: R, log_path: &str, limit: usize) -> Result<Self, FsckError> {
        let f = std::fs::File::create(log_path).map_err(FsckError::Io)?;
        let mut w = std::io::BufWriter::new(f);
        writeln!(w, "phase,offset,len").map_err(FsckError::Io)?;
        Ok(Self {
            inner,
            io_log: w,
            remaining: limit,
        })
    }

    fn log_read(&mut self, phase: IoPhase, offset: u64, len: usize) {
        if self.remaining == 0 {
            return;
        }
        let _ = writeln!(self.io_log, "{phase},{offset},{len}");
        self.remaining -= 1;
    }
}

impl<R: IoReader> IoReader for InstrumentedReader<R> {
    fn read_at(&mut self, offset: u64, len: usize, phase: IoPhase) -> Result<&[u8], FsckError> {
        self.log_read(phase, offset, len);
        self.inner.read_at(offset, len, phase)
    }

    fn coalesced_read_batch<T: Copy, F>(
        &mut self,
        requests: &[(u64, usize, T)],
        on_complete: F,
        phase: IoPhase,
    ) -> Result<(), FsckError>
    where
        F: FnMut(&[u8], T) -> Result<(), FsckError>,
    {
        for &(offset, len, _) in requests {
            self.log_read(phase, offset, len);
        }
        self.inner.coalesced_read_batch(requests, on_complete, phase)
    }
}

/// Runtime choice between a bare reader and an instrumented one. Avoids
/// dynamic dispatch while allowing the decision to be made at runtime
/// (e.g. based on environment variables).
pub enum MaybeInstrumented<R> {
    Bare(R),
    Instrumented(InstrumentedReader<R>),
}

impl<R> MaybeInstrumented<R> {
    /// If `FSCKCTL_IO_LOG` is set, wraps `inner` with CSV logging.
    /// `FSCKCTL_IO_LOG_LIMIT` optionally caps the number of logged
    /// operations.
    pub fn from_env(inner: R) -> Result<Self, FsckError> {
        if let Ok(path) = std::env::var("FSCKCTL_IO_LOG") {
            let limit = std::env::var("FSCKCTL_IO_LOG_LIMIT")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(usize::MAX);
            Ok(Self::Instrumented(InstrumentedReader::new(
                inner, &path, limit,
            )?))
        } else {
            Ok(Self::Bare(inner))
        }
    }
}

impl<R: IoReader> IoReader for MaybeInstrumented<R> {
    fn read_at(&mut self, offset: u64, len: usize, phase: IoPhase) -> Result<&[u8], FsckError> {
        match self {
            Self::Bare(r) => r.read_at(offset, len, phase),
            Self::Instrumented(r) => r.read_at(offset, len, phase),
        }
    }

    fn coalesced_read_batch<T: Copy, F>(
        &mut self,
        requests: &[(u64, usize, T)],
        on_complete: F,
        phase: IoPhase,
    ) -> Result<(), FsckError>
    where
        F: FnMut(&[u8], T) -> Result<(), FsckError>,
    {
        match self {
            Self::Bare(r) => r.coalesced_read_batch(requests, on_complete, phase),
            Self::Instrumented(r) => r.coalesced_read_batch(requests, on_complete, phase),
        }
    }
}
