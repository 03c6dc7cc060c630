//! Progress UNIX socket protocol (spec.md §6 "Progress socket protocol").
//!
//! "Peer connects to the socket; server writes one complete status file
//! verbatim (header line + one record per device), then closes." Grounded
//! on the teacher's preference for raw OS primitives over a runtime
//! abstraction (DESIGN NOTES / §2 "Concurrency"): a bare
//! `std::os::unix::net::UnixListener` rather than an async socket server.

use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

use crate::error::ScrubError;
use crate::scrub::progress_store::read_status_file_verbatim;

/// Binds `socket_path`, removing any stale socket file left over from a
/// prior run first (a crashed aggregator leaves the inode behind; the
/// kernel refuses to bind over a live one, which is the behavior we want,
/// so only an `AddrInUse` from a *dead* path triggers the unlink-retry).
pub fn bind(socket_path: &Path) -> Result<UnixListener, ScrubError> {
    match UnixListener::bind(socket_path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(socket_path).is_ok() {
                return Err(ScrubError::Io(e));
            }
            std::fs::remove_file(socket_path).map_err(ScrubError::Io)?;
            UnixListener::bind(socket_path).map_err(ScrubError::Io)
        }
        Err(e) => Err(ScrubError::Io(e)),
    }
}

/// Accept with a 5 s poll timeout (spec.md §5 "progress socket accept has
/// a 5 s poll"), write the status file's current bytes verbatim, and
/// close. Returns `Ok(false)` on a timeout (no peer connected this cycle),
/// `Ok(true)` if a peer was served.
pub fn serve_one(
    listener: &UnixListener,
    status_file_path: &Path,
    accept_timeout: Duration,
) -> Result<bool, ScrubError> {
    listener.set_nonblocking(true).map_err(ScrubError::Io)?;
    let deadline = std::time::Instant::now() + accept_timeout;
    loop {
        match listener.accept() {
            Ok((mut stream, _addr)) => {
                let bytes = read_status_file_verbatim(status_file_path)?;
                stream.write_all(&bytes).map_err(ScrubError::Io)?;
                return Ok(true);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if std::time::Instant::now() >= deadline {
                    return Ok(false);
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(ScrubError::Io(e)),
        }
    }
}
