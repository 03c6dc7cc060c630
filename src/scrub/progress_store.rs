//! `scrub.status.<fsid>` text format (spec.md §4.4 "Progress store").
//!
//! Grounded on `original_source/cmds/scrub.c`'s `scrub_write_file` /
//! `scrub_read_file`, reimplemented as a small recursive-descent line
//! parser rather than the C version's manual byte-offset state machine —
//! Rust's string/line iterators make the "bad line increments a rejection
//! counter but does not abort" semantics of spec.md §4.4 directly
//! expressible.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::OpenOptionsExt;

use crate::error::ScrubError;

pub const HEADER_LINE: &str = "scrub status:1";

/// One device's persisted progress record (spec.md §4.4: `<fsid>:<devid>|
/// key1:val1|key2:val2|...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatusRecord {
    pub fsid: String,
    pub devid: u64,
    pub fields: Vec<(String, String)>,
}

impl DeviceStatusRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn to_line(&self) -> String {
        let mut out = format!("{}:{}", self.fsid, self.devid);
        for (k, v) in &self.fields {
            out.push('|');
            out.push_str(k);
            out.push(':');
            out.push_str(v);
        }
        out
    }
}

/// Result of a read: the usable records plus how many lines were rejected
/// (spec.md §4.4 "a bad line increments a per-line rejection but does not
/// abort the read").
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub records: Vec<DeviceStatusRecord>,
    pub rejected_lines: usize,
}

/// Parse one `<fsid>:<devid>|key:val|...` line. Returns `None` for a line
/// that doesn't parse, or whose fsid comes out empty.
fn parse_line(line: &str) -> Option<DeviceStatusRecord> {
    let mut parts = line.split('|');
    let head = parts.next()?;
    let (fsid, devid_str) = head.split_once(':')?;
    if fsid.is_empty() {
        return None;
    }
    let devid = devid_str.parse::<u64>().ok()?;
    let mut fields = Vec::new();
    for kv in parts {
        let (k, v) = kv.split_once(':')?;
        fields.push((k.to_string(), v.to_string()));
    }
    Some(DeviceStatusRecord {
        fsid: fsid.to_string(),
        devid,
        fields,
    })
}

/// Open-shared, streaming read (spec.md §4.4 "Read protocol").
pub fn read_status_file(path: &std::path::Path) -> Result<ReadOutcome, ScrubError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ReadOutcome::default()),
        Err(e) => return Err(ScrubError::Io(e)),
    };
    let mut reader = BufReader::new(file);
    let mut header = String::new();
    reader.read_line(&mut header).map_err(ScrubError::Io)?;
    if header.trim_end() != HEADER_LINE {
        return Err(ScrubError::ProgressStore("missing or unrecognized header line"));
    }

    let mut outcome = ReadOutcome::default();
    for line in reader.lines() {
        let line = line.map_err(ScrubError::Io)?;
        if line.is_empty() {
            continue;
        }
        match parse_line(&line) {
            Some(record) => outcome.records.push(record),
            None => outcome.rejected_lines += 1,
        }
    }
    Ok(outcome)
}

/// Write-then-rename (spec.md §4.4 "Write protocol"): write to
/// `<path>_tmp` under an exclusive flock, fsync, rename into place. The
/// caller supplies both paths (see [`crate::config::Context`]'s
/// `status_file_path`/`tmp_status_file_path`).
pub fn write_status_file(
    final_path: &std::path::Path,
    tmp_path: &std::path::Path,
    records: &[DeviceStatusRecord],
) -> Result<(), ScrubError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(tmp_path)
        .map_err(ScrubError::Io)?;

    let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
    if unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
        return Err(ScrubError::Io(std::io::Error::last_os_error()));
    }

    writeln!(file, "{HEADER_LINE}").map_err(ScrubError::Io)?;
    for record in records {
        writeln!(file, "{}", record.to_line()).map_err(ScrubError::Io)?;
    }
    file.sync_all().map_err(ScrubError::Io)?;
    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }
    drop(file);

    std::fs::rename(tmp_path, final_path).map_err(ScrubError::Io)?;
    Ok(())
}

/// Read the whole file verbatim (header + every record line), used by the
/// progress socket server (spec.md §6 "Progress socket protocol": "server
/// writes one complete status file verbatim").
pub fn read_status_file_verbatim(path: &std::path::Path) -> Result<Vec<u8>, ScrubError> {
    let mut buf = Vec::new();
    File::open(path)
        .map_err(ScrubError::Io)?
        .read_to_end(&mut buf)
        .map_err(ScrubError::Io)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("scrub.status.abc");
        let tmp_path = dir.path().join("scrub.status.abc_tmp");
        let records = vec![DeviceStatusRecord {
            fsid: "abc".to_string(),
            devid: 1,
            fields: vec![
                ("state".to_string(), "running".to_string()),
                ("last_physical".to_string(), "4096".to_string()),
            ],
        }];
        write_status_file(&final_path, &tmp_path, &records).unwrap();
        let outcome = read_status_file(&final_path).unwrap();
        assert_eq!(outcome.rejected_lines, 0);
        assert_eq!(outcome.records, records);
    }

    #[test]
    fn bad_line_is_rejected_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrub.status.abc");
        std::fs::write(&path, format!("{HEADER_LINE}\nnotavalidline\nabc:2|state:idle\n")).unwrap();
        let outcome = read_status_file(&path).unwrap();
        assert_eq!(outcome.rejected_lines, 1);
        assert_eq!(outcome.records.len(), 1);
    }

    #[test]
    fn missing_file_returns_empty_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrub.status.missing");
        let outcome = read_status_file(&path).unwrap();
        assert!(outcome.records.is_empty());
    }
}
