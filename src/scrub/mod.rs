//! Scrub controller entry points (spec.md §4.3).
//!
//! Grounded on `original_source/cmds/scrub.c`'s `cmd_scrub_start` /
//! `cmd_scrub_cancel` / `cmd_scrub_resume` / `cmd_scrub_status` /
//! `cmd_scrub_limit` dispatch, and on the teacher's "one OS thread per
//! unit of work plus a coordinating decorator" shape (its direct-I/O
//! engine's buffer/log pairing) generalized here to "one OS thread per
//! device plus one aggregator thread" (§5 "Concurrency & resource
//! model").

pub mod aggregator;
pub mod kernel_iface;
pub mod progress_store;
pub mod socket;
pub mod worker;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Context;
use crate::error::ScrubError;
use crate::scrub::kernel_iface::{FsInfo, ScrubFlags, ScrubKernel};
use crate::scrub::progress_store::{read_status_file, DeviceStatusRecord};
use crate::scrub::worker::{run_worker, DeviceProgress, DeviceState, SharedProgress};

/// Whole-filesystem scrub state, the union over devices (spec.md §4.3
/// "Global state for a filesystem: running if any is running, paused if
/// none running and any paused, else finished").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsScrubState {
    Idle,
    Running,
    Paused,
    Finished,
}

pub fn fs_state(devices: &[DeviceState]) -> FsScrubState {
    if devices.is_empty() {
        FsScrubState::Idle
    } else if devices.iter().any(|s| *s == DeviceState::Running) {
        FsScrubState::Running
    } else if devices.iter().any(|s| *s == DeviceState::Paused) {
        FsScrubState::Paused
    } else {
        FsScrubState::Finished
    }
}

/// Delegates every call through a shared lock. The kernel control channel
/// is a single opaque handle in practice (an ioctl fd), so serializing
/// calls through one mutex rather than pretending devices have
/// independent channels matches spec.md §6 more honestly than faking
/// per-device locks the mock kernel doesn't need.
struct LockingKernel(Arc<Mutex<Box<dyn ScrubKernel>>>);

impl ScrubKernel for LockingKernel {
    fn fs_info(&mut self) -> Result<FsInfo, ScrubError> {
        self.0.lock().expect("kernel mutex poisoned").fs_info()
    }
    fn dev_info(&mut self, devid: u64) -> Result<kernel_iface::DevInfo, ScrubError> {
        self.0.lock().expect("kernel mutex poisoned").dev_info(devid)
    }
    fn scrub_start(
        &mut self,
        devid: u64,
        start_physical: u64,
        end_physical: u64,
        flags: ScrubFlags,
    ) -> Result<(), ScrubError> {
        self.0
            .lock()
            .expect("kernel mutex poisoned")
            .scrub_start(devid, start_physical, end_physical, flags)
    }
    fn scrub_progress(&mut self, devid: u64) -> Result<kernel_iface::KernelProgress, ScrubError> {
        self.0
            .lock()
            .expect("kernel mutex poisoned")
            .scrub_progress(devid)
    }
    fn scrub_cancel(&mut self, devid: u64) -> Result<(), ScrubError> {
        self.0.lock().expect("kernel mutex poisoned").scrub_cancel(devid)
    }
}

/// A running scrub: worker/aggregator thread handles plus the shared
/// progress each worker publishes into. Dropping this without calling
/// [`ScrubHandle::join`] leaks the background threads (they keep running
/// against the mock/real kernel); callers that want a clean shutdown
/// should call [`cancel`] first.
pub struct ScrubHandle {
    pub devices: Vec<(u64, SharedProgress)>,
    cancel_flags: HashMap<u64, Arc<AtomicBool>>,
    workers: Vec<std::thread::JoinHandle<Result<(), ScrubError>>>,
    aggregator_stop: Arc<AtomicBool>,
    aggregator: std::thread::JoinHandle<Result<(), ScrubError>>,
}

impl ScrubHandle {
    /// Join every worker and the aggregator, returning the first error
    /// encountered (if any). Blocks until all devices reach a terminal
    /// state (spec.md §4.3 "the main thread joins each worker with no
    /// timeout").
    pub fn join(self) -> Result<(), ScrubError> {
        for worker in self.workers {
            worker.join().expect("worker thread panicked")?;
        }
        self.aggregator_stop
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.aggregator.join().expect("aggregator thread panicked")
    }

    pub fn device_states(&self) -> Vec<DeviceState> {
        self.devices
            .iter()
            .map(|(_, shared)| shared.lock().expect("progress mutex poisoned").state)
            .collect()
    }
}

/// Start a scrub run (spec.md §4.3 "Start algorithm").
///
/// Step 1 (reject-if-running) and step 2 (resume offsets) are resolved
/// against the persisted status file before any worker is spawned; steps
/// 5/6 (signal handling, daemonization) are the calling process's
/// responsibility (see `cli::scrub`), not the controller's — a library
/// entry point has no business installing process-wide signal handlers
/// on a caller's behalf.
pub fn start(
    ctx: &Context,
    kernel: Box<dyn ScrubKernel>,
    fsid: &str,
    force: bool,
    poll_interval: Duration,
) -> Result<ScrubHandle, ScrubError> {
    let kernel = Arc::new(Mutex::new(kernel));
    let mut locking = LockingKernel(kernel.clone());

    let fs_info = locking.fs_info()?;
    let persisted = read_status_file(&ctx.status_file_path(fsid))?;

    let already_running = persisted
        .records
        .iter()
        .any(|r| r.get("state") == Some("running"));
    if already_running && !force {
        return Err(ScrubError::AlreadyRunning);
    }
    if already_running && force {
        // force only overrides a *stale* "running" record, not a real
        // in-kernel scrub (spec.md §4.3 step 1).
        for devid in &fs_info.devids {
            if matches!(
                locking.scrub_progress(*devid)?.status,
                kernel_iface::KernelScrubStatus::Running
            ) {
                return Err(ScrubError::AlreadyRunning);
            }
        }
    }

    let mut devices = Vec::new();
    let mut cancel_flags = HashMap::new();
    let mut workers = Vec::new();

    for &devid in &fs_info.devids {
        let dev_info = locking.dev_info(devid)?;
        let record = persisted.records.iter().find(|r| r.devid == devid);
        let start_physical = match record.and_then(|r| r.get("state")) {
            Some("canceled") | Some("running") | Some("paused") => record
                .and_then(|r| r.get("last_physical"))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0),
            _ => 0,
        };

        let shared: SharedProgress = Arc::new(Mutex::new(DeviceProgress {
            devid,
            state: DeviceState::Idle,
            start_physical,
            end_physical: dev_info.used_bytes,
            last_physical: start_physical,
            data_bytes_scrubbed: 0,
            tree_bytes_scrubbed: 0,
            read_errors: 0,
            csum_errors: 0,
            verify_errors: 0,
        }));
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let kernel_for_thread = kernel.clone();
        let shared_for_thread = shared.clone();
        let cancel_for_thread = cancel_flag.clone();
        let end_physical = dev_info.used_bytes;
        workers.push(std::thread::spawn(move || {
            let mut locking = LockingKernel(kernel_for_thread);
            run_worker(
                &mut locking,
                devid,
                start_physical,
                end_physical,
                ScrubFlags::default(),
                shared_for_thread,
                cancel_for_thread,
                poll_interval,
            )
        }));

        devices.push((devid, shared));
        cancel_flags.insert(devid, cancel_flag);
    }

    let aggregator_stop = Arc::new(AtomicBool::new(false));
    let ctx_for_aggregator = ctx.clone();
    let fsid_for_aggregator = fsid.to_string();
    let devices_for_aggregator = devices.clone();
    let stop_for_aggregator = aggregator_stop.clone();
    let aggregator = std::thread::spawn(move || {
        aggregator::run_aggregator(
            &ctx_for_aggregator,
            &fsid_for_aggregator,
            &devices_for_aggregator,
            &stop_for_aggregator,
            poll_interval,
        )
    });

    Ok(ScrubHandle {
        devices,
        cancel_flags,
        workers,
        aggregator_stop,
        aggregator,
    })
}

/// Cancel (spec.md §4.3 "Cancel"): send cancel to each device, wait for
/// workers, leave the status file with `canceled=1`.
pub fn cancel(ctx: &Context, fsid: &str, handle: ScrubHandle) -> Result<(), ScrubError> {
    for flag in handle.cancel_flags.values() {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }
    let devices = handle.devices.clone();
    handle.join()?;
    let mut records = aggregator::snapshot_records(fsid, &devices);
    for record in &mut records {
        record
            .fields
            .push(("canceled".to_string(), "1".to_string()));
    }
    std::fs::create_dir_all(&ctx.spool_dir).map_err(ScrubError::Io)?;
    progress_store::write_status_file(
        &ctx.status_file_path(fsid),
        &ctx.tmp_status_file_path(fsid),
        &records,
    )
}

/// Resume (spec.md §4.3 "Resume"): same as start, but devices already
/// `finished` are skipped entirely.
pub fn resume(
    ctx: &Context,
    kernel: Box<dyn ScrubKernel>,
    fsid: &str,
    poll_interval: Duration,
) -> Result<ScrubHandle, ScrubError> {
    let persisted = read_status_file(&ctx.status_file_path(fsid))?;
    let all_finished = !persisted.records.is_empty()
        && persisted
            .records
            .iter()
            .all(|r| r.get("state") == Some("finished"));
    if all_finished {
        return Err(ScrubError::NotFound);
    }
    start(ctx, kernel, fsid, true, poll_interval)
}

/// Status (spec.md §4.3 "Status"): read the persisted record for each
/// device, falling back to nothing if no record exists yet.
pub fn status(ctx: &Context, fsid: &str) -> Result<Vec<DeviceStatusRecord>, ScrubError> {
    let outcome = read_status_file(&ctx.status_file_path(fsid))?;
    Ok(outcome.records)
}

/// ETA in seconds for one device's record, `(total - scrubbed) / rate`
/// (spec.md §4.3 "Status"), or `None` if the rate can't be established
/// (no elapsed throughput yet).
pub fn eta_seconds(record: &DeviceStatusRecord, elapsed_secs: u64) -> Option<u64> {
    let last_physical: u64 = record.get("last_physical")?.parse().ok()?;
    let end_physical: u64 = record.get("end_physical")?.parse().ok()?;
    let start_physical: u64 = record.get("start_physical")?.parse().ok()?;
    if elapsed_secs == 0 || last_physical <= start_physical {
        return None;
    }
    let scrubbed = last_physical - start_physical;
    let rate = scrubbed / elapsed_secs.max(1);
    if rate == 0 {
        return None;
    }
    let remaining = end_physical.saturating_sub(last_physical);
    Some(remaining / rate)
}

/// Limit (spec.md §4.3 "Limit"): read or write the per-device throughput
/// ceiling through sysfs. Modeled as a trait so tests and production
/// differ only in backing store, matching `kernel_iface::ScrubKernel`'s
/// external-collaborator boundary.
pub trait SpeedLimitSysfs {
    fn read_limit(&self, devid: u64) -> Result<u64, ScrubError>;
    fn write_limit(&mut self, devid: u64, bytes_per_sec: u64) -> Result<(), ScrubError>;
}

/// `value 0 means unlimited`; `--all` applies to every device; printing
/// reports the lowest limit across devices as the effective cap (spec.md
/// §4.3 "Limit").
pub fn effective_limit(sysfs: &dyn SpeedLimitSysfs, devids: &[u64]) -> Result<Option<u64>, ScrubError> {
    let mut limits = Vec::with_capacity(devids.len());
    for &devid in devids {
        limits.push(sysfs.read_limit(devid)?);
    }
    Ok(limits.into_iter().filter(|&l| l != 0).min())
}

pub fn set_limit(
    sysfs: &mut dyn SpeedLimitSysfs,
    devids: &[u64],
    bytes_per_sec: u64,
) -> Result<(), ScrubError> {
    for &devid in devids {
        sysfs.write_limit(devid, bytes_per_sec)?;
    }
    Ok(())
}
