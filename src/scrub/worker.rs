//! Per-device scrub worker (spec.md §4.3 state diagram).
//!
//! Grounded on the teacher's direct-I/O engine's "one phase label, one
//! buffer, blocking syscalls" shape, generalized from "read tree blocks"
//! to "drive one device's in-kernel scrub primitive to completion",
//! matching spec.md §5 "scrub workers suspend inside the kernel scrub
//! primitive and when acquiring the per-device progress mutex."

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ScrubError;
use crate::scrub::kernel_iface::{KernelScrubStatus, ScrubFlags, ScrubKernel};

/// This device's place in the state diagram (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Running,
    Paused,
    Canceled,
    Finished,
}

#[derive(Debug, Clone)]
pub struct DeviceProgress {
    pub devid: u64,
    pub state: DeviceState,
    pub start_physical: u64,
    pub end_physical: u64,
    pub last_physical: u64,
    pub data_bytes_scrubbed: u64,
    pub tree_bytes_scrubbed: u64,
    pub read_errors: u64,
    pub csum_errors: u64,
    pub verify_errors: u64,
}

impl DeviceProgress {
    fn fresh(devid: u64, start_physical: u64, end_physical: u64) -> Self {
        Self {
            devid,
            state: DeviceState::Idle,
            start_physical,
            end_physical,
            last_physical: start_physical,
            data_bytes_scrubbed: 0,
            tree_bytes_scrubbed: 0,
            read_errors: 0,
            csum_errors: 0,
            verify_errors: 0,
        }
    }
}

/// Shared, per-device-mutex-guarded progress a worker publishes into and
/// the aggregator reads from (spec.md §5 "the progress array is shared
/// among all scrub workers and the aggregator under a per-device mutex").
pub type SharedProgress = Arc<Mutex<DeviceProgress>>;

/// Drives one device's scrub to completion (or until canceled), polling
/// the kernel primitive's progress and publishing it into `shared` after
/// every poll. Runs synchronously on the caller's thread; [`super::mod`]
/// spawns one OS thread per device around this function (spec.md §4.3
/// step 3: "Spawn one worker task per device").
pub fn run_worker(
    kernel: &mut dyn ScrubKernel,
    devid: u64,
    start_physical: u64,
    end_physical: u64,
    flags: ScrubFlags,
    shared: SharedProgress,
    cancel_requested: Arc<std::sync::atomic::AtomicBool>,
    poll_interval: Duration,
) -> Result<(), ScrubError> {
    {
        let mut progress = shared.lock().expect("progress mutex poisoned");
        *progress = DeviceProgress::fresh(devid, start_physical, end_physical);
        progress.state = DeviceState::Running;
    }

    kernel.scrub_start(devid, start_physical, end_physical, flags)?;

    loop {
        if cancel_requested.load(std::sync::atomic::Ordering::SeqCst) {
            kernel.scrub_cancel(devid)?;
        }

        let report = kernel.scrub_progress(devid)?;
        let mut progress = shared.lock().expect("progress mutex poisoned");
        // Ordering guarantee (spec.md §5): last_physical is monotonic.
        progress.last_physical = progress.last_physical.max(report.last_physical);
        progress.data_bytes_scrubbed = report.data_bytes_scrubbed;
        progress.tree_bytes_scrubbed = report.tree_bytes_scrubbed;
        progress.read_errors = report.read_errors;
        progress.csum_errors = report.csum_errors;
        progress.verify_errors = report.verify_errors;

        match report.status {
            KernelScrubStatus::Finished => {
                progress.state = DeviceState::Finished;
                return Ok(());
            }
            KernelScrubStatus::Canceled => {
                progress.state = DeviceState::Canceled;
                return Ok(());
            }
            KernelScrubStatus::NotRunning => {
                progress.state = DeviceState::Finished;
                return Ok(());
            }
            KernelScrubStatus::Running => {
                progress.state = DeviceState::Running;
            }
        }
        drop(progress);

        if poll_interval > Duration::ZERO {
            std::thread::sleep(poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::kernel_iface::{DevInfo, FsInfo, MockScrubKernel};

    #[test]
    fn worker_reaches_finished_state() {
        let mut kernel = MockScrubKernel::new(
            FsInfo {
                fsid: "abc".into(),
                num_devices: 1,
                devids: vec![1],
            },
            vec![DevInfo {
                devid: 1,
                total_bytes: 4096,
                used_bytes: 2048,
            }],
        );
        kernel.set_polls_to_finish(1, 1);
        let shared: SharedProgress = Arc::new(Mutex::new(DeviceProgress::fresh(1, 0, 4096)));
        let cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));
        run_worker(
            &mut kernel,
            1,
            0,
            4096,
            ScrubFlags::default(),
            shared.clone(),
            cancel,
            Duration::ZERO,
        )
        .expect("worker completes");
        assert_eq!(shared.lock().unwrap().state, DeviceState::Finished);
    }

    #[test]
    fn cancellation_reaches_canceled_state() {
        let mut kernel = MockScrubKernel::new(
            FsInfo {
                fsid: "abc".into(),
                num_devices: 1,
                devids: vec![1],
            },
            vec![DevInfo {
                devid: 1,
                total_bytes: 4096,
                used_bytes: 2048,
            }],
        );
        kernel.set_polls_to_finish(1, 1000);
        let shared: SharedProgress = Arc::new(Mutex::new(DeviceProgress::fresh(1, 0, 4096)));
        let cancel = Arc::new(std::sync::atomic::AtomicBool::new(true));
        run_worker(
            &mut kernel,
            1,
            0,
            4096,
            ScrubFlags::default(),
            shared.clone(),
            cancel,
            Duration::ZERO,
        )
        .expect("worker completes");
        assert_eq!(shared.lock().unwrap().state, DeviceState::Canceled);
    }
}
