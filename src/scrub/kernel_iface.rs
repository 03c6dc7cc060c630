//! Control-channel boundary to the kernel scrub driver (spec.md §6
//! "Control channel to the kernel driver").
//!
//! This is an external collaborator per spec.md §1/§5 Non-goals: no real
//! ioctl backing is implemented. [`ScrubKernel`] names the opcodes by
//! intent rather than by number, the way spec.md describes them, so a
//! production build would implement this trait against the platform's
//! actual scrub ioctl without touching [`crate::scrub`]'s state machine.

use crate::error::{KernelErrno, ScrubError};

/// Filesystem-wide facts the controller needs before it can address
/// individual devices.
#[derive(Debug, Clone)]
pub struct FsInfo {
    pub fsid: String,
    pub num_devices: u32,
    pub devids: Vec<u64>,
}

/// Per-device facts needed to size a scrub run.
#[derive(Debug, Clone, Copy)]
pub struct DevInfo {
    pub devid: u64,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// `scrub_start`'s flags (spec.md §4.3 step 3: "spawn one worker task per
/// device").
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrubFlags {
    pub readonly: bool,
    pub background: bool,
}

/// One incremental report from `scrub_progress(devid)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelScrubStatus {
    Running,
    Finished,
    Canceled,
    NotRunning,
}

#[derive(Debug, Clone, Copy)]
pub struct KernelProgress {
    pub status: KernelScrubStatus,
    pub last_physical: u64,
    pub data_bytes_scrubbed: u64,
    pub tree_bytes_scrubbed: u64,
    pub read_errors: u64,
    pub csum_errors: u64,
    pub verify_errors: u64,
}

/// The kernel control channel (spec.md §6). Every method maps to one named
/// opcode from the spec; implementations may return
/// [`KernelErrno::InProgress`] / [`KernelErrno::NotConnected`] for the
/// `already_running` / `not_running` sentinels spec.md calls out.
pub trait ScrubKernel: Send {
    fn fs_info(&mut self) -> Result<FsInfo, ScrubError>;
    fn dev_info(&mut self, devid: u64) -> Result<DevInfo, ScrubError>;
    fn scrub_start(
        &mut self,
        devid: u64,
        start_physical: u64,
        end_physical: u64,
        flags: ScrubFlags,
    ) -> Result<(), ScrubError>;
    fn scrub_progress(&mut self, devid: u64) -> Result<KernelProgress, ScrubError>;
    fn scrub_cancel(&mut self, devid: u64) -> Result<(), ScrubError>;
}

/// In-memory mock used by tests and by [`crate::scrub`]'s own unit tests.
/// Each device's scrub "completes" after a fixed number of progress polls,
/// deterministically, so tests don't depend on wall-clock timing.
pub struct MockScrubKernel {
    pub fs_info: FsInfo,
    pub dev_infos: std::collections::HashMap<u64, DevInfo>,
    polls_to_finish: std::collections::HashMap<u64, u32>,
    canceled: std::collections::HashSet<u64>,
    started: std::collections::HashMap<u64, (u64, u64)>,
}

impl MockScrubKernel {
    pub fn new(fs_info: FsInfo, dev_infos: Vec<DevInfo>) -> Self {
        Self {
            fs_info,
            dev_infos: dev_infos.into_iter().map(|d| (d.devid, d)).collect(),
            polls_to_finish: std::collections::HashMap::new(),
            canceled: std::collections::HashSet::new(),
            started: std::collections::HashMap::new(),
        }
    }

    /// Tests configure how many `scrub_progress` polls it takes before a
    /// device reports `Finished`.
    pub fn set_polls_to_finish(&mut self, devid: u64, polls: u32) {
        self.polls_to_finish.insert(devid, polls);
    }
}

impl ScrubKernel for MockScrubKernel {
    fn fs_info(&mut self) -> Result<FsInfo, ScrubError> {
        Ok(self.fs_info.clone())
    }

    fn dev_info(&mut self, devid: u64) -> Result<DevInfo, ScrubError> {
        self.dev_infos.get(&devid).copied().ok_or(ScrubError::Kernel {
            devid,
            errno: KernelErrno::Other(libc::ENODEV),
        })
    }

    fn scrub_start(
        &mut self,
        devid: u64,
        start_physical: u64,
        end_physical: u64,
        _flags: ScrubFlags,
    ) -> Result<(), ScrubError> {
        if self.started.contains_key(&devid) {
            return Err(ScrubError::Kernel {
                devid,
                errno: KernelErrno::InProgress,
            });
        }
        self.canceled.remove(&devid);
        self.started.insert(devid, (start_physical, end_physical));
        Ok(())
    }

    fn scrub_progress(&mut self, devid: u64) -> Result<KernelProgress, ScrubError> {
        let Some(&(start, end)) = self.started.get(&devid) else {
            return Ok(KernelProgress {
                status: KernelScrubStatus::NotRunning,
                last_physical: 0,
                data_bytes_scrubbed: 0,
                tree_bytes_scrubbed: 0,
                read_errors: 0,
                csum_errors: 0,
                verify_errors: 0,
            });
        };
        if self.canceled.contains(&devid) {
            return Ok(KernelProgress {
                status: KernelScrubStatus::Canceled,
                last_physical: start,
                data_bytes_scrubbed: 0,
                tree_bytes_scrubbed: 0,
                read_errors: 0,
                csum_errors: 0,
                verify_errors: 0,
            });
        }
        let remaining = self.polls_to_finish.entry(devid).or_insert(1);
        let status = if *remaining == 0 {
            KernelScrubStatus::Finished
        } else {
            *remaining -= 1;
            KernelScrubStatus::Running
        };
        let span = end.saturating_sub(start).max(1);
        let last_physical = if status == KernelScrubStatus::Finished {
            end
        } else {
            start + span / 2
        };
        Ok(KernelProgress {
            status,
            last_physical,
            data_bytes_scrubbed: last_physical.saturating_sub(start),
            tree_bytes_scrubbed: 0,
            read_errors: 0,
            csum_errors: 0,
            verify_errors: 0,
        })
    }

    fn scrub_cancel(&mut self, devid: u64) -> Result<(), ScrubError> {
        self.canceled.insert(devid);
        Ok(())
    }
}
