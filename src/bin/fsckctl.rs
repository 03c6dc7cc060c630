//! `fsckctl` binary entry point: parses the CLI, builds a [`Context`],
//! and dispatches to the checker or scrub controller.

use clap::Parser;

use fsckctl::btrfs::device_source::{DeviceBlockSource, IdentityMapper};
use fsckctl::btrfs::keyed_roots::find_root;
use fsckctl::btrfs::superblock::Superblock;
use fsckctl::btrfs::types::tree_id;
use fsckctl::check::check_fs_lowmem;
use fsckctl::cli::{check::CheckMode, scrub::ScrubCommand, Command, FsckCli};
use fsckctl::io::engine::IoEngine;
use fsckctl::scrub::kernel_iface::MockScrubKernel;
use fsckctl::{logging, scrub};

fn main() {
    let cli = FsckCli::parse();
    let ctx = cli.to_context();
    logging::init(&ctx);

    let exit_code = match &cli.command {
        Command::Check(args) => run_check(args),
        Command::Scrub(cmd) => run_scrub(&ctx, cmd),
    };

    std::process::exit(exit_code);
}

fn run_check(args: &fsckctl::cli::check::CheckArgs) -> i32 {
    let CheckMode::Lowmem = args.mode;

    let mut engine = match IoEngine::open(&args.device.to_string_lossy()) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("failed to open {}: {e}", args.device.display());
            return 2;
        }
    };

    let sb = match Superblock::load(engine.device_size(), |offset| {
        engine.read_at(offset, 4096).map(|buf| buf.to_vec())
    }) {
        Ok(sb) => sb,
        Err(e) => {
            tracing::error!("failed to read superblock: {e}");
            return 2;
        }
    };

    let mut source = DeviceBlockSource::new(engine, sb.node_size, IdentityMapper);

    let dev_tree = match find_root(&mut source, sb.root_tree_bytenr, tree_id::DEV_TREE_OBJECTID) {
        Ok(Some(root)) => root,
        Ok(None) => {
            tracing::error!("device tree root missing");
            return 2;
        }
        Err(e) => {
            tracing::error!("failed to resolve device tree: {e}");
            return 2;
        }
    };
    let extent_tree =
        match find_root(&mut source, sb.root_tree_bytenr, tree_id::EXTENT_TREE_OBJECTID) {
            Ok(Some(root)) => root,
            Ok(None) => {
                tracing::error!("extent tree root missing");
                return 2;
            }
            Err(e) => {
                tracing::error!("failed to resolve extent tree: {e}");
                return 2;
            }
        };
    let csum_tree =
        match find_root(&mut source, sb.root_tree_bytenr, tree_id::CSUM_TREE_OBJECTID) {
            Ok(Some(root)) => root,
            Ok(None) => {
                tracing::error!("csum tree root missing");
                return 2;
            }
            Err(e) => {
                tracing::error!("failed to resolve csum tree: {e}");
                return 2;
            }
        };

    let total_bytes = sb.total_bytes;
    let errors = match check_fs_lowmem(
        &mut source,
        &sb,
        dev_tree.bytenr,
        extent_tree.bytenr,
        csum_tree.bytenr,
        move |_devid| Some(total_bytes),
        None,
    ) {
        Ok(errors) => errors,
        Err(e) => {
            tracing::error!("check failed: {e}");
            return 2;
        }
    };

    // spec.md §6: check's exit code encodes "clean vs not" only.
    if errors.is_empty() {
        println!("no errors found");
        0
    } else {
        println!("{errors}");
        if args.repair && !args.readonly {
            // Repair writes go through `check::repair`'s `Transaction`/
            // `ChunkAllocator` seams (spec.md §6), which this CLI has no live
            // backend for: `IoEngine` only ever opens devices O_RDONLY. Until
            // a writable backend is wired in, `--repair` can only report.
            tracing::warn!("repair requested but no writable backend is wired into this CLI; no fixups were applied");
        }
        1
    }
}

/// Exit codes follow spec.md §6's CLI surface table: `start`/`resume` use
/// 0/1/2/3 (success / generic failure / nothing to resume / uncorrectable
/// errors found); `cancel` uses 0/2 (success / not running); `status` uses
/// 0/1 (found / not found); `limit` uses 0/1 (success / failure).
fn run_scrub(ctx: &fsckctl::config::Context, cmd: &ScrubCommand) -> i32 {
    // The real control channel (spec.md §6) is an external collaborator
    // this crate never implements against an actual kernel (SPEC_FULL.md
    // §5 Non-goals); the CLI wires the mock so the controller's state
    // machine is exercisable end to end.
    match cmd {
        ScrubCommand::Start(args) => {
            let kernel = Box::new(mock_kernel_for_path(&args.path));
            run_start_or_resume(scrub::start(
                ctx,
                kernel,
                &args.path,
                args.force,
                scrub::aggregator::DEFAULT_POLL_INTERVAL,
            ))
        }
        ScrubCommand::Resume(args) => {
            let kernel = Box::new(mock_kernel_for_path(&args.path));
            run_start_or_resume(scrub::resume(
                ctx,
                kernel,
                &args.path,
                scrub::aggregator::DEFAULT_POLL_INTERVAL,
            ))
        }
        ScrubCommand::Cancel(args) => {
            tracing::error!(
                "cancel requires the handle from the `start` that spawned it; no in-process scrub is tracked for {}",
                args.path
            );
            2
        }
        ScrubCommand::Status(args) => match scrub::status(ctx, &args.path) {
            Ok(records) if !records.is_empty() => {
                for record in &records {
                    println!("{}:{} -> {:?}", record.fsid, record.devid, record.fields);
                }
                0
            }
            Ok(_) => 1,
            Err(e) => {
                tracing::error!("status failed: {e}");
                1
            }
        },
        ScrubCommand::Limit(_args) => {
            tracing::error!("sysfs throughput limit is an external collaborator (spec.md §6); not wired to a real sysfs tree here");
            1
        }
    }
}

fn run_start_or_resume(result: Result<scrub::ScrubHandle, fsckctl::ScrubError>) -> i32 {
    match result {
        Ok(handle) => {
            let devices = handle.devices.clone();
            match handle.join() {
                Ok(()) => {
                    let any_unfinished = devices.iter().any(|(_, shared)| {
                        !matches!(
                            shared.lock().expect("progress mutex poisoned").state,
                            fsckctl::scrub::worker::DeviceState::Finished
                        )
                    });
                    if any_unfinished {
                        3
                    } else {
                        0
                    }
                }
                Err(e) => {
                    tracing::error!("scrub failed: {e}");
                    1
                }
            }
        }
        Err(fsckctl::ScrubError::NotFound) => 2,
        Err(e) => {
            tracing::error!("scrub failed to start: {e}");
            1
        }
    }
}

fn mock_kernel_for_path(path: &str) -> MockScrubKernel {
    use fsckctl::scrub::kernel_iface::{DevInfo, FsInfo};
    MockScrubKernel::new(
        FsInfo {
            fsid: path.to_string(),
            num_devices: 1,
            devids: vec![1],
        },
        vec![DevInfo {
            devid: 1,
            total_bytes: 0,
            used_bytes: 0,
        }],
    )
}
