//! Storage provisioning: pre-clean, wipe, partition, pool creation and the
//! EFI system partition.

use super::{under_root, PhaseContext, WorkflowLevel};
use crate::config::InstallerConfig;
use crate::error::{InstallError, InstallResult};
use crate::executor::{CommandSpec, ExitPolicy, Tolerance};
use crate::ledger::{FilesystemKind, MountEntry, MountLedger};
use crate::parse::{mounted_devices, pool_names};
use crate::pool::{PartitionPlan, StoragePool};
use crate::request::{partition_path, InstallationRequest};
use std::path::{Path, PathBuf};

/// Mount points a previous run may have left under the install root, deepest first.
const STALE_MOUNTS: &[&str] = &["sys/firmware/efi/efivars", "sys", "proc", "dev", "efi"];

/// `zpool labelclear` failures that just mean there was nothing to clear.
const NO_LABEL: &[&str] = &[
    "no such file",
    "no such device",
    "failed to open",
    "failed to read label",
    "unable to open",
];

/// Proof that the target disk was wiped in this run. Only `wipe_disk` makes one.
#[derive(Debug)]
pub struct WipedDisk {
    disk: PathBuf,
}

impl WipedDisk {
    pub fn disk(&self) -> &Path {
        &self.disk
    }
}

/// Partition devices produced by provisioning.
#[derive(Debug, Clone)]
pub struct ProvisionedStorage {
    pub efi_partition: PathBuf,
    pub pool_partition: PathBuf,
}

/// Bring the host back to a known state, then make sure the target disk is
/// ours to destroy. Running it on a fresh host and on a half-installed one
/// ends in the same place.
pub fn preclean(
    ctx: &mut PhaseContext<'_>,
    config: &InstallerConfig,
    request: &InstallationRequest,
) -> InstallResult<()> {
    let disk = request.disk();
    let root = &config.target.install_root;

    let probe = ctx.run(
        CommandSpec::new("test").arg("-b").path_arg(disk),
        ExitPolicy::Inspect,
    )?;
    if !probe.success() {
        return Err(InstallError::Precondition(format!(
            "{} is not a block device",
            disk.display()
        )));
    }

    for relative in STALE_MOUNTS {
        let mount_point = root.join(relative);
        if ctx.is_mounted(&mount_point)? {
            ctx.run(
                CommandSpec::new("umount").path_arg(&mount_point),
                ExitPolicy::Tolerate(Tolerance::needles(&["not mounted"])),
            )?;
            ctx.push(
                WorkflowLevel::Info,
                format!("Released stale mount {}", mount_point.display()),
            );
        }
    }

    let listed = ctx.run(
        CommandSpec::new("zpool").args(["list", "-H", "-o", "name"]),
        ExitPolicy::Inspect,
    )?;
    if listed.success() && pool_names(&listed.stdout).contains(&config.target.pool) {
        ctx.fatal(CommandSpec::new("zpool").arg("export").arg(config.target.pool.as_str()))?;
        ctx.push(
            WorkflowLevel::Info,
            format!("Exported leftover pool {}", config.target.pool),
        );
    }

    ctx.remove(root, ExitPolicy::Fatal)?;
    ctx.make_dir(root)?;

    let usage = ctx.fatal(
        CommandSpec::new("lsblk")
            .args(["-nrpo", "NAME,MOUNTPOINT"])
            .path_arg(disk),
    )?;
    let mounted = mounted_devices(&usage.stdout);
    if !mounted.is_empty() {
        let listing = mounted
            .iter()
            .map(|(device, mount_point)| format!("{device} on {mount_point}"))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(InstallError::Precondition(format!(
            "{} is still in use: {listing}",
            disk.display()
        )));
    }

    ctx.push(
        WorkflowLevel::Success,
        format!("{} released and {} recreated", disk.display(), root.display()),
    );
    Ok(())
}

/// Clear stale pool labels and wipe every signature from the disk.
pub fn wipe_disk(
    ctx: &mut PhaseContext<'_>,
    request: &InstallationRequest,
    plan: &PartitionPlan,
) -> InstallResult<WipedDisk> {
    let disk = request.disk();
    for index in plan.indices() {
        ctx.run(
            CommandSpec::new("zpool")
                .args(["labelclear", "-f"])
                .path_arg(partition_path(disk, index)),
            ExitPolicy::Tolerate(Tolerance::needles(NO_LABEL)),
        )?;
    }

    ctx.fatal(CommandSpec::new("wipefs").args(["-a", "-q"]).path_arg(disk))?;
    ctx.push(
        WorkflowLevel::Success,
        format!("Wiped all signatures from {}", disk.display()),
    );
    Ok(WipedDisk {
        disk: disk.to_path_buf(),
    })
}

/// Lay down the partition plan on a freshly wiped disk.
pub fn partition_disk(
    ctx: &mut PhaseContext<'_>,
    wiped: WipedDisk,
    plan: &PartitionPlan,
) -> InstallResult<()> {
    let disk = wiped.disk();
    ctx.fatal(CommandSpec::new("sgdisk").arg("--zap-all").path_arg(disk))?;
    for entry in plan.entries() {
        ctx.fatal(
            CommandSpec::new("sgdisk")
                .args(entry.sgdisk_args())
                .path_arg(disk),
        )?;
    }
    // partition nodes appear asynchronously
    ctx.run(CommandSpec::new("udevadm").arg("settle"), ExitPolicy::Ignore)?;
    ctx.push(
        WorkflowLevel::Success,
        format!(
            "Partitioned {} into {} partitions",
            disk.display(),
            plan.entries().len()
        ),
    );
    Ok(())
}

/// Create the pool on `device` and its dataset hierarchy.
pub fn create_pool(
    ctx: &mut PhaseContext<'_>,
    pool: &mut StoragePool,
    device: &Path,
) -> InstallResult<()> {
    ctx.fatal(CommandSpec::new("zpool").args(pool.create_args(device)))?;
    pool.mark_imported(Path::new("/"))?;
    for dataset in pool.datasets() {
        ctx.fatal(CommandSpec::new("zfs").args(dataset.create_args()))?;
    }
    ctx.push(
        WorkflowLevel::Success,
        format!(
            "Created pool {} with {} datasets",
            pool.name(),
            pool.datasets().len()
        ),
    );
    Ok(())
}

/// Export and re-import under the install root, then mount the root and
/// home datasets there.
pub fn verify_round_trip(
    ctx: &mut PhaseContext<'_>,
    pool: &mut StoragePool,
    root: &Path,
) -> InstallResult<()> {
    ctx.fatal(CommandSpec::new("zpool").arg("export").arg(pool.name()))?;
    pool.mark_exported();

    ctx.fatal(
        CommandSpec::new("zpool")
            .args(["import", "-N", "-R"])
            .path_arg(root)
            .arg(pool.name()),
    )?;
    pool.mark_imported(root)?;

    for dataset in pool.datasets().iter().filter(|dataset| dataset.is_mountable()) {
        ctx.fatal(CommandSpec::new("zfs").arg("mount").arg(dataset.name.as_str()))?;
    }
    ctx.push(
        WorkflowLevel::Success,
        format!("Pool {} imported under {}", pool.name(), root.display()),
    );
    Ok(())
}

/// Format the EFI system partition and mount it at `<root>/efi`.
pub fn prepare_efi(
    ctx: &mut PhaseContext<'_>,
    ledger: &mut MountLedger,
    device: &Path,
    root: &Path,
) -> InstallResult<()> {
    ctx.fatal(
        CommandSpec::new("mkfs.vfat")
            .args(["-F", "32", "-n", "EFI"])
            .path_arg(device),
    )?;
    let mount_point = under_root(root, Path::new("/efi"));
    ctx.make_dir(&mount_point)?;
    ledger.mount(
        ctx,
        MountEntry::new(
            device.to_string_lossy(),
            mount_point,
            FilesystemKind::Vfat,
        ),
    )
}

/// Everything between a released disk and a mounted root + EFI partition.
pub fn provision_storage(
    ctx: &mut PhaseContext<'_>,
    config: &InstallerConfig,
    request: &InstallationRequest,
    pool: &mut StoragePool,
    ledger: &mut MountLedger,
) -> InstallResult<ProvisionedStorage> {
    let plan = PartitionPlan::standard(&config.target.efi_size);
    let root = config.target.install_root.as_path();

    let wiped = wipe_disk(ctx, request, &plan)?;
    // the pool records the host id the installed system will boot with
    ctx.fatal(CommandSpec::new("zgenhostid").arg("-f"))?;
    partition_disk(ctx, wiped, &plan)?;

    let storage = ProvisionedStorage {
        efi_partition: request.partition(PartitionPlan::EFI_INDEX),
        pool_partition: request.partition(PartitionPlan::POOL_INDEX),
    };

    create_pool(ctx, pool, &storage.pool_partition)?;
    verify_round_trip(ctx, pool, root)?;
    prepare_efi(ctx, ledger, &storage.efi_partition, root)?;
    Ok(storage)
}
