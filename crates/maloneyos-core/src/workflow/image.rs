//! Image installation: extract the root image and make the new root usable
//! for chrooted configuration.

use super::{under_root, PhaseContext, WorkflowLevel};
use crate::config::{ImageCfg, InstallerConfig};
use crate::error::InstallResult;
use crate::executor::{CommandSpec, ExitPolicy};
use crate::ledger::{FilesystemKind, MountEntry, MountLedger};
use crate::parse::iso_device;
use std::path::{Path, PathBuf};

/// Pseudo-filesystems attached in mount order: source, path under root, kind.
const PSEUDO_FILESYSTEMS: &[(&str, &str, FilesystemKind)] = &[
    ("udev", "dev", FilesystemKind::Devtmpfs),
    ("proc", "proc", FilesystemKind::Proc),
    ("sys", "sys", FilesystemKind::Sysfs),
    ("efivarfs", "sys/firmware/efi/efivars", FilesystemKind::Efivarfs),
];

/// Proof that the root is extracted and the pseudo-filesystems are attached.
/// Only `install_image` makes one; configuration steps require it.
#[derive(Debug)]
pub struct AttachedRoot {
    root: PathBuf,
}

impl AttachedRoot {
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `path` (as seen from inside the new root) on the host.
    pub fn join(&self, path: impl AsRef<Path>) -> PathBuf {
        under_root(&self.root, path.as_ref())
    }
}

pub fn install_image(
    ctx: &mut PhaseContext<'_>,
    config: &InstallerConfig,
    ledger: &mut MountLedger,
) -> InstallResult<AttachedRoot> {
    let root = config.target.install_root.clone();
    let media_ready = detect_boot_media(ctx, &config.image)?;

    ctx.fatal(
        CommandSpec::new("unsquashfs")
            .args(["-f", "-d"])
            .path_arg(&root)
            .path_arg(&config.image.source),
    )?;
    ctx.push(
        WorkflowLevel::Success,
        format!(
            "Extracted {} into {}",
            config.image.source.display(),
            root.display()
        ),
    );

    for (source, relative, kind) in PSEUDO_FILESYSTEMS {
        let mount_point = root.join(relative);
        ctx.make_dir(&mount_point)?;
        ledger.mount(ctx, MountEntry::new(*source, mount_point, *kind))?;
    }
    let attached = AttachedRoot { root };

    copy_host_artifacts(ctx, &config.image, &attached, media_ready)?;

    for path in &config.image.live_only {
        ctx.remove(&attached.join(path), ExitPolicy::Ignore)?;
    }
    Ok(attached)
}

/// Make sure the live boot media is mounted. Only kernel and microcode copies
/// depend on it, so every failure here is a warning.
fn detect_boot_media(ctx: &mut PhaseContext<'_>, image: &ImageCfg) -> InstallResult<bool> {
    if ctx.is_mounted(&image.boot_media)? {
        return Ok(true);
    }

    let listing = ctx.run(
        CommandSpec::new("lsblk").args(["-rno", "PATH,FSTYPE,LABEL"]),
        ExitPolicy::Ignore,
    )?;
    let Some(device) = iso_device(&listing.stdout, &image.boot_media_label_prefix) else {
        ctx.push(
            WorkflowLevel::Warn,
            format!(
                "No iso9660 device labelled {}*; kernel and microcode will not be copied",
                image.boot_media_label_prefix
            ),
        );
        return Ok(false);
    };

    ctx.run(
        CommandSpec::new("mkdir").arg("-p").path_arg(&image.boot_media),
        ExitPolicy::Ignore,
    )?;
    // the live system owns this mount; it stays out of the ledger
    let mounted = ctx.run(
        CommandSpec::new("mount")
            .args(["-o", "ro"])
            .arg(device.as_str())
            .path_arg(&image.boot_media),
        ExitPolicy::Ignore,
    )?;
    if mounted.success() {
        ctx.push(
            WorkflowLevel::Info,
            format!("Mounted boot media {device} at {}", image.boot_media.display()),
        );
    }
    Ok(mounted.success())
}

fn copy_host_artifacts(
    ctx: &mut PhaseContext<'_>,
    image: &ImageCfg,
    root: &AttachedRoot,
    media_ready: bool,
) -> InstallResult<()> {
    ctx.copy_file(
        Path::new("/etc/hostid"),
        &root.join("/etc/hostid"),
        0o644,
        ExitPolicy::Fatal,
    )?;

    if !media_ready {
        ctx.push(
            WorkflowLevel::Warn,
            "Boot media unavailable; skipped kernel and microcode copies",
        );
        return Ok(());
    }

    let kernel = format!("vmlinuz-{}", image.kernel);
    let mut boot_files = vec![(image.boot_media.join(&image.kernel_dir).join(&kernel), kernel)];
    for microcode in &image.microcode {
        boot_files.push((
            image.boot_media.join(&image.microcode_dir).join(microcode),
            microcode.clone(),
        ));
    }

    for (source, name) in boot_files {
        let dest = root.join(Path::new("/boot").join(&name));
        let copied = ctx.copy_file(&source, &dest, 0o644, ExitPolicy::Ignore)?;
        if copied.success() {
            ctx.push(WorkflowLevel::Info, format!("Copied {name} into /boot"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstallError;
    use crate::executor::{CommandExecutor, CommandOutput};
    use crate::progress::LogSink;
    use crate::state::PipelineState;
    use std::cell::RefCell;

    struct Host {
        media_mounted: bool,
        lsblk: &'static str,
        fail_prefix: Option<&'static str>,
        seen: RefCell<Vec<String>>,
    }

    impl Host {
        fn new(media_mounted: bool) -> Self {
            Self {
                media_mounted,
                lsblk: "",
                fail_prefix: None,
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl CommandExecutor for Host {
        fn execute(&self, spec: &CommandSpec) -> InstallResult<CommandOutput> {
            let line = spec.command_line();
            self.seen.borrow_mut().push(line.clone());
            let status = match (spec.program.as_str(), self.fail_prefix) {
                (_, Some(prefix)) if line.starts_with(prefix) => 1,
                ("mountpoint", _) if !self.media_mounted => 32,
                _ => 0,
            };
            let stdout = if spec.program == "lsblk" {
                self.lsblk.to_string()
            } else {
                String::new()
            };
            Ok(CommandOutput {
                status,
                stdout,
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn extraction_failure_attaches_nothing() {
        let mut host = Host::new(true);
        host.fail_prefix = Some("unsquashfs");
        let sink = LogSink;
        let mut ctx = PhaseContext::new(&host, &sink, PipelineState::Installing);
        let mut ledger = MountLedger::new();

        let err = install_image(&mut ctx, &InstallerConfig::default(), &mut ledger).unwrap_err();
        assert!(matches!(err, InstallError::CommandFailed { .. }));
        assert!(ledger.is_empty());
    }

    #[test]
    fn pseudo_filesystems_are_recorded_in_mount_order() {
        let host = Host::new(true);
        let sink = LogSink;
        let mut ctx = PhaseContext::new(&host, &sink, PipelineState::Installing);
        let mut ledger = MountLedger::new();

        let attached = install_image(&mut ctx, &InstallerConfig::default(), &mut ledger).unwrap();
        assert_eq!(attached.path(), Path::new("/tmp/maloneyos"));
        let points: Vec<PathBuf> = ledger
            .entries()
            .iter()
            .map(|entry| entry.mount_point.clone())
            .collect();
        assert_eq!(
            points,
            vec![
                PathBuf::from("/tmp/maloneyos/dev"),
                PathBuf::from("/tmp/maloneyos/proc"),
                PathBuf::from("/tmp/maloneyos/sys"),
                PathBuf::from("/tmp/maloneyos/sys/firmware/efi/efivars"),
            ]
        );

        let seen = host.seen.borrow();
        assert!(seen.contains(
            &"install -D -m 0644 /etc/hostid /tmp/maloneyos/etc/hostid".to_string()
        ));
        assert!(seen.contains(
            &"install -D -m 0644 /run/archiso/bootmnt/arch/boot/x86_64/vmlinuz-linux-lts /tmp/maloneyos/boot/vmlinuz-linux-lts"
                .to_string()
        ));
        assert!(seen.contains(
            &"install -D -m 0644 /run/archiso/bootmnt/arch/boot/intel-ucode.img /tmp/maloneyos/boot/intel-ucode.img"
                .to_string()
        ));
        assert_eq!(seen.last().map(String::as_str), Some("rm -rf /tmp/maloneyos/maloneyos"));
    }

    #[test]
    fn hostid_copy_failure_is_fatal() {
        let mut host = Host::new(true);
        host.fail_prefix = Some("install -D -m 0644 /etc/hostid");
        let sink = LogSink;
        let mut ctx = PhaseContext::new(&host, &sink, PipelineState::Installing);
        let mut ledger = MountLedger::new();

        let err = install_image(&mut ctx, &InstallerConfig::default(), &mut ledger).unwrap_err();
        match err {
            InstallError::CommandFailed { command, .. } => {
                assert!(command.contains("/etc/hostid"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // pseudo-filesystems stay in the ledger for teardown to detach
        assert_eq!(ledger.entries().len(), PSEUDO_FILESYSTEMS.len());
        assert!(!host
            .seen
            .borrow()
            .iter()
            .any(|line| line.contains("vmlinuz")));
    }

    #[test]
    fn kernel_copy_failure_only_warns() {
        let mut host = Host::new(true);
        host.fail_prefix = Some("install -D -m 0644 /run/archiso/bootmnt/arch/boot/x86_64/vmlinuz");
        let sink = LogSink;
        let mut ctx = PhaseContext::new(&host, &sink, PipelineState::Installing);
        let mut ledger = MountLedger::new();

        install_image(&mut ctx, &InstallerConfig::default(), &mut ledger).unwrap();
        assert!(host
            .seen
            .borrow()
            .iter()
            .any(|line| line.ends_with("/tmp/maloneyos/boot/intel-ucode.img")));
        let report = ctx.into_report("install");
        let warnings: Vec<_> = report.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("vmlinuz-linux-lts"));
    }

    #[test]
    fn missing_boot_media_only_warns() {
        let mut host = Host::new(false);
        host.lsblk = "/dev/sda \n/dev/sda1 vfat EFI\n";
        let sink = LogSink;
        let mut ctx = PhaseContext::new(&host, &sink, PipelineState::Installing);
        let mut ledger = MountLedger::new();

        install_image(&mut ctx, &InstallerConfig::default(), &mut ledger).unwrap();
        assert!(!host
            .seen
            .borrow()
            .iter()
            .any(|line| line.contains("vmlinuz")));
        let report = ctx.into_report("install");
        assert!(report.warnings().count() >= 2);
    }

    #[test]
    fn boot_media_is_mounted_read_only_when_found() {
        let mut host = Host::new(false);
        host.lsblk = "/dev/sr0 iso9660 ARCH_202410\n";
        let sink = LogSink;
        let mut ctx = PhaseContext::new(&host, &sink, PipelineState::Installing);

        assert!(detect_boot_media(&mut ctx, &ImageCfg::default()).unwrap());
        assert!(host
            .seen
            .borrow()
            .contains(&"mount -o ro /dev/sr0 /run/archiso/bootmnt".to_string()));
    }
}
