//! Chrooted configuration of the new root.
//!
//! Steps are independent: a failing step is recorded with its output and the
//! remaining steps still run.

use super::{AttachedRoot, PhaseContext, WorkflowLevel, WorkflowReport};
use crate::config::InstallerConfig;
use crate::error::{InstallError, InstallResult};
use crate::executor::{CommandSpec, ExitPolicy, Tolerance};
use crate::parse::boot_entries_with_label;
use crate::pool::PartitionPlan;
use crate::render::{
    BootEntry, BootMenuArgs, HostId, KernelCommandline, LocaleConf, LocaleGen, MkinitcpioConf,
    MkinitcpioPreset, SudoersFragment, VconsoleConf,
};
use crate::request::InstallationRequest;
use log::{error, info};
use std::fmt;
use std::path::Path;

/// `userdel`: the account does not exist.
const USERDEL_NO_SUCH_USER: i32 = 6;
/// `useradd`: the account already exists.
const USERADD_EXISTS: i32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationStep {
    Locale,
    BootPreset,
    Bootloader,
    Identity,
    Services,
}

impl ConfigurationStep {
    pub const ALL: [ConfigurationStep; 5] = [
        ConfigurationStep::Locale,
        ConfigurationStep::BootPreset,
        ConfigurationStep::Bootloader,
        ConfigurationStep::Identity,
        ConfigurationStep::Services,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationStep::Locale => "locale",
            ConfigurationStep::BootPreset => "boot-preset",
            ConfigurationStep::Bootloader => "bootloader",
            ConfigurationStep::Identity => "identity",
            ConfigurationStep::Services => "services",
        }
    }
}

impl fmt::Display for ConfigurationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed { message: String, output: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: ConfigurationStep,
    pub status: StepStatus,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Outcome of every step plus the phase's workflow events.
#[derive(Debug, Clone)]
pub struct ConfigurationReport {
    pub outcomes: Vec<StepOutcome>,
    pub report: WorkflowReport,
}

impl ConfigurationReport {
    pub fn failed(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.succeeded())
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Aggregate error naming every failed step, if any failed.
    pub fn error(&self) -> Option<InstallError> {
        let failed: Vec<&str> = self.failed().map(|outcome| outcome.step.as_str()).collect();
        if failed.is_empty() {
            return None;
        }
        Some(InstallError::ConfigurationFailed {
            failed: failed.len(),
            total: self.outcomes.len(),
            steps: failed.join(", "),
        })
    }
}

/// Run every configuration step against the attached root.
pub fn configure_system(
    mut ctx: PhaseContext<'_>,
    config: &InstallerConfig,
    request: &InstallationRequest,
    root: &AttachedRoot,
) -> ConfigurationReport {
    let mut outcomes = Vec::with_capacity(ConfigurationStep::ALL.len());
    for step in ConfigurationStep::ALL {
        let result = match step {
            ConfigurationStep::Locale => locale(&mut ctx, config, root),
            ConfigurationStep::BootPreset => boot_preset(&mut ctx, config, root),
            ConfigurationStep::Bootloader => bootloader(&mut ctx, config, request, root),
            ConfigurationStep::Identity => identity(&mut ctx, config, request, root),
            ConfigurationStep::Services => services(&mut ctx, config, root),
        };
        let status = match result {
            Ok(()) => {
                info!("configuration step {step} succeeded");
                ctx.push(WorkflowLevel::Success, format!("Step {step} complete"));
                StepStatus::Succeeded
            }
            Err(err) => {
                error!("configuration step {step} failed: {err}");
                ctx.push(WorkflowLevel::Error, format!("Step {step} failed: {err}"));
                let output = match &err {
                    InstallError::CommandFailed { diagnostic, .. } => diagnostic.clone(),
                    _ => String::new(),
                };
                StepStatus::Failed {
                    message: err.to_string(),
                    output,
                }
            }
        };
        outcomes.push(StepOutcome { step, status });
    }

    ConfigurationReport {
        outcomes,
        report: ctx.into_report("System configuration"),
    }
}

fn in_root(root: &AttachedRoot, program: &str) -> CommandSpec {
    CommandSpec::new(program).chroot(root.path())
}

fn locale(
    ctx: &mut PhaseContext<'_>,
    config: &InstallerConfig,
    root: &AttachedRoot,
) -> InstallResult<()> {
    let locale = &config.locale;
    let existing = ctx
        .read_file(&root.join("/etc/locale.gen"))?
        .unwrap_or_default();
    ctx.write_config(
        root.path(),
        &LocaleGen::enable(existing, &locale.lang, &locale.charset),
    )?;
    ctx.write_config(
        root.path(),
        &LocaleConf {
            lang: locale.lang.clone(),
        },
    )?;
    ctx.write_config(
        root.path(),
        &VconsoleConf {
            keymap: locale.keymap.clone(),
        },
    )?;
    ctx.fatal(
        in_root(root, "ln")
            .arg("-sf")
            .arg(format!("/usr/share/zoneinfo/{}", locale.timezone))
            .arg("/etc/localtime"),
    )?;
    ctx.fatal(in_root(root, "locale-gen"))?;
    // virtual machines frequently have no usable RTC
    ctx.run(in_root(root, "hwclock").arg("--systohc"), ExitPolicy::Ignore)?;
    Ok(())
}

fn boot_preset(
    ctx: &mut PhaseContext<'_>,
    config: &InstallerConfig,
    root: &AttachedRoot,
) -> InstallResult<()> {
    ctx.remove(
        &root.join("/etc/mkinitcpio.conf.d/archiso.conf"),
        ExitPolicy::Fatal,
    )?;
    ctx.write_config(
        root.path(),
        &MkinitcpioPreset {
            kernel: config.image.kernel.clone(),
        },
    )?;

    let conf_path = root.join("/etc/mkinitcpio.conf");
    let existing = ctx.read_file(&conf_path)?.ok_or_else(|| {
        InstallError::Precondition(format!("{} is missing", conf_path.display()))
    })?;
    ctx.write_config(root.path(), &MkinitcpioConf::with_pool_hook(&existing)?)?;

    ctx.fatal(in_root(root, "mkinitcpio").arg("-P"))?;
    Ok(())
}

fn bootloader(
    ctx: &mut PhaseContext<'_>,
    config: &InstallerConfig,
    request: &InstallationRequest,
    root: &AttachedRoot,
) -> InstallResult<()> {
    let pool = config.target.pool.as_str();
    let boot = &config.boot;

    ctx.fatal(
        in_root(root, "zpool")
            .args(["set", "cachefile=/etc/zfs/zpool.cache"])
            .arg(pool),
    )?;
    ctx.fatal(
        in_root(root, "zpool")
            .arg("set")
            .arg(format!("bootfs={}", config.boot_dataset()))
            .arg(pool),
    )?;
    ctx.fatal(
        in_root(root, "systemctl")
            .arg("enable")
            .args(config.services.pool_units.iter().cloned()),
    )?;

    let image_name = boot
        .efi_image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            InstallError::InvalidConfig(format!(
                "boot.efi_image has no file name: {}",
                boot.efi_image.display()
            ))
        })?;
    let esp_dir = root.join(Path::new("/efi").join(&boot.efi_dir));
    ctx.make_dir(&esp_dir)?;
    ctx.fatal(
        CommandSpec::new("mv")
            .path_arg(root.join(&boot.efi_image))
            .path_arg(esp_dir.join(&image_name)),
    )?;

    let raw = ctx.fatal(in_root(root, "hostid"))?;
    let hostid = HostId::parse(&raw.stdout)?;

    let existing = ctx.run(in_root(root, "efibootmgr"), ExitPolicy::Inspect)?;
    for number in boot_entries_with_label(&existing.stdout, &boot.label) {
        ctx.run(
            in_root(root, "efibootmgr").args(["-B", "-b"]).arg(number.as_str()),
            ExitPolicy::Ignore,
        )?;
        ctx.push(
            WorkflowLevel::Info,
            format!("Removed stale boot entry Boot{number}"),
        );
    }

    let entry = BootEntry {
        disk: request.disk().to_path_buf(),
        partition: PartitionPlan::EFI_INDEX,
        label: boot.label.clone(),
        loader: BootEntry::loader_path(&boot.efi_dir, &image_name),
        args: BootMenuArgs {
            hostid: hostid.clone(),
            timeout: boot.menu_timeout,
            pool: pool.to_string(),
        },
    };
    ctx.fatal(in_root(root, "efibootmgr").args(entry.efibootmgr_args()))?;

    let cmdline = KernelCommandline {
        options: boot.kernel_options.clone(),
        hostid,
    };
    ctx.fatal(
        in_root(root, "zfs")
            .arg("set")
            .arg(format!("org.zfsbootmenu:commandline={cmdline}"))
            .arg(config.root_namespace()),
    )?;
    ctx.push(
        WorkflowLevel::Info,
        format!("Firmware entry {} points at {}", boot.label, entry.loader),
    );
    Ok(())
}

fn identity(
    ctx: &mut PhaseContext<'_>,
    config: &InstallerConfig,
    request: &InstallationRequest,
    root: &AttachedRoot,
) -> InstallResult<()> {
    let identity = &config.identity;
    let staging = identity.staging_user.as_str();

    ctx.run(
        in_root(root, "userdel").arg(staging),
        ExitPolicy::Tolerate(Tolerance::codes(&[USERDEL_NO_SUCH_USER])),
    )?;
    ctx.remove(&root.join(Path::new("/home").join(staging)), ExitPolicy::Fatal)?;
    ctx.remove(&root.join(SudoersFragment::path_for(staging)), ExitPolicy::Fatal)?;

    let user = request.username();
    ctx.run(
        in_root(root, "useradd")
            .args(["-m", "-g"])
            .arg(identity.primary_group.as_str())
            .arg("-G")
            .arg(identity.admin_groups.join(","))
            .arg(user),
        ExitPolicy::Tolerate(Tolerance::codes(&[USERADD_EXISTS])),
    )?;
    ctx.fatal(in_root(root, "chpasswd").secret_stdin(request.chpasswd_line()))?;
    ctx.write_config(
        root.path(),
        &SudoersFragment {
            user: user.to_string(),
        },
    )?;
    ctx.remove(&root.join(&identity.autologin_dropin), ExitPolicy::Fatal)?;
    Ok(())
}

fn services(
    ctx: &mut PhaseContext<'_>,
    config: &InstallerConfig,
    root: &AttachedRoot,
) -> InstallResult<()> {
    let units = &config.services;
    ctx.fatal(
        in_root(root, "systemctl")
            .arg("enable")
            .args(units.pool_units.iter().chain(&units.system_units).cloned()),
    )?;
    Ok(())
}
