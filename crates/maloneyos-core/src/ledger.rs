//! Ordered record of the mounts made under the install root.

use crate::error::InstallResult;
use crate::executor::{CommandSpec, ExitPolicy, Tolerance};
use crate::workflow::{PhaseContext, WorkflowLevel};
use std::fmt;
use std::path::{Path, PathBuf};

/// Filesystem types the installer mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Vfat,
    Devtmpfs,
    Proc,
    Sysfs,
    Efivarfs,
}

impl FilesystemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemKind::Vfat => "vfat",
            FilesystemKind::Devtmpfs => "devtmpfs",
            FilesystemKind::Proc => "proc",
            FilesystemKind::Sysfs => "sysfs",
            FilesystemKind::Efivarfs => "efivarfs",
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub kind: FilesystemKind,
}

impl MountEntry {
    pub fn new(source: impl Into<String>, mount_point: impl Into<PathBuf>, kind: FilesystemKind) -> Self {
        Self {
            source: source.into(),
            mount_point: mount_point.into(),
            kind,
        }
    }
}

/// Mounts in the order they were made. Entries are only ever added after the
/// mount succeeded and only removed after the unmount succeeded.
#[derive(Debug, Default)]
pub struct MountLedger {
    entries: Vec<MountEntry>,
}

impl MountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: MountEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, mount_point: &Path) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.mount_point == mount_point)
    }

    /// `mount -t <kind> <source> <mount point>`, recorded once it succeeds.
    pub fn mount(&mut self, ctx: &mut PhaseContext<'_>, entry: MountEntry) -> InstallResult<()> {
        ctx.fatal(
            CommandSpec::new("mount")
                .arg("-t")
                .arg(entry.kind.as_str())
                .arg(entry.source.as_str())
                .path_arg(&entry.mount_point),
        )?;
        ctx.push(
            WorkflowLevel::Info,
            format!("Mounted {} at {}", entry.kind, entry.mount_point.display()),
        );
        self.record(entry);
        Ok(())
    }

    /// Unmount newest first. "Not mounted" counts as done; any other failure
    /// stops the unwind and leaves that entry and everything older recorded.
    pub fn unwind(&mut self, ctx: &mut PhaseContext<'_>) -> InstallResult<usize> {
        let mut released = 0;
        while let Some(entry) = self.entries.last() {
            ctx.run(
                CommandSpec::new("umount").path_arg(&entry.mount_point),
                ExitPolicy::Tolerate(Tolerance::needles(&["not mounted", "no mount point"])),
            )?;
            self.entries.pop();
            released += 1;
        }
        Ok(released)
    }
}
