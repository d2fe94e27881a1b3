//! Typed representations of every file and argument string the installer
//! generates inside the new root.
//!
//! Each file is a value; `ConfigFile::render` is the only place text gets
//! produced.

use crate::error::{InstallError, InstallResult};
use std::fmt;
use std::path::{Path, PathBuf};

/// Path, permissions and text of a rendered file (path is inside the new root).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub mode: u32,
    pub contents: String,
}

/// A file the installer writes into the target system.
pub trait ConfigFile {
    /// Absolute path as seen from inside the new root.
    fn path(&self) -> PathBuf;

    fn mode(&self) -> u32 {
        0o644
    }

    fn contents(&self) -> String;

    fn render(&self) -> RenderedFile {
        RenderedFile {
            path: self.path(),
            mode: self.mode(),
            contents: self.contents(),
        }
    }
}

/// `/etc/locale.conf`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleConf {
    pub lang: String,
}

impl ConfigFile for LocaleConf {
    fn path(&self) -> PathBuf {
        PathBuf::from("/etc/locale.conf")
    }

    fn contents(&self) -> String {
        format!("LANG={}\n", self.lang)
    }
}

/// `/etc/vconsole.conf`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VconsoleConf {
    pub keymap: String,
}

impl ConfigFile for VconsoleConf {
    fn path(&self) -> PathBuf {
        PathBuf::from("/etc/vconsole.conf")
    }

    fn contents(&self) -> String {
        format!("KEYMAP={}\n", self.keymap)
    }
}

/// `/etc/locale.gen` with one locale switched on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleGen {
    existing: String,
    entry: String,
}

impl LocaleGen {
    pub fn enable(existing: impl Into<String>, lang: &str, charset: &str) -> Self {
        Self {
            existing: existing.into(),
            entry: format!("{lang} {charset}"),
        }
    }
}

impl ConfigFile for LocaleGen {
    fn path(&self) -> PathBuf {
        PathBuf::from("/etc/locale.gen")
    }

    fn contents(&self) -> String {
        let mut lines: Vec<String> = self.existing.lines().map(str::to_string).collect();
        let active = lines.iter().any(|line| line.trim() == self.entry);
        if !active {
            // header examples are "#  entry"; the real list is "#entry"
            let commented = lines.iter().position(|line| {
                line.strip_prefix('#').map(str::trim_end) == Some(self.entry.as_str())
            });
            match commented {
                Some(idx) => lines[idx] = self.entry.clone(),
                None => lines.push(self.entry.clone()),
            }
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

/// mkinitcpio preset for the installed kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkinitcpioPreset {
    pub kernel: String,
}

impl ConfigFile for MkinitcpioPreset {
    fn path(&self) -> PathBuf {
        PathBuf::from(format!("/etc/mkinitcpio.d/{}.preset", self.kernel))
    }

    fn contents(&self) -> String {
        let kernel = &self.kernel;
        format!(
            "# mkinitcpio preset file for the '{kernel}' package\n\
             \n\
             ALL_kver=\"/boot/vmlinuz-{kernel}\"\n\
             ALL_microcode=(/boot/*-ucode.img)\n\
             \n\
             PRESETS=('default' 'fallback')\n\
             \n\
             default_image=\"/boot/initramfs-{kernel}.img\"\n\
             \n\
             fallback_image=\"/boot/initramfs-{kernel}-fallback.img\"\n\
             fallback_options=\"-S autodetect\"\n"
        )
    }
}

/// `/etc/mkinitcpio.conf` with the pool hook placed before `filesystems`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkinitcpioConf {
    contents: String,
}

impl MkinitcpioConf {
    /// Rewrite the active `HOOKS=(...)` line: `zfs` goes immediately before
    /// `filesystems` and `fsck` is dropped. Applying it twice is a no-op.
    pub fn with_pool_hook(existing: &str) -> InstallResult<Self> {
        let mut found = false;
        let mut lines = Vec::new();
        for line in existing.lines() {
            let trimmed = line.trim_start();
            if !found && trimmed.starts_with("HOOKS=(") {
                let hooks = parse_hooks(trimmed).ok_or_else(|| {
                    InstallError::InvalidConfig(format!("unparseable HOOKS line: {line}"))
                })?;
                lines.push(render_hooks(&order_pool_hook(hooks)));
                found = true;
            } else {
                lines.push(line.to_string());
            }
        }
        if !found {
            return Err(InstallError::InvalidConfig(
                "mkinitcpio.conf has no active HOOKS=(...) line".to_string(),
            ));
        }
        let mut contents = lines.join("\n");
        contents.push('\n');
        Ok(Self { contents })
    }
}

impl ConfigFile for MkinitcpioConf {
    fn path(&self) -> PathBuf {
        PathBuf::from("/etc/mkinitcpio.conf")
    }

    fn contents(&self) -> String {
        self.contents.clone()
    }
}

fn parse_hooks(line: &str) -> Option<Vec<String>> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    if close < open {
        return None;
    }
    Some(
        line[open + 1..close]
            .split_whitespace()
            .map(str::to_string)
            .collect(),
    )
}

fn order_pool_hook(hooks: Vec<String>) -> Vec<String> {
    let mut ordered: Vec<String> = hooks
        .into_iter()
        .filter(|hook| hook != "zfs" && hook != "fsck")
        .collect();
    match ordered.iter().position(|hook| hook == "filesystems") {
        Some(idx) => ordered.insert(idx, "zfs".to_string()),
        None => ordered.push("zfs".to_string()),
    }
    ordered
}

fn render_hooks(hooks: &[String]) -> String {
    format!("HOOKS=({})", hooks.join(" "))
}

/// `/etc/sudoers.d/00_<user>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SudoersFragment {
    pub user: String,
}

impl SudoersFragment {
    pub fn path_for(user: &str) -> PathBuf {
        PathBuf::from(format!("/etc/sudoers.d/00_{user}"))
    }
}

impl ConfigFile for SudoersFragment {
    fn path(&self) -> PathBuf {
        Self::path_for(&self.user)
    }

    fn mode(&self) -> u32 {
        0o440
    }

    fn contents(&self) -> String {
        format!("{} ALL=(ALL) ALL\n", self.user)
    }
}

/// Host id as printed by `hostid`: eight lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostId(String);

impl HostId {
    pub fn parse(raw: &str) -> InstallResult<Self> {
        let value = raw.trim().trim_start_matches("0x").to_ascii_lowercase();
        if value.len() != 8 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InstallError::Precondition(format!(
                "hostid output `{}` is not an 8-digit hex value",
                raw.trim()
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.0)
    }
}

/// Arguments ZFSBootMenu reads from its firmware entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootMenuArgs {
    pub hostid: HostId,
    pub timeout: u32,
    pub pool: String,
}

impl fmt::Display for BootMenuArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spl_hostid={} zbm.timeout={} zbm.prefer={} zbm.import_policy=hostid",
            self.hostid, self.timeout, self.pool
        )
    }
}

/// A firmware boot entry created with `efibootmgr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub disk: PathBuf,
    pub partition: u32,
    pub label: String,
    pub loader: String,
    pub args: BootMenuArgs,
}

impl BootEntry {
    /// Firmware loader path (`\EFI\zbm\zfsbootmenu.EFI`) for a file below the ESP.
    pub fn loader_path(efi_dir: &Path, image: &str) -> String {
        let mut loader = String::new();
        for component in efi_dir.components() {
            let part = component.as_os_str().to_string_lossy();
            if part == "/" {
                continue;
            }
            loader.push('\\');
            loader.push_str(&part);
        }
        loader.push('\\');
        loader.push_str(image);
        loader
    }

    pub fn efibootmgr_args(&self) -> Vec<String> {
        vec![
            "--disk".to_string(),
            self.disk.to_string_lossy().into_owned(),
            "--part".to_string(),
            self.partition.to_string(),
            "--create".to_string(),
            "--label".to_string(),
            self.label.clone(),
            "--loader".to_string(),
            self.loader.clone(),
            "--unicode".to_string(),
            self.args.to_string(),
            "--verbose".to_string(),
        ]
    }
}

/// Value of the `org.zfsbootmenu:commandline` property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCommandline {
    pub options: Vec<String>,
    pub hostid: HostId,
}

impl fmt::Display for KernelCommandline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for option in &self.options {
            write!(f, "{option} ")?;
        }
        write!(f, "spl.spl_hostid={}", self.hostid)
    }
}
