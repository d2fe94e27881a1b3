use crate::error::{InstallError, InstallResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the installer configuration on the live media.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/maloneyos-installer.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetCfg {
    #[serde(default = "default_install_root")]
    pub install_root: PathBuf,

    #[serde(default = "default_pool")]
    pub pool: String,

    /// Name of the boot environment under `<pool>/ROOT`.
    #[serde(default = "default_boot_environment")]
    pub boot_environment: String,

    #[serde(default = "default_efi_size")]
    pub efi_size: String,
}

fn default_install_root() -> PathBuf {
    PathBuf::from("/tmp/maloneyos")
}

fn default_pool() -> String {
    "zroot".to_string()
}

fn default_boot_environment() -> String {
    "arch".to_string()
}

fn default_efi_size() -> String {
    "+512M".to_string()
}

impl Default for TargetCfg {
    fn default() -> Self {
        Self {
            install_root: default_install_root(),
            pool: default_pool(),
            boot_environment: default_boot_environment(),
            efi_size: default_efi_size(),
        }
    }
}

/// Files written by the selection wizard before the pipeline starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffCfg {
    #[serde(default = "default_disk_file")]
    pub disk_file: PathBuf,

    #[serde(default = "default_username_file")]
    pub username_file: PathBuf,

    #[serde(default = "default_password_file")]
    pub password_file: PathBuf,
}

fn default_disk_file() -> PathBuf {
    PathBuf::from("/tmp/selected-disk")
}

fn default_username_file() -> PathBuf {
    PathBuf::from("/tmp/username")
}

fn default_password_file() -> PathBuf {
    PathBuf::from("/tmp/password")
}

impl Default for HandoffCfg {
    fn default() -> Self {
        Self {
            disk_file: default_disk_file(),
            username_file: default_username_file(),
            password_file: default_password_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCfg {
    /// Block device (or file) holding the squashfs root image.
    #[serde(default = "default_image_source")]
    pub source: PathBuf,

    #[serde(default = "default_boot_media")]
    pub boot_media: PathBuf,

    #[serde(default = "default_boot_media_label_prefix")]
    pub boot_media_label_prefix: String,

    #[serde(default = "default_kernel")]
    pub kernel: String,

    /// Directory on the boot media that holds `vmlinuz-<kernel>`.
    #[serde(default = "default_kernel_dir")]
    pub kernel_dir: PathBuf,

    /// Directory on the boot media that holds the microcode images.
    #[serde(default = "default_microcode_dir")]
    pub microcode_dir: PathBuf,

    #[serde(default = "default_microcode")]
    pub microcode: Vec<String>,

    /// Paths inside the new root that only make sense on the live media.
    #[serde(default = "default_live_only")]
    pub live_only: Vec<PathBuf>,
}

fn default_image_source() -> PathBuf {
    PathBuf::from("/dev/loop0")
}

fn default_boot_media() -> PathBuf {
    PathBuf::from("/run/archiso/bootmnt")
}

fn default_boot_media_label_prefix() -> String {
    "ARCH".to_string()
}

fn default_kernel() -> String {
    "linux-lts".to_string()
}

fn default_kernel_dir() -> PathBuf {
    PathBuf::from("arch/boot/x86_64")
}

fn default_microcode_dir() -> PathBuf {
    PathBuf::from("arch/boot")
}

fn default_microcode() -> Vec<String> {
    vec!["amd-ucode.img".to_string(), "intel-ucode.img".to_string()]
}

fn default_live_only() -> Vec<PathBuf> {
    vec![PathBuf::from("/maloneyos")]
}

impl Default for ImageCfg {
    fn default() -> Self {
        Self {
            source: default_image_source(),
            boot_media: default_boot_media(),
            boot_media_label_prefix: default_boot_media_label_prefix(),
            kernel: default_kernel(),
            kernel_dir: default_kernel_dir(),
            microcode_dir: default_microcode_dir(),
            microcode: default_microcode(),
            live_only: default_live_only(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocaleCfg {
    #[serde(default = "default_lang")]
    pub lang: String,

    #[serde(default = "default_charset")]
    pub charset: String,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_keymap")]
    pub keymap: String,
}

fn default_lang() -> String {
    "en_US.UTF-8".to_string()
}

fn default_charset() -> String {
    "UTF-8".to_string()
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_keymap() -> String {
    "de_CH-latin1".to_string()
}

impl Default for LocaleCfg {
    fn default() -> Self {
        Self {
            lang: default_lang(),
            charset: default_charset(),
            timezone: default_timezone(),
            keymap: default_keymap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootCfg {
    #[serde(default = "default_boot_label")]
    pub label: String,

    /// Boot-manager image shipped at the top of the extracted root.
    #[serde(default = "default_efi_image")]
    pub efi_image: PathBuf,

    /// Directory under the EFI mount that receives the image.
    #[serde(default = "default_efi_dir")]
    pub efi_dir: PathBuf,

    #[serde(default = "default_menu_timeout")]
    pub menu_timeout: u32,

    #[serde(default = "default_kernel_options")]
    pub kernel_options: Vec<String>,
}

fn default_boot_label() -> String {
    "ZFSBootMenu".to_string()
}

fn default_efi_image() -> PathBuf {
    PathBuf::from("/zfsbootmenu.EFI")
}

fn default_efi_dir() -> PathBuf {
    PathBuf::from("EFI/zbm")
}

fn default_menu_timeout() -> u32 {
    3
}

fn default_kernel_options() -> Vec<String> {
    vec![
        "noresume".to_string(),
        "init_on_alloc=0".to_string(),
        "rw".to_string(),
    ]
}

impl Default for BootCfg {
    fn default() -> Self {
        Self {
            label: default_boot_label(),
            efi_image: default_efi_image(),
            efi_dir: default_efi_dir(),
            menu_timeout: default_menu_timeout(),
            kernel_options: default_kernel_options(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityCfg {
    /// Placeholder account baked into the live image.
    #[serde(default = "default_staging_user")]
    pub staging_user: String,

    #[serde(default = "default_primary_group")]
    pub primary_group: String,

    #[serde(default = "default_admin_groups")]
    pub admin_groups: Vec<String>,

    #[serde(default = "default_autologin")]
    pub autologin_dropin: PathBuf,
}

fn default_staging_user() -> String {
    "archie".to_string()
}

fn default_primary_group() -> String {
    "users".to_string()
}

fn default_admin_groups() -> Vec<String> {
    vec!["wheel".to_string()]
}

fn default_autologin() -> PathBuf {
    PathBuf::from("/etc/sddm.conf.d/autologin.conf")
}

impl Default for IdentityCfg {
    fn default() -> Self {
        Self {
            staging_user: default_staging_user(),
            primary_group: default_primary_group(),
            admin_groups: default_admin_groups(),
            autologin_dropin: default_autologin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesCfg {
    #[serde(default = "default_pool_units")]
    pub pool_units: Vec<String>,

    #[serde(default = "default_system_units")]
    pub system_units: Vec<String>,
}

fn default_pool_units() -> Vec<String> {
    [
        "zfs-import-cache",
        "zfs-import.target",
        "zfs-mount",
        "zfs-zed",
        "zfs.target",
    ]
    .iter()
    .map(|unit| unit.to_string())
    .collect()
}

fn default_system_units() -> Vec<String> {
    vec!["NetworkManager".to_string(), "sshd".to_string()]
}

impl Default for ServicesCfg {
    fn default() -> Self {
        Self {
            pool_units: default_pool_units(),
            system_units: default_system_units(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsCfg {
    /// Upper bound for a single external command. Image extraction dominates.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub reboot: bool,

    #[serde(default)]
    pub chroot_path: Option<String>,
}

fn default_timeout_secs() -> u64 {
    3600
}

impl Default for CommandsCfg {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            reboot: false,
            chroot_path: None,
        }
    }
}

/// Installer configuration, read once at startup and handed to the driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallerConfig {
    #[serde(default)]
    pub target: TargetCfg,

    #[serde(default)]
    pub handoff: HandoffCfg,

    #[serde(default)]
    pub image: ImageCfg,

    #[serde(default)]
    pub locale: LocaleCfg,

    #[serde(default)]
    pub boot: BootCfg,

    #[serde(default)]
    pub identity: IdentityCfg,

    #[serde(default)]
    pub services: ServicesCfg,

    #[serde(default)]
    pub commands: CommandsCfg,

    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl InstallerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> InstallResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };
        cfg.path = Some(path.to_path_buf());

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(InstallError::InvalidConfig(issues.join("; ")));
        }
        Ok(cfg)
    }

    /// Load `path`, or fall back to the built-in live-media defaults when it does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> InstallResult<Self> {
        match Self::load(path.as_ref()) {
            Err(InstallError::Io(err)) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            other => other,
        }
    }

    /// Collect human-readable problems with the configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.target.install_root.is_absolute() {
            issues.push(format!(
                "target.install_root must be absolute (got {})",
                self.target.install_root.display()
            ));
        }
        if self.target.install_root == Path::new("/") {
            issues.push("target.install_root must not be /".to_string());
        }
        if self.target.pool.trim().is_empty() || self.target.pool.contains('/') {
            issues.push("target.pool must be a bare pool name".to_string());
        }
        if self.target.boot_environment.trim().is_empty()
            || self.target.boot_environment.contains('/')
        {
            issues.push("target.boot_environment must be a single dataset component".to_string());
        }
        if self.services.pool_units.is_empty() {
            issues.push("services.pool_units must list at least one unit".to_string());
        }
        if self.commands.timeout_secs == 0 {
            issues.push("commands.timeout_secs must be greater than zero".to_string());
        }
        if self.identity.admin_groups.is_empty() {
            issues.push("identity.admin_groups must grant at least one group".to_string());
        }
        issues
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.commands.timeout_secs)
    }

    pub fn chroot_binary_path(&self) -> Option<PathBuf> {
        self.commands.chroot_path.as_ref().map(PathBuf::from)
    }

    /// `<pool>/ROOT`, the unmounted namespace that parents boot environments.
    pub fn root_namespace(&self) -> String {
        format!("{}/ROOT", self.target.pool)
    }

    /// The bootable dataset (`bootfs`).
    pub fn boot_dataset(&self) -> String {
        format!("{}/{}", self.root_namespace(), self.target.boot_environment)
    }

    pub fn home_dataset(&self) -> String {
        format!("{}/home", self.target.pool)
    }
}
