//! Target storage layout: the partition plan and the root pool.

use crate::config::InstallerConfig;
use crate::error::{InstallError, InstallResult};
use std::fmt;
use std::path::{Path, PathBuf};

/// Pool-level properties (`-o`) applied at creation.
pub const POOL_PROPERTIES: &[(&str, &str)] = &[("ashift", "12"), ("autotrim", "on")];

/// Filesystem properties (`-O`) inherited by every dataset.
pub const FILESYSTEM_PROPERTIES: &[(&str, &str)] = &[
    ("acltype", "posixacl"),
    ("compression", "zstd"),
    ("dnodesize", "auto"),
    ("normalization", "formD"),
    ("relatime", "on"),
    ("xattr", "sa"),
];

/// GPT partition type codes understood by `sgdisk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    EfiSystem,
    SolarisRoot,
}

impl TypeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeCode::EfiSystem => "EF00",
            TypeCode::SolarisRoot => "BF00",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSize {
    /// `sgdisk` size expression such as `+512M`.
    Fixed(String),
    /// Everything that is left.
    Remainder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub index: u32,
    pub start: String,
    pub size: PartitionSize,
    pub type_code: TypeCode,
}

impl PartitionSpec {
    /// `-n<i>:<start>:<end>` and `-t<i>:<code>` for one `sgdisk` call.
    pub fn sgdisk_args(&self) -> Vec<String> {
        let end = match &self.size {
            PartitionSize::Fixed(size) => size.as_str(),
            PartitionSize::Remainder => "0",
        };
        vec![
            format!("-n{}:{}:{}", self.index, self.start, end),
            format!("-t{}:{}", self.index, self.type_code.as_str()),
        ]
    }
}

/// Ordered partition layout. The EFI system partition is always index 1 and
/// the pool partition always index 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    entries: Vec<PartitionSpec>,
}

impl PartitionPlan {
    pub const EFI_INDEX: u32 = 1;
    pub const POOL_INDEX: u32 = 2;

    pub fn standard(efi_size: &str) -> Self {
        Self {
            entries: vec![
                PartitionSpec {
                    index: Self::EFI_INDEX,
                    start: "1M".to_string(),
                    size: PartitionSize::Fixed(efi_size.to_string()),
                    type_code: TypeCode::EfiSystem,
                },
                PartitionSpec {
                    index: Self::POOL_INDEX,
                    start: "0".to_string(),
                    size: PartitionSize::Remainder,
                    type_code: TypeCode::SolarisRoot,
                },
            ],
        }
    }

    pub fn entries(&self) -> &[PartitionSpec] {
        &self.entries
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|entry| entry.index)
    }
}

/// Value of a dataset's `mountpoint` property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountPolicy {
    None,
    Path(PathBuf),
}

impl fmt::Display for MountPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountPolicy::None => f.write_str("none"),
            MountPolicy::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Value of a dataset's `canmount` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanMount {
    On,
    NoAuto,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub mountpoint: MountPolicy,
    pub canmount: CanMount,
}

impl Dataset {
    /// Arguments for `zfs create`.
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "-o".to_string(),
            format!("mountpoint={}", self.mountpoint),
        ];
        if self.canmount == CanMount::NoAuto {
            args.push("-o".to_string());
            args.push("canmount=noauto".to_string());
        }
        args.push(self.name.clone());
        args
    }

    /// Datasets that `zfs mount` must bring up after an `-N` import.
    pub fn is_mountable(&self) -> bool {
        matches!(self.mountpoint, MountPolicy::Path(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolState {
    Exported,
    Imported { altroot: PathBuf },
}

/// The root pool and its datasets as the installer tracks them.
#[derive(Debug, Clone)]
pub struct StoragePool {
    name: String,
    datasets: Vec<Dataset>,
    state: PoolState,
}

impl StoragePool {
    /// `<pool>/ROOT`, `<pool>/ROOT/<bootenv>` and `<pool>/home`, in creation order.
    pub fn standard(config: &InstallerConfig) -> Self {
        Self {
            name: config.target.pool.clone(),
            datasets: vec![
                Dataset {
                    name: config.root_namespace(),
                    mountpoint: MountPolicy::None,
                    canmount: CanMount::On,
                },
                Dataset {
                    name: config.boot_dataset(),
                    mountpoint: MountPolicy::Path(PathBuf::from("/")),
                    canmount: CanMount::NoAuto,
                },
                Dataset {
                    name: config.home_dataset(),
                    mountpoint: MountPolicy::Path(PathBuf::from("/home")),
                    canmount: CanMount::On,
                },
            ],
            state: PoolState::Exported,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn state(&self) -> &PoolState {
        &self.state
    }

    pub fn is_imported(&self) -> bool {
        matches!(self.state, PoolState::Imported { .. })
    }

    /// Arguments for `zpool create` on `device`.
    pub fn create_args(&self, device: &Path) -> Vec<String> {
        let mut args = vec!["create".to_string(), "-f".to_string()];
        for (key, value) in POOL_PROPERTIES {
            args.push("-o".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in FILESYSTEM_PROPERTIES {
            args.push("-O".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push("-m".to_string());
        args.push("none".to_string());
        args.push(self.name.clone());
        args.push(device.to_string_lossy().into_owned());
        args
    }

    /// A pool cannot be imported under a second altroot while it is still
    /// imported under the first.
    pub fn mark_imported(&mut self, altroot: &Path) -> InstallResult<()> {
        if let PoolState::Imported { altroot: current } = &self.state {
            if current.as_path() != altroot {
                return Err(InstallError::PoolState(format!(
                    "pool {} is already imported under {}; refusing {}",
                    self.name,
                    current.display(),
                    altroot.display()
                )));
            }
        }
        self.state = PoolState::Imported {
            altroot: altroot.to_path_buf(),
        };
        Ok(())
    }

    pub fn mark_exported(&mut self) {
        self.state = PoolState::Exported;
    }
}
