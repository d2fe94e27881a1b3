//! Operator input handed over by the selection wizard.

use crate::config::HandoffCfg;
use crate::error::{InstallError, InstallResult};
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use zeroize::Zeroizing;

const MAX_USERNAME_LEN: usize = 32;

fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]*$").expect("static username pattern"))
}

/// Immutable description of what to install and for whom.
///
/// The password is only ever fed to a command's stdin. It is zeroed on drop
/// and never shows up in `Debug` output.
#[derive(Clone)]
pub struct InstallationRequest {
    disk: PathBuf,
    username: String,
    password: Zeroizing<String>,
}

impl InstallationRequest {
    /// Validate and build a request from in-memory values.
    pub fn new(
        disk: impl Into<PathBuf>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> InstallResult<Self> {
        Self::build(disk.into(), username.into(), Zeroizing::new(password.into()))
    }

    /// Read the three handoff files written by the wizard.
    pub fn from_handoff(handoff: &HandoffCfg) -> InstallResult<Self> {
        let disk = read_handoff(&handoff.disk_file)?;
        let username = read_handoff(&handoff.username_file)?;
        let password = read_handoff(&handoff.password_file)?;
        Self::build(
            PathBuf::from(disk.as_str()),
            username.as_str().to_owned(),
            password,
        )
    }

    fn build(
        disk: PathBuf,
        username: String,
        password: Zeroizing<String>,
    ) -> InstallResult<Self> {
        if !disk.starts_with("/dev/") || disk == Path::new("/dev/") {
            return Err(InstallError::Precondition(format!(
                "target disk must be a /dev path (got {})",
                disk.display()
            )));
        }
        validate_username(&username)?;
        if password.is_empty() {
            return Err(InstallError::Precondition(
                "account password must not be empty".to_string(),
            ));
        }
        if password.contains('\n') {
            return Err(InstallError::Precondition(
                "account password must be a single line".to_string(),
            ));
        }

        Ok(Self {
            disk,
            username,
            password,
        })
    }

    pub fn disk(&self) -> &Path {
        &self.disk
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// `user:password\n` as consumed by `chpasswd`.
    pub fn chpasswd_line(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(format!("{}:{}\n", self.username, self.password.as_str()).into_bytes())
    }

    /// Device path of partition `index` on the target disk.
    pub fn partition(&self, index: u32) -> PathBuf {
        partition_path(&self.disk, index)
    }
}

impl fmt::Debug for InstallationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationRequest")
            .field("disk", &self.disk)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Predict the device node for partition `index` of `disk`.
///
/// Kernel naming inserts a `p` when the disk name already ends in a digit
/// (`nvme0n1p2`, `mmcblk0p1`).
pub fn partition_path(disk: &Path, index: u32) -> PathBuf {
    let raw = disk.to_string_lossy();
    let suffix_is_digit = raw
        .chars()
        .last()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);

    if suffix_is_digit {
        PathBuf::from(format!("{raw}p{index}"))
    } else {
        PathBuf::from(format!("{raw}{index}"))
    }
}

fn validate_username(username: &str) -> InstallResult<()> {
    if username.is_empty() {
        return Err(InstallError::Precondition(
            "account name must not be empty".to_string(),
        ));
    }
    if username.len() > MAX_USERNAME_LEN || !username_pattern().is_match(username) {
        return Err(InstallError::Precondition(format!(
            "`{username}` is not a valid login name"
        )));
    }
    if username == "root" {
        return Err(InstallError::Precondition(
            "root cannot be provisioned as the primary account".to_string(),
        ));
    }
    Ok(())
}

/// Every handoff read is zeroed on drop, since one of them holds the password.
fn read_handoff(path: &Path) -> InstallResult<Zeroizing<String>> {
    let raw = Zeroizing::new(fs::read_to_string(path).map_err(|err| {
        InstallError::MissingInput {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    })?);
    let value = Zeroizing::new(raw.trim().to_string());
    if value.is_empty() {
        return Err(InstallError::MissingInput {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn handoff_in(dir: &Path) -> HandoffCfg {
        HandoffCfg {
            disk_file: dir.join("selected-disk"),
            username_file: dir.join("username"),
            password_file: dir.join("password"),
        }
    }

    #[test]
    fn reads_and_trims_handoff_files() {
        let dir = tempdir().unwrap();
        let handoff = handoff_in(dir.path());
        fs::write(&handoff.disk_file, "/dev/sdx\n").unwrap();
        fs::write(&handoff.username_file, "alice\n").unwrap();
        fs::write(&handoff.password_file, "secret\n").unwrap();

        let request = InstallationRequest::from_handoff(&handoff).unwrap();
        assert_eq!(request.disk(), Path::new("/dev/sdx"));
        assert_eq!(request.username(), "alice");
        assert_eq!(request.chpasswd_line().as_slice(), b"alice:secret\n");
    }

    #[test]
    fn handoff_values_are_wiped_buffers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("password");
        fs::write(&path, "  hunter2 \n").unwrap();

        let password: Zeroizing<String> = read_handoff(&path).unwrap();
        assert_eq!(password.as_str(), "hunter2");
    }

    #[test]
    fn missing_handoff_is_a_precondition_error() {
        let dir = tempdir().unwrap();
        let handoff = handoff_in(dir.path());
        fs::write(&handoff.disk_file, "/dev/sdx").unwrap();
        fs::write(&handoff.username_file, "   \n").unwrap();

        let err = InstallationRequest::from_handoff(&handoff).unwrap_err();
        assert!(err.is_precondition());
        match err {
            InstallError::MissingInput { path, reason } => {
                assert_eq!(path, handoff.username_file);
                assert_eq!(reason, "file is empty");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn debug_output_redacts_password() {
        let request = InstallationRequest::new("/dev/sdx", "alice", "hunter2").unwrap();
        let rendered = format!("{request:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn rejects_bad_usernames_and_disks() {
        assert!(InstallationRequest::new("/dev/sdx", "Alice", "pw").is_err());
        assert!(InstallationRequest::new("/dev/sdx", "al ice", "pw").is_err());
        assert!(InstallationRequest::new("/dev/sdx", "root", "pw").is_err());
        assert!(InstallationRequest::new("/dev/sdx", "alice", "").is_err());
        assert!(InstallationRequest::new("sdx", "alice", "pw").is_err());
        assert!(InstallationRequest::new("/dev/sdx", "_svc-01", "pw").is_ok());
    }

    #[test]
    fn partition_naming_follows_kernel_convention() {
        assert_eq!(
            partition_path(Path::new("/dev/sda"), 2),
            PathBuf::from("/dev/sda2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 1),
            PathBuf::from("/dev/nvme0n1p1")
        );
        assert_eq!(
            partition_path(Path::new("/dev/mmcblk0"), 2),
            PathBuf::from("/dev/mmcblk0p2")
        );
    }
}
