//! Host-backed `CommandExecutor`. Every side effect of an install ends up
//! here as a spawned process.

use crate::command::CommandRunner;
use log::{debug, trace};
use maloneyos_core::config::InstallerConfig;
use maloneyos_core::error::{InstallError, InstallResult};
use maloneyos_core::executor::{CommandExecutor, CommandOutput, CommandSpec};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default locations we probe when looking for a `chroot` binary on the host.
pub const DEFAULT_CHROOT_PATHS: &[&str] = &[
    "/usr/sbin/chroot",
    "/usr/bin/chroot",
    "/sbin/chroot",
    "/bin/chroot",
];

/// Executor that runs commands on the live system.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    runner: CommandRunner,
    chroot_binary: PathBuf,
}

impl SystemExecutor {
    /// Build an executor from the installer configuration, discovering
    /// `chroot` unless the configuration names it.
    pub fn from_config(config: &InstallerConfig) -> InstallResult<Self> {
        let timeout = config.command_timeout();
        let chroot_binary = match config.chroot_binary_path() {
            Some(path) => Self::checked(path)?,
            None => Self::discover_chroot()?,
        };
        Ok(Self::new(chroot_binary, timeout))
    }

    pub fn new(chroot_binary: PathBuf, timeout: Duration) -> Self {
        Self {
            runner: CommandRunner::new(timeout),
            chroot_binary,
        }
    }

    pub fn chroot_binary(&self) -> &Path {
        &self.chroot_binary
    }

    fn checked(path: PathBuf) -> InstallResult<PathBuf> {
        if !path.exists() {
            return Err(InstallError::InvalidConfig(format!(
                "chroot binary not found at {}",
                path.display()
            )));
        }
        Ok(path)
    }

    fn discover_chroot() -> InstallResult<PathBuf> {
        DEFAULT_CHROOT_PATHS
            .iter()
            .map(Path::new)
            .find(|candidate| candidate.exists())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                InstallError::InvalidConfig(format!(
                    "unable to locate chroot binary; tried {:?}",
                    DEFAULT_CHROOT_PATHS
                ))
            })
    }

    /// Program and argv for `spec`; chrooted commands run through `chroot <root>`.
    fn argv(&self, spec: &CommandSpec) -> (OsString, Vec<OsString>) {
        let args = spec.args.iter().map(OsString::from);
        match &spec.chroot {
            Some(root) => {
                let mut argv = vec![root.as_os_str().to_owned(), OsString::from(&spec.program)];
                argv.extend(args);
                (self.chroot_binary.as_os_str().to_owned(), argv)
            }
            None => (OsString::from(&spec.program), args.collect()),
        }
    }
}

impl CommandExecutor for SystemExecutor {
    fn execute(&self, spec: &CommandSpec) -> InstallResult<CommandOutput> {
        let (program, args) = self.argv(spec);
        debug!("exec {}", spec.command_line());
        if let Some(input) = &spec.input {
            trace!("feeding {} bytes on stdin", input.len());
        }

        let output = self.runner.run(
            &program,
            args.as_slice(),
            spec.input.as_ref().map(|bytes| bytes.as_slice()),
            spec.cwd.as_deref(),
        )?;
        debug!("exit {} from {}", output.status, spec.program);

        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
