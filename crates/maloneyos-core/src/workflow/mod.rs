//! Installation phases and the shared context they run commands through.

mod configure;
mod image;
mod storage;
mod teardown;

use crate::error::{InstallError, InstallResult};
use crate::executor::{CommandExecutor, CommandOutput, CommandSpec, ExitPolicy};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::render::ConfigFile;
use crate::state::PipelineState;
use log::{debug, warn};
use std::path::{Path, PathBuf};

pub use configure::{
    configure_system, ConfigurationReport, ConfigurationStep, StepOutcome, StepStatus,
};
pub use image::{install_image, AttachedRoot};
pub use storage::{
    create_pool, partition_disk, preclean, prepare_efi, provision_storage, verify_round_trip,
    wipe_disk, ProvisionedStorage, WipedDisk,
};
pub use teardown::{teardown, TeardownReport};

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by each phase.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowReport {
    pub fn warnings(&self) -> impl Iterator<Item = &WorkflowEvent> {
        self.events
            .iter()
            .filter(|event| matches!(event.level, WorkflowLevel::Warn | WorkflowLevel::Error))
    }
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

/// Runs commands on behalf of one phase: applies the exit policy, emits a
/// progress event per command and collects workflow events.
pub struct PhaseContext<'a> {
    executor: &'a dyn CommandExecutor,
    sink: &'a dyn ProgressSink,
    phase: PipelineState,
    events: Vec<WorkflowEvent>,
}

impl<'a> PhaseContext<'a> {
    pub fn new(
        executor: &'a dyn CommandExecutor,
        sink: &'a dyn ProgressSink,
        phase: PipelineState,
    ) -> Self {
        Self {
            executor,
            sink,
            phase,
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, level: WorkflowLevel, message: impl Into<String>) {
        let event = event(level, message);
        if matches!(event.level, WorkflowLevel::Warn | WorkflowLevel::Error) {
            warn!("[{}] {}", self.phase, event.message);
        }
        self.events.push(event);
    }

    /// Close the context and hand back what it recorded.
    pub fn into_report(self, title: impl Into<String>) -> WorkflowReport {
        WorkflowReport {
            title: title.into(),
            events: self.events,
        }
    }

    /// Execute `spec` and apply `policy` to a non-zero exit.
    pub fn run(&mut self, spec: CommandSpec, policy: ExitPolicy) -> InstallResult<CommandOutput> {
        let command = spec.command_line();
        debug!("[{}] running {}", self.phase, command);
        let output = self.executor.execute(&spec)?;
        self.sink.command_completed(&ProgressEvent {
            phase: self.phase,
            command: command.clone(),
            status: output.status,
            output: output.combined(),
        });

        if output.success() {
            return Ok(output);
        }

        match policy {
            ExitPolicy::Fatal => Err(command_failed(command, &output)),
            ExitPolicy::Tolerate(tolerance) => {
                if tolerance.matches(&output) {
                    self.push(
                        WorkflowLevel::Info,
                        format!("{command}: already satisfied ({})", output.diagnostic()),
                    );
                    Ok(output)
                } else {
                    Err(command_failed(command, &output))
                }
            }
            ExitPolicy::Ignore => {
                self.push(
                    WorkflowLevel::Warn,
                    format!(
                        "{command} exited with code {}: {}",
                        output.status,
                        non_empty(output.diagnostic())
                    ),
                );
                Ok(output)
            }
            ExitPolicy::Inspect => Ok(output),
        }
    }

    /// Shorthand for a command whose failure aborts the caller.
    pub fn fatal(&mut self, spec: CommandSpec) -> InstallResult<CommandOutput> {
        self.run(spec, ExitPolicy::Fatal)
    }

    /// `mountpoint -q`; anything but exit 0 means "not mounted".
    pub fn is_mounted(&mut self, path: &Path) -> InstallResult<bool> {
        let out = self.run(
            CommandSpec::new("mountpoint").arg("-q").path_arg(path),
            ExitPolicy::Inspect,
        )?;
        Ok(out.success())
    }

    pub fn make_dir(&mut self, path: &Path) -> InstallResult<()> {
        self.fatal(CommandSpec::new("mkdir").arg("-p").path_arg(path))?;
        Ok(())
    }

    pub fn remove(&mut self, path: &Path, policy: ExitPolicy) -> InstallResult<()> {
        self.run(CommandSpec::new("rm").arg("-rf").path_arg(path), policy)?;
        Ok(())
    }

    /// Copy a file with explicit permissions, creating parent directories.
    pub fn copy_file(
        &mut self,
        source: &Path,
        dest: &Path,
        mode: u32,
        policy: ExitPolicy,
    ) -> InstallResult<CommandOutput> {
        self.run(
            CommandSpec::new("install")
                .arg("-D")
                .arg("-m")
                .arg(format!("{mode:04o}"))
                .path_arg(source)
                .path_arg(dest),
            policy,
        )
    }

    /// Read a text file on the host; `None` when it cannot be read.
    pub fn read_file(&mut self, path: &Path) -> InstallResult<Option<String>> {
        let out = self.run(CommandSpec::new("cat").path_arg(path), ExitPolicy::Inspect)?;
        Ok(out.success().then_some(out.stdout))
    }

    /// Render `file` and write it under `root` with the file's permissions.
    pub fn write_config(&mut self, root: &Path, file: &dyn ConfigFile) -> InstallResult<PathBuf> {
        let rendered = file.render();
        let dest = under_root(root, &rendered.path);
        self.fatal(
            CommandSpec::new("install")
                .arg("-D")
                .arg("-m")
                .arg(format!("{:04o}", rendered.mode))
                .arg("/dev/stdin")
                .path_arg(&dest)
                .stdin(rendered.contents.into_bytes()),
        )?;
        self.push(
            WorkflowLevel::Info,
            format!("Wrote {}", rendered.path.display()),
        );
        Ok(dest)
    }
}

/// Join an absolute in-image path onto the install root.
pub fn under_root(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(path),
    }
}

fn command_failed(command: String, output: &CommandOutput) -> InstallError {
    InstallError::CommandFailed {
        command,
        status: output.status,
        diagnostic: non_empty(output.diagnostic()).to_string(),
    }
}

fn non_empty(diagnostic: &str) -> &str {
    if diagnostic.is_empty() {
        "no additional output"
    } else {
        diagnostic
    }
}
