use crate::error::InstallResult;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// A single external command as the pipeline wants it run.
#[derive(Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Bytes written to the child's stdin. Never logged.
    pub input: Option<Zeroizing<Vec<u8>>>,
    /// Run the program inside this root via `chroot`.
    pub chroot: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: None,
            chroot: None,
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: impl AsRef<Path>) -> Self {
        let rendered = path.as_ref().to_string_lossy().into_owned();
        self.arg(rendered)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.input = Some(Zeroizing::new(bytes.into()));
        self
    }

    /// Feed already-protected bytes (credentials) without copying them.
    pub fn secret_stdin(mut self, bytes: Zeroizing<Vec<u8>>) -> Self {
        self.input = Some(bytes);
        self
    }

    pub fn chroot(mut self, root: impl Into<PathBuf>) -> Self {
        self.chroot = Some(root.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Shell-like rendering for logs and progress events.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 3);
        if let Some(root) = &self.chroot {
            parts.push("chroot".to_string());
            parts.push(root.to_string_lossy().into_owned());
        }
        parts.push(self.program.clone());
        parts.extend(self.args.iter().map(|arg| quote(arg)));
        parts.join(" ")
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("input", &self.input.as_ref().map(|bytes| bytes.len()))
            .field("chroot", &self.chroot)
            .field("cwd", &self.cwd)
            .finish()
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:+,@%\\".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Exit status and captured streams of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefer stderr, fall back to stdout, for error messages.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr
        } else {
            self.stdout.trim()
        }
    }

    /// Both streams, for progress display.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            ("", "") => String::new(),
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Transport for every side effect the installer performs on the host.
///
/// Implementations spawn the command and report what happened; a non-zero
/// exit is data, not an error. Spawn failures and timeouts are errors.
pub trait CommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> InstallResult<CommandOutput>;
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for &E {
    fn execute(&self, spec: &CommandSpec) -> InstallResult<CommandOutput> {
        (**self).execute(spec)
    }
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for std::sync::Arc<E> {
    fn execute(&self, spec: &CommandSpec) -> InstallResult<CommandOutput> {
        (**self).execute(spec)
    }
}

/// What the caller wants done with a non-zero exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Non-zero aborts the caller with `CommandFailed`.
    Fatal,
    /// Listed outcomes are idempotent no-ops; everything else is fatal.
    Tolerate(Tolerance),
    /// Non-zero is recorded as a warning and execution continues.
    Ignore,
    /// The caller interprets the raw output.
    Inspect,
}

/// Outcomes that mean "already in the desired state".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tolerance {
    pub codes: Vec<i32>,
    pub needles: Vec<&'static str>,
}

impl Tolerance {
    pub fn codes(codes: &[i32]) -> Self {
        Self {
            codes: codes.to_vec(),
            needles: Vec::new(),
        }
    }

    pub fn needles(needles: &[&'static str]) -> Self {
        Self {
            codes: Vec::new(),
            needles: needles.to_vec(),
        }
    }

    pub fn matches(&self, output: &CommandOutput) -> bool {
        if self.codes.contains(&output.status) {
            return true;
        }
        let diagnostic = output.diagnostic().to_ascii_lowercase();
        self.needles
            .iter()
            .any(|needle| diagnostic.contains(&needle.to_ascii_lowercase()))
    }
}
