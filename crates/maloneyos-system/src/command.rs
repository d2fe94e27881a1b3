//! Spawns host binaries with a timeout, an optional stdin payload and
//! captured output.

use maloneyos_core::error::{InstallError, InstallResult};
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Runs one process at a time and bounds how long it may take.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

/// Exit status and captured streams of a finished process.
#[derive(Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `program` with `args`, feeding `input` to stdin when present.
    pub fn run<S: AsRef<OsStr>>(
        &self,
        program: &OsStr,
        args: &[S],
        input: Option<&[u8]>,
        cwd: Option<&Path>,
    ) -> InstallResult<Output> {
        let mut command = Command::new(program);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| {
            InstallError::Executor(format!(
                "failed to spawn {}: {err}",
                Path::new(program).display()
            ))
        })?;

        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes)?;
                stdin.flush().ok();
                // dropping the handle closes the pipe so the child sees EOF
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(program, child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        program: &OsStr,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> InstallResult<Output> {
        let start = Instant::now();
        let stdout_handle = Self::spawn_output_reader(stdout_pipe);
        let stderr_handle = Self::spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(InstallError::Executor(format!(
                "{} timed out after {:?}",
                Path::new(program).display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| InstallError::Executor("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| InstallError::Executor("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            // killed by a signal
            status: exit_status.code().unwrap_or(-1),
        })
    }

    /// Drain a pipe on a helper thread so a chatty child cannot fill it and stall.
    fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<InstallResult<String>>
    where
        R: Read + Send + 'static,
    {
        thread::spawn(move || -> InstallResult<String> {
            let mut buf = Vec::new();
            if let Some(mut reader) = pipe {
                reader.read_to_end(&mut buf)?;
            }
            Ok(String::from_utf8_lossy(&buf).into_owned())
        })
    }
}
