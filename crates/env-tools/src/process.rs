//! One-shot tool subprocesses with captured output and cancellation.
//!
//! A [`ToolCommand`] runs to completion and yields a [`ToolOutput`]; the
//! caller decides what a non-zero exit means. Cancelling the token kills the
//! child's whole process group, since installers routinely spawn helpers.

use log::{debug, warn};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for pipes to close after the child is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A command line for an external tool.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
}

/// Captured result of a finished (or cancelled) tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code, `None` when killed by a signal or cancelled.
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
}

impl ToolOutput {
    /// stdout followed by stderr, as a tool's raw diagnostic text.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end().is_empty(), self.stderr.trim_end().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Human-readable command line for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(|a| a.as_os_str()))
            .map(|part| {
                let part = part.to_string_lossy();
                if part.contains(char::is_whitespace) {
                    format!("\"{}\"", part)
                } else {
                    part.into_owned()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion, or until `cancel` fires.
    ///
    /// Only spawn failures (missing program, permissions) are errors; a
    /// non-zero exit is reported through [`ToolOutput::success`].
    pub async fn run(&self, cancel: &CancellationToken) -> std::io::Result<ToolOutput> {
        debug!("[process] Running {}", self.display());

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.kill_on_drop(true).spawn()?;

        let mut stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let mut stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let (status, cancelled) = tokio::select! {
            status = child.wait() => (Some(status?), false),
            _ = cancel.cancelled() => {
                warn!("[process] Cancelled {}", self.display());
                kill_process_group(&child);
                child.start_kill().ok();
                child.wait().await.ok();
                (None, true)
            }
        };

        let stdout = drain(&mut stdout_task).await;
        let stderr = drain(&mut stderr_task).await;

        let code = status.and_then(|s| s.code());
        let success = status.map(|s| s.success()).unwrap_or(false);
        debug!(
            "[process] {} exited with {:?} (cancelled: {})",
            self.program.display(),
            code,
            cancelled
        );

        Ok(ToolOutput {
            code,
            success,
            stdout,
            stderr,
            cancelled,
        })
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!("[process] Pipe read failed: {}", e);
        }
    }
    buf
}

/// Collect a pipe reader, abandoning it if a grandchild keeps the pipe open.
async fn drain(task: &mut tokio::task::JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut *task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            debug!("[process] Pipe reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                warn!("[process] Failed to kill process group {}: {}", pid, e);
            }
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &tokio::process::Child) {}
