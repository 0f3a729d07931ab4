//! Child-process bridge for the external tools the handlers drive.
//!
//! Every tool is spawned in its own process group so that cancellation reaches
//! the whole tree: SIGTERM first, SIGKILL after [`GRACE_PERIOD`].

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;

use command_group::AsyncCommandGroup;
use command_group::AsyncGroupChild;
use snafu::ResultExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error;
use crate::error::Result;

/// Grace period for SIGTERM before SIGKILL.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Where the child's standard error goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrMode {
    /// Collected and returned in [`Output::stderr`].
    Capture,
    /// Passed through to the worker's own stderr.
    Inherit,
}

/// A command line plus its input.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    stderr: StderrMode,
    current_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            stderr: StderrMode::Capture,
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Add `KEY=value` entries; entries without `=` are ignored.
    pub fn env_pairs<'a>(mut self, pairs: impl IntoIterator<Item = &'a str>) -> Self {
        for pair in pairs {
            if let Some((key, value)) = pair.split_once('=') {
                self.env.push((key.to_string(), value.to_string()));
            }
        }
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn inherit_stderr(mut self) -> Self {
        self.stderr = StderrMode::Inherit;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments as lossy strings, for logging and tests.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    pub fn env_vars(&self) -> &[(String, String)] {
        &self.env
    }

    /// `program arg...` for diagnostics.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// Collected result of a finished child.
#[derive(Debug)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    /// Empty when stderr was inherited.
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Run to completion and return the output whatever the exit status.
///
/// Fails only if the child cannot be spawned, fed, or waited on, or when
/// `cancel` fires first, in which case the process group is terminated.
pub async fn run(invocation: &Invocation, cancel: &CancellationToken) -> Result<Output> {
    let command = invocation.program.clone();
    debug!(command = %invocation.display(), "spawning");

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(match invocation.stderr {
            StderrMode::Capture => Stdio::piped(),
            StderrMode::Inherit => Stdio::inherit(),
        })
        .kill_on_drop(true);
    for (key, value) in &invocation.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &invocation.current_dir {
        cmd.current_dir(dir);
    }

    let mut child: AsyncGroupChild = cmd.group_spawn().context(error::SpawnProcessSnafu {
        command: command.clone(),
    })?;

    // stdin is written while the output is drained so large manifests cannot deadlock
    let stdin_task = match (invocation.stdin.clone(), child.inner().stdin.take()) {
        (Some(input), Some(mut pipe)) => Some(tokio::spawn(async move {
            pipe.write_all(&input).await?;
            pipe.shutdown().await
        })),
        _ => None,
    };

    let stdout_task = child.inner().stdout.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).await.map(|_| buf)
        })
    });
    let stderr_task = child.inner().stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).await.map(|_| buf)
        })
    });

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    let status = match waited {
        Some(status) => status.context(error::WaitProcessSnafu { command: command.clone() })?,
        None => {
            info!(command = %command, "job canceled, terminating child");
            terminate_process_group(&mut child, GRACE_PERIOD).await;
            return error::CanceledSnafu { command }.fail();
        }
    };

    if let Some(task) = stdin_task {
        match task.await {
            Ok(Ok(())) => {}
            // a child that exits without reading its input closes the pipe early
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(source)) => return Err(error::Error::WriteStdin { command, source }),
            Err(e) => warn!(command = %command, error = %e, "stdin writer task failed"),
        }
    }

    let stdout = collect(stdout_task, &command).await?;
    let stderr = String::from_utf8_lossy(&collect(stderr_task, &command).await?).into_owned();

    debug!(command = %command, %status, "child exited");
    Ok(Output { status, stdout, stderr })
}

/// Like [`run`] but a non-zero exit becomes [`Error::CommandFailed`](crate::error::Error::CommandFailed).
pub async fn run_checked(invocation: &Invocation, cancel: &CancellationToken) -> Result<Output> {
    let output = run(invocation, cancel).await?;
    if !output.success() {
        return error::CommandFailedSnafu {
            command: invocation.display(),
            status: output.status.to_string(),
            stderr: output.stderr.trim().to_string(),
        }
        .fail();
    }
    Ok(output)
}

async fn collect(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    command: &str,
) -> Result<Vec<u8>> {
    let Some(task) = task else {
        return Ok(Vec::new());
    };
    match task.await {
        Ok(read) => read.context(error::WaitProcessSnafu { command }),
        Err(e) => {
            warn!(command, error = %e, "output reader task failed");
            Ok(Vec::new())
        }
    }
}

/// SIGTERM the group, wait up to `grace`, then kill and reap.
async fn terminate_process_group(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::sys::signal::Signal;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = child.inner().id() else {
        return;
    };

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e != nix::errno::Errno::ESRCH {
            warn!(pid, error = ?e, "SIGTERM to process group failed");
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.inner().try_wait().ok().flatten().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if let Err(e) = child.kill().await {
        warn!(pid, error = %e, "SIGKILL to process group failed");
    }
    let _ = child.wait().await;
}
