//! Streaming shell command runner
//!
//! Output is read line by line as the child produces it. Cancellation kills
//! the child's whole process group, not just the direct child.

use crate::types::LspError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on lines kept by [`CommandRunner::capture`].
const MAX_CAPTURED_LINES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Run a full command line through the platform shell.
    pub fn shell(line: &str) -> Self {
        if cfg!(windows) {
            Self::new("cmd").args(["/C", line])
        } else {
            Self::new("sh").args(["-c", line])
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

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human readable command line for logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs commands under one cancellation signal, optionally forwarding every
/// output line to a sink.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    cancel: CancellationToken,
    output: Option<mpsc::Sender<String>>,
}

impl CommandRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            output: None,
        }
    }

    pub fn with_output(mut self, output: mpsc::Sender<String>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Forward a status line to the output sink, if any.
    pub async fn emit(&self, line: impl Into<String>) {
        if let Some(output) = &self.output {
            let _ = output.send(line.into()).await;
        }
    }

    /// Spawn a command and return its incremental output.
    pub fn stream(&self, spec: &CommandSpec) -> Result<LineStream, LspError> {
        if self.cancel.is_cancelled() {
            return Err(LspError::Cancelled);
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // Own process group so cancellation reaches grandchildren too
        #[cfg(unix)]
        cmd.process_group(0);

        let command = spec.display();
        debug!("Running: {}", command);

        let mut child = cmd.spawn().map_err(|e| LspError::CommandFailed {
            command: command.clone(),
            status: format!("failed to start: {}", e),
        })?;

        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        Ok(LineStream {
            command,
            child,
            stdout,
            stderr,
            cancel: self.cancel.clone(),
        })
    }

    /// Run to completion, forwarding output lines to the sink.
    pub async fn run(&self, spec: &CommandSpec) -> Result<(), LspError> {
        let mut stream = self.stream(spec)?;
        while let Some(line) = stream.next_line().await? {
            self.emit(line).await;
        }
        Ok(())
    }

    /// Run to completion and return the combined output.
    pub async fn capture(&self, spec: &CommandSpec) -> Result<String, LspError> {
        let mut stream = self.stream(spec)?;
        let mut lines = Vec::new();
        while let Some(line) = stream.next_line().await? {
            if lines.len() < MAX_CAPTURED_LINES {
                lines.push(line);
            }
        }
        Ok(lines.join("\n"))
    }
}

enum StreamEvent {
    Cancelled,
    Stdout(std::io::Result<Option<String>>),
    Stderr(std::io::Result<Option<String>>),
}

/// Output of a running command, stdout and stderr interleaved.
pub struct LineStream {
    command: String,
    child: Child,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
    cancel: CancellationToken,
}

impl LineStream {
    /// Next output line. `Ok(None)` once the command exited successfully; an
    /// error for a non-zero exit or cancellation.
    pub async fn next_line(&mut self) -> Result<Option<String>, LspError> {
        loop {
            if self.stdout.is_none() && self.stderr.is_none() {
                return self.wait().await.map(|()| None);
            }

            let event = tokio::select! {
                _ = self.cancel.cancelled() => StreamEvent::Cancelled,
                line = next_or_pending(&mut self.stdout) => StreamEvent::Stdout(line),
                line = next_or_pending(&mut self.stderr) => StreamEvent::Stderr(line),
            };

            match event {
                StreamEvent::Cancelled => {
                    self.kill_tree().await;
                    return Err(LspError::Cancelled);
                }
                StreamEvent::Stdout(Ok(Some(line))) | StreamEvent::Stderr(Ok(Some(line))) => {
                    return Ok(Some(line));
                }
                StreamEvent::Stdout(_) => self.stdout = None,
                StreamEvent::Stderr(_) => self.stderr = None,
            }
        }
    }

    async fn wait(&mut self) -> Result<(), LspError> {
        let status = tokio::select! {
            _ = self.cancel.cancelled() => None,
            status = self.child.wait() => Some(status),
        };
        let Some(status) = status else {
            self.kill_tree().await;
            return Err(LspError::Cancelled);
        };
        let status = status?;

        if status.success() {
            Ok(())
        } else {
            Err(LspError::CommandFailed {
                command: self.command.clone(),
                status: status.to_string(),
            })
        }
    }

    async fn kill_tree(&mut self) {
        warn!("Cancelling: {}", self.command);

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!("killpg({}) failed: {}", pid, e);
            }
        }

        let _ = self.child.kill().await;
    }
}

async fn next_or_pending<R>(lines: &mut Option<Lines<R>>) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}
