//! Long-running operations.
//!
//! An operation runs as a task that produces an ordered stream of
//! [`ProgressEvent`]s. The runner owns the terminal event: operation bodies
//! only emit incremental events and return a result, and the runner turns
//! that result into exactly one `Completed` or `Failed`. Failures of the
//! orchestrated tool itself end the stream with no terminal event.

mod compile;
mod init;
mod install;

use crate::config::Directories;
use crate::fqbn::Fqbn;
use crate::instance::Instance;
use crate::process::{CommandSpec, Exit, ProcessLauncher, SpawnedProcess};
use crate::{Error, Result};
use kiln_types::{InstanceId, OutputStream, ProgressEvent};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitRequest {
    /// Sketch whose `sketch.json` supplies the instance's target defaults
    pub sketch_path: Option<PathBuf>,
    /// Profile of that sketch to apply; requires `sketch_path`
    pub profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInstallRequest {
    pub packager: String,
    pub architecture: String,
    /// `None` or empty selects the latest release in the index
    pub version: Option<String>,
    pub skip_post_install: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub fqbn: String,
    pub sketch_path: PathBuf,
    pub build_path: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// (Re)load the instance's package index and installed platforms
    Init(InitRequest),
    PlatformInstall(PlatformInstallRequest),
    Compile(CompileRequest),
}

impl Operation {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::PlatformInstall(_) => "platform_install",
            Self::Compile(_) => "compile",
        }
    }

    /// Parameter checks done before any stream is opened.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for empty names or a malformed FQBN.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Init(req) => {
                if req.profile.as_deref().is_some_and(|p| !p.is_empty())
                    && req.sketch_path.is_none()
                {
                    return Err(Error::InvalidArgument(
                        "A profile can only be selected together with a sketch".to_string(),
                    ));
                }
                Ok(())
            }
            Self::PlatformInstall(req) => {
                if req.packager.trim().is_empty() || req.architecture.trim().is_empty() {
                    return Err(Error::InvalidArgument(
                        "platform_package and architecture are required".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Compile(req) => {
                Fqbn::parse(&req.fqbn)?;
                if req.sketch_path.as_os_str().is_empty() {
                    return Err(Error::InvalidArgument("sketch_path is required".to_string()));
                }
                Ok(())
            }
        }
    }
}

/// Immutable record of one operation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub instance: InstanceId,
    pub operation: Operation,
}

/// Collaborators an operation body needs
#[derive(Clone)]
pub struct OperationContext {
    pub instance: Arc<Instance>,
    pub dirs: Directories,
    pub launcher: Arc<dyn ProcessLauncher>,
}

/// Incremental-event side of an operation stream
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSink {
    /// Emit a non-terminal event.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` once the consumer is gone, and
    /// `Error::ProtocolViolation` for terminal events, which only the runner
    /// may send.
    pub async fn emit(&self, event: ProgressEvent) -> Result<()> {
        if event.is_terminal() {
            return Err(Error::ProtocolViolation(
                "operation bodies cannot emit terminal events".to_string(),
            ));
        }
        self.tx.send(event).await.map_err(|_| Error::Cancelled)
    }

    /// Emit a log line.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` once the consumer is gone.
    pub async fn log(&self, text: impl Into<String>) -> Result<()> {
        self.emit(ProgressEvent::log(text)).await
    }
}

/// How an operation stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEnd {
    /// `Completed` was the last event
    Completed,
    /// `Failed` was the last event
    Failed(String),
    /// The consumer went away or the instance was destroyed
    Cancelled,
    /// The orchestrated tool died; no terminal event was sent
    Aborted(String),
}

/// A running operation: its event stream plus the task producing it
#[derive(Debug)]
pub struct OperationHandle {
    pub events: mpsc::Receiver<ProgressEvent>,
    task: JoinHandle<OperationEnd>,
    cancel: CancellationToken,
}

impl OperationHandle {
    /// Ask the operation to stop; the end is observed through [`Self::finish`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the producing task and report how the stream ended.
    pub async fn finish(self) -> OperationEnd {
        drop(self.events);
        match self.task.await {
            Ok(end) => end,
            Err(e) => OperationEnd::Aborted(format!("Operation task failed: {e}")),
        }
    }
}

/// Start an operation on its own task.
///
/// `buffer` bounds the event channel; a slow consumer applies backpressure
/// to the operation rather than growing memory.
#[must_use]
pub fn run(ctx: OperationContext, operation: Operation, buffer: usize) -> OperationHandle {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let cancel = ctx.instance.closed.child_token();
    let token = cancel.clone();
    let name = operation.name();
    let id = ctx.instance.id;

    let task = tokio::spawn(async move {
        let sink = ProgressSink { tx: tx.clone() };
        let result = tokio::select! {
            result = execute(&ctx, operation, &sink) => result,
            () = token.cancelled() => Err(Error::Cancelled),
            () = tx.closed() => Err(Error::Cancelled),
        };
        drop(sink);

        let (terminal, end) = match result {
            Ok(result) => (Some(ProgressEvent::Completed { result }), OperationEnd::Completed),
            Err(Error::Cancelled) => (None, OperationEnd::Cancelled),
            Err(Error::TransportClosed(reason)) => (None, OperationEnd::Aborted(reason)),
            Err(e) => {
                let message = e.to_string();
                (
                    Some(ProgressEvent::Failed {
                        message: message.clone(),
                    }),
                    OperationEnd::Failed(message),
                )
            }
        };

        if let Some(event) = terminal
            && tx.send(event).await.is_err()
        {
            debug!("[{}] {} finished after consumer left", id, name);
            return OperationEnd::Cancelled;
        }
        debug!("[{}] {} ended: {:?}", id, name, end);
        end
    });

    OperationHandle {
        events: rx,
        task,
        cancel,
    }
}

async fn execute(ctx: &OperationContext, operation: Operation, sink: &ProgressSink) -> Result<Value> {
    match operation {
        Operation::Init(req) => init::run(ctx, &req, sink).await,
        Operation::PlatformInstall(req) => install::run(ctx, &req, sink).await,
        Operation::Compile(req) => compile::run(ctx, &req, sink).await,
    }
}

/// Run an external tool, streaming its output lines as `Output` events.
///
/// The process is killed if the consumer goes away mid-run.
pub(crate) async fn run_tool(
    launcher: &dyn ProcessLauncher,
    spec: &CommandSpec,
    sink: &ProgressSink,
) -> Result<Exit> {
    let SpawnedProcess {
        stdin,
        stdout,
        stderr,
        mut control,
    } = launcher.spawn(spec)?;
    drop(stdin);

    if let Err(e) = pump_output(stdout, stderr, sink).await {
        if let Err(kill_err) = control.kill().await {
            warn!("Failed to kill {}: {}", spec.program.display(), kill_err);
        }
        return Err(e);
    }
    control.wait().await
}

async fn pump_output(
    stdout: crate::process::BoxedRead,
    stderr: crate::process::BoxedRead,
    sink: &ProgressSink,
) -> Result<()> {
    let mut out = BufReader::new(stdout);
    let mut err = BufReader::new(stderr);
    let mut out_line = Vec::new();
    let mut err_line = Vec::new();
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        // read_until keeps partial bytes in the buffer when the other branch wins
        let (stream, read) = tokio::select! {
            n = out.read_until(b'\n', &mut out_line), if out_open => (OutputStream::Stdout, n?),
            n = err.read_until(b'\n', &mut err_line), if err_open => (OutputStream::Stderr, n?),
        };
        let (line, open) = match stream {
            OutputStream::Stdout => (&mut out_line, &mut out_open),
            _ => (&mut err_line, &mut err_open),
        };
        if read == 0 {
            *open = false;
            continue;
        }
        let text = decode_line(line);
        line.clear();
        sink.emit(ProgressEvent::Output { stream, text }).await?;
    }
    Ok(())
}

/// Tool output is not guaranteed to be UTF-8; invalid bytes become U+FFFD.
fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
