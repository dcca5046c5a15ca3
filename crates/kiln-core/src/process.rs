//! Process execution facility.
//!
//! Operations and debug sessions start external tools through a
//! [`ProcessLauncher`], which hands back the child's byte streams and a
//! [`ProcessControl`] for signalling it. Tests swap in in-memory backends.

use crate::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::debug;

/// Program, arguments and environment of one child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Shell-like rendering for logs and error messages
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().map(|a| {
                if a.contains(' ') {
                    format!("'{a}'")
                } else {
                    a.clone()
                }
            }))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(i32),
    /// Terminated by a signal (crash or kill)
    Signal(i32),
}

impl Exit {
    #[must_use]
    pub fn success(self) -> bool {
        self == Self::Code(0)
    }
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit status {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// A started child with its standard streams split out
pub struct SpawnedProcess {
    pub stdin: BoxedWrite,
    pub stdout: BoxedRead,
    pub stderr: BoxedRead,
    pub control: Box<dyn ProcessControl>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ProcessControl: Send {
    /// Deliver an out-of-band interrupt (`SIGINT`).
    ///
    /// # Errors
    ///
    /// Returns an error if the process is gone or the signal fails.
    fn interrupt(&mut self) -> Result<()>;

    /// Kill the process and reap it.
    async fn kill(&mut self) -> Result<()>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> Result<Exit>;
}

pub trait ProcessLauncher: Send + Sync {
    /// Start a process with piped stdin, stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the program cannot be started.
    fn spawn(&self, spec: &CommandSpec) -> Result<SpawnedProcess>;
}

/// Launches real processes through `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn spawn(&self, spec: &CommandSpec) -> Result<SpawnedProcess> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::BackendUnavailable(format!("Failed to spawn {}: {}", spec.program.display(), e))
        })?;
        debug!("Spawned pid {:?}: {}", child.id(), spec.display());

        let missing = |stream: &str| Error::BackendUnavailable(format!("Failed to get {stream} handle"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        Ok(SpawnedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            control: Box::new(ChildControl { child }),
        })
    }
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    fn interrupt(&mut self) -> Result<()> {
        let pid = self
            .child
            .id()
            .ok_or_else(|| Error::BackendUnavailable("Process already exited".to_string()))?;
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| Error::BackendUnavailable(format!("Invalid pid {pid}")))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<Exit> {
        let status = self.child.wait().await?;
        Ok(exit_from_status(status))
    }
}

#[cfg(unix)]
fn exit_from_status(status: std::process::ExitStatus) -> Exit {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => Exit::Code(code),
        (None, Some(signal)) => Exit::Signal(signal),
        (None, None) => Exit::Code(-1),
    }
}

#[cfg(not(unix))]
fn exit_from_status(status: std::process::ExitStatus) -> Exit {
    Exit::Code(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_display_quotes_spaces() {
        let spec = CommandSpec::new("/bin/gdb")
            .arg("-ex")
            .arg("set pagination off")
            .arg("fw.elf");
        assert_eq!(spec.display(), "/bin/gdb -ex 'set pagination off' fw.elf");
    }

    #[test]
    fn test_exit_success() {
        assert!(Exit::Code(0).success());
        assert!(!Exit::Code(2).success());
        assert!(!Exit::Signal(9).success());
        assert_eq!(Exit::Signal(9).to_string(), "signal 9");
    }

    #[test]
    fn test_spawn_missing_program_is_backend_unavailable() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let result = TokioLauncher.spawn(&CommandSpec::new("/nonexistent/kiln-tool"));
        assert!(matches!(result, Err(Error::BackendUnavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_cat_echoes() {
        let mut process = TokioLauncher.spawn(&CommandSpec::new("cat")).unwrap();
        process.stdin.write_all(b"ping").await.unwrap();
        drop(process.stdin);

        let mut out = Vec::new();
        process.stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ping");
        assert_eq!(process.control.wait().await.unwrap(), Exit::Code(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupt_terminates_sleep() {
        let mut process = TokioLauncher
            .spawn(&CommandSpec::new("sleep").arg("30"))
            .unwrap();
        process.control.interrupt().unwrap();
        let exit = process.control.wait().await.unwrap();
        assert_eq!(exit, Exit::Signal(libc::SIGINT));
    }
}
