//! Debug relay: a byte pipe between a client and a debugger backend.
//!
//! A session is negotiated from the first client message, which must carry
//! the target and nothing else. Once the backend is running the session is
//! active: client bytes go to the backend's stdin in order, an interrupt
//! flag becomes `SIGINT`, and backend output flows back as responses. When
//! either side ends, the other is drained and the backend is reaped.

use super::{backend, resolver};
use crate::config::DebugSettings;
use crate::instance::Instance;
use crate::process::{BoxedRead, BoxedWrite, ProcessLauncher, SpawnedProcess};
use crate::{Error, Result};
use kiln_types::{DebugConfigRequest, DebugRequest, DebugResponse, DebugSessionConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;
/// Client writes queued for the backend's stdin before the relay waits
const WRITE_QUEUE: usize = 16;

/// Client side of a debug stream as seen by the relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayInput {
    Message(DebugRequest),
    /// The client half-closed its side
    Close,
}

/// Extract the target from the message that opens a session.
///
/// # Errors
///
/// Returns `Error::ProtocolViolation` if the message has no target or also
/// carries bytes or an interrupt.
pub fn opening_request(first: DebugRequest) -> Result<DebugConfigRequest> {
    let DebugRequest {
        config,
        data,
        send_interrupt,
    } = first;
    let config = config.ok_or_else(|| {
        Error::ProtocolViolation("The first debug message must carry the session target".to_string())
    })?;
    if !data.is_empty() || send_interrupt {
        return Err(Error::ProtocolViolation(
            "The opening debug message cannot carry data or an interrupt".to_string(),
        ));
    }
    Ok(config)
}

/// A debug session whose backend is running
pub struct DebugSession {
    config: DebugSessionConfig,
    process: SpawnedProcess,
    close_requested: bool,
    grace: Duration,
    instance_closed: CancellationToken,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("config", &self.config)
            .field("close_requested", &self.close_requested)
            .finish_non_exhaustive()
    }
}

/// Resolve the target and launch the backend.
///
/// Any client message that arrives before the backend is up fails the
/// session with `ProtocolViolation`; a close while negotiating cancels it.
///
/// # Errors
///
/// Returns `BackendUnavailable` when the instance is at its session limit or
/// the backend cannot start, plus any resolver error.
pub async fn negotiate(
    instance: Arc<Instance>,
    launcher: &dyn ProcessLauncher,
    settings: &DebugSettings,
    req: DebugConfigRequest,
    inbound: &mut mpsc::Receiver<RelayInput>,
) -> Result<DebugSession> {
    let permit = instance.debug_slots.clone().try_acquire_owned().map_err(|_| {
        Error::BackendUnavailable(format!(
            "Instance {} has reached its debug session limit",
            instance.id
        ))
    })?;

    let launch = async {
        let config = {
            let state = instance.state.read().await;
            resolver::resolve(&state, &req)?
        };
        let interpreter = req
            .interpreter
            .as_deref()
            .filter(|i| !i.is_empty())
            .unwrap_or(&settings.default_interpreter);
        let spec = backend::build_command(&config, interpreter)?;
        info!("[{}] Starting debugger: {}", instance.id, spec.display());
        let process = launcher.spawn(&spec)?;
        Ok::<_, Error>((config, process))
    };

    let (config, mut process) = tokio::select! {
        launched = launch => launched?,
        input = inbound.recv() => return Err(early_input(input)),
        () = instance.closed.cancelled() => return Err(Error::Cancelled),
    };

    let mut close_requested = false;
    while let Ok(input) = inbound.try_recv() {
        match input {
            RelayInput::Close => close_requested = true,
            RelayInput::Message(_) => {
                if let Err(e) = process.control.kill().await {
                    warn!("[{}] Failed to kill debugger: {}", instance.id, e);
                }
                return Err(early_input(Some(input)));
            }
        }
    }

    Ok(DebugSession {
        config,
        process,
        close_requested,
        grace: settings.shutdown_grace(),
        instance_closed: instance.closed.clone(),
        _permit: permit,
    })
}

fn early_input(input: Option<RelayInput>) -> Error {
    match input {
        Some(RelayInput::Message(_)) => Error::ProtocolViolation(
            "Message received before the debug session was established".to_string(),
        ),
        Some(RelayInput::Close) | None => Error::Cancelled,
    }
}

impl DebugSession {
    #[must_use]
    pub fn config(&self) -> &DebugSessionConfig {
        &self.config
    }

    /// Relay bytes until either side ends, then drain and reap the backend.
    ///
    /// `cancel` or destroying the instance kills the backend immediately.
    /// After a clean end the backend gets the configured shutdown grace to
    /// exit once its stdin is closed.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for a second target message, `Cancelled`
    /// when cancelled, or an I/O error from reaping the backend.
    #[allow(clippy::too_many_lines)]
    pub async fn relay(
        self,
        mut inbound: mpsc::Receiver<RelayInput>,
        outbound: mpsc::Sender<DebugResponse>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let grace = self.grace;
        let SpawnedProcess {
            stdin,
            stdout,
            stderr,
            mut control,
        } = self.process;
        let (stdin_tx, writer) = spawn_writer(stdin);
        let mut stdin_tx = Some(stdin_tx);
        let stderr_seen = Arc::new(AtomicBool::new(false));
        let pumps = [
            tokio::spawn(pump(stdout, outbound.clone(), None)),
            tokio::spawn(pump(stderr, outbound.clone(), Some(stderr_seen.clone()))),
        ];
        let instance_closed = self.instance_closed;

        let mut exited = None;
        let outcome = if self.close_requested {
            Ok(())
        } else {
            loop {
                tokio::select! {
                    () = stopped(&cancel, &instance_closed, &outbound) => break Err(Error::Cancelled),
                    status = control.wait() => {
                        exited = Some(status?);
                        break Ok(());
                    }
                    input = inbound.recv() => match input {
                        Some(RelayInput::Message(msg)) => {
                            if msg.config.is_some() {
                                break Err(Error::ProtocolViolation(
                                    "Debug session is already established".to_string(),
                                ));
                            }
                            if msg.send_interrupt {
                                if let Err(e) = control.interrupt() {
                                    warn!("Failed to interrupt debugger: {}", e);
                                    let _ = outbound.send(DebugResponse::error(e.to_string())).await;
                                }
                                continue;
                            }
                            let Some(tx) = stdin_tx.as_ref().filter(|_| !msg.data.is_empty()) else {
                                continue;
                            };
                            // A backend that stops reading must not pin the relay
                            tokio::select! {
                                sent = tx.send(msg.data) => if sent.is_err() {
                                    stdin_tx = None;
                                },
                                () = stopped(&cancel, &instance_closed, &outbound) => break Err(Error::Cancelled),
                                status = control.wait() => {
                                    exited = Some(status?);
                                    break Ok(());
                                }
                            }
                        }
                        Some(RelayInput::Close) | None => break Ok(()),
                    },
                }
            }
        };

        if let Err(e) = outcome {
            if let Err(kill_err) = control.kill().await {
                warn!("Failed to kill debugger: {}", kill_err);
            }
            writer.abort();
            for pump in &pumps {
                pump.abort();
            }
            return Err(e);
        }

        // The writer closes stdin once its queue is flushed
        drop(stdin_tx);
        let (exit, killed) = match exited {
            Some(exit) => (exit, false),
            None => match tokio::time::timeout(grace, control.wait()).await {
                Ok(exit) => (exit?, false),
                Err(_) => {
                    debug!("Debugger did not exit within {:?}, killing it", grace);
                    control.kill().await?;
                    (control.wait().await?, true)
                }
            },
        };

        writer.abort();
        drain(pumps, grace).await;

        if !killed && !exit.success() && !stderr_seen.load(Ordering::SeqCst) {
            let _ = outbound
                .send(DebugResponse::error(format!("Debugger exited with {exit}")))
                .await;
        }
        debug!("Debug session closed ({})", exit);
        Ok(())
    }
}

async fn write_flush(writer: &mut BoxedWrite, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

/// Own the backend's stdin on a task of its own; dropping the sender closes it.
fn spawn_writer(mut stdin: BoxedWrite) -> (mpsc::Sender<Vec<u8>>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE);
    let task = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_flush(&mut stdin, &data).await {
                debug!("Debugger stdin closed: {}", e);
                break;
            }
        }
    });
    (tx, task)
}

/// Resolves when the session must stop without draining.
async fn stopped(
    cancel: &CancellationToken,
    instance_closed: &CancellationToken,
    outbound: &mpsc::Sender<DebugResponse>,
) {
    tokio::select! {
        () = cancel.cancelled() => {}
        () = instance_closed.cancelled() => {}
        () = outbound.closed() => {}
    }
}

/// Forward backend output; stderr chunks become error-bearing responses.
async fn pump(
    mut reader: BoxedRead,
    outbound: mpsc::Sender<DebugResponse>,
    stderr_seen: Option<Arc<AtomicBool>>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Debugger output closed: {}", e);
                break;
            }
        };
        let response = match &stderr_seen {
            Some(seen) => {
                seen.store(true, Ordering::SeqCst);
                DebugResponse::error(String::from_utf8_lossy(&buf[..n]))
            }
            None => DebugResponse::data(&buf[..n]),
        };
        if outbound.send(response).await.is_err() {
            break;
        }
    }
}

/// Wait for the output pumps to finish, aborting them after `grace`.
async fn drain(pumps: [JoinHandle<()>; 2], grace: Duration) {
    let [out, err] = pumps;
    let out_abort = out.abort_handle();
    let err_abort = err.abort_handle();
    let joined = tokio::time::timeout(grace, async {
        let _ = out.await;
        let _ = err.await;
    })
    .await;
    if joined.is_err() {
        debug!("Debugger output still open after exit, dropping it");
        out_abort.abort();
        err_abort.abort();
    }
}
