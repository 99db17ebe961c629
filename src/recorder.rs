/// Recorder process lifecycle: spawn, graceful stop, forced stop, exit reporting.
///
/// The recorder is an external screen-capture process (ffmpeg). It is asked to
/// finish by writing `q` to its stdin, which lets it finalize the container.
/// Every spawned child gets a waiter task that posts exactly one
/// `MonitorEvent::RecorderExited` when the process terminates, whatever the
/// reason.
use crate::monitor::MonitorEvent;
use crate::session::SessionId;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

/// Byte that asks ffmpeg to stop recording and finalize its output.
const GRACEFUL_STOP_BYTE: &[u8] = b"q";

/// Errors from recorder operations.
#[derive(Debug)]
pub enum RecorderError {
    /// The recorder program could not be launched.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Writing the stop byte to the recorder's stdin failed.
    Stdin { source: std::io::Error },
    /// Killing the recorder failed.
    Kill { source: std::io::Error },
}

impl std::fmt::Display for RecorderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderError::Spawn { program, source } => {
                write!(f, "failed to spawn recorder {}: {}", program, source)
            }
            RecorderError::Stdin { source } => {
                write!(f, "failed to send stop request to recorder: {}", source)
            }
            RecorderError::Kill { source } => {
                write!(f, "failed to kill recorder: {}", source)
            }
        }
    }
}

impl std::error::Error for RecorderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecorderError::Spawn { source, .. } => Some(source),
            RecorderError::Stdin { source } => Some(source),
            RecorderError::Kill { source } => Some(source),
        }
    }
}

/// Controls the external recorder on behalf of the session state machine.
///
/// Process exit is not reported through this trait: implementations post
/// `RecorderExited` on the monitor channel instead, so exit is handled as its
/// own event.
#[allow(async_fn_in_trait)]
pub trait Recorder {
    /// Opaque reference to one running recording.
    type Handle;

    /// Launch a recording into `output` for the given session.
    fn start(&mut self, session: SessionId, output: &Path) -> Result<Self::Handle, RecorderError>;

    /// Ask the recorder to finish gracefully. Returns once the request is sent,
    /// not when the process exits.
    async fn request_stop(&mut self, handle: &mut Self::Handle) -> Result<(), RecorderError>;

    /// Terminate the recorder without waiting for it to finalize.
    fn force_stop(&mut self, handle: &mut Self::Handle) -> Result<(), RecorderError>;
}

/// Builds the recorder arguments (including the output path) for one recording.
pub type ArgsBuilder = Box<dyn Fn(&Path) -> Vec<String> + Send>;

/// Runs the recorder as a child process.
pub struct ProcessRecorder {
    program: String,
    args_for: ArgsBuilder,
    events: mpsc::UnboundedSender<MonitorEvent>,
}

/// A running recorder child.
#[derive(Debug)]
pub struct ProcessHandle {
    session: SessionId,
    pid: Option<u32>,
    output: PathBuf,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessRecorder {
    pub fn new(
        program: impl Into<String>,
        args_for: impl Fn(&Path) -> Vec<String> + Send + 'static,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        Self {
            program: program.into(),
            args_for: Box::new(args_for),
            events,
        }
    }
}

impl Recorder for ProcessRecorder {
    type Handle = ProcessHandle;

    /// Spawn the recorder in its own process group with stdin piped.
    ///
    /// Must be called from within a tokio runtime: the exit waiter and the
    /// stderr forwarder run as tasks.
    fn start(&mut self, session: SessionId, output: &Path) -> Result<ProcessHandle, RecorderError> {
        let args = (self.args_for)(output);
        tracing::debug!(
            session,
            program = %self.program,
            args = ?args,
            "spawning recorder"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        // Own process group: a terminal Ctrl-C must not reach the recorder
        // before it has been asked to finalize.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| RecorderError::Spawn {
            program: self.program.clone(),
            source: e,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(session, stderr));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let events = self.events.clone();
        tokio::spawn(async move {
            let (exit_code, error) = match wait_for_exit(child, kill_rx).await {
                Ok(status) => (status.code(), None),
                Err(e) => (None, Some(e.to_string())),
            };
            let _ = events.send(MonitorEvent::RecorderExited {
                session,
                exit_code,
                error,
            });
        });

        tracing::info!(session, pid = ?pid, output = %output.display(), "recorder started");

        Ok(ProcessHandle {
            session,
            pid,
            output: output.to_path_buf(),
            stdin,
            kill_tx: Some(kill_tx),
        })
    }

    /// Write the stop byte and close stdin. A second call is a no-op.
    async fn request_stop(&mut self, handle: &mut ProcessHandle) -> Result<(), RecorderError> {
        let Some(mut stdin) = handle.stdin.take() else {
            tracing::debug!(session = handle.session, "stop already requested");
            return Ok(());
        };

        stdin
            .write_all(GRACEFUL_STOP_BYTE)
            .await
            .map_err(|e| RecorderError::Stdin { source: e })?;
        stdin
            .flush()
            .await
            .map_err(|e| RecorderError::Stdin { source: e })?;
        drop(stdin);

        tracing::debug!(
            session = handle.session,
            pid = ?handle.pid,
            output = %handle.output.display(),
            "graceful stop requested"
        );
        Ok(())
    }

    fn force_stop(&mut self, handle: &mut ProcessHandle) -> Result<(), RecorderError> {
        tracing::warn!(session = handle.session, pid = ?handle.pid, "killing recorder");

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = handle.pid {
                match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                    Err(e) => {
                        return Err(RecorderError::Kill {
                            source: std::io::Error::from(e),
                        })
                    }
                }
            }
        }

        // The waiter kills the direct child too, covering platforms without
        // process groups.
        if let Some(kill_tx) = handle.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        Ok(())
    }
}

/// Wait for the child, killing it first if a kill request arrives.
async fn wait_for_exit(mut child: Child, kill_rx: oneshot::Receiver<()>) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => return status,
        Ok(()) = kill_rx => {}
    }
    child.start_kill()?;
    child.wait().await
}

/// Log the recorder's stderr (ffmpeg progress and errors) at trace level.
async fn forward_stderr(session: SessionId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::trace!(session, "recorder: {}", line);
    }
}
