/// Connection-session state machine: turns keyword appearances in the two
/// watched logs into exactly one recording per connection.
///
/// `Idle -> Recording` on the connected keyword in the primary log,
/// `Recording -> Stopping` on a record appended to the incoming-connections
/// file, `Stopping -> Idle` when the recorder exits (after renaming the
/// artifact). The disconnected keyword is informational only.
use crate::config::{KeywordConfig, OutputConfig};
use crate::keywords::{contains_any, parse_incoming_record};
use crate::recorder::Recorder;
use crate::template::{render_output_name, TemplateVars};
use crate::timefmt::format_timestamp;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Monotonic id of a recording session within one run.
pub type SessionId = u64;

/// Externally visible phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Recording,
    Stopping,
}

/// A session that owns a running recorder. The temp path and the handle
/// exist together or not at all.
#[derive(Debug)]
struct ActiveSession<H> {
    id: SessionId,
    connected_at: DateTime<Local>,
    temp_output: PathBuf,
    handle: H,
}

#[derive(Debug)]
enum SessionState<H> {
    Idle,
    Recording(ActiveSession<H>),
    /// `final_output` is `None` when the stop came from shutdown rather than
    /// a finished connection; the artifact then keeps its temp name.
    Stopping {
        active: ActiveSession<H>,
        final_output: Option<PathBuf>,
    },
}

/// Point-in-time view of the session, for the status file.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub session_id: Option<SessionId>,
    pub connected_at: Option<DateTime<Local>>,
    pub temp_output: Option<PathBuf>,
    pub final_output: Option<PathBuf>,
    pub last_artifact: Option<PathBuf>,
}

/// The single session of this host and the recorder that serves it.
pub struct SessionMachine<R: Recorder> {
    recorder: R,
    keywords: KeywordConfig,
    output: OutputConfig,
    state: SessionState<R::Handle>,
    next_id: SessionId,
    last_artifact: Option<PathBuf>,
}

impl<R: Recorder> SessionMachine<R> {
    pub fn new(recorder: R, keywords: KeywordConfig, output: OutputConfig) -> Self {
        Self {
            recorder,
            keywords,
            output,
            state: SessionState::Idle,
            next_id: 1,
            last_artifact: None,
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            SessionState::Idle => Phase::Idle,
            SessionState::Recording(_) => Phase::Recording,
            SessionState::Stopping { .. } => Phase::Stopping,
        }
    }

    fn active(&self) -> Option<&ActiveSession<R::Handle>> {
        match &self.state {
            SessionState::Idle => None,
            SessionState::Recording(active) | SessionState::Stopping { active, .. } => Some(active),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.active().map(|a| a.id)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let active = self.active();
        let final_output = match &self.state {
            SessionState::Stopping { final_output, .. } => final_output.clone(),
            _ => None,
        };
        SessionSnapshot {
            phase: self.phase(),
            session_id: active.map(|a| a.id),
            connected_at: active.map(|a| a.connected_at),
            temp_output: active.map(|a| a.temp_output.clone()),
            final_output,
            last_artifact: self.last_artifact.clone(),
        }
    }

    /// Temp artifact path for a session that connected at `connected_at`.
    pub fn temp_output_path(&self, connected_at: &DateTime<Local>) -> PathBuf {
        let stamp = format_timestamp(connected_at, &self.output.date_format);
        self.output.dir.join(format!(
            "{}{}.{}",
            self.output.temp_prefix, stamp, self.output.extension
        ))
    }

    /// Handle new text from the primary log.
    ///
    /// Returns the new phase if the session changed state.
    pub fn on_log_delta(&mut self, text: &str, now: DateTime<Local>) -> Option<Phase> {
        let mut transition = None;

        if contains_any(text, &[&self.keywords.connected]) {
            tracing::info!("incoming connection connected");
            transition = self.start_session(now);
        }

        if contains_any(text, &[&self.keywords.disconnected]) {
            // The incoming-connections record is what ends a session.
            tracing::info!(session = ?self.session_id(), "incoming connection disconnected");
        }

        transition
    }

    fn start_session(&mut self, now: DateTime<Local>) -> Option<Phase> {
        if let Some(active) = self.active() {
            tracing::debug!(
                session = active.id,
                phase = ?self.phase(),
                "session already open, ignoring connect"
            );
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        // A temp file kept by an earlier session may already hold this name.
        let temp_output = unused_path(self.temp_output_path(&now));
        tracing::debug!(session = id, temp_output = %temp_output.display(), "starting recording");

        match self.recorder.start(id, &temp_output) {
            Ok(handle) => {
                self.state = SessionState::Recording(ActiveSession {
                    id,
                    connected_at: now,
                    temp_output,
                    handle,
                });
                Some(Phase::Recording)
            }
            Err(e) => {
                tracing::error!(session = id, error = %e, "failed to start recorder");
                None
            }
        }
    }

    /// Handle new text from the incoming-connections file.
    ///
    /// While recording, a well-formed record names the final artifact and
    /// asks the recorder to stop. Records arriving while idle or already
    /// stopping are dropped.
    pub async fn on_incoming_delta(&mut self, text: &str, now: DateTime<Local>) -> Option<Phase> {
        tracing::info!(record = text.trim_end(), "incoming connection record");

        match self.phase() {
            Phase::Idle => {
                tracing::debug!("no active session, dropping incoming record");
                return None;
            }
            Phase::Stopping => {
                tracing::debug!(session = ?self.session_id(), "session already stopping");
                return None;
            }
            Phase::Recording => {}
        }

        let Some(record) = parse_incoming_record(text) else {
            tracing::warn!(
                session = ?self.session_id(),
                "malformed incoming record, session keeps recording"
            );
            return None;
        };

        let mut active = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Recording(active) => active,
            other => {
                self.state = other;
                return None;
            }
        };

        let vars = TemplateVars {
            connected_at: format_timestamp(&active.connected_at, &self.output.date_format),
            disconnected_at: format_timestamp(&now, &self.output.date_format),
            connection_id: record.connection_id,
            display_name: record.display_name,
        };
        let final_output = self
            .output
            .dir
            .join(render_output_name(&self.output.file_name, &vars));
        tracing::debug!(
            session = active.id,
            final_output = %final_output.display(),
            "stopping recording"
        );

        if let Err(e) = self.recorder.request_stop(&mut active.handle).await {
            // The exit event still arrives if the recorder is already gone.
            tracing::warn!(session = active.id, error = %e, "graceful stop request failed");
        }

        self.state = SessionState::Stopping {
            active,
            final_output: Some(final_output),
        };
        Some(Phase::Stopping)
    }

    /// Handle termination of the recorder for `session`.
    ///
    /// A stopping session is renamed to its final name. A session still
    /// recording has crashed: its temp file is left in place. Either way the
    /// machine is Idle afterwards.
    pub async fn on_recorder_exit(
        &mut self,
        session: SessionId,
        exit_code: Option<i32>,
        error: Option<&str>,
    ) -> Option<Phase> {
        if self.session_id() != Some(session) {
            tracing::debug!(session, "exit of unknown recorder ignored");
            return None;
        }

        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Recording(active) => {
                tracing::error!(
                    session,
                    exit_code = ?exit_code,
                    error = ?error,
                    temp_output = %active.temp_output.display(),
                    "recorder exited unexpectedly, recording left at temp path"
                );
            }
            SessionState::Stopping {
                active,
                final_output: None,
            } => {
                tracing::info!(
                    session,
                    exit_code = ?exit_code,
                    output = %active.temp_output.display(),
                    "recorder stopped, recording kept at temp path"
                );
                self.last_artifact = Some(active.temp_output);
            }
            SessionState::Stopping {
                active,
                final_output: Some(final_output),
            } => {
                tracing::debug!(session, exit_code = ?exit_code, "recorder exited");
                let final_output = unused_path(final_output);
                match tokio::fs::rename(&active.temp_output, &final_output).await {
                    Ok(()) => {
                        tracing::info!(
                            session,
                            output = %final_output.display(),
                            "recording written"
                        );
                        self.last_artifact = Some(final_output);
                    }
                    Err(e) => {
                        tracing::error!(
                            session,
                            from = %active.temp_output.display(),
                            to = %final_output.display(),
                            error = %e,
                            "failed to rename recording"
                        );
                        self.last_artifact = Some(active.temp_output);
                    }
                }
            }
            SessionState::Idle => {}
        }
        Some(Phase::Idle)
    }

    /// Kill the recorder of `session` if it is still stopping.
    pub fn on_stop_timeout(&mut self, session: SessionId) {
        let SessionState::Stopping { active, .. } = &mut self.state else {
            return;
        };
        if active.id != session {
            return;
        }
        tracing::warn!(session, "recorder ignored graceful stop");
        if let Err(e) = self.recorder.force_stop(&mut active.handle) {
            tracing::error!(session, error = %e, "failed to kill recorder");
        }
    }

    /// Ask an active recording to finish without renaming it.
    ///
    /// Returns the new phase if the session changed state.
    pub async fn shutdown(&mut self) -> Option<Phase> {
        let mut active = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Recording(active) => active,
            other => {
                self.state = other;
                return None;
            }
        };

        tracing::info!(session = active.id, "shutting down, stopping active recording");
        if let Err(e) = self.recorder.request_stop(&mut active.handle).await {
            tracing::warn!(session = active.id, error = %e, "graceful stop request failed");
        }
        self.state = SessionState::Stopping {
            active,
            final_output: None,
        };
        Some(Phase::Stopping)
    }

    /// Force-stop whatever recorder is running.
    pub fn kill_active(&mut self) {
        let id = self.session_id();
        let handle = match &mut self.state {
            SessionState::Idle => return,
            SessionState::Recording(active) | SessionState::Stopping { active, .. } => {
                &mut active.handle
            }
        };
        if let Err(e) = self.recorder.force_stop(handle) {
            tracing::error!(session = ?id, error = %e, "failed to kill recorder");
        }
    }

    #[cfg(test)]
    pub fn recorder(&self) -> &R {
        &self.recorder
    }
}

/// `path` itself if nothing exists there, otherwise the first free
/// `<stem>_<n>.<ext>` next to it.
fn unused_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    (1..=u32::MAX)
        .map(|n| match &ext {
            Some(ext) => parent.join(format!("{stem}_{n}.{ext}")),
            None => parent.join(format!("{stem}_{n}")),
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}
