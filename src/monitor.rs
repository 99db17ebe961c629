//! Watcher dispatch and the single event loop.
//!
//! # Architecture
//!
//! A `notify` watcher on the log directory forwards changes to the two
//! watched files into one unbounded channel. The recorder's exit waiters,
//! the stop watchdog and the signal listener post to the same channel.
//! `Monitor::run` consumes it one event at a time; each handler (offset
//! bookkeeping, tail read, state machine step) runs to completion before the
//! next event is taken, so no state is shared or locked.

use crate::config::MonitorConfig;
use crate::offset::WatchedFile;
use crate::recorder::Recorder;
use crate::session::{Phase, SessionId, SessionMachine};
use crate::status::StatusFile;
use crate::tail::read_range;
use crate::watchdog::StopWatchdog;
use chrono::Local;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Which of the two watched files changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTarget {
    /// Primary log (connection keywords).
    Log,
    /// Incoming-connections file (session records).
    Incoming,
}

/// Everything the event loop reacts to.
#[derive(Debug)]
pub enum MonitorEvent {
    FileChanged(WatchTarget),
    RecorderExited {
        session: SessionId,
        exit_code: Option<i32>,
        error: Option<String>,
    },
    StopTimeout {
        session: SessionId,
    },
    Shutdown,
}

/// Error type for watcher setup.
#[derive(Debug)]
pub enum MonitorError {
    /// Failed to initialize the notify watcher
    NotifyInit(notify::Error),
    /// Failed to watch the log directory
    Watch { path: PathBuf, error: notify::Error },
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotifyInit(e) => write!(f, "Failed to initialize file watcher: {}", e),
            Self::Watch { path, error } => {
                write!(f, "Failed to watch directory {}: {}", path.display(), error)
            }
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NotifyInit(e) => Some(e),
            Self::Watch { error, .. } => Some(error),
        }
    }
}

/// Create the event channel shared by the monitor and its producers.
pub fn channel() -> (
    mpsc::UnboundedSender<MonitorEvent>,
    mpsc::UnboundedReceiver<MonitorEvent>,
) {
    mpsc::unbounded_channel()
}

pub struct Monitor<R: Recorder> {
    watch_dir: PathBuf,
    log_file: WatchedFile,
    incoming_file: WatchedFile,
    machine: SessionMachine<R>,
    watchdog: StopWatchdog,
    status: Option<StatusFile>,
    events_tx: mpsc::UnboundedSender<MonitorEvent>,
    events_rx: mpsc::UnboundedReceiver<MonitorEvent>,
    shutting_down: bool,
}

impl<R: Recorder> Monitor<R> {
    /// Build a monitor from a resolved config snapshot.
    ///
    /// Both watched files are sized now; content already present is never
    /// scanned.
    pub fn new(
        config: &MonitorConfig,
        recorder: R,
        events_tx: mpsc::UnboundedSender<MonitorEvent>,
        events_rx: mpsc::UnboundedReceiver<MonitorEvent>,
    ) -> Self {
        let log_file = WatchedFile::from_current_size(config.log_path());
        let incoming_file = WatchedFile::from_current_size(config.incoming_path());
        debug!(
            log_size = log_file.last_size(),
            incoming_size = incoming_file.last_size(),
            "initial watched file sizes"
        );

        Self {
            watch_dir: config.watch.dir.clone(),
            log_file,
            incoming_file,
            machine: SessionMachine::new(
                recorder,
                config.keywords.clone(),
                config.output.clone(),
            ),
            watchdog: StopWatchdog::new(Duration::from_secs(config.recorder.stop_timeout_secs)),
            status: config.output.status_file.clone().map(StatusFile::new),
            events_tx,
            events_rx,
            shutting_down: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    /// Watch the log directory and process events until shutdown completes.
    pub async fn run(mut self) -> Result<(), MonitorError> {
        let _watcher = self.watch()?;
        info!(
            dir = %self.watch_dir.display(),
            log = %self.log_file.path().display(),
            incoming = %self.incoming_file.path().display(),
            "watching for remote sessions"
        );
        self.write_status();

        while let Some(event) = self.events_rx.recv().await {
            if self.handle_event(event).await.is_break() {
                break;
            }
        }

        if let Some(status) = &self.status {
            status.remove();
        }
        info!(phase = ?self.phase(), "monitor stopped");
        Ok(())
    }

    /// Start the notify watcher. Dropping the returned watcher stops it.
    fn watch(&self) -> Result<RecommendedWatcher, MonitorError> {
        let log_name = file_name_of(self.log_file.path());
        let incoming_name = file_name_of(self.incoming_file.path());
        let tx = self.events_tx.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("Watch error: {:?}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in &event.paths {
                let name = file_name_of(path);
                let target = if name == log_name {
                    WatchTarget::Log
                } else if name == incoming_name {
                    WatchTarget::Incoming
                } else {
                    continue;
                };
                let _ = tx.send(MonitorEvent::FileChanged(target));
            }
        })
        .map_err(MonitorError::NotifyInit)?;

        watcher
            .watch(&self.watch_dir, RecursiveMode::NonRecursive)
            .map_err(|error| MonitorError::Watch {
                path: self.watch_dir.clone(),
                error,
            })?;
        Ok(watcher)
    }

    /// Wait for the next event (used by tests that drive the loop by hand).
    #[cfg(test)]
    pub async fn next_event(&mut self) -> Option<MonitorEvent> {
        self.events_rx.recv().await
    }

    /// Process one event to completion. `Break` ends the loop.
    pub async fn handle_event(&mut self, event: MonitorEvent) -> ControlFlow<()> {
        let transition = match event {
            MonitorEvent::FileChanged(target) => self.handle_file_change(target).await,
            MonitorEvent::RecorderExited {
                session,
                exit_code,
                error,
            } => {
                self.machine
                    .on_recorder_exit(session, exit_code, error.as_deref())
                    .await
            }
            MonitorEvent::StopTimeout { session } => {
                self.machine.on_stop_timeout(session);
                None
            }
            MonitorEvent::Shutdown => {
                if self.shutting_down {
                    warn!("second shutdown signal, killing recorder");
                    self.machine.kill_active();
                    None
                } else {
                    self.shutting_down = true;
                    self.machine.shutdown().await
                }
            }
        };

        match transition {
            Some(Phase::Stopping) => {
                if let Some(session) = self.machine.session_id() {
                    self.watchdog.arm(session, &self.events_tx);
                }
            }
            Some(Phase::Idle) => self.watchdog.disarm(),
            _ => {}
        }
        if transition.is_some() {
            self.write_status();
        }

        if self.shutting_down && self.machine.phase() == Phase::Idle {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Read the delta of the changed file and feed it to the state machine.
    async fn handle_file_change(&mut self, target: WatchTarget) -> Option<Phase> {
        if self.shutting_down {
            return None;
        }

        let file = match target {
            WatchTarget::Log => &mut self.log_file,
            WatchTarget::Incoming => &mut self.incoming_file,
        };

        let size = match std::fs::metadata(file.path()) {
            Ok(m) => m.len(),
            Err(e) => {
                debug!(path = %file.path().display(), error = %e, "cannot stat watched file");
                return None;
            }
        };
        let previous = file.last_size();
        let range = file.compute_delta(size)?;
        debug!(
            ?target,
            previous,
            size,
            start = range.start,
            end = range.end,
            "watched file changed"
        );

        let text = read_range(file.path(), range);
        if text.is_empty() {
            return None;
        }
        trace!(?target, "delta:\n{}", text);

        let now = Local::now();
        match target {
            WatchTarget::Log => self.machine.on_log_delta(&text, now),
            WatchTarget::Incoming => self.machine.on_incoming_delta(&text, now).await,
        }
    }

    fn write_status(&self) {
        if let Some(status) = &self.status {
            status.update(self.machine.snapshot());
        }
    }
}

fn file_name_of(path: &Path) -> Option<std::ffi::OsString> {
    path.file_name().map(|n| n.to_os_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::ProcessRecorder;
    use crate::session::tests::FakeRecorder;
    use std::io::Write;

    struct Fixture {
        _dir: tempfile::TempDir,
        watch_dir: PathBuf,
        output_dir: PathBuf,
        config: MonitorConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let watch_dir = dir.path().join("logs");
            let output_dir = dir.path().join("videos");
            std::fs::create_dir_all(&watch_dir).unwrap();
            std::fs::create_dir_all(&output_dir).unwrap();

            let mut config = MonitorConfig::default();
            config.watch.dir = watch_dir.clone();
            config.output.dir = output_dir.clone();
            config.output.status_file = Some(dir.path().join("status.json"));

            let fixture = Self {
                _dir: dir,
                watch_dir,
                output_dir,
                config,
            };
            fixture.append(WatchTarget::Log, &"x".repeat(100));
            fixture.append(WatchTarget::Incoming, &"y".repeat(50));
            fixture
        }

        fn path(&self, target: WatchTarget) -> PathBuf {
            match target {
                WatchTarget::Log => self.config.log_path(),
                WatchTarget::Incoming => self.config.incoming_path(),
            }
        }

        fn append(&self, target: WatchTarget, text: &str) {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path(target))
                .unwrap();
            file.write_all(text.as_bytes()).unwrap();
        }

        fn outputs(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(&self.output_dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }

        fn status(&self) -> serde_json::Value {
            self.try_status().expect("status file")
        }

        fn try_status(&self) -> Option<serde_json::Value> {
            let path = self.config.output.status_file.as_ref()?;
            serde_json::from_str(&std::fs::read_to_string(path).ok()?).ok()
        }

        /// Poll the status file until its phase is `phase`.
        async fn wait_for_phase(&self, phase: &str) -> bool {
            for _ in 0..250 {
                if self.try_status().is_some_and(|s| s["phase"] == phase) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        }
    }

    fn fake_monitor(fixture: &Fixture) -> Monitor<FakeRecorder> {
        let (tx, rx) = channel();
        Monitor::new(&fixture.config, FakeRecorder::default(), tx, rx)
    }

    #[tokio::test]
    async fn test_existing_content_is_not_replayed() {
        let fixture = Fixture::new();
        fixture.append(WatchTarget::Log, "TeamViewerDesktop started\n");
        let mut monitor = fake_monitor(&fixture);

        assert_eq!(
            monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Log)).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.phase(), Phase::Idle);
        assert_eq!(monitor.log_file.last_size(), 126);
    }

    #[tokio::test]
    async fn test_connect_then_record_then_exit() {
        let fixture = Fixture::new();
        let mut monitor = fake_monitor(&fixture);

        fixture.append(WatchTarget::Log, "12:00:00 TeamViewerDesktop started\n");
        assert_eq!(
            monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Log)).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.phase(), Phase::Recording);
        assert_eq!(fixture.status()["phase"], "recording");

        // Re-observing the same size reads nothing and starts nothing
        assert_eq!(
            monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Log)).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.machine.recorder().started.len(), 1);

        fixture.append(WatchTarget::Incoming, "42\tAlice\n");
        assert_eq!(
            monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Incoming)).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.phase(), Phase::Stopping);
        assert!(monitor.watchdog.is_armed());
        assert_eq!(fixture.status()["phase"], "stopping");

        let flow = monitor
            .handle_event(MonitorEvent::RecorderExited {
                session: 1,
                exit_code: Some(0),
                error: None,
            })
            .await;
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(monitor.phase(), Phase::Idle);
        assert!(!monitor.watchdog.is_armed());

        let outputs = fixture.outputs();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].ends_with("-42(Alice).mp4"), "got {outputs:?}");
        assert!(!outputs[0].starts_with("tmp_"));
        assert_eq!(fixture.status()["phase"], "idle");
    }

    #[tokio::test]
    async fn test_truncated_log_is_read_from_start() {
        let fixture = Fixture::new();
        let mut monitor = fake_monitor(&fixture);

        std::fs::write(fixture.path(WatchTarget::Log), "TeamViewerDesktop started\n").unwrap();
        assert_eq!(
            monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Log)).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.phase(), Phase::Recording);
        assert_eq!(monitor.log_file.last_size(), 26);
    }

    #[tokio::test]
    async fn test_incoming_record_without_session_is_dropped() {
        let fixture = Fixture::new();
        let mut monitor = fake_monitor(&fixture);

        fixture.append(WatchTarget::Incoming, "42\tAlice\n");
        assert_eq!(
            monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Incoming)).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.phase(), Phase::Idle);
        assert!(fixture.outputs().is_empty());
    }

    #[tokio::test]
    async fn test_missing_watched_file_is_ignored() {
        let fixture = Fixture::new();
        let mut monitor = fake_monitor(&fixture);

        std::fs::remove_file(fixture.path(WatchTarget::Log)).unwrap();
        let flow = monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Log)).await;
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(monitor.log_file.last_size(), 100);
    }

    #[tokio::test]
    async fn test_shutdown_when_idle_breaks() {
        let fixture = Fixture::new();
        let mut monitor = fake_monitor(&fixture);
        let flow = monitor.handle_event(MonitorEvent::Shutdown).await;
        assert_eq!(flow, ControlFlow::Break(()));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_recorder_exit() {
        let fixture = Fixture::new();
        let mut monitor = fake_monitor(&fixture);

        fixture.append(WatchTarget::Log, "TeamViewerDesktop started\n");
        assert_eq!(
            monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Log)).await,
            ControlFlow::Continue(())
        );

        let flow = monitor.handle_event(MonitorEvent::Shutdown).await;
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(monitor.phase(), Phase::Stopping);

        // Second signal escalates to a kill
        assert_eq!(
            monitor.handle_event(MonitorEvent::Shutdown).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.machine.recorder().kills, vec![1]);

        // Changes arriving during shutdown are not processed
        fixture.append(WatchTarget::Incoming, "42\tAlice\n");
        assert_eq!(
            monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Incoming)).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.incoming_file.last_size(), 50);

        let flow = monitor
            .handle_event(MonitorEvent::RecorderExited {
                session: 1,
                exit_code: None,
                error: None,
            })
            .await;
        assert_eq!(flow, ControlFlow::Break(()));
        let outputs = fixture.outputs();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].starts_with("tmp_"));
    }

    #[tokio::test]
    async fn test_end_to_end_with_process_recorder() {
        let fixture = Fixture::new();
        let (tx, rx) = channel();
        let recorder = ProcessRecorder::new(
            "sh",
            |out: &Path| {
                vec![
                    "-c".to_string(),
                    r#"printf frames > "$0"; head -c 1 > /dev/null"#.to_string(),
                    out.to_string_lossy().into_owned(),
                ]
            },
            tx.clone(),
        );
        let mut monitor = Monitor::new(&fixture.config, recorder, tx, rx);

        fixture.append(WatchTarget::Log, "TeamViewerDesktop started\n");
        assert_eq!(
            monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Log)).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.phase(), Phase::Recording);

        // Let the recorder create its temp file before asking it to stop
        for _ in 0..100 {
            if !fixture.outputs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        fixture.append(WatchTarget::Incoming, "7\tnull\n");
        assert_eq!(
            monitor.handle_event(MonitorEvent::FileChanged(WatchTarget::Incoming)).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.phase(), Phase::Stopping);

        let event = tokio::time::timeout(Duration::from_secs(5), monitor.next_event())
            .await
            .expect("recorder did not exit")
            .expect("channel closed");
        assert!(matches!(event, MonitorEvent::RecorderExited { session: 1, .. }));
        assert_eq!(
            monitor.handle_event(event).await,
            ControlFlow::Continue(())
        );
        assert_eq!(monitor.phase(), Phase::Idle);

        let outputs = fixture.outputs();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].ends_with("-7.mp4"), "got {outputs:?}");
        let contents = std::fs::read_to_string(fixture.output_dir.join(&outputs[0])).unwrap();
        assert_eq!(contents, "frames");
    }

    #[tokio::test]
    async fn test_run_dispatches_watched_files_only() {
        let fixture = Fixture::new();
        let (tx, rx) = channel();
        let monitor = Monitor::new(&fixture.config, FakeRecorder::default(), tx.clone(), rx);

        let drive = async {
            assert!(fixture.wait_for_phase("idle").await, "monitor never started");

            // Same directory, same content, different name
            std::fs::write(
                fixture.watch_dir.join("TeamViewer15_Logfile_OLD.log"),
                "TeamViewerDesktop started\n",
            )
            .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(fixture.status()["phase"], "idle");

            fixture.append(WatchTarget::Log, "TeamViewerDesktop started\n");
            assert!(fixture.wait_for_phase("recording").await, "connect not dispatched");
            assert_eq!(fixture.status()["session_id"], 1);

            tx.send(MonitorEvent::Shutdown).unwrap();
            assert!(fixture.wait_for_phase("stopping").await);
            tx.send(MonitorEvent::RecorderExited {
                session: 1,
                exit_code: Some(0),
                error: None,
            })
            .unwrap();
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(20), async {
            tokio::join!(monitor.run(), drive)
        })
        .await
        .expect("monitor loop did not exit");
        assert!(result.is_ok());

        assert!(fixture.try_status().is_none(), "status file left behind");
        let outputs = fixture.outputs();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].starts_with("tmp_"), "got {outputs:?}");
    }
}
