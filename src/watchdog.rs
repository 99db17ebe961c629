/// Stop-grace watchdog.
///
/// After a graceful stop is requested, the recorder gets `timeout` to exit.
/// When the timer fires, a `StopTimeout` event is posted; the monitor kills
/// the recorder if that session is still stopping.
use crate::monitor::MonitorEvent;
use crate::session::SessionId;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct StopWatchdog {
    timeout: Option<Duration>,
    pending: Option<JoinHandle<()>>,
}

impl StopWatchdog {
    /// A zero timeout disables the watchdog.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: (!timeout.is_zero()).then_some(timeout),
            pending: None,
        }
    }

    /// Start the timer for `session`, replacing any previous one.
    pub fn arm(&mut self, session: SessionId, events: &mpsc::UnboundedSender<MonitorEvent>) {
        let Some(timeout) = self.timeout else {
            return;
        };
        self.disarm();
        tracing::debug!(session, timeout_secs = timeout.as_secs(), "stop watchdog armed");

        let events = events.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(MonitorEvent::StopTimeout { session });
        }));
    }

    pub fn disarm(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.pending.as_ref().is_some_and(|t| !t.is_finished())
    }
}
