/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM each post a `Shutdown` event. The first one
/// stops an active recording gracefully; a second one kills the recorder.
use crate::monitor::MonitorEvent;
use tokio::sync::mpsc;

/// Spawn a task that forwards shutdown signals to the monitor.
pub fn spawn_shutdown_listener(events: mpsc::UnboundedSender<MonitorEvent>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = wait_for_signal().await {
                tracing::error!(error = %e, "failed to listen for shutdown signals");
                return;
            }
            tracing::info!("shutdown signal received");
            if events.send(MonitorEvent::Shutdown).is_err() {
                return;
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
