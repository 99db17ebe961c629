mod command;
mod config;
mod keywords;
mod monitor;
mod offset;
mod recorder;
mod session;
mod signals;
mod status;
mod tail;
mod template;
mod timefmt;
mod watchdog;

use clap::Parser;
use command::CaptureBackend;
use config::MonitorConfig;
use monitor::Monitor;
use recorder::ProcessRecorder;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Watch the remote-desktop logs and record every incoming session to a
/// video file named after the connection.
#[derive(Parser, Debug)]
#[command(name = "sessionrec", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "sessionrec.toml")]
    config: PathBuf,

    /// Directory containing the remote-desktop logs (overrides config)
    #[arg(long)]
    watch_dir: Option<PathBuf>,

    /// Directory recordings are written to (overrides config)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Recorder program (overrides config)
    #[arg(long)]
    ffmpeg: Option<String>,

    /// Capture frame rate (overrides config)
    #[arg(long)]
    fps: Option<u32>,

    /// Print resolved settings and the recorder command, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (-v: file deltas, -vv: delta contents and recorder output)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Apply command-line overrides on top of the file config.
    fn apply_overrides(&self, mut config: MonitorConfig) -> MonitorConfig {
        if let Some(dir) = &self.watch_dir {
            config.watch.dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output.dir = dir.clone();
        }
        if let Some(program) = &self.ffmpeg {
            config.recorder.program = program.clone();
        }
        if let Some(fps) = self.fps {
            config.recorder.fps = fps;
        }
        config.normalized()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::info!("sessionrec starting");
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match MonitorConfig::load(&cli.config) {
        Ok(c) => cli.apply_overrides(c),
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(?config, "resolved configuration");

    let backend = CaptureBackend::native();

    if cli.dry_run {
        print_dry_run(&config, backend);
        return ExitCode::SUCCESS;
    }

    let (events_tx, events_rx) = monitor::channel();
    let recorder_config = config.recorder.clone();
    let recorder = ProcessRecorder::new(
        config.recorder.program.clone(),
        move |output: &Path| command::build_args(&recorder_config, backend, output),
        events_tx.clone(),
    );
    signals::spawn_shutdown_listener(events_tx.clone());

    let monitor = Monitor::new(&config, recorder, events_tx, events_rx);
    match monitor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "monitor failed");
            ExitCode::FAILURE
        }
    }
}

fn print_dry_run(config: &MonitorConfig, backend: CaptureBackend) {
    let sample = config.output.dir.join(format!(
        "{}[{}].{}",
        config.output.temp_prefix, config.output.date_format, config.output.extension
    ));
    let args = command::build_args(&config.recorder, backend, &sample);

    println!("Dry run: configuration resolved, not watching.");
    println!("  log file:        {}", config.log_path().display());
    println!("  incoming file:   {}", config.incoming_path().display());
    println!("  connected:       {:?}", config.keywords.connected);
    println!("  disconnected:    {:?}", config.keywords.disconnected);
    println!("  output dir:      {}", config.output.dir.display());
    println!("  output template: {}", config.output.file_name);
    println!("  stop timeout:    {}s", config.recorder.stop_timeout_secs);
    println!("  recorder:        {} {}", config.recorder.program, args.join(" "));
}
