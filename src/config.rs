use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from sessionrec.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub watch: WatchConfig,
    pub keywords: KeywordConfig,
    pub recorder: RecorderConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directory holding both watched files.
    pub dir: PathBuf,
    /// Primary log: connection keywords appear here.
    pub log_file: String,
    /// Secondary log: one tab-separated record per finished connection.
    pub incoming_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeywordConfig {
    pub connected: String,
    pub disconnected: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub program: String,
    pub fps: u32,
    pub bitrate: u64,
    pub video_device: String,
    pub offset_x: Option<i32>,
    pub offset_y: Option<i32>,
    pub video_size: Option<String>,
    pub scale: Option<String>,
    pub preset: String,
    pub extra_args: Vec<String>,
    /// Seconds to wait for a graceful stop before killing the recorder (0 = wait forever).
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub temp_prefix: String,
    pub extension: String,
    pub date_format: String,
    pub status_file: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: default_watch_dir(),
            log_file: "TeamViewer12_Logfile.log".to_string(),
            incoming_file: "Connections_incoming.txt".to_string(),
        }
    }
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            connected: "TeamViewerDesktop started".to_string(),
            disconnected: "RA: Stopping capturing thread".to_string(),
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            fps: 5,
            bitrate: 2_000_000,
            video_device: if cfg!(target_os = "macos") {
                "default".to_string()
            } else {
                "0.0".to_string()
            },
            offset_x: None,
            offset_y: None,
            video_size: None,
            scale: None,
            preset: "ultrafast".to_string(),
            extra_args: Vec::new(),
            stop_timeout_secs: 30,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            file_name: "${ct}-${dt}-${id}${name}.mp4".to_string(),
            temp_prefix: "tmp_".to_string(),
            extension: "mp4".to_string(),
            date_format: "YmdHis".to_string(),
            status_file: None,
        }
    }
}

/// Where the remote-desktop software writes its logs on this platform.
fn default_watch_dir() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("C:/Program Files (x86)/TeamViewer/")
    } else if cfg!(target_os = "macos") {
        expand_home(Path::new("~/Library/Logs/TeamViewer/"))
    } else {
        let user = std::env::var("USER").unwrap_or_default();
        PathBuf::from(format!("/var/log/teamviewer12/{user}/"))
    }
}

/// Expand a leading `~` to `$HOME`. Paths without one are returned unchanged.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Errors raised while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl MonitorConfig {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default().normalized());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: MonitorConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(config.normalized())
    }

    /// Expand `~` in every configured path.
    pub fn normalized(mut self) -> Self {
        self.watch.dir = expand_home(&self.watch.dir);
        self.output.dir = expand_home(&self.output.dir);
        self.output.status_file = self.output.status_file.map(|p| expand_home(&p));
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.watch.dir.join(&self.watch.log_file)
    }

    pub fn incoming_path(&self) -> PathBuf {
        self.watch.dir.join(&self.watch.incoming_file)
    }
}
