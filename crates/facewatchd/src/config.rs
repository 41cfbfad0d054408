use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default recognition service endpoint.
const DEFAULT_RECOGNIZER_URL: &str = "http://127.0.0.1:8080/v1/recognize";

/// Daemon configuration.
///
/// Built from defaults, then the optional config file, then `FACEWATCH_*`
/// environment variables; later layers win.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Recognition service endpoint.
    pub recognizer_url: String,
    /// Bearer token for the recognition service, if it requires one.
    pub api_key: Option<String>,
    /// Live analysis tick period in milliseconds.
    pub poll_interval_ms: u64,
    /// Timeout in seconds for one recognition call.
    pub request_timeout_secs: u64,
    /// Batch pipeline worker count.
    pub batch_workers: usize,
    /// Directory recordings are written to.
    pub recordings_dir: PathBuf,
    /// Frames per second captured while recording.
    pub recording_fps: u32,
}

/// On-disk config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    db_path: Option<PathBuf>,
    recognizer_url: Option<String>,
    api_key: Option<String>,
    poll_interval_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    batch_workers: Option<usize>,
    recordings_dir: Option<PathBuf>,
    recording_fps: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Config {
    /// Load configuration from the default file location and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("FACEWATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"));
        let file = match std::fs::read_to_string(&path) {
            Ok(text) => Some(parse_file(&path, &text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        if file.is_some() {
            tracing::info!(path = %path.display(), "loaded config file");
        }
        Ok(Self::layered(file, |key| std::env::var(key).ok()))
    }

    /// Built-in defaults.
    pub fn defaults() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            db_path: data_dir.join("facewatch.db"),
            recognizer_url: DEFAULT_RECOGNIZER_URL.to_string(),
            api_key: None,
            poll_interval_ms: 1500,
            request_timeout_secs: 30,
            batch_workers: facewatch_core::batch::DEFAULT_BATCH_WORKERS,
            recordings_dir: videos_dir(),
            recording_fps: 10,
        }
    }

    fn layered(file: Option<FileConfig>, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::defaults();
        if let Some(file) = file {
            config.apply_file(file);
        }
        config.apply_env(env);
        config.sanitize();
        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        let FileConfig {
            camera_device,
            db_path,
            recognizer_url,
            api_key,
            poll_interval_ms,
            request_timeout_secs,
            batch_workers,
            recordings_dir,
            recording_fps,
        } = file;
        set(&mut self.camera_device, camera_device);
        set(&mut self.db_path, db_path);
        set(&mut self.recognizer_url, recognizer_url);
        if api_key.is_some() {
            self.api_key = api_key;
        }
        set(&mut self.poll_interval_ms, poll_interval_ms);
        set(&mut self.request_timeout_secs, request_timeout_secs);
        set(&mut self.batch_workers, batch_workers);
        set(&mut self.recordings_dir, recordings_dir);
        set(&mut self.recording_fps, recording_fps);
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        set(&mut self.camera_device, env("FACEWATCH_CAMERA_DEVICE"));
        set(&mut self.db_path, env("FACEWATCH_DB_PATH").map(PathBuf::from));
        set(&mut self.recognizer_url, env("FACEWATCH_RECOGNIZER_URL"));
        if let Some(key) = env("FACEWATCH_API_KEY") {
            self.api_key = Some(key);
        }
        set(&mut self.poll_interval_ms, parsed(&env, "FACEWATCH_POLL_INTERVAL_MS"));
        set(
            &mut self.request_timeout_secs,
            parsed(&env, "FACEWATCH_REQUEST_TIMEOUT_SECS"),
        );
        set(&mut self.batch_workers, parsed(&env, "FACEWATCH_BATCH_WORKERS"));
        set(
            &mut self.recordings_dir,
            env("FACEWATCH_RECORDINGS_DIR").map(PathBuf::from),
        );
        set(&mut self.recording_fps, parsed(&env, "FACEWATCH_RECORDING_FPS"));
    }

    /// Replace zero values that would stall the daemon.
    fn sanitize(&mut self) {
        let defaults = Self::defaults();
        if self.poll_interval_ms == 0 {
            tracing::warn!("poll interval of 0 ms is invalid; using default");
            self.poll_interval_ms = defaults.poll_interval_ms;
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = defaults.request_timeout_secs;
        }
        if self.batch_workers == 0 {
            self.batch_workers = defaults.batch_workers;
        }
        if self.recording_fps == 0 {
            self.recording_fps = defaults.recording_fps;
        }
        if self.api_key.as_deref().is_some_and(str::is_empty) {
            self.api_key = None;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Interval between recorded frames.
    pub fn recording_frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.recording_fps.max(1)))
    }
}

fn parse_file(path: &Path, text: &str) -> Result<FileConfig, ConfigError> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("facewatch")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("facewatch")
}

/// `$XDG_VIDEOS_DIR`, else the entry in `user-dirs.dirs`, else `~/Videos`.
fn videos_dir() -> PathBuf {
    let home = home_dir();
    std::env::var("XDG_VIDEOS_DIR")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            let dirs = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| home.join(".config"))
                .join("user-dirs.dirs");
            let text = std::fs::read_to_string(dirs).ok()?;
            user_dir(&text, "XDG_VIDEOS_DIR", &home)
        })
        .unwrap_or_else(|| home.join("Videos"))
        .join("facewatch")
}

/// Look up `key` in a `user-dirs.dirs` file (`KEY="$HOME/dir"` lines).
fn user_dir(text: &str, key: &str, home: &Path) -> Option<PathBuf> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .and_then(|(_, value)| {
            let value = value.trim().trim_matches('"');
            if let Some(rest) = value.strip_prefix("$HOME") {
                Some(home.join(rest.trim_start_matches('/')))
            } else if value.starts_with('/') {
                Some(PathBuf::from(value))
            } else {
                None
            }
        })
}
