use presence_core::{
    DistanceThreshold, FaceGate, Role, WindowPolicy, DEFAULT_DISTANCE_THRESHOLD,
    LATE_GRACE_MINUTES, MAX_GRACE_MINUTES, MIN_FACE_CONFIDENCE, MIN_FACE_SIZE_PX,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus '{other}'")),
        }
    }
}

/// Daemon configuration: defaults, then an optional TOML file, then `PRESENCE_*` env vars.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Command line of the external embedding helper.
    pub extractor_command: String,
    /// Timeout in seconds for one descriptor extraction.
    pub extract_timeout_secs: u64,
    /// Euclidean distance threshold for a positive match.
    pub distance_threshold: f64,
    /// Minutes after session start during which arrivals are present.
    pub late_grace_minutes: i64,
    /// Minimum detector confidence for a usable face.
    pub min_face_confidence: f32,
    /// Minimum face box side in pixels.
    pub min_face_size_px: f32,
    /// Restrict matching to one role; both when unset.
    pub match_role: Option<Role>,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        Self {
            db_path: data_dir.join("attendance.db"),
            extractor_command: String::new(),
            extract_timeout_secs: 10,
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            late_grace_minutes: LATE_GRACE_MINUTES,
            min_face_confidence: MIN_FACE_CONFIDENCE,
            min_face_size_px: MIN_FACE_SIZE_PX,
            match_role: None,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load from `PRESENCE_CONFIG` (if set) and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("PRESENCE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PRESENCE_EXTRACTOR_COMMAND") {
            self.extractor_command = v;
        }
        self.extract_timeout_secs = env_parse("PRESENCE_EXTRACT_TIMEOUT_SECS", self.extract_timeout_secs);
        self.distance_threshold = env_parse("PRESENCE_DISTANCE_THRESHOLD", self.distance_threshold);
        self.late_grace_minutes = env_parse("PRESENCE_LATE_GRACE_MINUTES", self.late_grace_minutes);
        self.min_face_confidence = env_parse("PRESENCE_MIN_FACE_CONFIDENCE", self.min_face_confidence);
        self.min_face_size_px = env_parse("PRESENCE_MIN_FACE_SIZE_PX", self.min_face_size_px);
        if let Ok(v) = std::env::var("PRESENCE_MATCH_ROLE") {
            self.match_role = parse_match_role(&v)?;
        }
        self.bus = env_parse("PRESENCE_BUS", self.bus);
        Ok(())
    }

    /// Reject values the window policy would otherwise have to clamp.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0..=MAX_GRACE_MINUTES).contains(&self.late_grace_minutes) {
            return Err(ConfigError::Invalid {
                key: "late_grace_minutes",
                message: format!(
                    "{} is outside 0..={MAX_GRACE_MINUTES}",
                    self.late_grace_minutes
                ),
            });
        }
        Ok(())
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs.max(1))
    }

    pub fn threshold(&self) -> DistanceThreshold {
        DistanceThreshold::new(self.distance_threshold)
    }

    pub fn window_policy(&self) -> WindowPolicy {
        WindowPolicy::with_grace_minutes(self.late_grace_minutes)
    }

    pub fn face_gate(&self) -> FaceGate {
        FaceGate {
            min_confidence: self.min_face_confidence,
            min_size_px: self.min_face_size_px,
        }
    }
}

/// Empty means no restriction; anything else must name a role.
fn parse_match_role(value: &str) -> Result<Option<Role>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|message| ConfigError::Invalid {
            key: "PRESENCE_MATCH_ROLE",
            message,
        })
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
