use crate::estimation::queue::DEFAULT_SERVING_SECONDS;
use crate::estimation::{DEFAULT_HISTORY_WINDOW_MINUTES, EngineSettings};
use crate::state::FacilityId;
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const DEFAULT_TIMEZONE: &str = "America/New_York";
pub const DEFAULT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_FEED_PATH: &str = "config/feed.json";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub app: AppSection,
    pub logging: LoggingSection,
    #[serde(default)]
    pub clock: Option<ClockSection>,
    #[serde(default)]
    pub schedule: Option<ScheduleSection>,
    #[serde(default)]
    pub queue: Option<QueueSection>,
    #[serde(default)]
    pub facilities: Option<FacilitiesSection>,
    #[serde(default)]
    pub feed: Option<FeedSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClockSection {
    /// IANA zone name used for dates, weekdays and feed timestamps
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleSection {
    /// Seconds between ticks (default: 300)
    pub interval_secs: Option<u64>,
    /// Bound on every feed or store call (default: 10)
    pub upstream_timeout_secs: Option<u64>,
    /// How far back each batch fetches swipe counts (default: 120)
    pub history_window_minutes: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueSection {
    pub default_serving_seconds: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FacilitiesSection {
    #[serde(default)]
    pub ids: Vec<FacilityId>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown timezone: {0}")]
    Timezone(String),
}

pub fn load_default() -> Result<Config, ConfigError> {
    load_from_path(DEFAULT_CONFIG_PATH)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    config.timezone()?;
    Ok(config)
}

impl Config {
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        let name = self
            .clock
            .as_ref()
            .and_then(|c| c.timezone.as_deref())
            .unwrap_or(DEFAULT_TIMEZONE);
        name.parse::<Tz>()
            .map_err(|_| ConfigError::Timezone(name.to_string()))
    }

    /// Returns the tick interval (default: 300 seconds)
    pub fn interval(&self) -> Duration {
        let secs = self
            .schedule
            .as_ref()
            .and_then(|s| s.interval_secs)
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        Duration::from_secs(secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        let secs = self
            .schedule
            .as_ref()
            .and_then(|s| s.upstream_timeout_secs)
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    pub fn history_window_minutes(&self) -> i64 {
        self.schedule
            .as_ref()
            .and_then(|s| s.history_window_minutes)
            .filter(|minutes| *minutes >= 0)
            .unwrap_or(DEFAULT_HISTORY_WINDOW_MINUTES)
    }

    pub fn default_serving_seconds(&self) -> f64 {
        self.queue
            .as_ref()
            .and_then(|q| q.default_serving_seconds)
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .unwrap_or(DEFAULT_SERVING_SECONDS)
    }

    /// Configured facility ids, or empty slice to update everything in the feed.
    pub fn facility_ids(&self) -> &[FacilityId] {
        self.facilities
            .as_ref()
            .map(|f| f.ids.as_slice())
            .unwrap_or(&[])
    }

    pub fn feed_path(&self) -> &Path {
        self.feed
            .as_ref()
            .and_then(|f| f.path.as_deref())
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or(Path::new(DEFAULT_FEED_PATH))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            facility_ids: self.facility_ids().to_vec(),
            io_timeout: self.upstream_timeout(),
            history_window_minutes: self.history_window_minutes(),
            default_serving_seconds: self.default_serving_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_config(name: &str, contents: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let path = std::env::temp_dir().join(format!("campus-density-{name}-{unique}.toml"));
        fs::write(&path, contents)?;
        Ok(path)
    }

    #[test]
    fn default_config_lists_facilities() -> Result<(), Box<dyn std::error::Error>> {
        let config = load_default()?;
        assert!(!config.facility_ids().is_empty());
        assert_eq!(config.interval(), Duration::from_secs(300));
        Ok(())
    }

    #[test]
    fn missing_sections_use_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_config(
            "minimal",
            r#"
[app]
name = "campus-density"

[logging]
level = "info"
"#,
        )?;

        let config = load_from_path(&path)?;
        let _ = fs::remove_file(&path);

        assert_eq!(config.timezone()?, chrono_tz::America::New_York);
        assert_eq!(config.interval(), Duration::from_secs(DEFAULT_INTERVAL_SECS));
        assert_eq!(config.upstream_timeout(), Duration::from_secs(10));
        assert_eq!(config.history_window_minutes(), 120);
        assert_eq!(config.default_serving_seconds(), 75.0);
        assert!(config.facility_ids().is_empty());
        assert_eq!(config.feed_path(), Path::new(DEFAULT_FEED_PATH));
        Ok(())
    }

    #[test]
    fn explicit_sections_override_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_config(
            "full",
            r#"
[app]
name = "campus-density"

[logging]
level = "debug"

[clock]
timezone = "America/Chicago"

[schedule]
interval_secs = 60
upstream_timeout_secs = 3
history_window_minutes = 45

[queue]
default_serving_seconds = 40.0

[facilities]
ids = ["Risley", "Okenshields"]

[feed]
path = "/tmp/feed.json"
"#,
        )?;

        let config = load_from_path(&path)?;
        let _ = fs::remove_file(&path);
        let settings = config.engine_settings();

        assert_eq!(config.timezone()?, chrono_tz::America::Chicago);
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(settings.io_timeout, Duration::from_secs(3));
        assert_eq!(settings.history_window_minutes, 45);
        assert_eq!(settings.default_serving_seconds, 40.0);
        assert_eq!(settings.facility_ids, vec!["Risley", "Okenshields"]);
        assert_eq!(config.feed_path(), Path::new("/tmp/feed.json"));
        Ok(())
    }

    #[test]
    fn unknown_timezone_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_config(
            "bad-tz",
            r#"
[app]
name = "campus-density"

[logging]
level = "info"

[clock]
timezone = "Mars/Olympus_Mons"
"#,
        )?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Timezone(_))));
        Ok(())
    }

    #[test]
    fn missing_config_file_returns_read_error() {
        let result = load_from_path("/nonexistent/campus-density.toml");
        assert!(matches!(result, Err(ConfigError::Read(_))));
    }

    #[test]
    fn invalid_toml_returns_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_config("invalid", "[app\nname = ")?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        Ok(())
    }
}
