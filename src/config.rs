//! Configuration loader and validator for the release delivery pipeline.
use crate::orchestrator::{BreakerSettings, DeliveryConfig};
use crate::planner::{PlannerConfig, WindowTime};
use crate::resilience::RetryPolicy;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub delivery: Delivery,
    pub retry: Retry,
    pub breakers: Breakers,
    pub mail: Mail,
    pub calendar: Calendar,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub cycle_interval_secs: u64,
    pub retention_days: i64,
}

/// Batch planning and window settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    /// Fixed UTC offset the window times are evaluated in, e.g. "+09:00".
    pub timezone_offset: String,
    pub window_tolerance_minutes: i64,
    pub plan_max_age_hours: i64,
    pub two_window_threshold: usize,
    pub three_window_threshold: usize,
    pub windows_single: Vec<String>,
    pub windows_double: Vec<String>,
    pub windows_triple: Vec<String>,
}

/// Retry-with-backoff settings shared by all dependencies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Retry {
    pub max_attempts: u32,
    pub backoff_base_secs: f64,
    pub max_backoff_secs: f64,
}

/// Per-dependency circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Breakers {
    pub mail: Breaker,
    pub calendar: Breaker,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Breaker {
    pub failure_threshold: u32,
    pub open_secs: u64,
}

/// Mail API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub endpoint: String,
    pub token: String,
    pub from: String,
    pub to: String,
}

/// Calendar API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Calendar {
    pub endpoint: String,
    pub token: String,
    pub calendar_id: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Builds the orchestrator's delivery settings from the validated config.
    pub fn delivery_config(&self) -> Result<DeliveryConfig, ConfigError> {
        let timezone: FixedOffset = self
            .delivery
            .timezone_offset
            .parse()
            .map_err(|_| ConfigError::Invalid("delivery.timezone_offset must be like +09:00"))?;

        let windows = |raw: &[String], err: &'static str| -> Result<Vec<WindowTime>, ConfigError> {
            raw.iter()
                .map(|s| WindowTime::parse(s).ok_or(ConfigError::Invalid(err)))
                .collect()
        };

        Ok(DeliveryConfig {
            planner: PlannerConfig {
                two_window_threshold: self.delivery.two_window_threshold,
                three_window_threshold: self.delivery.three_window_threshold,
                windows_single: windows(
                    &self.delivery.windows_single,
                    "delivery.windows_single entries must be HH:MM",
                )?,
                windows_double: windows(
                    &self.delivery.windows_double,
                    "delivery.windows_double entries must be HH:MM",
                )?,
                windows_triple: windows(
                    &self.delivery.windows_triple,
                    "delivery.windows_triple entries must be HH:MM",
                )?,
            },
            timezone,
            window_tolerance: chrono::Duration::minutes(self.delivery.window_tolerance_minutes),
            plan_max_age: chrono::Duration::hours(self.delivery.plan_max_age_hours),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                backoff_base_secs: self.retry.backoff_base_secs,
                max_backoff_secs: self.retry.max_backoff_secs,
            },
            mail_breaker: BreakerSettings {
                failure_threshold: self.breakers.mail.failure_threshold,
                open_duration: std::time::Duration::from_secs(self.breakers.mail.open_secs),
            },
            calendar_breaker: BreakerSettings {
                failure_threshold: self.breakers.calendar.failure_threshold,
                open_duration: std::time::Duration::from_secs(self.breakers.calendar.open_secs),
            },
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.cycle_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.cycle_interval_secs must be > 0"));
    }
    if cfg.app.retention_days <= 0 {
        return Err(ConfigError::Invalid("app.retention_days must be > 0"));
    }

    if cfg.delivery.window_tolerance_minutes <= 0 {
        return Err(ConfigError::Invalid(
            "delivery.window_tolerance_minutes must be > 0",
        ));
    }
    if cfg.delivery.plan_max_age_hours <= 0 {
        return Err(ConfigError::Invalid("delivery.plan_max_age_hours must be > 0"));
    }
    if cfg.delivery.two_window_threshold == 0
        || cfg.delivery.two_window_threshold >= cfg.delivery.three_window_threshold
    {
        return Err(ConfigError::Invalid(
            "delivery thresholds must satisfy 0 < two_window < three_window",
        ));
    }
    if cfg.delivery.windows_single.len() != 1 {
        return Err(ConfigError::Invalid("delivery.windows_single must list 1 time"));
    }
    if cfg.delivery.windows_double.len() != 2 {
        return Err(ConfigError::Invalid("delivery.windows_double must list 2 times"));
    }
    if cfg.delivery.windows_triple.len() != 3 {
        return Err(ConfigError::Invalid("delivery.windows_triple must list 3 times"));
    }

    if cfg.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be > 0"));
    }
    if cfg.retry.backoff_base_secs < 0.0 || cfg.retry.max_backoff_secs < 0.0 {
        return Err(ConfigError::Invalid("retry backoff values must be >= 0"));
    }

    if cfg.breakers.mail.failure_threshold == 0 || cfg.breakers.calendar.failure_threshold == 0 {
        return Err(ConfigError::Invalid("breaker failure_threshold must be > 0"));
    }

    if cfg.mail.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.endpoint must be non-empty"));
    }
    if cfg.mail.token.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.token must be non-empty"));
    }
    if cfg.mail.from.trim().is_empty() || cfg.mail.to.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.from and mail.to must be non-empty"));
    }

    if cfg.calendar.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("calendar.endpoint must be non-empty"));
    }
    if cfg.calendar.token.trim().is_empty() {
        return Err(ConfigError::Invalid("calendar.token must be non-empty"));
    }
    if cfg.calendar.calendar_id.trim().is_empty() {
        return Err(ConfigError::Invalid("calendar.calendar_id must be non-empty"));
    }

    // Surface unparseable offsets/window times at load time.
    cfg.delivery_config()?;

    Ok(())
}

/// Example YAML configuration, also used as the test fixture.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  cycle_interval_secs: 300
  retention_days: 90

delivery:
  timezone_offset: "+09:00"
  window_tolerance_minutes: 5
  plan_max_age_hours: 24
  two_window_threshold: 100
  three_window_threshold: 200
  windows_single: ["08:00"]
  windows_double: ["08:00", "20:00"]
  windows_triple: ["08:00", "13:00", "20:00"]

retry:
  max_attempts: 3
  backoff_base_secs: 2.0
  max_backoff_secs: 60.0

breakers:
  mail:
    failure_threshold: 5
    open_secs: 300
  calendar:
    failure_threshold: 5
    open_secs: 300

mail:
  endpoint: "https://mail.example.com/v1/"
  token: "YOUR_MAIL_API_TOKEN"
  from: "herald@example.com"
  to: "you@example.com"

calendar:
  endpoint: "https://calendar.example.com/api/"
  token: "YOUR_CALENDAR_API_TOKEN"
  calendar_id: "releases"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();

        let delivery = cfg.delivery_config().unwrap();
        assert_eq!(delivery.timezone.local_minus_utc(), 9 * 3600);
        assert_eq!(delivery.planner.windows_triple.len(), 3);
        assert_eq!(delivery.retry.max_attempts, 3);
    }

    #[test]
    fn invalid_timezone_offset() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.delivery.timezone_offset = "Tokyo".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("timezone_offset")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_window_lists() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.delivery.windows_triple = vec!["08:00".into(), "20:00".into()];
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.delivery.windows_single = vec!["25:99".into()];
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_thresholds() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.delivery.two_window_threshold = 300;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("threshold")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_mail_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.mail.token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("mail.token")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.calendar.calendar_id = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.cycle_interval_secs, 300);
        assert_eq!(cfg.delivery.two_window_threshold, 100);
    }
}
