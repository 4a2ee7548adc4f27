//! Configuration loader and validator for the reminder service.
use crate::model::ChannelKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
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

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub scheduler: SchedulerSettings,
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub channels: BTreeMap<ChannelKind, ChannelConfig>,
    #[serde(default)]
    pub templates: Templates,
    #[serde(default)]
    pub appointments: Appointments,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Tick loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick_interval_secs: u64,
    /// Upper bound for the storage-failure backoff applied to the next tick.
    pub max_backoff_secs: u64,
    /// Maximum number of due events pulled per batch.
    pub batch_size: u32,
    /// How long a claimed event stays reserved for one delivery.
    pub claim_lease_secs: u64,
    /// Terminal events older than this are purged. 0 disables the sweep.
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default = "default_retention_sweep_secs")]
    pub retention_sweep_secs: u64,
}

fn default_retention_sweep_secs() -> u64 {
    3600
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs as i64)
    }
}

/// What `stop()` does with deliveries still in flight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Wait for in-flight deliveries (bounded by `drain_timeout_secs`).
    #[default]
    Drain,
    /// Stop in-flight deliveries at their next suspension point.
    Abandon,
}

/// Delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Attempts per event, counting the first one.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Deliveries running in parallel.
    pub concurrency: usize,
    pub send_timeout_secs: u64,
    #[serde(default)]
    pub on_stop: StopPolicy,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_drain_timeout_secs() -> u64 {
    10
}

impl DispatchSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Delay before attempt `attempt + 1`: base doubled per attempt, capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(1_u64 << shift)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Longest a single delivery run can hold its claim: every attempt hits
    /// the send timeout and every retry waits its full delay.
    pub fn worst_case_run(&self) -> Duration {
        let sends = self.send_timeout().saturating_mul(self.max_attempts);
        (1..self.max_attempts)
            .map(|attempt| self.retry_delay(attempt))
            .fold(sends, Duration::saturating_add)
    }
}

/// Outbound gateway for one channel kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// HTTP gateway receiving a JSON notification per send.
    Webhook {
        url: String,
        #[serde(default)]
        token: Option<String>,
    },
    /// Writes notifications to the log only.
    Log,
}

/// Message templates with `{param}` placeholders filled from the event payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Templates {
    pub appointment: String,
    pub check_in: String,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            appointment: "Reminder: your appointment with {doctor_name} is on {slot_date} at {slot_time}.".into(),
            check_in: "Time for your mood check-in. How are you feeling today?".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Appointments {
    /// Minutes before the appointment start at which a reminder is due.
    pub lead_minutes: Vec<u32>,
}

impl Default for Appointments {
    fn default() -> Self {
        Self {
            lead_minutes: vec![24 * 60, 60],
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn default_database_url(&self) -> String {
        format!(
            "sqlite://{}/reminders.db",
            self.app.data_dir.trim_end_matches('/')
        )
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
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let s = &cfg.scheduler;
    if s.tick_interval_secs == 0 {
        return Err(ConfigError::Invalid("scheduler.tick_interval_secs must be > 0"));
    }
    if s.max_backoff_secs < s.tick_interval_secs {
        return Err(ConfigError::Invalid(
            "scheduler.max_backoff_secs must be >= scheduler.tick_interval_secs",
        ));
    }
    if s.batch_size == 0 {
        return Err(ConfigError::Invalid("scheduler.batch_size must be > 0"));
    }
    if s.claim_lease_secs == 0 {
        return Err(ConfigError::Invalid("scheduler.claim_lease_secs must be > 0"));
    }
    if s.retention_days > 0 && s.retention_sweep_secs == 0 {
        return Err(ConfigError::Invalid("scheduler.retention_sweep_secs must be > 0"));
    }

    let d = &cfg.dispatch;
    if d.max_attempts == 0 {
        return Err(ConfigError::Invalid("dispatch.max_attempts must be >= 1"));
    }
    if d.concurrency == 0 {
        return Err(ConfigError::Invalid("dispatch.concurrency must be >= 1"));
    }
    if d.send_timeout_secs == 0 {
        return Err(ConfigError::Invalid("dispatch.send_timeout_secs must be > 0"));
    }
    if d.retry_max_delay_ms < d.retry_base_delay_ms {
        return Err(ConfigError::Invalid(
            "dispatch.retry_max_delay_ms must be >= dispatch.retry_base_delay_ms",
        ));
    }

    if Duration::from_secs(s.claim_lease_secs) < d.worst_case_run() {
        return Err(ConfigError::Invalid(
            "scheduler.claim_lease_secs must cover a full retry run of dispatch attempts",
        ));
    }

    for channel in cfg.channels.values() {
        if let ChannelConfig::Webhook { url, .. } = channel {
            if reqwest::Url::parse(url).is_err() {
                return Err(ConfigError::Invalid("channels.*.url must be an absolute URL"));
            }
        }
    }

    if cfg.templates.appointment.trim().is_empty() {
        return Err(ConfigError::Invalid("templates.appointment must be non-empty"));
    }
    if cfg.templates.check_in.trim().is_empty() {
        return Err(ConfigError::Invalid("templates.check_in must be non-empty"));
    }
    if cfg.appointments.lead_minutes.is_empty() {
        return Err(ConfigError::Invalid("appointments.lead_minutes must not be empty"));
    }

    Ok(())
}

/// Returns the example YAML shipped with the service.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

scheduler:
  tick_interval_secs: 30
  max_backoff_secs: 300
  batch_size: 200
  claim_lease_secs: 600
  retention_days: 30
  retention_sweep_secs: 3600

dispatch:
  max_attempts: 3
  retry_base_delay_ms: 2000
  retry_max_delay_ms: 60000
  concurrency: 8
  send_timeout_secs: 15
  on_stop: drain
  drain_timeout_secs: 10

channels:
  email:
    type: webhook
    url: "https://gateway.example.com/v1/email"
    token: "YOUR_GATEWAY_TOKEN"
  sms:
    type: webhook
    url: "https://gateway.example.com/v1/sms"
  push:
    type: log

templates:
  appointment: "Reminder: your appointment with {doctor_name} is on {slot_date} at {slot_time}."
  check_in: "Hi {name}, time for your mood check-in. How are you feeling today?"

appointments:
  lead_minutes: [1440, 60]
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.dispatch.on_stop, StopPolicy::Drain);
        assert_eq!(cfg.channels.len(), 3);
        assert_eq!(cfg.channels.get(&ChannelKind::Push), Some(&ChannelConfig::Log));
        assert_eq!(cfg.appointments.lead_minutes, vec![1440, 60]);
    }

    #[test]
    fn optional_sections_default() {
        let yaml = r#"app:
  data_dir: "./data"
scheduler:
  tick_interval_secs: 5
  max_backoff_secs: 60
  batch_size: 10
  claim_lease_secs: 60
dispatch:
  max_attempts: 2
  retry_base_delay_ms: 10
  retry_max_delay_ms: 100
  concurrency: 1
  send_timeout_secs: 5
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert!(cfg.channels.is_empty());
        assert_eq!(cfg.templates, Templates::default());
        assert_eq!(cfg.scheduler.retention_days, 0);
        assert_eq!(cfg.dispatch.drain_timeout_secs, 10);
    }

    #[test]
    fn invalid_tick_interval() {
        let mut cfg = example_cfg();
        cfg.scheduler.tick_interval_secs = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("tick_interval_secs")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_backoff_below_interval() {
        let mut cfg = example_cfg();
        cfg.scheduler.max_backoff_secs = 10;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("max_backoff_secs")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_dispatch_limits() {
        let mut cfg = example_cfg();
        cfg.dispatch.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.dispatch.concurrency = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.dispatch.retry_max_delay_ms = 1;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn lease_must_outlast_retry_run() {
        let cfg = example_cfg();
        // 3 sends of 15s plus waits of 2s and 4s.
        assert_eq!(cfg.dispatch.worst_case_run(), Duration::from_secs(51));

        let mut cfg = example_cfg();
        cfg.scheduler.claim_lease_secs = 50;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("claim_lease_secs")),
            _ => panic!("wrong error"),
        }

        cfg.scheduler.claim_lease_secs = 51;
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_webhook_url() {
        let mut cfg = example_cfg();
        cfg.channels.insert(
            ChannelKind::Sms,
            ChannelConfig::Webhook {
                url: "not a url".into(),
                token: None,
            },
        );
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let d = example_cfg().dispatch;
        assert_eq!(d.retry_delay(1), Duration::from_millis(2000));
        assert_eq!(d.retry_delay(2), Duration::from_millis(4000));
        assert_eq!(d.retry_delay(3), Duration::from_millis(8000));
        assert_eq!(d.retry_delay(10), Duration::from_millis(60000));
        assert_eq!(d.retry_delay(u32::MAX), Duration::from_millis(60000));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(cfg.default_database_url().ends_with("/data/reminders.db"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.scheduler.tick_interval_secs, 30);
        assert_eq!(cfg.dispatch.max_attempts, 3);
    }
}
