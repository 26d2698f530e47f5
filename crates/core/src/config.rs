//! Recognised orchestrator options.
//!
//! Every field has a serde default so a partial TOML file (or none at all)
//! yields a usable configuration.

use crate::error::{OrchestratorError, Result};
use crate::retry::RetryPolicy;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub signal: SignalConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub time: TimeConfig,
}

/// Task dispatch wiring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_local_url")]
    pub url: String,

    #[serde(default = "default_local_url")]
    pub result_backend: String,

    /// Size of the worker pool consuming dispatched tasks
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Retention of completed task results in seconds, 0 = never expire
    #[serde(default)]
    pub result_expires: u64,
}

fn default_local_url() -> String {
    "local://".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_local_url(),
            result_backend: default_local_url(),
            worker_concurrency: default_worker_concurrency(),
            result_expires: 0,
        }
    }
}

impl BrokerConfig {
    pub fn is_local(&self) -> bool {
        self.url.starts_with("local://")
    }

    /// With no expiry the scheduler forgets results once every successor has consumed them
    pub fn forget_consumed_results(&self) -> bool {
        self.result_expires == 0
    }
}

/// Coordination channel connection and cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_signal_port")]
    pub port: u16,

    #[serde(default)]
    pub database: u32,

    /// Seconds between signal drains
    #[serde(default = "default_polling_time")]
    pub polling_time: f64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_signal_port() -> u16 {
    6379
}

fn default_polling_time() -> f64 {
    0.5
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_signal_port(),
            database: 0,
            polling_time: default_polling_time(),
        }
    }
}

impl SignalConfig {
    pub fn polling_interval(&self) -> Duration {
        seconds(self.polling_time)
    }
}

/// Which state store backend to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Redb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_store_port")]
    pub port: u16,

    /// Database name; the file name for the embedded backend
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redb
}

fn default_store_port() -> u16 {
    27017
}

fn default_database() -> String {
    "dagrun.redb".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            host: default_host(),
            port: default_store_port(),
            database: default_database(),
        }
    }
}

/// Loop cadence, lease timing and dispatch deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Seconds between workflow-level polls
    #[serde(default = "default_polling_time")]
    pub workflow_polling_time: f64,

    /// Seconds between DAG-level polls
    #[serde(default = "default_polling_time")]
    pub dag_polling_time: f64,

    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: i64,

    #[serde(default = "default_lease_renew_interval_secs")]
    pub lease_renew_interval_secs: i64,

    /// Deadline for a dispatched task to report back, unless the task overrides it
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,

    #[serde(default = "default_max_concurrent_instances")]
    pub max_concurrent_instances: usize,
}

fn default_lease_ttl_secs() -> i64 {
    30
}

fn default_lease_renew_interval_secs() -> i64 {
    10
}

fn default_dispatch_timeout_secs() -> u64 {
    3_600
}

fn default_max_concurrent_instances() -> usize {
    64
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workflow_polling_time: default_polling_time(),
            dag_polling_time: default_polling_time(),
            lease_ttl_secs: default_lease_ttl_secs(),
            lease_renew_interval_secs: default_lease_renew_interval_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            max_concurrent_instances: default_max_concurrent_instances(),
        }
    }
}

impl RunnerConfig {
    pub fn workflow_polling_interval(&self) -> Duration {
        seconds(self.workflow_polling_time)
    }

    pub fn dag_polling_interval(&self) -> Duration {
        seconds(self.dag_polling_time)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs)
    }

    pub fn lease_renew_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_renew_interval_secs)
    }
}

/// Timestamp normalisation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    /// `UTC` or a fixed offset such as `+02:00`
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_enable_utc")]
    pub enable_utc: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enable_utc() -> bool {
    true
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            enable_utc: default_enable_utc(),
        }
    }
}

impl TimeConfig {
    /// Offset used when rendering timestamps; records are always stored in UTC
    pub fn offset(&self) -> Result<FixedOffset> {
        if self.enable_utc {
            return Ok(utc_offset());
        }
        parse_offset(&self.timezone)
    }

    pub fn render(&self, ts: DateTime<Utc>) -> Result<String> {
        Ok(ts.with_timezone(&self.offset()?).to_rfc3339())
    }
}

impl OrchestratorConfig {
    /// Reject values the loops cannot work with
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("runner.workflow_polling_time", self.runner.workflow_polling_time),
            ("runner.dag_polling_time", self.runner.dag_polling_time),
            ("signal.polling_time", self.signal.polling_time),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(OrchestratorError::Config(format!(
                    "{} must be a finite, non-negative number of seconds",
                    name
                )));
            }
        }
        if self.runner.lease_ttl_secs <= 0 {
            return Err(OrchestratorError::Config(
                "lease_ttl_secs must be positive".to_string(),
            ));
        }
        if self.runner.lease_renew_interval_secs >= self.runner.lease_ttl_secs {
            return Err(OrchestratorError::Config(
                "lease_renew_interval_secs must be shorter than lease_ttl_secs".to_string(),
            ));
        }
        // a renewal is attempted on the first DAG poll after it falls due
        let renewal_slack =
            (self.runner.lease_ttl_secs - self.runner.lease_renew_interval_secs) as f64;
        if self.runner.dag_polling_time >= renewal_slack {
            return Err(OrchestratorError::Config(format!(
                "dag_polling_time must be shorter than lease_ttl_secs - lease_renew_interval_secs ({}s)",
                renewal_slack
            )));
        }
        if self.broker.worker_concurrency == 0 {
            return Err(OrchestratorError::Config(
                "worker_concurrency must be at least 1".to_string(),
            ));
        }
        self.time.offset()?;
        Ok(())
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

fn parse_offset(tz: &str) -> Result<FixedOffset> {
    let tz = tz.trim();
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return Ok(utc_offset());
    }

    let invalid = || OrchestratorError::Config(format!("unsupported timezone: {}", tz));

    let (sign, rest) = match tz.chars().next() {
        Some('+') => (1, &tz[1..]),
        Some('-') => (-1, &tz[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert!(config.broker.is_local());
        assert!(config.broker.forget_consumed_results());
        assert_eq!(config.runner.dag_polling_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_renew_interval_must_be_shorter_than_ttl() {
        let mut config = OrchestratorConfig::default();
        config.runner.lease_renew_interval_secs = 30;
        assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn test_non_finite_polling_times_rejected() {
        for field in 0..3 {
            let mut config = OrchestratorConfig::default();
            match field {
                0 => config.runner.workflow_polling_time = f64::INFINITY,
                1 => config.runner.dag_polling_time = f64::NAN,
                _ => config.signal.polling_time = f64::INFINITY,
            }
            assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));
        }

        let mut config = OrchestratorConfig::default();
        config.runner.dag_polling_time = f64::INFINITY;
        config.signal.polling_time = -1.0;
        assert_eq!(config.runner.dag_polling_interval(), Duration::ZERO);
        assert_eq!(config.signal.polling_interval(), Duration::ZERO);
    }

    #[test]
    fn test_dag_poll_must_fit_inside_renewal_slack() {
        let mut config = OrchestratorConfig::default();
        config.runner.dag_polling_time = 20.0;
        assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));

        config.runner.dag_polling_time = 19.5;
        config.validate().unwrap();
    }

    #[test]
    fn test_timezone_rendering() {
        let ts = DateTime::parse_from_rfc3339("2026-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let utc = TimeConfig::default();
        assert_eq!(utc.render(ts).unwrap(), "2026-01-01T10:00:00+00:00");

        let local = TimeConfig {
            timezone: "+02:00".to_string(),
            enable_utc: false,
        };
        assert_eq!(local.render(ts).unwrap(), "2026-01-01T12:00:00+02:00");

        let bad = TimeConfig {
            timezone: "Mars/Olympus".to_string(),
            enable_utc: false,
        };
        assert!(bad.render(ts).is_err());
    }
}
