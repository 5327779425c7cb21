//! Configuration module for peerwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Remote device session settings.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Bound on a single command round trip (default: 30s)
    pub command_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 22,
            username: String::new(),
            password: String::new(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Poll cadence and failure backoff.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub bgp_interval: Duration,
    pub interface_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            bgp_interval: Duration::from_secs(60),
            interface_interval: Duration::from_secs(60),
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(600),
        }
    }
}

/// Thresholds the diff engine uses to derive events.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub flap_window: Duration,
    /// Flapping fires once transitions inside the window exceed this count.
    pub flap_threshold: usize,
    /// Per-poll increase of errors (in + out) that counts as a breach.
    pub error_delta_threshold: u64,
    /// Per-poll increase of discards (in + out) that counts as a breach.
    pub discard_delta_threshold: u64,
    /// Upper bound on waiting for an entity's write lock.
    pub lock_timeout: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            flap_window: Duration::from_secs(300),
            flap_threshold: 3,
            error_delta_threshold: 100,
            discard_delta_threshold: 1000,
            lock_timeout: Duration::from_millis(2000),
        }
    }
}

/// User-facing alerting gates.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub bgp_down_enabled: bool,
    pub interface_down_enabled: bool,
    pub flapping_enabled: bool,
    /// Combined error/discard delta an error breach must exceed to become an alert.
    pub error_threshold: u64,
    /// Minimum gap between two alerts of the same type for the same source.
    pub cooldown: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            bgp_down_enabled: true,
            interface_down_enabled: true,
            flapping_enabled: true,
            error_threshold: 100,
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub history_days: i64,
    pub event_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            history_days: 30,
            event_days: 60,
        }
    }
}

/// Monitor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Path to the SQLite database file (default: "peerwatch.db")
    pub db_path: String,
    pub ssh: SshConfig,
    pub schedule: ScheduleConfig,
    pub detection: DetectionConfig,
    pub alerts: AlertConfig,
    pub retention: RetentionConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            db_path: "peerwatch.db".to_string(),
            ssh: SshConfig::default(),
            schedule: ScheduleConfig::default(),
            detection: DetectionConfig::default(),
            alerts: AlertConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional and prefixed with `PEERWATCH_`, e.g.
    /// `PEERWATCH_SSH_HOST`, `PEERWATCH_BGP_INTERVAL_SECS`,
    /// `PEERWATCH_ALERT_ERROR_THRESHOLD`. Values that fail to parse are
    /// reported and the default is kept.
    pub fn load() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let vars = Vars { lookup };

        if let Some(path) = vars.string("DB_PATH") {
            cfg.db_path = path;
        }

        if let Some(host) = vars.string("SSH_HOST") {
            cfg.ssh.host = host;
        }
        vars.parse("SSH_PORT", &mut cfg.ssh.port);
        if let Some(user) = vars.string("SSH_USER") {
            cfg.ssh.username = user;
        }
        if let Some(password) = vars.string("SSH_PASSWORD") {
            cfg.ssh.password = password;
        }
        vars.secs("COMMAND_TIMEOUT_SECS", &mut cfg.ssh.command_timeout);

        vars.secs("BGP_INTERVAL_SECS", &mut cfg.schedule.bgp_interval);
        vars.secs("INTERFACE_INTERVAL_SECS", &mut cfg.schedule.interface_interval);
        vars.secs("BACKOFF_BASE_SECS", &mut cfg.schedule.backoff_base);
        vars.secs("BACKOFF_MAX_SECS", &mut cfg.schedule.backoff_max);

        vars.secs("FLAP_WINDOW_SECS", &mut cfg.detection.flap_window);
        vars.parse("FLAP_THRESHOLD", &mut cfg.detection.flap_threshold);
        vars.parse("ERROR_DELTA_THRESHOLD", &mut cfg.detection.error_delta_threshold);
        vars.parse("DISCARD_DELTA_THRESHOLD", &mut cfg.detection.discard_delta_threshold);
        let mut lock_ms = cfg.detection.lock_timeout.as_millis() as u64;
        vars.parse("LOCK_TIMEOUT_MS", &mut lock_ms);
        cfg.detection.lock_timeout = Duration::from_millis(lock_ms);

        vars.parse("ALERT_BGP_DOWN_ENABLED", &mut cfg.alerts.bgp_down_enabled);
        vars.parse("ALERT_INTERFACE_DOWN_ENABLED", &mut cfg.alerts.interface_down_enabled);
        vars.parse("ALERT_FLAPPING_ENABLED", &mut cfg.alerts.flapping_enabled);
        vars.parse("ALERT_ERROR_THRESHOLD", &mut cfg.alerts.error_threshold);
        vars.secs("ALERT_COOLDOWN_SECS", &mut cfg.alerts.cooldown);

        vars.parse("HISTORY_RETENTION_DAYS", &mut cfg.retention.history_days);
        vars.parse("EVENT_RETENTION_DAYS", &mut cfg.retention.event_days);

        cfg.sanitize();
        cfg
    }

    /// Replace values that would stall the scheduler with their defaults.
    fn sanitize(&mut self) {
        let defaults = ScheduleConfig::default();
        if self.schedule.bgp_interval.is_zero() {
            self.schedule.bgp_interval = defaults.bgp_interval;
        }
        if self.schedule.interface_interval.is_zero() {
            self.schedule.interface_interval = defaults.interface_interval;
        }
        if self.schedule.backoff_max < self.schedule.backoff_base {
            self.schedule.backoff_max = self.schedule.backoff_base;
        }
        if self.ssh.command_timeout.is_zero() {
            self.ssh.command_timeout = SshConfig::default().command_timeout;
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("PEERWATCH_{}", name))
    }

    fn parse<T: FromStr>(&self, name: &str, target: &mut T) {
        if let Some(raw) = self.string(name) {
            match raw.trim().parse() {
                Ok(value) => *target = value,
                Err(_) => tracing::warn!("Ignoring invalid PEERWATCH_{}={:?}", name, raw),
            }
        }
    }

    fn secs(&self, name: &str, target: &mut Duration) {
        let mut secs = target.as_secs();
        self.parse(name, &mut secs);
        *target = Duration::from_secs(secs);
    }
}
