use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::state::{TransitionTable, UserId};

/// Size based rotation for the metrics log.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

/// Tunables of the monitoring engine.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Error count at which a user is reported; twice this blocks the user.
    pub anomaly_threshold: u64,
    /// Trailing window scanned for cyclic transitions.
    pub window: Duration,
    /// Capacity of the event ring buffer.
    pub max_events: usize,
    pub monitor_interval: Duration,
    pub retention_interval: Duration,
    pub block_duration: Duration,
    pub min_cycle_length: usize,
    /// Age after which events and anomalies are dropped.
    pub event_retention: Duration,
    /// Average latency above which a handler is reported as slow.
    pub slow_handler_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: 5,
            window: Duration::from_secs(3600),
            max_events: 10_000,
            monitor_interval: Duration::from_secs(60),
            retention_interval: Duration::from_secs(3600),
            block_duration: Duration::from_secs(300),
            min_cycle_length: 3,
            event_retention: Duration::from_secs(24 * 3600),
            slow_handler_ms: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub monitor: MonitorConfig,
    pub transitions: TransitionTable,
    pub metrics_dir: Option<PathBuf>,
    pub stats_dir: Option<PathBuf>,
    pub rotation: RotationConfig,
    pub admin_ids: Vec<UserId>,
    pub admin_webhook_url: Option<String>,
    pub admin_webhook_timeout_ms: u64,
    pub admin_tokens: Option<HashSet<String>>,
    pub report_inline_limit: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            anomaly_threshold: parse_optional_u64("STATEWARDEN_ANOMALY_THRESHOLD")?
                .unwrap_or(defaults.anomaly_threshold),
            window: parse_secs("STATEWARDEN_WINDOW_SECS")?.unwrap_or(defaults.window),
            max_events: parse_optional_u64("STATEWARDEN_MAX_EVENTS")?
                .map(|v| v as usize)
                .unwrap_or(defaults.max_events),
            monitor_interval: parse_secs("STATEWARDEN_MONITOR_INTERVAL_SECS")?
                .unwrap_or(defaults.monitor_interval),
            retention_interval: parse_secs("STATEWARDEN_RETENTION_INTERVAL_SECS")?
                .unwrap_or(defaults.retention_interval),
            block_duration: parse_secs("STATEWARDEN_BLOCK_DURATION_SECS")?
                .unwrap_or(defaults.block_duration),
            min_cycle_length: parse_optional_u64("STATEWARDEN_MIN_CYCLE_LENGTH")?
                .map(|v| v as usize)
                .unwrap_or(defaults.min_cycle_length),
            event_retention: parse_secs("STATEWARDEN_EVENT_RETENTION_SECS")?
                .unwrap_or(defaults.event_retention),
            slow_handler_ms: parse_optional_u64("STATEWARDEN_SLOW_HANDLER_MS")?
                .unwrap_or(defaults.slow_handler_ms),
        };
        validate(&monitor)?;

        let transitions = match env::var("STATEWARDEN_TRANSITIONS_FILE") {
            Ok(path) if !path.trim().is_empty() => {
                let content = fs::read_to_string(&path).with_context(|| {
                    format!(
                        "Failed to read STATEWARDEN_TRANSITIONS_FILE '{}': file unreadable",
                        path
                    )
                })?;
                serde_json::from_str::<TransitionTable>(&content).with_context(|| {
                    format!(
                        "Failed to parse STATEWARDEN_TRANSITIONS_FILE '{}': invalid JSON transition table",
                        path
                    )
                })?
            }
            _ => TransitionTable::default(),
        };

        let metrics_dir = parse_dir("STATEWARDEN_METRICS_DIR", "metrics");
        let stats_dir = parse_dir("STATEWARDEN_STATS_DIR", "stats");

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("METRICS_LOG_MAX_BYTES")?,
            keep: parse_optional_u64("METRICS_LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("METRICS_LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        let admin_ids = match env::var("STATEWARDEN_ADMIN_IDS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<UserId>()
                        .map_err(|_| anyhow!("STATEWARDEN_ADMIN_IDS entry '{}' is not a user id", s))
                })
                .collect::<Result<Vec<_>>>()?,
            Err(_) => Vec::new(),
        };

        let admin_webhook_url = env::var("STATEWARDEN_ADMIN_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let admin_webhook_timeout_ms =
            parse_optional_u64("STATEWARDEN_ADMIN_WEBHOOK_TIMEOUT_MS")?.unwrap_or(2000);

        let admin_tokens = env::var("STATEWARDEN_ADMIN_TOKENS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<HashSet<_>>()
            })
            .filter(|set: &HashSet<String>| !set.is_empty());

        let report_inline_limit =
            parse_optional_u64("STATEWARDEN_REPORT_INLINE_LIMIT")?.unwrap_or(4000) as usize;

        Ok(Self {
            monitor,
            transitions,
            metrics_dir,
            stats_dir,
            rotation,
            admin_ids,
            admin_webhook_url,
            admin_webhook_timeout_ms,
            admin_tokens,
            report_inline_limit,
        })
    }
}

fn validate(monitor: &MonitorConfig) -> Result<()> {
    if monitor.anomaly_threshold == 0 {
        bail!("STATEWARDEN_ANOMALY_THRESHOLD must be at least 1");
    }
    if monitor.max_events == 0 {
        bail!("STATEWARDEN_MAX_EVENTS must be at least 1");
    }
    if monitor.min_cycle_length == 0 {
        bail!("STATEWARDEN_MIN_CYCLE_LENGTH must be at least 1");
    }
    if monitor.monitor_interval.is_zero() || monitor.retention_interval.is_zero() {
        bail!("monitor and retention intervals must be at least one second");
    }
    Ok(())
}

/// Directory variables default to a relative path; an explicit empty value
/// disables the corresponding file output.
fn parse_dir(var: &str, default: &str) -> Option<PathBuf> {
    match env::var(var) {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => Some(PathBuf::from(value.trim())),
        Err(_) => Some(PathBuf::from(default)),
    }
}

fn parse_secs(var: &str) -> Result<Option<Duration>> {
    Ok(parse_optional_u64(var)?.map(Duration::from_secs))
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateId;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "STATEWARDEN_ANOMALY_THRESHOLD",
        "STATEWARDEN_WINDOW_SECS",
        "STATEWARDEN_MAX_EVENTS",
        "STATEWARDEN_MONITOR_INTERVAL_SECS",
        "STATEWARDEN_RETENTION_INTERVAL_SECS",
        "STATEWARDEN_BLOCK_DURATION_SECS",
        "STATEWARDEN_MIN_CYCLE_LENGTH",
        "STATEWARDEN_EVENT_RETENTION_SECS",
        "STATEWARDEN_SLOW_HANDLER_MS",
        "STATEWARDEN_TRANSITIONS_FILE",
        "STATEWARDEN_METRICS_DIR",
        "STATEWARDEN_STATS_DIR",
        "METRICS_LOG_MAX_BYTES",
        "METRICS_LOG_ROTATE_KEEP",
        "METRICS_LOG_ROTATE_COMPRESS",
        "STATEWARDEN_ADMIN_IDS",
        "STATEWARDEN_ADMIN_WEBHOOK_URL",
        "STATEWARDEN_ADMIN_WEBHOOK_TIMEOUT_MS",
        "STATEWARDEN_ADMIN_TOKENS",
        "STATEWARDEN_REPORT_INLINE_LIMIT",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.monitor.anomaly_threshold, 5);
        assert_eq!(cfg.monitor.window, Duration::from_secs(3600));
        assert_eq!(cfg.monitor.max_events, 10_000);
        assert_eq!(cfg.monitor.monitor_interval, Duration::from_secs(60));
        assert_eq!(cfg.monitor.retention_interval, Duration::from_secs(3600));
        assert_eq!(cfg.monitor.block_duration, Duration::from_secs(300));
        assert_eq!(cfg.monitor.min_cycle_length, 3);
        assert_eq!(cfg.metrics_dir, Some(PathBuf::from("metrics")));
        assert_eq!(cfg.stats_dir, Some(PathBuf::from("stats")));
        assert_eq!(cfg.rotation.keep, 1);
        assert!(cfg.admin_ids.is_empty());
        assert!(cfg.admin_tokens.is_none());
        assert_eq!(cfg.report_inline_limit, 4000);
        assert!(!cfg.transitions.is_restricted());
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let mut temp = NamedTempFile::new().unwrap();
        let table = serde_json::json!({
            "names": {"1": "CHOOSING_MODE"},
            "allowed": {"1": [2, 3]}
        });
        use std::io::Write;
        write!(temp, "{}", table).unwrap();

        std::env::set_var("STATEWARDEN_ANOMALY_THRESHOLD", "7");
        std::env::set_var("STATEWARDEN_WINDOW_SECS", "600");
        std::env::set_var("STATEWARDEN_MAX_EVENTS", "500");
        std::env::set_var("STATEWARDEN_MONITOR_INTERVAL_SECS", "5");
        std::env::set_var("STATEWARDEN_BLOCK_DURATION_SECS", "30");
        std::env::set_var("STATEWARDEN_MIN_CYCLE_LENGTH", "2");
        std::env::set_var("STATEWARDEN_TRANSITIONS_FILE", temp.path());
        std::env::set_var("STATEWARDEN_METRICS_DIR", "");
        std::env::set_var("STATEWARDEN_STATS_DIR", "/tmp/statewarden-stats");
        std::env::set_var("METRICS_LOG_MAX_BYTES", "1024");
        std::env::set_var("METRICS_LOG_ROTATE_KEEP", "3");
        std::env::set_var("METRICS_LOG_ROTATE_COMPRESS", "true");
        std::env::set_var("STATEWARDEN_ADMIN_IDS", "100, 200");
        std::env::set_var("STATEWARDEN_ADMIN_TOKENS", "a,b");
        std::env::set_var("STATEWARDEN_REPORT_INLINE_LIMIT", "128");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.monitor.anomaly_threshold, 7);
        assert_eq!(cfg.monitor.window, Duration::from_secs(600));
        assert_eq!(cfg.monitor.max_events, 500);
        assert_eq!(cfg.monitor.monitor_interval, Duration::from_secs(5));
        assert_eq!(cfg.monitor.block_duration, Duration::from_secs(30));
        assert_eq!(cfg.monitor.min_cycle_length, 2);
        assert!(cfg
            .transitions
            .is_valid_transition(Some(StateId(1)), StateId(3)));
        assert!(!cfg
            .transitions
            .is_valid_transition(Some(StateId(1)), StateId(4)));
        assert!(cfg.metrics_dir.is_none());
        assert_eq!(cfg.stats_dir, Some(PathBuf::from("/tmp/statewarden-stats")));
        assert_eq!(cfg.rotation.max_bytes, Some(1024));
        assert_eq!(cfg.rotation.keep, 3);
        assert!(cfg.rotation.compress);
        assert_eq!(cfg.admin_ids, vec![100, 200]);
        let tokens = cfg.admin_tokens.unwrap();
        assert!(tokens.contains("a") && tokens.contains("b"));
        assert_eq!(cfg.report_inline_limit, 128);

        clear_env();
    }

    #[test]
    fn rejects_invalid_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        std::env::set_var("STATEWARDEN_ANOMALY_THRESHOLD", "lots");
        assert!(AppConfig::from_env().is_err());
        std::env::set_var("STATEWARDEN_ANOMALY_THRESHOLD", "0");
        assert!(AppConfig::from_env().is_err());
        std::env::remove_var("STATEWARDEN_ANOMALY_THRESHOLD");

        std::env::set_var("STATEWARDEN_ADMIN_IDS", "1,not-a-number");
        assert!(AppConfig::from_env().is_err());
        std::env::remove_var("STATEWARDEN_ADMIN_IDS");

        std::env::set_var("METRICS_LOG_ROTATE_COMPRESS", "maybe");
        assert!(AppConfig::from_env().is_err());

        clear_env();
    }
}
