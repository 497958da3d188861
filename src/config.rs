use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Ms;

const DAY_MS: Ms = 24 * 3_600_000;

/// Process configuration, read from `RESERVA_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    /// Force-release overdue claims during sweeps instead of only reporting them.
    pub auto_release_overdue: bool,
    pub engine: EngineConfig,
}

/// The part of the configuration the engine itself consumes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `due_at = claimed_at + loan_period_ms` for every new claim.
    pub loan_period_ms: Ms,
    /// Journal append attempts per commit before giving up.
    pub commit_attempts: u32,
    pub commit_backoff: Duration,
    /// Offset applied when turning a calendar date into a time window.
    pub utc_offset_minutes: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loan_period_ms: 14 * DAY_MS,
            commit_attempts: 3,
            commit_backoff: Duration::from_millis(20),
            utc_offset_minutes: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            auto_release_overdue: false,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup. Missing or unparseable values fall back
    /// to the defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
            var(name).and_then(|s| s.trim().parse().ok())
        }

        let defaults = Config::default();
        let engine_defaults = defaults.engine;

        let loan_period_ms = parse::<u32>(&var, "RESERVA_LOAN_PERIOD_DAYS")
            .map(|days| days as Ms * DAY_MS)
            .unwrap_or(engine_defaults.loan_period_ms);
        let utc_offset_minutes = parse::<i32>(&var, "RESERVA_UTC_OFFSET_MINUTES")
            .filter(|m| m.abs() < 24 * 60)
            .unwrap_or(engine_defaults.utc_offset_minutes);

        Self {
            data_dir: var("RESERVA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: parse(&var, "RESERVA_METRICS_PORT"),
            compact_threshold: parse(&var, "RESERVA_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: parse(&var, "RESERVA_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            auto_release_overdue: parse(&var, "RESERVA_AUTO_RELEASE_OVERDUE")
                .unwrap_or(defaults.auto_release_overdue),
            engine: EngineConfig {
                loan_period_ms,
                commit_attempts: parse(&var, "RESERVA_COMMIT_ATTEMPTS")
                    .filter(|n| *n > 0)
                    .unwrap_or(engine_defaults.commit_attempts),
                commit_backoff: engine_defaults.commit_backoff,
                utc_offset_minutes,
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reserva.wal")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.engine.loan_period_ms, 14 * DAY_MS);
        assert_eq!(cfg.engine.commit_attempts, 3);
        assert!(!cfg.auto_release_overdue);
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/reserva.wal"));
    }

    #[test]
    fn reads_every_variable() {
        let cfg = from_pairs(&[
            ("RESERVA_DATA_DIR", "/var/lib/reserva"),
            ("RESERVA_METRICS_PORT", "9100"),
            ("RESERVA_COMPACT_THRESHOLD", "50"),
            ("RESERVA_SWEEP_INTERVAL_SECS", "5"),
            ("RESERVA_AUTO_RELEASE_OVERDUE", "true"),
            ("RESERVA_LOAN_PERIOD_DAYS", " 7 "),
            ("RESERVA_COMMIT_ATTEMPTS", "5"),
            ("RESERVA_UTC_OFFSET_MINUTES", "-300"),
        ]);
        assert_eq!(cfg.wal_path(), PathBuf::from("/var/lib/reserva/reserva.wal"));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
        assert!(cfg.auto_release_overdue);
        assert_eq!(cfg.engine.loan_period_ms, 7 * DAY_MS);
        assert_eq!(cfg.engine.commit_attempts, 5);
        assert_eq!(cfg.engine.utc_offset_minutes, -300);
    }

    #[test]
    fn unparseable_values_fall_back_to_defaults() {
        let cfg = from_pairs(&[
            ("RESERVA_METRICS_PORT", "http"),
            ("RESERVA_COMPACT_THRESHOLD", "-1"),
            ("RESERVA_AUTO_RELEASE_OVERDUE", "yes"),
            ("RESERVA_LOAN_PERIOD_DAYS", "two weeks"),
        ]);
        let defaults = Config::default();
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.compact_threshold, defaults.compact_threshold);
        assert!(!cfg.auto_release_overdue);
        assert_eq!(cfg.engine.loan_period_ms, defaults.engine.loan_period_ms);
    }

    #[test]
    fn out_of_range_values_are_filtered() {
        let cfg = from_pairs(&[
            ("RESERVA_COMMIT_ATTEMPTS", "0"),
            ("RESERVA_SWEEP_INTERVAL_SECS", "0"),
            ("RESERVA_UTC_OFFSET_MINUTES", "1440"),
        ]);
        assert_eq!(cfg.engine.commit_attempts, 3);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.engine.utc_offset_minutes, 0);

        let cfg = from_pairs(&[("RESERVA_UTC_OFFSET_MINUTES", "-1439")]);
        assert_eq!(cfg.engine.utc_offset_minutes, -1439);
    }
}
