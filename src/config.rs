use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;

/// Server settings, read from `COURTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends before the background compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Facility catalog JSON; the stock campus facilities when unset.
    pub facilities_file: Option<PathBuf>,
    /// User directory JSON (id, name, role, token).
    pub users_file: Option<PathBuf>,
    /// Load the sample reservations at startup.
    pub seed_reservations: bool,
    pub engine: EngineConfig,
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset means default; set but
    /// unparsable is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();

        let engine = EngineConfig {
            open_hour: parsed(&lookup, "COURTBOOK_OPEN_HOUR")?.unwrap_or(defaults.open_hour),
            close_hour: parsed(&lookup, "COURTBOOK_CLOSE_HOUR")?.unwrap_or(defaults.close_hour),
            max_attempts: parsed(&lookup, "COURTBOOK_MAX_RETRIES")?.unwrap_or(defaults.max_attempts),
            lock_wait: parsed(&lookup, "COURTBOOK_LOCK_WAIT_MS")?
                .map_or(defaults.lock_wait, Duration::from_millis),
            admission_timeout: parsed(&lookup, "COURTBOOK_ADMISSION_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .or(defaults.admission_timeout),
        };
        if engine.open_hour > engine.close_hour || engine.close_hour > 24 {
            return Err(ConfigError {
                var: "COURTBOOK_OPEN_HOUR",
                value: format!("{}..{}", engine.open_hour, engine.close_hour),
            });
        }

        Ok(Self {
            bind: lookup("COURTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "COURTBOOK_PORT")?.unwrap_or(5434),
            data_dir: lookup("COURTBOOK_DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            max_connections: parsed(&lookup, "COURTBOOK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "COURTBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed(&lookup, "COURTBOOK_METRICS_PORT")?,
            tls_cert: lookup("COURTBOOK_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("COURTBOOK_TLS_KEY").map(PathBuf::from),
            facilities_file: lookup("COURTBOOK_FACILITIES").map(PathBuf::from),
            users_file: lookup("COURTBOOK_USERS").map(PathBuf::from),
            seed_reservations: parsed(&lookup, "COURTBOOK_SEED_RESERVATIONS")?.unwrap_or(false),
            engine,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("courtbook.wal")
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]).unwrap();
        assert_eq!(c.port, 5434);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert!(c.metrics_port.is_none());
        assert!(!c.seed_reservations);
        assert_eq!(c.engine.max_attempts, 5);
        assert_eq!(c.wal_path(), PathBuf::from("./data/courtbook.wal"));
    }

    #[test]
    fn engine_tunables_are_read() {
        let c = config(&[
            ("COURTBOOK_OPEN_HOUR", "7"),
            ("COURTBOOK_CLOSE_HOUR", "23"),
            ("COURTBOOK_LOCK_WAIT_MS", "50"),
            ("COURTBOOK_ADMISSION_TIMEOUT_MS", "1500"),
            ("COURTBOOK_MAX_RETRIES", "3"),
            ("COURTBOOK_SEED_RESERVATIONS", "true"),
        ])
        .unwrap();
        assert_eq!((c.engine.open_hour, c.engine.close_hour), (7, 23));
        assert_eq!(c.engine.lock_wait, Duration::from_millis(50));
        assert_eq!(c.engine.admission_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(c.engine.max_attempts, 3);
        assert!(c.seed_reservations);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = config(&[("COURTBOOK_PORT", "eighty")]).unwrap_err();
        assert_eq!(err.var, "COURTBOOK_PORT");
        assert!(config(&[("COURTBOOK_OPEN_HOUR", "20"), ("COURTBOOK_CLOSE_HOUR", "8")]).is_err());
    }
}
