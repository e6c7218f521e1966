use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Client settings.
///
/// Loaded from built-in defaults, then an optional TOML file, then
/// `RSWARM_`-prefixed environment variables (`RSWARM_MAX_PEERS=80`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    // Networking
    pub listen_port_start: u16,
    pub listen_port_end: u16,
    pub max_peers: usize,

    // Disk
    pub download_dir: PathBuf,
    /// Directory for resume files. Defaults to next to the payload.
    pub state_dir: Option<PathBuf>,
    pub verify_on_resume: bool,

    // Choking
    pub max_active_peers: usize,
    pub max_optimistic_peers: usize,
    pub choke_interval_secs: u64,

    // Scheduling
    pub max_in_flight_pieces: usize,
    pub endgame_threshold: f64,
    pub endgame_interval_secs: u64,
    pub request_timeout_secs: u64,

    // Uploading
    pub max_queued_requests: usize,

    // Timings
    pub keepalive_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub tracker_timeout_secs: u64,
    pub tracker_retry_secs: u64,

    // Logging
    pub log_level: String,
    /// Directory for daily-rotated log files. Stdout only when unset.
    pub log_dir: Option<PathBuf>,
    pub max_log_files: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port_start: constants::DEFAULT_PORT_START,
            listen_port_end: constants::DEFAULT_PORT_END,
            max_peers: constants::MAX_PEERS,
            download_dir: PathBuf::from("downloads"),
            state_dir: None,
            verify_on_resume: false,
            max_active_peers: constants::MAX_ACTIVE_PEERS,
            max_optimistic_peers: constants::MAX_OPTIMISTIC_PEERS,
            choke_interval_secs: constants::CHOKE_INTERVAL.as_secs(),
            max_in_flight_pieces: constants::MAX_IN_FLIGHT_PIECES,
            endgame_threshold: constants::ENDGAME_THRESHOLD,
            endgame_interval_secs: constants::ENDGAME_INTERVAL.as_secs(),
            request_timeout_secs: constants::REQUEST_TIMEOUT.as_secs(),
            max_queued_requests: constants::MAX_QUEUED_REQUESTS,
            keepalive_interval_secs: constants::KEEPALIVE_INTERVAL.as_secs(),
            read_timeout_secs: constants::READ_TIMEOUT.as_secs(),
            connect_timeout_secs: constants::CONNECT_TIMEOUT.as_secs(),
            tracker_timeout_secs: constants::TRACKER_TIMEOUT.as_secs(),
            tracker_retry_secs: constants::TRACKER_RETRY.as_secs(),
            log_level: "info".to_string(),
            log_dir: None,
            max_log_files: 7,
        }
    }
}

impl Config {
    /// Loads and validates the configuration. A missing file is not an
    /// error; the defaults and environment still apply.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed("RSWARM_")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Config = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port_start == 0 || self.listen_port_start > self.listen_port_end {
            return Err(ConfigError::Invalid(format!(
                "empty listen port range {}..={}",
                self.listen_port_start, self.listen_port_end
            )));
        }
        if self.max_active_peers == 0 {
            return Err(ConfigError::Invalid("max_active_peers must be > 0".into()));
        }
        if self.max_in_flight_pieces == 0 {
            return Err(ConfigError::Invalid(
                "max_in_flight_pieces must be > 0".into(),
            ));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be > 0".into()));
        }
        if !(self.endgame_threshold > 0.0 && self.endgame_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "endgame_threshold {} outside (0, 1]",
                self.endgame_threshold
            )));
        }
        if self.log_dir.is_some() && self.max_log_files == 0 {
            return Err(ConfigError::Invalid("max_log_files must be > 0".into()));
        }
        if self.choke_interval_secs == 0 || self.keepalive_interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be > 0".into()));
        }
        Ok(())
    }

    /// Where the resume sidecar for `payload` lives.
    pub fn resume_path_for(&self, payload: &Path) -> PathBuf {
        let mut name = payload
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "payload".into());
        name.push(".resume");

        match &self.state_dir {
            Some(dir) => dir.join(name),
            None => payload.with_file_name(name),
        }
    }

    pub fn choke_interval(&self) -> Duration {
        Duration::from_secs(self.choke_interval_secs)
    }

    pub fn endgame_interval(&self) -> Duration {
        Duration::from_secs(self.endgame_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker_timeout_secs)
    }

    pub fn tracker_retry(&self) -> Duration {
        Duration::from_secs(self.tracker_retry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::{Format, Toml};
    use figment::Figment;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_port_start, 6881);
        assert_eq!(config.listen_port_end, 6889);
        assert_eq!(config.max_active_peers, 4);
        assert_eq!(config.max_optimistic_peers, 1);
        assert_eq!(config.max_in_flight_pieces, 25);
        assert_eq!(config.choke_interval(), Duration::from_secs(30));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_override() {
        let toml_str = r#"
            max_active_peers = 6
            endgame_threshold = 0.05
            state_dir = "/var/lib/rswarm"
        "#;

        let config = Config::from_figment(
            Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml_str)),
        )
        .unwrap();

        assert_eq!(config.max_active_peers, 6);
        assert_eq!(config.endgame_threshold, 0.05);
        assert_eq!(config.state_dir, Some(PathBuf::from("/var/lib/rswarm")));
        // untouched fields keep their defaults
        assert_eq!(config.max_in_flight_pieces, 25);
    }

    #[test]
    fn test_missing_fields_use_serde_default() {
        let config: Config = Figment::new()
            .merge(Toml::string("max_peers = 10"))
            .extract()
            .unwrap();
        assert_eq!(config.max_peers, 10);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_dir, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_threshold = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string("endgame_threshold = 1.5"));
        assert!(matches!(
            Config::from_figment(bad_threshold),
            Err(ConfigError::Invalid(_))
        ));

        let bad_ports = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string("listen_port_start = 7000\nlisten_port_end = 6999"));
        assert!(Config::from_figment(bad_ports).is_err());

        let no_log_files = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string("log_dir = \"/var/log/rswarm\"\nmax_log_files = 0"));
        assert!(Config::from_figment(no_log_files).is_err());

        let bad_type = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string("max_peers = \"many\""));
        assert!(matches!(
            Config::from_figment(bad_type),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn test_resume_path() {
        let mut config = Config::default();
        let payload = Path::new("/data/movie.iso");
        assert_eq!(
            config.resume_path_for(payload),
            PathBuf::from("/data/movie.iso.resume")
        );

        config.state_dir = Some(PathBuf::from("/state"));
        assert_eq!(
            config.resume_path_for(payload),
            PathBuf::from("/state/movie.iso.resume")
        );
    }
}
