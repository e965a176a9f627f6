use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// tfrec needs the -D output, the parsers rely on the hexdump lines
pub const DEFAULT_CMD: &str = "tfrec -D";

fn cmd_default() -> String { return DEFAULT_CMD.to_string() }
fn log_unknown_sensors_default() -> bool { return false }
fn log_unmapped_sensors_default() -> bool { return false }
fn sensor_map_default() -> BTreeMap<String, String> { return BTreeMap::new() }
fn poll_timeout_secs_default() -> u64 { return 3 }
fn cycle_limit_secs_default() -> u64 { return 10 }

pub fn deltas_default() -> BTreeMap<String, String> {
    let mut deltas = BTreeMap::new();
    deltas.insert("rain".to_string(), "rain_total".to_string());
    deltas.insert("strikes".to_string(), "strikes_total".to_string());
    return deltas;
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read the config on {0}")]
    NotFound(String),
    #[error("Unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TfrcConfig {
    /// How to invoke tfrec
    #[serde(default="cmd_default")]
    pub cmd: String,
    /// Prepended to PATH of the child
    pub path: Option<String>,
    /// Replaces LD_LIBRARY_PATH of the child
    pub ld_library_path: Option<String>,
    #[serde(default="log_unknown_sensors_default")]
    pub log_unknown_sensors: bool,
    #[serde(default="log_unmapped_sensors_default")]
    pub log_unmapped_sensors: bool,
    /// output field -> <observation>.<hardware_id>.<packet_type>
    #[serde(default="sensor_map_default")]
    pub sensor_map: BTreeMap<String, String>,
    /// delta field -> cumulative counter field
    #[serde(default="deltas_default")]
    pub deltas: BTreeMap<String, String>,
    #[serde(default="poll_timeout_secs_default")]
    pub poll_timeout_secs: u64,
    #[serde(default="cycle_limit_secs_default")]
    pub cycle_limit_secs: u64,
}

impl Default for TfrcConfig {
    fn default() -> Self {
        return TfrcConfig {
            cmd: cmd_default(),
            path: None,
            ld_library_path: None,
            log_unknown_sensors: log_unknown_sensors_default(),
            log_unmapped_sensors: log_unmapped_sensors_default(),
            sensor_map: sensor_map_default(),
            deltas: deltas_default(),
            poll_timeout_secs: poll_timeout_secs_default(),
            cycle_limit_secs: cycle_limit_secs_default(),
        };
    }
}

impl TfrcConfig {
    /// Loads the given file, or the first of `config/tfrc.yaml` and `tfrc.yaml`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let candidates: Vec<PathBuf> = match path {
            Some(p) => vec![p.to_path_buf()],
            None => vec![PathBuf::from("config/tfrc.yaml"), PathBuf::from("tfrc.yaml")],
        };

        for candidate in &candidates {
            let mut file = match File::open(candidate) {
                Ok(f) => f,
                Err(e) => {
                    debug!("Config {} not usable: {e}", candidate.display());
                    continue;
                }
            };

            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let c = Self::from_yaml(&contents)?;
            info!("Config loaded from {}", candidate.display());
            return Ok(c);
        }

        let tried: Vec<String> = candidates.iter().map(|c| c.display().to_string()).collect();
        Err(ConfigError::NotFound(tried.join(" or ")))
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        /* An empty document is a valid config with all defaults */
        if contents.trim().is_empty() {
            return Ok(TfrcConfig::default());
        }
        let c: TfrcConfig = serde_yml::from_str(contents)?;
        c.validate()?;
        Ok(c)
    }

    /// The framer never waits with zero durations, so they are refused
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout_secs == 0 {
            return Err(ConfigError::Invalid("poll_timeout_secs must be at least 1".to_string()));
        }
        if self.cycle_limit_secs == 0 {
            return Err(ConfigError::Invalid("cycle_limit_secs must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn cycle_limit(&self) -> Duration {
        Duration::from_secs(self.cycle_limit_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let c = TfrcConfig::from_yaml("").unwrap();
        assert_eq!(c.cmd, "tfrec -D");
        assert!(!c.log_unknown_sensors);
        assert!(!c.log_unmapped_sensors);
        assert!(c.sensor_map.is_empty());
        assert_eq!(c.deltas.get("rain"), Some(&"rain_total".to_string()));
        assert_eq!(c.deltas.get("strikes"), Some(&"strikes_total".to_string()));
        assert_eq!(c.poll_timeout(), Duration::from_secs(3));
        assert_eq!(c.cycle_limit(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_sensor_map() {
        let yaml = r#"
cmd: "tfrec -D -T 2b"
log_unknown_sensors: true
sensor_map:
  temp3: temperature.65B0.TFA_1Packet
  humidity3: humidity.65B0.TFA_1Packet
deltas:
  rain: rain_total
"#;
        let c = TfrcConfig::from_yaml(yaml).unwrap();
        assert_eq!(c.cmd, "tfrec -D -T 2b");
        assert!(c.log_unknown_sensors);
        assert_eq!(c.sensor_map.len(), 2);
        assert_eq!(c.sensor_map["temp3"], "temperature.65B0.TFA_1Packet");
        /* A given deltas table replaces the default entirely */
        assert_eq!(c.deltas.len(), 1);
    }

    #[test]
    fn test_zero_durations_rejected() {
        assert!(matches!(TfrcConfig::from_yaml("cycle_limit_secs: 0"), Err(ConfigError::Invalid(_))));
        assert!(matches!(TfrcConfig::from_yaml("poll_timeout_secs: 0"), Err(ConfigError::Invalid(_))));

        let c = TfrcConfig::from_yaml("poll_timeout_secs: 1\ncycle_limit_secs: 2").unwrap();
        assert_eq!(c.poll_timeout(), Duration::from_secs(1));
        assert_eq!(c.cycle_limit(), Duration::from_secs(2));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "path: /opt/tfrec/bin").unwrap();
        writeln!(file, "ld_library_path: /opt/tfrec/lib").unwrap();

        let c = TfrcConfig::load(Some(file.path())).unwrap();
        assert_eq!(c.path.as_deref(), Some("/opt/tfrec/bin"));
        assert_eq!(c.ld_library_path.as_deref(), Some("/opt/tfrec/lib"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(TfrcConfig::load(Some(&missing)), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_broken_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sensor_map: [unterminated").unwrap();
        assert!(matches!(TfrcConfig::load(Some(file.path())), Err(ConfigError::Parse(_))));
    }
}
