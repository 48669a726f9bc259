use anyhow::{Context, Result};
use serde::Deserialize;
use spbms_lib::{client::Timing, transport::Bitrate};
use std::path::Path;
use std::time::Duration;

use crate::commandline::CliArgs;

/// Connection defaults read from YAML. Every key is optional, values given
/// on the command line win.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub device: Option<String>,
    /// kbit/s, e.g. `250`
    pub bitrate: Option<Bitrate>,
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub delay: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub frame_delay: Option<Duration>,
    pub retries: Option<u32>,
}

impl ConnectionConfig {
    pub const DEFAULT_CONFIG_FILE: &str = "spbms.yaml";

    pub fn load(config_file_path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// Loads `path`, or the default file if it exists.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(Self::DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM3")
    } else {
        String::from("/dev/ttyACM0")
    }
}

/// Connection settings after merging command line, config file and defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub device: String,
    pub bitrate: Bitrate,
    pub timing: Timing,
}

impl Connection {
    pub fn new(args: &CliArgs, config: ConnectionConfig) -> Self {
        let defaults = Timing::default();
        Self {
            device: args
                .device
                .clone()
                .or(config.device)
                .unwrap_or_else(default_device_name),
            bitrate: args.bitrate.or(config.bitrate).unwrap_or_default(),
            timing: Timing {
                timeout: args.timeout.or(config.timeout).unwrap_or(defaults.timeout),
                retries: args.retries.or(config.retries).unwrap_or(defaults.retries),
                frame_delay: args
                    .frame_delay
                    .or(config.frame_delay)
                    .unwrap_or(defaults.frame_delay),
                delay: args.delay.or(config.delay).unwrap_or(defaults.delay),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn yaml_keys() {
        let config: ConnectionConfig = serde_yaml::from_str(
            "device: /dev/ttyACM1\nbitrate: 500\ntimeout: 2s\nframe_delay: 3ms\n",
        )
        .unwrap();
        assert_eq!(config.device.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(config.bitrate, Some(Bitrate::K500));
        assert_eq!(config.timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.frame_delay, Some(Duration::from_millis(3)));
        assert_eq!(config.retries, None);
        assert!(serde_yaml::from_str::<ConnectionConfig>("bitrate: 300\n").is_err());
    }

    #[test]
    fn command_line_wins() {
        let config = ConnectionConfig {
            device: Some("/dev/ttyACM1".to_string()),
            bitrate: Some(Bitrate::K125),
            retries: Some(7),
            ..Default::default()
        };
        let args = CliArgs::parse_from(["spbms", "--bitrate", "1M", "--timeout", "250ms", "status"]);
        let connection = Connection::new(&args, config);
        assert_eq!(connection.device, "/dev/ttyACM1");
        assert_eq!(connection.bitrate, Bitrate::M1);
        assert_eq!(connection.timing.timeout, Duration::from_millis(250));
        assert_eq!(connection.timing.retries, 7);
        assert_eq!(connection.timing.delay, Timing::default().delay);
    }

    #[test]
    fn config_file_round_trip() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("spbms.yaml");
        std::fs::write(&path, "retries: 20\ndelay: 50ms\n").unwrap();
        let config = ConnectionConfig::resolve(Some(&path)).unwrap();
        assert_eq!(config.retries, Some(20));
        assert_eq!(config.delay, Some(Duration::from_millis(50)));
        assert!(ConnectionConfig::resolve(Some(&directory.path().join("missing.yaml"))).is_err());
    }
}
