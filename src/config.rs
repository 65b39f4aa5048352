//! Daemon configuration: a TOML file merged with CLI overrides.
//!
//! Grounded on the `hg4d-firmware` example's `Cli`/`RuntimeConfig::from_cli`
//! split — `Cli` is what `clap` parses from argv, `Config` is the resolved,
//! validated value the rest of the daemon depends on. A `--config` file
//! supplies the baseline; explicit CLI flags (host/port/watch-directory)
//! take priority over it.

use crate::session::event_trigger::TriggerRule;
use crate::session::jog::JogLoopConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("parsing config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
}

/// `cncd` command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "cncd")]
#[command(about = "Network-attached controller session daemon for desktop CNC machines")]
pub struct Cli {
    /// TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// TCP listen address.
    #[arg(long)]
    pub host: Option<String>,

    /// TCP listen port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory watched for droppable G-code jobs.
    #[arg(long, value_name = "DIR")]
    pub watch_directory: Option<PathBuf>,

    /// Keep streaming a job past a firmware `error:NN` reply.
    #[arg(long)]
    pub continue_on_error: bool,

    /// Log level passed to `tracing_subscriber::EnvFilter`.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JogSettings {
    #[serde(default = "default_dead_zone")]
    pub dead_zone: f64,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default)]
    pub invert_x: bool,
    #[serde(default)]
    pub invert_y: bool,
    #[serde(default)]
    pub invert_z: bool,
    #[serde(default = "default_max_feed_xy")]
    pub max_feed_x_mm_min: f64,
    #[serde(default = "default_max_feed_xy")]
    pub max_feed_y_mm_min: f64,
    #[serde(default = "default_max_feed_z")]
    pub max_feed_z_mm_min: f64,
    #[serde(default = "default_window_depth")]
    pub window_depth: usize,
    #[serde(default = "default_planner_blocks")]
    pub planner_blocks: u32,
}

fn default_dead_zone() -> f64 {
    0.08
}
fn default_sensitivity() -> f64 {
    1.0
}
fn default_max_feed_xy() -> f64 {
    3000.0
}
fn default_max_feed_z() -> f64 {
    1000.0
}
fn default_window_depth() -> usize {
    4
}
fn default_planner_blocks() -> u32 {
    15
}

impl Default for JogSettings {
    fn default() -> Self {
        JogSettings {
            dead_zone: default_dead_zone(),
            sensitivity: default_sensitivity(),
            invert_x: false,
            invert_y: false,
            invert_z: false,
            max_feed_x_mm_min: default_max_feed_xy(),
            max_feed_y_mm_min: default_max_feed_xy(),
            max_feed_z_mm_min: default_max_feed_z(),
            window_depth: default_window_depth(),
            planner_blocks: default_planner_blocks(),
        }
    }
}

impl From<JogSettings> for JogLoopConfig {
    fn from(s: JogSettings) -> Self {
        JogLoopConfig {
            dead_zone: s.dead_zone,
            sensitivity: s.sensitivity,
            invert_x: s.invert_x,
            invert_y: s.invert_y,
            invert_z: s.invert_z,
            max_feed_x_mm_min: s.max_feed_x_mm_min,
            max_feed_y_mm_min: s.max_feed_y_mm_min,
            max_feed_z_mm_min: s.max_feed_z_mm_min,
            // Acceleration is overwritten at runtime from the firmware's
            // own `$120`-`$122` settings once a session connects; these
            // are just sane pre-connect defaults.
            accel_x_mm_s2: 500.0,
            accel_y_mm_s2: 500.0,
            accel_z_mm_s2: 500.0,
            window_depth: s.window_depth,
            planner_blocks: s.planner_blocks,
        }
    }
}

/// The resolved daemon configuration, after merging a TOML file (if any)
/// with CLI overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub watch_directory: Option<PathBuf>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub jog: JogSettings,
    #[serde(default)]
    pub trigger_rules: Vec<TriggerRule>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8838
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_host(),
            port: default_port(),
            watch_directory: None,
            continue_on_error: false,
            jog: JogSettings::default(),
            trigger_rules: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Build the resolved config: start from the file at `cli.config` (or
    /// defaults if none given), then apply any CLI flags the user actually
    /// passed.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };

        if let Some(host) = &cli.host {
            config.host = host.clone();
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if cli.watch_directory.is_some() {
            config.watch_directory = cli.watch_directory.clone();
        }
        if cli.continue_on_error {
            config.continue_on_error = true;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_network_defaults() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8838);
        assert!(!config.continue_on_error);
    }

    #[test]
    fn cli_overrides_take_priority_over_defaults() {
        let cli = Cli {
            config: None,
            host: Some("0.0.0.0".to_string()),
            port: Some(9000),
            watch_directory: None,
            continue_on_error: true,
            log_level: "debug".to_string(),
        };
        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(config.continue_on_error);
    }

    #[test]
    fn jog_settings_convert_into_jog_loop_config() {
        let settings = JogSettings { sensitivity: 2.0, ..JogSettings::default() };
        let jog_config: JogLoopConfig = settings.into();
        assert_eq!(jog_config.sensitivity, 2.0);
        assert_eq!(jog_config.window_depth, 4);
        assert_eq!(jog_config.planner_blocks, 15);
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_text = "host = \"192.168.1.50\"\nport = 7777\n";
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.host, "192.168.1.50");
        assert_eq!(config.port, 7777);
        assert!(!config.continue_on_error);
    }
}
