//! Daemon configuration, loaded once at startup from a TOML file.
//!
//! Every section has defaults; the serial, social, push and mail sections are
//! optional and leave their channel disabled when absent.
//!
//! ```toml
//! [taps]
//! count = 3
//! low_volume_threshold = 1.0
//!
//! [serial]
//! port = "/dev/ttyACM0"
//!
//! [social]
//! bearer_token = "..."
//! admins = ["head_brewer"]
//!
//! [digest]
//! times = ["16:00"]
//! ```

use crate::scheduler::DigestSchedule;
use chrono::NaiveTime;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

#[derive(thiserror::Error, Debug)]
pub(crate) enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    pub(crate) taps: TapsConfig,
    pub(crate) state: StateConfig,
    pub(crate) serial: Option<SerialConfig>,
    pub(crate) social: Option<SocialConfig>,
    pub(crate) push: Option<PushConfig>,
    pub(crate) mail: Option<MailConfig>,
    pub(crate) digest: DigestConfig,
    pub(crate) engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct TapsConfig {
    pub(crate) count: u8,
    pub(crate) temperature_probes: usize,

    /// Flow meter pulses per volume unit, ~170.5 pulses/oz for the stock meters.
    pub(crate) pulses_per_unit: f64,

    /// Calibration units per reporting unit, 128 oz to the gallon.
    pub(crate) unit_divisor: f64,

    pub(crate) litres_per_unit: f64,

    /// Readings where no tap exceeds this many pulses are treated as line noise.
    pub(crate) noise_threshold: u32,

    pub(crate) low_volume_threshold: f64,
}

impl Default for TapsConfig {
    fn default() -> Self {
        Self {
            count: 3,
            temperature_probes: 1,
            pulses_per_unit: 170.5,
            unit_divisor: 128.0,
            litres_per_unit: 3.785_411_784,
            noise_threshold: 10,
            low_volume_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct StateConfig {
    /// Authoritative tap record.
    pub(crate) record: PathBuf,

    /// Dashboard copy of the record, with temperatures.
    pub(crate) projection: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            record: PathBuf::from("taps.toml"),
            projection: PathBuf::from("taps.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SerialConfig {
    pub(crate) port: String,

    #[serde(default = "default_baud")]
    pub(crate) baud: u32,
}

fn default_baud() -> u32 {
    9600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SocialConfig {
    #[serde(default = "default_social_api")]
    pub(crate) api_base: String,

    pub(crate) bearer_token: String,

    /// Stream filter, defaults to the command marker.
    #[serde(default)]
    pub(crate) search_term: Option<String>,

    #[serde(default = "default_command_marker")]
    pub(crate) command_marker: String,

    #[serde(default = "default_new_keg_hashtag")]
    pub(crate) new_keg_hashtag: String,

    #[serde(default)]
    pub(crate) admins: Vec<String>,

    #[serde(default = "default_queue_capacity")]
    pub(crate) queue_capacity: usize,
}

impl SocialConfig {
    pub(crate) fn search_term(&self) -> &str {
        self.search_term.as_deref().unwrap_or(&self.command_marker)
    }
}

fn default_social_api() -> String {
    "https://api.twitter.com".to_owned()
}

pub(crate) const DEFAULT_COMMAND_MARKER: &str = "#NUVATION_KEGBOT";
pub(crate) const DEFAULT_NEW_KEG_HASHTAG: &str = "#NuvationHasANewKeg";

fn default_command_marker() -> String {
    DEFAULT_COMMAND_MARKER.to_owned()
}

fn default_new_keg_hashtag() -> String {
    DEFAULT_NEW_KEG_HASHTAG.to_owned()
}

fn default_queue_capacity() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PushConfig {
    #[serde(default = "default_push_api")]
    pub(crate) api_base: String,

    pub(crate) access_token: String,

    #[serde(default)]
    pub(crate) channel_tag: Option<String>,
}

fn default_push_api() -> String {
    "https://api.pushbullet.com".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MailConfig {
    pub(crate) relay: String,

    #[serde(default = "default_smtp_port")]
    pub(crate) port: u16,

    pub(crate) from: String,
    pub(crate) to: Vec<String>,
}

fn default_smtp_port() -> u16 {
    25
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DigestConfig {
    /// Local wall clock times, `HH:MM`.
    pub(crate) times: Vec<String>,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            times: vec!["16:00".to_owned()],
        }
    }
}

impl DigestConfig {
    pub(crate) fn schedule(&self) -> Result<DigestSchedule, ConfigError> {
        self.times
            .iter()
            .map(|t| {
                NaiveTime::parse_from_str(t, "%H:%M")
                    .map_err(|_| ConfigError::Invalid(format!("digest time {t:?} is not HH:MM")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(DigestSchedule::new)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct EngineConfig {
    pub(crate) poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
        }
    }
}

impl EngineConfig {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    pub(crate) fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;

        contents.parse()
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));

        if self.taps.count == 0 {
            return invalid("taps.count must be at least 1");
        }
        if !(self.taps.pulses_per_unit > 0.0) {
            return invalid("taps.pulses_per_unit must be greater than 0");
        }
        if !(self.taps.unit_divisor > 0.0) {
            return invalid("taps.unit_divisor must be greater than 0");
        }
        if let Some(social) = &self.social {
            if social.queue_capacity == 0 {
                return invalid("social.queue_capacity must be at least 1");
            }
            if social.command_marker.trim().is_empty() {
                return invalid("social.command_marker must not be empty");
            }
        }
        if let Some(mail) = &self.mail {
            if mail.to.is_empty() {
                return invalid("mail.to must list at least one recipient");
            }
        }

        self.digest.schedule()?;

        Ok(())
    }
}
