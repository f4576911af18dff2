//! # Configuration Management
//!
//! This module handles loading and parsing configuration from the
//! deck-config.toml file: WiFi credentials, weather API settings, timing
//! constants for the cooperative scheduler, and the input-to-HID binding
//! tables.
//!
//! Unlike purely cosmetic options, credentials are load-bearing: there is no
//! corrective code path for a missing SSID or API key at runtime, so
//! validation failures here are fatal and the binary must exit before the
//! scheduler loop starts.

use crate::Tick;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// All of these are startup-fatal: the scheduler loop is never entered with
/// an invalid configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("config read: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML or has the wrong shape
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),

    /// WiFi SSID or password is empty
    #[error("wifi credentials missing (set [wifi] ssid and password)")]
    MissingWifiCredentials,

    /// Weather polling enabled but no API key configured
    #[error("weather api key missing (set [weather] api_key or enabled = false)")]
    MissingApiKey,

    /// Unrecognized weather units string
    #[error("invalid weather units {0:?} (expected \"metric\" or \"imperial\")")]
    InvalidUnits(String),

    /// Binding references a key name missing from the keycode table
    #[error("unknown key name {0:?} in input binding")]
    UnknownKeyName(String),

    /// Binding references an unrecognized consumer-control name
    #[error("unknown control name {0:?} in input binding")]
    UnknownControlName(String),

    /// Chord binding exceeds the six-key boot report
    #[error("chord has more than six non-modifier keys")]
    ChordTooLong,

    /// A timing value that must be nonzero was zero
    #[error("invalid timing value: {0}")]
    InvalidTiming(&'static str),
}

/// Application configuration loaded from deck-config.toml
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// WiFi association credentials
    pub wifi: WifiConfig,
    /// Weather service settings
    pub weather: WeatherConfig,
    /// Time sync settings
    pub time: TimeConfig,
    /// Scheduler and task timing constants
    pub timing: TimingConfig,
    /// Input devices and their HID bindings
    pub input: InputConfig,
    /// Outbound HID transport settings
    pub hid: HidConfig,
}

/// WiFi credentials and the reachability probe the host link uses.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WifiConfig {
    /// Network SSID (required, no default)
    pub ssid: String,
    /// Network password (required, no default)
    pub password: String,
    /// TCP endpoint probed by the host connectivity transport
    pub probe_addr: String,
}

/// Weather service configuration (OpenWeather current-weather API).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// Master switch; when false no weather task is registered
    pub enabled: bool,
    /// OpenWeather API key (required when enabled)
    pub api_key: String,
    /// City query string (e.g. "London")
    pub city: String,
    /// "metric" (°C) or "imperial" (°F)
    pub units: String,
}

/// Time source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeConfig {
    /// SNTP server hostname
    pub ntp_server: String,
    /// Fixed UTC offset applied when formatting local time, in minutes.
    /// Stands in for the original firmware's TIMEZONE/DST pair.
    pub utc_offset_minutes: i32,
}

/// Timing constants for the cooperative scheduler and its tasks.
///
/// Everything is expressed in wall units here and converted to tick counts
/// via [`TimingConfig::ticks_from_ms`]. Defaults come from the original
/// firmware's constants (50 ms loop pace tightened to 20 ms, 20 ms debounce,
/// 3 s/60 s WiFi backoff, daily NTP sync with 5 min retries, 30 min weather
/// polls).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Scheduler tick length in milliseconds
    pub tick_ms: u64,
    /// Button debounce window in milliseconds
    pub debounce_ms: u64,
    /// Connectivity backoff base delay in seconds
    pub backoff_base_s: u64,
    /// Connectivity backoff cap in seconds
    pub backoff_cap_s: u64,
    /// Max wait for an in-flight connect attempt in seconds
    pub connect_timeout_s: u64,
    /// Normal interval between time syncs in seconds
    pub sync_interval_s: u64,
    /// Base retry delay after a failed sync in seconds
    pub sync_retry_base_s: u64,
    /// Clock staleness threshold in seconds
    pub clock_stale_after_s: u64,
    /// Max wait for an in-flight time query in seconds
    pub sync_timeout_s: u64,
    /// Normal interval between weather fetches in seconds
    pub weather_poll_s: u64,
    /// Base retry delay after a failed fetch in seconds
    pub weather_retry_base_s: u64,
    /// Weather staleness threshold in seconds
    pub weather_stale_after_s: u64,
    /// Max wait for an in-flight weather fetch in seconds
    pub weather_timeout_s: u64,
    /// Display refresh period in milliseconds
    pub display_refresh_ms: u64,
    /// Minimum spacing between HID reports to the same control, milliseconds
    pub hid_min_spacing_ms: u64,
    /// Maximum pending HID reports before oldest are dropped
    pub hid_queue_depth: usize,
}

impl TimingConfig {
    /// Convert a millisecond interval to whole ticks, never rounding to zero.
    pub fn ticks_from_ms(&self, ms: u64) -> Tick {
        (ms / self.tick_ms).max(1)
    }

    /// Convert a second interval to whole ticks, never rounding to zero.
    pub fn ticks_from_secs(&self, secs: u64) -> Tick {
        self.ticks_from_ms(secs.saturating_mul(1000))
    }
}

/// Input devices and their HID bindings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InputConfig {
    /// Push buttons, in raw-sample order
    pub buttons: Vec<ButtonBinding>,
    /// Rotary encoders, in raw-sample order
    pub encoders: Vec<EncoderBinding>,
}

/// A push button and the HID action bound to it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ButtonBinding {
    /// Human-readable name used in logs
    pub name: String,
    /// Action emitted on press (and released on release)
    pub action: ActionSpec,
}

/// A rotary encoder and the HID actions bound to each direction.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderBinding {
    /// Human-readable name used in logs
    pub name: String,
    /// Action pulsed once per clockwise detent
    pub clockwise: ActionSpec,
    /// Action pulsed once per counter-clockwise detent
    pub counter_clockwise: ActionSpec,
}

/// Declarative HID action: either a named consumer-control usage or a
/// keyboard chord given as named keys, mirroring the original firmware's
/// string-keyed shortcut table.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ActionSpec {
    /// Consumer-control usage by name, e.g. `control = "play_pause"`
    Control { control: String },
    /// Keyboard chord by key names, e.g. `keys = ["LEFT_CONTROL", "M"]`
    Chord { keys: Vec<String> },
}

/// Outbound HID transport settings (Linux USB gadget device nodes).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HidConfig {
    /// Keyboard report device, empty to log reports instead of sending
    pub keyboard_dev: String,
    /// Consumer-control report device, empty to log reports instead
    pub consumer_dev: String,
}

impl Default for WifiConfig {
    fn default() -> Self {
        WifiConfig {
            ssid: String::new(),
            password: String::new(),
            probe_addr: "1.1.1.1:53".to_string(),
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        WeatherConfig {
            enabled: true,
            api_key: String::new(),
            city: "London".to_string(),
            units: "metric".to_string(),
        }
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        TimeConfig {
            ntp_server: "pool.ntp.org".to_string(),
            utc_offset_minutes: 0,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            tick_ms: 20,
            debounce_ms: 20,
            backoff_base_s: 3,
            backoff_cap_s: 60,
            connect_timeout_s: 15,
            sync_interval_s: 24 * 60 * 60,
            sync_retry_base_s: 5 * 60,
            clock_stale_after_s: 48 * 60 * 60,
            sync_timeout_s: 10,
            weather_poll_s: 30 * 60,
            weather_retry_base_s: 60,
            weather_stale_after_s: 2 * 60 * 60,
            weather_timeout_s: 15,
            display_refresh_ms: 500,
            hid_min_spacing_ms: 50,
            hid_queue_depth: 16,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        // The original control surface: mic-mute chord, skip/back media
        // buttons, encoder push for play/pause, rotation for volume.
        InputConfig {
            buttons: vec![
                ButtonBinding {
                    name: "mic".to_string(),
                    action: ActionSpec::Chord {
                        keys: vec![
                            "LEFT_CONTROL".to_string(),
                            "LEFT_SHIFT".to_string(),
                            "M".to_string(),
                        ],
                    },
                },
                ButtonBinding {
                    name: "skip".to_string(),
                    action: ActionSpec::Control {
                        control: "scan_next".to_string(),
                    },
                },
                ButtonBinding {
                    name: "back".to_string(),
                    action: ActionSpec::Control {
                        control: "scan_prev".to_string(),
                    },
                },
                ButtonBinding {
                    name: "encoder_sw".to_string(),
                    action: ActionSpec::Control {
                        control: "play_pause".to_string(),
                    },
                },
            ],
            encoders: vec![EncoderBinding {
                name: "volume".to_string(),
                clockwise: ActionSpec::Control {
                    control: "volume_up".to_string(),
                },
                counter_clockwise: ActionSpec::Control {
                    control: "volume_down".to_string(),
                },
            }],
        }
    }
}

impl Default for HidConfig {
    fn default() -> Self {
        HidConfig {
            keyboard_dev: String::new(),
            consumer_dev: String::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            wifi: WifiConfig::default(),
            weather: WeatherConfig::default(),
            time: TimeConfig::default(),
            timing: TimingConfig::default(),
            input: InputConfig::default(),
            hid: HidConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from deck-config.toml in the working
    /// directory.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("deck-config.toml")
    }

    /// Load and validate configuration from the given path.
    ///
    /// Any failure here is startup-fatal by design: there is no sensible
    /// degraded mode for missing credentials or a zero-length tick.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde can express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wifi.ssid.is_empty() || self.wifi.password.is_empty() {
            return Err(ConfigError::MissingWifiCredentials);
        }
        if self.weather.enabled && self.weather.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        match self.weather.units.as_str() {
            "metric" | "imperial" => {}
            other => return Err(ConfigError::InvalidUnits(other.to_string())),
        }
        if self.timing.tick_ms == 0 {
            return Err(ConfigError::InvalidTiming("tick_ms must be nonzero"));
        }
        if self.timing.hid_queue_depth == 0 {
            return Err(ConfigError::InvalidTiming("hid_queue_depth must be nonzero"));
        }
        // Binding names are resolved against the keycode tables up front so
        // a typo fails at startup, not on first key press.
        crate::hid::MappingTable::from_config(&self.input)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.wifi.ssid = "desknet".to_string();
        config.wifi.password = "hunter2".to_string();
        config.weather.api_key = "abc123".to_string();
        config
    }

    #[test]
    fn test_default_timing_constants() {
        let config = Config::default();
        assert_eq!(config.timing.tick_ms, 20);
        assert_eq!(config.timing.debounce_ms, 20);
        assert_eq!(config.timing.backoff_base_s, 3);
        assert_eq!(config.timing.backoff_cap_s, 60);
        assert_eq!(config.timing.weather_poll_s, 1800);
        assert_eq!(config.timing.hid_queue_depth, 16);
    }

    #[test]
    fn test_default_bindings_cover_original_controls() {
        let config = Config::default();
        let names: Vec<&str> = config
            .input
            .buttons
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(names, vec!["mic", "skip", "back", "encoder_sw"]);
        assert_eq!(config.input.encoders.len(), 1);
    }

    #[test]
    fn test_ticks_from_ms_never_zero() {
        let timing = TimingConfig::default();
        assert_eq!(timing.ticks_from_ms(1), 1, "sub-tick intervals round up");
        assert_eq!(timing.ticks_from_ms(20), 1);
        assert_eq!(timing.ticks_from_ms(500), 25);
        assert_eq!(timing.ticks_from_secs(3), 150);
    }

    #[test]
    fn test_missing_credentials_is_fatal() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingWifiCredentials)
        ));

        let mut config = valid_config();
        config.weather.api_key.clear();
        assert!(matches!(config.validate(), Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn test_weather_disabled_skips_api_key_check() {
        let mut config = valid_config();
        config.weather.api_key.clear();
        config.weather.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_units_rejected() {
        let mut config = valid_config();
        config.weather.units = "kelvin".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUnits(_))
        ));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = valid_config();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.wifi.ssid, config.wifi.ssid);
        assert_eq!(parsed.weather.city, config.weather.city);
        assert_eq!(parsed.timing.tick_ms, config.timing.tick_ms);
        assert_eq!(parsed.input.buttons.len(), config.input.buttons.len());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let config = valid_config();
        write!(file, "{}", toml::to_string(&config).unwrap()).unwrap();
        let loaded = Config::load_from_path(file.path()).unwrap();
        assert_eq!(loaded.wifi.ssid, "desknet");
    }

    #[test]
    fn test_load_nonexistent_file_is_error() {
        // A missing config is fatal; there is no sensible set of default
        // credentials to fall back to.
        assert!(Config::load_from_path("/nonexistent/path").is_err());
    }

    #[test]
    fn test_unknown_binding_name_is_fatal() {
        let mut config = valid_config();
        config.input.buttons[0].action = ActionSpec::Chord {
            keys: vec!["HYPER".to_string()],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownKeyName(_))
        ));
    }
}
