//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::climate::{ClimateMode, ZoneKind};
use crate::error::{OpenThermError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub sensors: SensorConfig,
    #[serde(default)]
    pub climate: ClimateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Pin level that means "active" on the OpenTherm side of the adapter
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActiveLevel {
    High,
    Low,
}

/// GPIO pins (BCM numbering)
#[derive(Debug, Deserialize, Clone)]
pub struct PinConfig {
    #[serde(default = "default_master_in")]
    pub master_in: u8,

    #[serde(default = "default_master_out")]
    pub master_out: u8,

    #[serde(default = "default_slave_in")]
    pub slave_in: u8,

    #[serde(default = "default_slave_out")]
    pub slave_out: u8,

    #[serde(default = "default_input_active")]
    pub input_active: ActiveLevel,

    #[serde(default = "default_output_active")]
    pub output_active: ActiveLevel,
}

/// Line backend selection
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Real adapter on GPIO pins (feature `gpio`)
    Gpio,
    /// In-process simulated boiler
    Simulated,
}

/// Link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// Response delay of the simulated boiler
    #[serde(default = "default_simulated_response_delay_ms")]
    pub simulated_response_delay_ms: u64,
}

/// Poll scheduling
#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    /// Ids refreshed more recently than this are skipped in a cycle
    #[serde(default = "default_min_refresh_ms")]
    pub min_refresh_ms: u64,

    /// Readings older than this are reported as stale
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

/// Master session timing and fault handling
#[derive(Debug, Deserialize, Clone)]
pub struct MasterConfig {
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_fault_threshold")]
    pub fault_threshold: u32,

    #[serde(default = "default_inter_frame_gap_ms")]
    pub inter_frame_gap_ms: u64,
}

/// Gateway mode (room unit upstream on the slave pair)
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_override_timeout_s")]
    pub override_timeout_s: u64,
}

/// Which readings the telemetry reporter exports
#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    #[serde(default = "default_true")]
    pub external_temperature: bool,
    #[serde(default = "default_true")]
    pub return_temperature: bool,
    #[serde(default = "default_true")]
    pub boiler_temperature: bool,
    #[serde(default = "default_true")]
    pub pressure: bool,
    #[serde(default = "default_true")]
    pub modulation: bool,
    #[serde(default = "default_true")]
    pub heating_target_temperature: bool,
    #[serde(default = "default_true")]
    pub max_ch_setpoint: bool,
    #[serde(default = "default_true")]
    pub min_ch_setpoint: bool,
    #[serde(default = "default_true")]
    pub max_modulation: bool,
    #[serde(default = "default_true")]
    pub oem_fault_code: bool,
    #[serde(default = "default_true")]
    pub oem_diagnostic_code: bool,
    #[serde(default = "default_true")]
    pub master_ot_version: bool,
    #[serde(default = "default_true")]
    pub slave_ot_version: bool,
    #[serde(default = "default_true")]
    pub room_temperature: bool,
    #[serde(default = "default_true")]
    pub room_setpoint: bool,
    #[serde(default = "default_true")]
    pub dhw_temperature: bool,
    #[serde(default = "default_true")]
    pub dhw_setpoint: bool,
    #[serde(default = "default_true")]
    pub flame: bool,
    #[serde(default = "default_true")]
    pub ch_active: bool,
    #[serde(default = "default_true")]
    pub dhw_active: bool,
    #[serde(default = "default_true")]
    pub fault: bool,
    #[serde(default = "default_true")]
    pub diagnostic: bool,
}

/// Climate zones
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClimateConfig {
    #[serde(default)]
    pub hot_water: ZoneConfig,
    #[serde(default)]
    pub heating_water: ZoneConfig,
}

/// One climate zone; unset limits fall back to the zone's defaults
#[derive(Debug, Deserialize, Clone)]
pub struct ZoneConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub mode: ClimateMode,

    #[serde(default)]
    pub initial_target: Option<f32>,

    #[serde(default)]
    pub min_temperature: Option<f32>,

    #[serde(default)]
    pub max_temperature: Option<f32>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for a daily rolling log file; console only when unset
    #[serde(default)]
    pub directory: Option<String>,

    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_master_in() -> u8 { 17 }
fn default_master_out() -> u8 { 27 }
fn default_slave_in() -> u8 { 22 }
fn default_slave_out() -> u8 { 23 }
fn default_input_active() -> ActiveLevel { ActiveLevel::High }
fn default_output_active() -> ActiveLevel { ActiveLevel::Low }

fn default_backend() -> Backend { Backend::Simulated }
fn default_simulated_response_delay_ms() -> u64 { 40 }

fn default_update_interval_ms() -> u64 { 30000 }
fn default_min_refresh_ms() -> u64 { 5000 }
fn default_stale_after_ms() -> u64 { 60000 }

fn default_response_timeout_ms() -> u64 { 800 }
fn default_max_attempts() -> u8 { 3 }
fn default_retry_backoff_ms() -> u64 { 100 }
fn default_fault_threshold() -> u32 { 5 }
fn default_inter_frame_gap_ms() -> u64 { 100 }

fn default_override_timeout_s() -> u64 { 24 * 60 * 60 }

fn default_true() -> bool { true }

fn default_log_level() -> String { "info".to_string() }
fn default_log_file_prefix() -> String { "opentherm-gateway.log".to_string() }

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            master_in: default_master_in(),
            master_out: default_master_out(),
            slave_in: default_slave_in(),
            slave_out: default_slave_out(),
            input_active: default_input_active(),
            output_active: default_output_active(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            simulated_response_delay_ms: default_simulated_response_delay_ms(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
            min_refresh_ms: default_min_refresh_ms(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fault_threshold: default_fault_threshold(),
            inter_frame_gap_ms: default_inter_frame_gap_ms(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            override_timeout_s: default_override_timeout_s(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            external_temperature: true,
            return_temperature: true,
            boiler_temperature: true,
            pressure: true,
            modulation: true,
            heating_target_temperature: true,
            max_ch_setpoint: true,
            min_ch_setpoint: true,
            max_modulation: true,
            oem_fault_code: true,
            oem_diagnostic_code: true,
            master_ot_version: true,
            slave_ot_version: true,
            room_temperature: true,
            room_setpoint: true,
            dhw_temperature: true,
            dhw_setpoint: true,
            flame: true,
            ch_active: true,
            dhw_active: true,
            fault: true,
            diagnostic: true,
        }
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ClimateMode::default(),
            initial_target: None,
            min_temperature: None,
            max_temperature: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            file_prefix: default_log_file_prefix(),
        }
    }
}

impl PollingConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn min_refresh(&self) -> Duration {
        Duration::from_millis(self.min_refresh_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl MasterConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn inter_frame_gap(&self) -> Duration {
        Duration::from_millis(self.inter_frame_gap_ms)
    }
}

impl GatewayConfig {
    pub fn override_timeout(&self) -> Duration {
        Duration::from_secs(self.override_timeout_s)
    }
}

impl SensorConfig {
    /// Whether the snapshot field `name` is exported
    ///
    /// Fields without a sensor switch (link health, zones) are always exported.
    pub fn is_enabled(&self, name: &str) -> bool {
        match name {
            "external_temperature" => self.external_temperature,
            "return_temperature" => self.return_temperature,
            "boiler_temperature" => self.boiler_temperature,
            "pressure" => self.pressure,
            "modulation" => self.modulation,
            "heating_target_temperature" => self.heating_target_temperature,
            "max_ch_setpoint" => self.max_ch_setpoint,
            "min_ch_setpoint" => self.min_ch_setpoint,
            "max_modulation" => self.max_modulation,
            "oem_fault_code" => self.oem_fault_code,
            "oem_diagnostic_code" => self.oem_diagnostic_code,
            "master_ot_version" => self.master_ot_version,
            "slave_ot_version" => self.slave_ot_version,
            "room_temperature" => self.room_temperature,
            "room_setpoint" => self.room_setpoint,
            "dhw_temperature" => self.dhw_temperature,
            "dhw_setpoint" => self.dhw_setpoint,
            "flame" => self.flame,
            "ch_active" => self.ch_active,
            "dhw_active" => self.dhw_active,
            "fault" => self.fault,
            "diagnostic" => self.diagnostic,
            _ => true,
        }
    }
}

impl ClimateConfig {
    pub fn zone(&self, kind: ZoneKind) -> &ZoneConfig {
        match kind {
            ZoneKind::HotWater => &self.hot_water,
            ZoneKind::HeatingWater => &self.heating_water,
        }
    }
}

impl ZoneConfig {
    /// Target limits for the zone, `(min, max)` in °C
    pub fn limits(&self, kind: ZoneKind, gateway: bool) -> (f32, f32) {
        let (min, max) = match (kind, gateway) {
            (ZoneKind::HotWater, _) => (30.0, 80.0),
            (ZoneKind::HeatingWater, false) => (20.0, 80.0),
            (ZoneKind::HeatingWater, true) => (5.0, 30.0),
        };
        (
            self.min_temperature.unwrap_or(min),
            self.max_temperature.unwrap_or(max),
        )
    }
}

fn invalid(message: impl std::fmt::Display) -> OpenThermError {
    OpenThermError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use opentherm_gateway::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Validate pins
        let pins = [
            ("master_in", self.pins.master_in),
            ("master_out", self.pins.master_out),
            ("slave_in", self.pins.slave_in),
            ("slave_out", self.pins.slave_out),
        ];
        for (name, pin) in pins {
            if pin > 27 {
                return Err(invalid(format!("pin {} = {} is not a header GPIO (0-27)", name, pin)));
            }
        }
        for (i, (name, pin)) in pins.iter().enumerate() {
            if let Some((other, _)) = pins[i + 1..].iter().find(|(_, p)| p == pin) {
                return Err(invalid(format!("pins {} and {} both use GPIO {}", name, other, pin)));
            }
        }

        // Validate polling
        if self.polling.update_interval_ms < 1000 || self.polling.update_interval_ms > 3_600_000 {
            return Err(invalid("update_interval_ms must be between 1000 and 3600000"));
        }

        if self.polling.min_refresh_ms > self.polling.update_interval_ms {
            return Err(invalid("min_refresh_ms must not exceed update_interval_ms"));
        }

        if self.polling.stale_after_ms < self.polling.update_interval_ms {
            return Err(invalid("stale_after_ms must be at least update_interval_ms"));
        }

        // Validate master timing
        if self.master.response_timeout_ms < 100 || self.master.response_timeout_ms > 1000 {
            return Err(invalid("response_timeout_ms must be between 100 and 1000"));
        }

        if self.master.max_attempts == 0 || self.master.max_attempts > 10 {
            return Err(invalid("max_attempts must be between 1 and 10"));
        }

        if self.master.retry_backoff_ms > 10000 {
            return Err(invalid("retry_backoff_ms must be at most 10000"));
        }

        if self.master.fault_threshold == 0 {
            return Err(invalid("fault_threshold must be greater than 0"));
        }

        if self.master.inter_frame_gap_ms < 100 || self.master.inter_frame_gap_ms > 10000 {
            return Err(invalid("inter_frame_gap_ms must be between 100 and 10000"));
        }

        // Validate gateway
        if self.gateway.override_timeout_s == 0 {
            return Err(invalid("override_timeout_s must be greater than 0"));
        }

        // Validate climate zones
        for kind in [ZoneKind::HotWater, ZoneKind::HeatingWater] {
            let zone = self.climate.zone(kind);
            let (min, max) = zone.limits(kind, self.gateway.enabled);
            if !min.is_finite() || !max.is_finite() || min >= max {
                return Err(invalid(format!("{} min_temperature must be less than max_temperature", kind)));
            }
            if min < 0.0 || max > 100.0 {
                return Err(invalid(format!("{} limits must be within 0-100 °C", kind)));
            }
            if let Some(target) = zone.initial_target {
                if target < min || target > max {
                    return Err(invalid(format!(
                        "{} initial_target {} is outside {}-{}",
                        kind, target, min, max
                    )));
                }
            }
        }

        // Validate log level
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        if self.logging.directory.is_some() && self.logging.file_prefix.is_empty() {
            return Err(invalid("logging file_prefix cannot be empty when a directory is set"));
        }

        Ok(())
    }
}
