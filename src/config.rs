//! Workcell configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. A TOML file (default: `config/workcell.toml`)
//! 2. Environment variables prefixed with `WORKCELL_`, nested keys separated
//!    by a double underscore
//!
//! ```text
//! WORKCELL_APPLICATION__LOG_LEVEL=debug
//! WORKCELL_PAL__SAVE_DATA=true
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "workcell"
//! log_level = "info"
//!
//! [pal]
//! save_data = true
//! log_dir = "/data/pal_logs"
//!
//! [pal.methods]
//! transfer_tray_tray = "C:/PAL/methods/lcfc_transfer.cam"
//! archive = "C:/PAL/methods/lcfc_archive.cam"
//!
//! [pal.transport]
//! kind = "ssh"
//! host = "pal-pc"
//! user = "lab"
//! program = "C:/Program Files/CTC/PAL.exe"
//!
//! [pal.triggers]
//! start_line = 0
//! continue_line = 1
//! done_line = 2
//! poll_interval_ms = 50
//! timeout_secs = 600
//!
//! [[pal.custom_positions]]
//! name = "cell1_we"
//! assembly_allowed = true
//!
//! [[pal.custom_positions]]
//! name = "waste"
//! destroys = true
//! ```

use crate::error::{AppResult, WorkcellError};
use crate::motion::transform::RotationStep;
use crate::pal::method::MethodKind;
use crate::position::{CustomPositionCaps, Position};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value parsed but is not usable
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkcellConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Autosampler dispatch settings
    #[serde(default)]
    pub pal: PalConfig,
    /// Motion driver settings
    #[serde(default)]
    pub motion: MotionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, also used as the archive label prefix
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// How vendor job lists reach the autosampler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Record job lists without executing anything
    #[default]
    Simulated,
    /// Launch the vendor program on this machine
    Local {
        /// Vendor program path
        program: PathBuf,
    },
    /// Launch the vendor program on a remote machine through `ssh`
    Ssh {
        /// Autosampler PC
        host: String,
        /// Login user; the ssh client default if absent
        #[serde(default)]
        user: Option<String>,
        /// ssh port
        #[serde(default = "default_ssh_port")]
        port: u16,
        /// Vendor program path on the remote machine
        program: String,
        /// Delay between connection attempts
        #[serde(default = "default_ssh_retry_ms")]
        retry_interval_ms: u64,
    },
}

/// Digital input lines carrying the start/continue/done triggers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerConfig {
    /// Input line raised when an operation starts
    pub start_line: u32,
    /// Input line raised when sampling starts
    pub continue_line: u32,
    /// Input line raised when an operation completes
    pub done_line: u32,
    /// Hardware only supports level snapshots, so edges are found by polling
    /// at this interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout applied to each trigger phase
    #[serde(default = "default_trigger_timeout_secs")]
    pub timeout_secs: u64,
}

impl TriggerConfig {
    /// Line poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-phase timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Autosampler dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PalConfig {
    /// Method name to vendor method file. An empty path means unconfigured.
    #[serde(default)]
    pub methods: BTreeMap<String, PathBuf>,
    /// How job lists reach the vendor program
    #[serde(default)]
    pub transport: TransportConfig,
    /// `None` runs without hardware acknowledgment
    #[serde(default)]
    pub triggers: Option<TriggerConfig>,
    /// Named positions and what they allow
    #[serde(default)]
    pub custom_positions: Vec<CustomPositionCaps>,
    /// Emit one data record per completed run
    #[serde(default)]
    pub save_data: bool,
    /// Directory for auxiliary vendor log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Directory for data record files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Wait after submitting a job list before trusting triggers
    #[serde(default = "default_program_close_ms")]
    pub program_close_settle_ms: u64,
    /// Wait after the last run of a plan
    #[serde(default = "default_post_plan_ms")]
    pub post_plan_settle_ms: u64,
}

impl Default for PalConfig {
    fn default() -> Self {
        Self {
            methods: BTreeMap::new(),
            transport: TransportConfig::default(),
            triggers: None,
            custom_positions: Vec::new(),
            save_data: false,
            log_dir: default_log_dir(),
            data_dir: default_data_dir(),
            program_close_settle_ms: default_program_close_ms(),
            post_plan_settle_ms: default_post_plan_ms(),
        }
    }
}

impl PalConfig {
    /// Vendor method file for a chemistry method.
    pub fn method_file(&self, kind: MethodKind) -> AppResult<PathBuf> {
        match self.methods.get(kind.as_str()) {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            Some(_) => Err(WorkcellError::NotAvailable(format!(
                "method '{}' is not configured",
                kind
            ))),
            None => Err(WorkcellError::NotAvailable(format!(
                "method '{}' is unknown to this autosampler",
                kind
            ))),
        }
    }

    /// Pause after submitting a job list.
    pub fn program_close_settle(&self) -> Duration {
        Duration::from_millis(self.program_close_settle_ms)
    }

    /// Pause after the last run of a plan.
    pub fn post_plan_settle(&self) -> Duration {
        Duration::from_millis(self.post_plan_settle_ms)
    }
}

/// Motion driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Logical axis name (x, y, z) to controller axis number
    #[serde(default = "default_axes")]
    pub axes: BTreeMap<String, usize>,
    /// Axis rotation sequence applied to motor coordinates
    #[serde(default)]
    pub rotations: Vec<RotationStep>,
    /// Motor -> instrument calibration (row-major 4x4), identity if absent
    #[serde(default)]
    pub instrument_calibration: Option<[[f64; 4]; 4]>,
    /// Initial 2D affine plate calibration (row-major 3x3)
    #[serde(default)]
    pub plate_affine: Option<[[f64; 3]; 3]>,
    /// Move-wait poll interval
    #[serde(default = "default_motion_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            axes: default_axes(),
            rotations: Vec::new(),
            instrument_calibration: None,
            plate_affine: None,
            poll_interval_ms: default_motion_poll_ms(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "workcell".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_retry_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_trigger_timeout_secs() -> u64 {
    600
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("data/pal_logs")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/pal_records")
}

fn default_program_close_ms() -> u64 {
    500
}

fn default_post_plan_ms() -> u64 {
    1000
}

fn default_axes() -> BTreeMap<String, usize> {
    [("x", 0), ("y", 1), ("z", 2)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn default_motion_poll_ms() -> u64 {
    100
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl WorkcellConfig {
    /// Load configuration from `config/workcell.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/workcell.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WORKCELL_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Method table keys name known methods
    /// - Custom position names are unique and valid positions
    /// - Trigger lines are distinct, poll interval and timeout are non-zero
    /// - SSH host is not empty
    /// - Plate and instrument calibrations have affine last rows
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for name in self.pal.methods.keys() {
            if MethodKind::from_name(name).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown method '{}' in pal.methods",
                    name
                )));
            }
        }

        let mut names = HashSet::new();
        for position in &self.pal.custom_positions {
            if let Err(e) = Position::custom(position.name.clone()).validate() {
                return Err(ConfigError::ValidationError(e.to_string()));
            }
            if !names.insert(&position.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate custom position: '{}'",
                    position.name
                )));
            }
        }

        if let Some(triggers) = &self.pal.triggers {
            let lines: HashSet<u32> = [
                triggers.start_line,
                triggers.continue_line,
                triggers.done_line,
            ]
            .into_iter()
            .collect();
            if lines.len() != 3 {
                return Err(ConfigError::ValidationError(
                    "Trigger lines must be distinct".to_string(),
                ));
            }
            if triggers.poll_interval_ms == 0 {
                return Err(ConfigError::ValidationError(
                    "Trigger poll_interval_ms must be > 0".to_string(),
                ));
            }
            if triggers.timeout_secs == 0 {
                return Err(ConfigError::ValidationError(
                    "Trigger timeout_secs must be > 0".to_string(),
                ));
            }
        }

        if let TransportConfig::Ssh { host, .. } = &self.pal.transport {
            if host.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "SSH transport: 'host' cannot be empty".to_string(),
                ));
            }
        }

        if let Some(m) = &self.motion.plate_affine {
            if m[2] != [0.0, 0.0, 1.0] {
                return Err(ConfigError::ValidationError(
                    "motion.plate_affine last row must be [0, 0, 1]".to_string(),
                ));
            }
        }
        if let Some(m) = &self.motion.instrument_calibration {
            if m[3] != [0.0, 0.0, 0.0, 1.0] {
                return Err(ConfigError::ValidationError(
                    "motion.instrument_calibration last row must be [0, 0, 0, 1]".to_string(),
                ));
            }
        }
        if self.motion.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "motion.poll_interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for WorkcellConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            pal: PalConfig::default(),
            motion: MotionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_validation_valid() {
        assert!(WorkcellConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = WorkcellConfig::default();
        config.application.log_level = "loud".to_string();
        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_duplicate_custom_positions() {
        let mut config = WorkcellConfig::default();
        let waste = CustomPositionCaps {
            name: "waste".into(),
            dest_allowed: true,
            assembly_allowed: false,
            destroys: true,
        };
        config.pal.custom_positions = vec![waste.clone(), waste];
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Duplicate custom position"));
    }

    #[test]
    fn test_trigger_lines_must_differ() {
        let mut config = WorkcellConfig::default();
        config.pal.triggers = Some(TriggerConfig {
            start_line: 1,
            continue_line: 1,
            done_line: 2,
            poll_interval_ms: 50,
            timeout_secs: 10,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unconfigured_method_is_not_available() {
        let mut config = PalConfig::default();
        config
            .methods
            .insert("archive".to_string(), PathBuf::new());
        let err = config.method_file(MethodKind::Archive).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotAvailable);
        let err = config.method_file(MethodKind::LiquidInjection).unwrap_err();
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[pal]
save_data = true

[pal.methods]
transfer_tray_tray = "methods/transfer.cam"

[pal.transport]
kind = "ssh"
host = "pal-pc"
program = "PAL.exe"

[[pal.custom_positions]]
name = "waste"
destroys = true
"#
        )
        .unwrap();

        let config = WorkcellConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert!(config.pal.save_data);
        assert_eq!(
            config.pal.method_file(MethodKind::TransferTrayTray).unwrap(),
            PathBuf::from("methods/transfer.cam")
        );
        assert!(matches!(
            config.pal.transport,
            TransportConfig::Ssh { port: 22, .. }
        ));
        assert!(config.pal.custom_positions[0].destroys);
        assert!(config.pal.custom_positions[0].dest_allowed);
    }
}
