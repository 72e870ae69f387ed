//! Startup configuration.
//!
//! Everything the core needs from its configuration collaborator: serial
//! link parameters, default sweep shape, command-channel timing, and the
//! calibration strategy. Loaded once from a TOML file (or defaulted) and
//! read-only afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calibration::{AnalyticCalibration, CalibrationStrategy, TableCalibration};
use crate::errors::{AcquisitionError, Result};
use crate::store::{MAX_DUT_COUNT, MAX_FREQUENCIES};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub serial: SerialSettings,
    pub sweep: SweepSettings,
    pub command: CommandSettings,
    pub calibration: CalibrationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Serial device connected to the measurement controller.
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Number of DUTs to measure (1..=4).
    pub dut_count: u8,
    /// First frequency index of the sweep range.
    pub start_freq_index: u8,
    /// Last frequency index of the sweep range (inclusive).
    pub end_freq_index: u8,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            dut_count: MAX_DUT_COUNT as u8,
            start_freq_index: 0,
            end_freq_index: (MAX_FREQUENCIES - 1) as u8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    /// How long each transmission waits for its acknowledgement.
    pub ack_timeout_ms: u64,
    /// Transmissions per command before giving up.
    pub attempts: u32,
    /// Pause between retries.
    pub retry_delay_ms: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 500,
            attempts: 3,
            retry_delay_ms: 50,
        }
    }
}

impl CommandSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Which calibration strategy to build at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationKind {
    /// Closed-form frequency-response model of the front end.
    #[default]
    Analytic,
    /// Measured lookup table loaded from `table_path`.
    Table,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CalibrationSettings {
    pub strategy: CalibrationKind,
    /// Calibration CSV, required for the table strategy.
    pub table_path: Option<PathBuf>,
}

impl AcquisitionConfig {
    /// Load and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| AcquisitionError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let sweep = &self.sweep;
        if sweep.dut_count == 0 || sweep.dut_count as usize > MAX_DUT_COUNT {
            return Err(AcquisitionError::Config(format!(
                "dut_count must be 1..={MAX_DUT_COUNT}, got {}",
                sweep.dut_count
            )));
        }
        if sweep.start_freq_index > sweep.end_freq_index
            || sweep.end_freq_index as usize >= MAX_FREQUENCIES
        {
            return Err(AcquisitionError::Config(format!(
                "frequency index range {}..={} is invalid",
                sweep.start_freq_index, sweep.end_freq_index
            )));
        }
        Ok(())
    }

    /// Build the configured calibration strategy.
    pub fn build_calibration(&self) -> Result<Box<dyn CalibrationStrategy>> {
        match self.calibration.strategy {
            CalibrationKind::Analytic => Ok(Box::new(AnalyticCalibration::default())),
            CalibrationKind::Table => {
                let path = self.calibration.table_path.as_deref().ok_or_else(|| {
                    AcquisitionError::Config(
                        "table calibration selected but no table_path given".into(),
                    )
                })?;
                Ok(Box::new(TableCalibration::from_csv_path(path)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_are_valid() {
        let config = AcquisitionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sweep.dut_count, 4);
        assert_eq!(config.sweep.end_freq_index, 37);
        assert_eq!(config.command.attempts, 3);
        assert_eq!(config.calibration.strategy, CalibrationKind::Analytic);
    }

    #[test]
    fn loads_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[serial]\nport = \"/dev/ttyACM1\"\n\n[sweep]\ndut_count = 2\n\n[calibration]\nstrategy = \"analytic\"\n"
        )
        .unwrap();

        let config = AcquisitionConfig::load(file.path()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM1");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.sweep.dut_count, 2);
    }

    #[test]
    fn rejects_bad_sweep_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sweep]\nstart_freq_index = 10\nend_freq_index = 2\n").unwrap();
        assert!(AcquisitionConfig::load(file.path()).is_err());
    }

    #[test]
    fn table_strategy_requires_path() {
        let config = AcquisitionConfig {
            calibration: CalibrationSettings {
                strategy: CalibrationKind::Table,
                table_path: None,
            },
            ..Default::default()
        };
        assert!(config.build_calibration().is_err());
    }
}
