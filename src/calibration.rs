//! Analog front-end calibration.
//!
//! Raw magnitudes coming off the controller include the gain of the whole
//! analog chain (instrumentation amplifier and output stage on the voltage
//! path; TIA, PGA and output stage on the current path), and each stage adds
//! a frequency-dependent phase lag. A calibration strategy maps
//! `(frequency, TIA mode, PGA setting)` to the correction that removes both.
//!
//! Two interchangeable strategies exist: a measured lookup table with
//! log-frequency interpolation, and a closed-form single-pole model of the
//! amplifier chain. The strategy is chosen once at configuration time.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{info, warn};

use crate::errors::{AcquisitionError, Result};
use crate::protocol::{FrequencySample, TiaMode, PGA_STEPS};

/// Correction for one `(frequency, TIA mode, PGA setting)` operating point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    /// Total voltage-path gain (V measured / V actual).
    pub v_gain: f32,
    /// Total current-path gain (V measured / A actual).
    pub i_gain: f32,
    /// Voltage-path phase minus current-path phase, degrees.
    pub phase_offset_deg: f32,
}

impl Correction {
    /// No-op correction, used when a table lookup misses and the sample is
    /// forwarded uncalibrated.
    pub fn identity() -> Self {
        Self {
            v_gain: 1.0,
            i_gain: 1.0,
            phase_offset_deg: 0.0,
        }
    }
}

/// A source of front-end corrections. Selected at configuration time and
/// read-only afterwards.
pub trait CalibrationStrategy: Send {
    /// The correction for an operating point, or `None` when no calibration
    /// data covers it (table strategy only; the analytic model is total).
    fn correction(&self, freq_hz: u32, tia_mode: TiaMode, pga_gain: u8) -> Option<Correction>;
}

/// Wrap a phase angle into [-180, 180] degrees.
pub fn normalize_phase_deg(deg: f32) -> f32 {
    if !deg.is_finite() {
        return deg;
    }
    let mut deg = deg;
    while deg > 180.0 {
        deg -= 360.0;
    }
    while deg < -180.0 {
        deg += 360.0;
    }
    deg
}

/// A raw sample with the front-end contribution removed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibratedSample {
    pub v_magnitude: f32,
    pub v_phase_deg: f32,
    pub i_magnitude: f32,
    pub i_phase_deg: f32,
}

impl From<&FrequencySample> for CalibratedSample {
    /// Pass-through, for forwarding a sample uncalibrated.
    fn from(sample: &FrequencySample) -> Self {
        Self {
            v_magnitude: sample.v_magnitude,
            v_phase_deg: sample.v_phase_deg,
            i_magnitude: sample.i_magnitude,
            i_phase_deg: sample.i_phase_deg,
        }
    }
}

/// Apply a correction to a raw sample: magnitudes are divided by the path
/// gains, and the phase offset is removed from the voltage phase so the
/// V−I difference comes out corrected.
pub fn apply(sample: &FrequencySample, correction: &Correction) -> CalibratedSample {
    CalibratedSample {
        v_magnitude: sample.v_magnitude / correction.v_gain,
        v_phase_deg: normalize_phase_deg(sample.v_phase_deg - correction.phase_offset_deg),
        i_magnitude: sample.i_magnitude / correction.i_gain,
        i_phase_deg: sample.i_phase_deg,
    }
}

// ============================================================================
// Table strategy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct CalCell {
    v_gain: f32,
    i_gain: f32,
    phase_offset_deg: f32,
}

/// All calibration cells measured at one frequency, indexed `[tia][pga]`.
#[derive(Debug, Clone)]
struct TableEntry {
    frequency_hz: u32,
    cells: [[Option<CalCell>; PGA_STEPS]; 2],
}

impl TableEntry {
    fn new(frequency_hz: u32) -> Self {
        Self {
            frequency_hz,
            cells: [[None; PGA_STEPS]; 2],
        }
    }

    fn cell(&self, tia_mode: TiaMode, pga_gain: u8) -> Option<CalCell> {
        self.cells[tia_mode as usize][pga_gain as usize]
    }
}

/// Measured calibration table with log-frequency interpolation.
///
/// Entries are kept sorted by frequency. A lookup at a stored frequency
/// returns the stored cell; between two stored frequencies both bracketing
/// cells must exist and the correction is interpolated linearly in
/// log-frequency; outside the table the nearest edge entry is used.
pub struct TableCalibration {
    entries: Vec<TableEntry>,
}

impl TableCalibration {
    /// Load the table from the instrument's calibration CSV.
    ///
    /// Line format: `freq,tia_mode,pga_gain,v_gain,i_gain,phase` where
    /// `tia_mode` is 0 (low) or 1 (high) and `pga_gain` is 0..=7. Empty
    /// lines and `#` comments are skipped; malformed lines are logged and
    /// ignored, matching the tolerant loader this replaces.
    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_csv_reader(BufReader::new(file))
    }

    pub fn from_csv_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut entries: Vec<TableEntry> = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Self::parse_line(line) {
                Some((freq, tia, pga, cell)) => {
                    let index = match entries.iter().position(|e| e.frequency_hz == freq) {
                        Some(index) => index,
                        None => {
                            entries.push(TableEntry::new(freq));
                            entries.len() - 1
                        }
                    };
                    entries[index].cells[tia as usize][pga as usize] = Some(cell);
                }
                None => warn!("skipping invalid calibration line {}: {line}", line_no + 1),
            }
        }
        if entries.is_empty() {
            return Err(AcquisitionError::Calibration(
                "calibration table contains no entries".into(),
            ));
        }
        entries.sort_by_key(|e| e.frequency_hz);
        info!("loaded calibration table for {} frequencies", entries.len());
        Ok(Self { entries })
    }

    fn parse_line(line: &str) -> Option<(u32, TiaMode, u8, CalCell)> {
        let mut fields = line.split(',').map(str::trim);
        let freq = fields.next()?.parse::<u32>().ok()?;
        let tia = fields.next()?.parse::<u8>().ok()?;
        let pga = fields.next()?.parse::<u8>().ok()?;
        let v_gain = fields.next()?.parse::<f32>().ok()?;
        let i_gain = fields.next()?.parse::<f32>().ok()?;
        let phase = fields.next()?.parse::<f32>().ok()?;
        if tia > 1 || pga as usize >= PGA_STEPS || fields.next().is_some() {
            return None;
        }
        Some((
            freq,
            TiaMode::from_wire(tia),
            pga,
            CalCell {
                v_gain,
                i_gain,
                phase_offset_deg: phase,
            },
        ))
    }

    pub fn frequency_count(&self) -> usize {
        self.entries.len()
    }

    fn correction_at(&self, index: usize, tia_mode: TiaMode, pga_gain: u8) -> Option<Correction> {
        self.entries[index]
            .cell(tia_mode, pga_gain)
            .map(|c| Correction {
                v_gain: c.v_gain,
                i_gain: c.i_gain,
                phase_offset_deg: c.phase_offset_deg,
            })
    }
}

impl CalibrationStrategy for TableCalibration {
    fn correction(&self, freq_hz: u32, tia_mode: TiaMode, pga_gain: u8) -> Option<Correction> {
        if pga_gain as usize >= PGA_STEPS || self.entries.is_empty() {
            return None;
        }
        match self
            .entries
            .binary_search_by_key(&freq_hz, |e| e.frequency_hz)
        {
            Ok(i) => self.correction_at(i, tia_mode, pga_gain),
            Err(0) => self.correction_at(0, tia_mode, pga_gain),
            Err(i) if i == self.entries.len() => {
                self.correction_at(self.entries.len() - 1, tia_mode, pga_gain)
            }
            Err(i) => {
                let lower = &self.entries[i - 1];
                let upper = &self.entries[i];
                let lo = lower.cell(tia_mode, pga_gain)?;
                let hi = upper.cell(tia_mode, pga_gain)?;
                // Sweep frequencies are log-spaced, so interpolate in
                // log-frequency rather than linearly in Hz.
                let t = ((freq_hz as f32).ln() - (lower.frequency_hz as f32).ln())
                    / ((upper.frequency_hz as f32).ln() - (lower.frequency_hz as f32).ln());
                Some(Correction {
                    v_gain: lo.v_gain + t * (hi.v_gain - lo.v_gain),
                    i_gain: lo.i_gain + t * (hi.i_gain - lo.i_gain),
                    phase_offset_deg: lo.phase_offset_deg
                        + t * (hi.phase_offset_deg - lo.phase_offset_deg),
                })
            }
        }
    }
}

// ============================================================================
// Analytic strategy
// ============================================================================

/// Closed-form single-pole model of the analog front end.
///
/// Each amplifier stage is modeled as a first-order low-pass with pole
/// frequency `GBW / stage_gain`:
///
/// ```text
/// gain(f)  = stage_gain / sqrt(1 + (f / f_pole)^2)
/// phase(f) = -atan(f / f_pole)
/// ```
///
/// The voltage path cascades the instrumentation amplifier with the output
/// stage; the current path cascades the TIA, the PGA (with a per-setting
/// measured cutoff), and the output stage. Always computable, for any
/// frequency.
#[derive(Debug, Clone)]
pub struct AnalyticCalibration {
    /// Voltage-path amplifier gain-bandwidth product, MHz.
    pub v_gbw_mhz: f32,
    /// Instrumentation amplifier gain on the voltage path.
    pub v_amp_gain: f32,
    /// Current-path (TIA) amplifier gain-bandwidth product, MHz.
    pub i_gbw_mhz: f32,
    /// Output buffer stage gain, common to both paths.
    pub output_gain: f32,
    /// TIA transimpedance per mode, indexed by [`TiaMode`] (V/A).
    pub tia_gain: [f32; 2],
    /// Measured PGA bandwidth per gain setting, MHz.
    pub pga_cutoff_mhz: [f32; PGA_STEPS],
    /// Actual PGA gain per setting.
    pub pga_gain: [f32; PGA_STEPS],
}

impl Default for AnalyticCalibration {
    fn default() -> Self {
        Self {
            v_gbw_mhz: 10.0,
            v_amp_gain: 15.0,
            i_gbw_mhz: 40.0,
            output_gain: 20.0,
            tia_gain: [37.6, 7500.0],
            pga_cutoff_mhz: [10.0, 3.8, 1.8, 1.8, 1.3, 0.9, 0.38, 0.23],
            pga_gain: [1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0],
        }
    }
}

fn single_pole(f: f32, pole_hz: f32) -> (f32, f32) {
    let ratio = f / pole_hz;
    let attenuation = 1.0 / (1.0 + ratio * ratio).sqrt();
    let phase_deg = -ratio.atan().to_degrees();
    (attenuation, phase_deg)
}

impl CalibrationStrategy for AnalyticCalibration {
    fn correction(&self, freq_hz: u32, tia_mode: TiaMode, pga_gain: u8) -> Option<Correction> {
        let f = freq_hz as f32;
        let pga = (pga_gain as usize).min(PGA_STEPS - 1);

        let v_pole = self.v_gbw_mhz / self.v_amp_gain * 1e6;
        let (v_att, v_phase) = single_pole(f, v_pole);
        let v_gain = self.output_gain * self.v_amp_gain * v_att;

        let tia = self.tia_gain[tia_mode as usize];
        let i_pole = self.i_gbw_mhz / tia * 1e6;
        let pga_pole = self.pga_cutoff_mhz[pga] * 1e6;
        let (tia_att, tia_phase) = single_pole(f, i_pole);
        let (pga_att, pga_phase) = single_pole(f, pga_pole);
        let i_gain = self.output_gain * tia * tia_att * self.pga_gain[pga] * pga_att;
        let i_phase = tia_phase + pga_phase;

        Some(Correction {
            v_gain,
            i_gain,
            phase_offset_deg: v_phase - i_phase,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const CSV: &str = "\
# freq,tia_mode,pga_gain,v_gain,i_gain,phase
100,1,2,10.0,100.0,1.0
1000,1,2,20.0,200.0,3.0
10000,1,2,40.0,400.0,5.0
100,0,2,5.0,50.0,0.5
";

    fn table() -> TableCalibration {
        TableCalibration::from_csv_reader(Cursor::new(CSV)).unwrap()
    }

    #[test]
    fn normalize_stays_in_range() {
        for deg in [-1000.0, -180.0, -17.5, 0.0, 179.9, 180.0, 540.0, 7000.0] {
            let n = normalize_phase_deg(deg);
            assert!((-180.0..=180.0).contains(&n), "{deg} -> {n}");
        }
        assert_eq!(normalize_phase_deg(190.0), -170.0);
        assert_eq!(normalize_phase_deg(-190.0), 170.0);
    }

    #[test]
    fn exact_frequency_returns_stored_values() {
        let cal = table();
        let c = cal.correction(1000, TiaMode::High, 2).unwrap();
        assert_eq!(c.v_gain, 20.0);
        assert_eq!(c.i_gain, 200.0);
        assert_eq!(c.phase_offset_deg, 3.0);
    }

    #[test]
    fn interpolates_in_log_frequency() {
        let cal = table();
        // sqrt(100 * 1000) is the log-midpoint of the first bracket.
        let mid = (100.0f32 * 1000.0).sqrt() as u32;
        let c = cal.correction(mid, TiaMode::High, 2).unwrap();
        assert!((c.v_gain - 15.0).abs() < 0.05, "v_gain = {}", c.v_gain);
        assert!((c.phase_offset_deg - 2.0).abs() < 0.01);
    }

    #[test]
    fn clamps_outside_table_range() {
        let cal = table();
        let below = cal.correction(10, TiaMode::High, 2).unwrap();
        assert_eq!(below.v_gain, 10.0);
        let above = cal.correction(1_000_000, TiaMode::High, 2).unwrap();
        assert_eq!(above.v_gain, 40.0);
    }

    #[test]
    fn missing_combination_is_none() {
        let cal = table();
        // No low-TIA data at 1 kHz and no pga=5 data anywhere.
        assert!(cal.correction(1000, TiaMode::Low, 2).is_none());
        assert!(cal.correction(1000, TiaMode::High, 5).is_none());
        assert!(cal.correction(1000, TiaMode::High, 99).is_none());
    }

    #[test]
    fn rejects_empty_table() {
        assert!(TableCalibration::from_csv_reader(Cursor::new("# nothing\n")).is_err());
    }

    #[test]
    fn analytic_dc_gain_matches_stage_products() {
        let cal = AnalyticCalibration::default();
        let c = cal.correction(1, TiaMode::High, 0).unwrap();
        // Far below every pole the attenuations are ~1.
        assert!((c.v_gain - 20.0 * 15.0).abs() / (20.0 * 15.0) < 1e-3);
        assert!((c.i_gain - 20.0 * 7500.0).abs() / (20.0 * 7500.0) < 1e-3);
        assert!(c.phase_offset_deg.abs() < 0.1);
    }

    #[test]
    fn analytic_gain_rolls_off_with_frequency() {
        let cal = AnalyticCalibration::default();
        let lo = cal.correction(100, TiaMode::High, 3).unwrap();
        let hi = cal.correction(100_000, TiaMode::High, 3).unwrap();
        assert!(hi.v_gain < lo.v_gain);
        assert!(hi.i_gain < lo.i_gain);
    }

    #[test]
    fn analytic_pole_halves_power() {
        let cal = AnalyticCalibration::default();
        // Voltage-path pole sits at GBW / gain = 10 MHz / 15.
        let pole = (cal.v_gbw_mhz / cal.v_amp_gain * 1e6) as u32;
        let c = cal.correction(pole, TiaMode::High, 0).unwrap();
        let dc = cal.correction(1, TiaMode::High, 0).unwrap();
        let ratio = c.v_gain / dc.v_gain;
        assert!((ratio - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-2);
    }

    #[test]
    fn apply_removes_gain_and_phase() {
        let sample = FrequencySample {
            dut_id: 1,
            freq_hz: 1000,
            v_magnitude: 10.0,
            v_phase_deg: 30.0,
            i_magnitude: 4.0,
            i_phase_deg: 10.0,
            pga_gain: 2,
            tia_mode: TiaMode::High,
            valid: true,
        };
        let correction = Correction {
            v_gain: 2.0,
            i_gain: 4.0,
            phase_offset_deg: 5.0,
        };
        let cal = apply(&sample, &correction);
        assert_eq!(cal.v_magnitude, 5.0);
        assert_eq!(cal.i_magnitude, 1.0);
        assert_eq!(cal.v_phase_deg, 25.0);
        assert_eq!(cal.i_phase_deg, 10.0);
    }
}
