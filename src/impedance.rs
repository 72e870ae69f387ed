//! Impedance derivation from calibrated voltage/current pairs.

use crate::calibration::{normalize_phase_deg, CalibratedSample};
use crate::protocol::{FrequencySample, TiaMode};

/// Guard on the squared current magnitude; below this the division is
/// meaningless and the point is marked invalid instead of producing NaN/Inf.
const CURRENT_EPSILON_SQ: f32 = 1e-12;

/// One derived impedance value. `Default` is the invalid placeholder the
/// measurement store is filled with.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImpedancePoint {
    pub freq_hz: u32,
    pub magnitude_ohm: f32,
    pub phase_deg: f32,
    pub pga_gain: u8,
    pub tia_mode: TiaMode,
    pub valid: bool,
}

impl ImpedancePoint {
    fn invalid_for(sample: &FrequencySample) -> Self {
        Self {
            freq_hz: sample.freq_hz,
            pga_gain: sample.pga_gain,
            tia_mode: sample.tia_mode,
            ..Self::default()
        }
    }
}

/// Derive `Z = V / I` by full complex division.
///
/// Both phasors are converted to rectangular form so the cross terms are
/// handled exactly, then the quotient goes back to polar. A sample the
/// controller already flagged invalid, or one with near-zero current, yields
/// an invalid point carrying the sample's metadata.
pub fn derive_impedance(sample: &FrequencySample, cal: &CalibratedSample) -> ImpedancePoint {
    if !sample.valid {
        return ImpedancePoint::invalid_for(sample);
    }

    let v_phase = cal.v_phase_deg.to_radians();
    let i_phase = cal.i_phase_deg.to_radians();
    let (v_re, v_im) = (
        cal.v_magnitude * v_phase.cos(),
        cal.v_magnitude * v_phase.sin(),
    );
    let (i_re, i_im) = (
        cal.i_magnitude * i_phase.cos(),
        cal.i_magnitude * i_phase.sin(),
    );

    let denom = i_re * i_re + i_im * i_im;
    if denom < CURRENT_EPSILON_SQ {
        return ImpedancePoint::invalid_for(sample);
    }

    let z_re = (v_re * i_re + v_im * i_im) / denom;
    let z_im = (v_im * i_re - v_re * i_im) / denom;

    ImpedancePoint {
        freq_hz: sample.freq_hz,
        magnitude_ohm: (z_re * z_re + z_im * z_im).sqrt(),
        phase_deg: z_im.atan2(z_re).to_degrees(),
        pga_gain: sample.pga_gain,
        tia_mode: sample.tia_mode,
        valid: true,
    }
}

/// Scalar fallback for streams where the V−I phase difference was combined
/// upstream: `|Z| = |V| / |I|`, phase passed through (normalized). Loses the
/// cross-term exactness of [`derive_impedance`].
pub fn derive_impedance_scalar(
    v_magnitude: f32,
    i_magnitude: f32,
    phase_deg: f32,
) -> Option<(f32, f32)> {
    if i_magnitude * i_magnitude < CURRENT_EPSILON_SQ {
        return None;
    }
    Some((v_magnitude / i_magnitude, normalize_phase_deg(phase_deg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(v_mag: f32, v_phase: f32, i_mag: f32, i_phase: f32) -> FrequencySample {
        FrequencySample {
            dut_id: 1,
            freq_hz: 1000,
            v_magnitude: v_mag,
            v_phase_deg: v_phase,
            i_magnitude: i_mag,
            i_phase_deg: i_phase,
            pga_gain: 2,
            tia_mode: TiaMode::High,
            valid: true,
        }
    }

    #[test]
    fn reference_division() {
        let s = sample(2.0, 30.0, 1.0, 10.0);
        let z = derive_impedance(&s, &CalibratedSample::from(&s));
        assert!(z.valid);
        assert!((z.magnitude_ohm - 2.0).abs() < 1e-5);
        assert!((z.phase_deg - 20.0).abs() < 1e-4);
        assert_eq!(z.freq_hz, 1000);
        assert_eq!(z.pga_gain, 2);
        assert_eq!(z.tia_mode, TiaMode::High);
    }

    #[test]
    fn purely_resistive_load() {
        let s = sample(5.0, 45.0, 2.5, 45.0);
        let z = derive_impedance(&s, &CalibratedSample::from(&s));
        assert!((z.magnitude_ohm - 2.0).abs() < 1e-5);
        assert!(z.phase_deg.abs() < 1e-4);
    }

    #[test]
    fn near_zero_current_is_invalid() {
        let s = sample(2.0, 30.0, 0.0, 10.0);
        let z = derive_impedance(&s, &CalibratedSample::from(&s));
        assert!(!z.valid);
        assert_eq!(z.magnitude_ohm, 0.0);
        assert!(z.magnitude_ohm.is_finite());
        assert_eq!(z.freq_hz, 1000);
    }

    #[test]
    fn invalid_sample_stays_invalid() {
        let mut s = sample(2.0, 30.0, 1.0, 10.0);
        s.valid = false;
        let z = derive_impedance(&s, &CalibratedSample::from(&s));
        assert!(!z.valid);
    }

    #[test]
    fn scalar_fallback() {
        let (mag, phase) = derive_impedance_scalar(3.0, 1.5, 200.0).unwrap();
        assert_eq!(mag, 2.0);
        assert_eq!(phase, -160.0);
        assert!(derive_impedance_scalar(1.0, 0.0, 0.0).is_none());
    }
}
