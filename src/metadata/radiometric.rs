//! Linear radiometric decoding for thermal sensors.

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// `T[cK] = c1 * raw + c2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RadiometricCalibration {
    pub c1: f64,
    pub c2: f64,
}

impl Default for RadiometricCalibration {
    /// Identity: raw counts are already centikelvin.
    fn default() -> Self {
        Self { c1: 1.0, c2: 0.0 }
    }
}

/// Row-major temperature grid in centikelvin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemperatureMap {
    pub width: usize,
    pub height: usize,
    pub centikelvin: Vec<u16>,
    /// Samples whose calibrated value fell outside `0..=u16::MAX` or was not
    /// finite, and were clamped.
    pub saturated: usize,
}

impl TemperatureMap {
    pub fn get(&self, x: usize, y: usize) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.centikelvin.get(y * self.width + x).copied()
    }
}

/// Apply the calibration to every sample. Results are rounded and saturated to
/// the `u16` range; non-finite results become zero. Both are counted in
/// [`TemperatureMap::saturated`].
pub fn decode_ir_radiometric(
    raw: &[u16],
    width: usize,
    height: usize,
    calibration: &RadiometricCalibration,
) -> GateResult<TemperatureMap> {
    let expected = width
        .checked_mul(height)
        .ok_or_else(|| GateError::invalid("radiometric frame dimensions overflow"))?;
    if raw.len() != expected {
        return Err(GateError::invalid(format!(
            "radiometric frame is {}x{} ({} samples) but {} samples were supplied",
            width,
            height,
            expected,
            raw.len()
        )));
    }
    let max = f64::from(u16::MAX);
    let mut saturated = 0usize;
    let centikelvin = raw
        .iter()
        .map(|sample| {
            let t = (calibration.c1 * f64::from(*sample) + calibration.c2).round();
            if !t.is_finite() {
                saturated += 1;
                0
            } else if t < 0.0 || t > max {
                saturated += 1;
                t.clamp(0.0, max) as u16
            } else {
                t as u16
            }
        })
        .collect();
    if saturated > 0 {
        log::debug!(
            "radiometric decode clamped {} of {} samples",
            saturated,
            expected
        );
    }
    Ok(TemperatureMap {
        width,
        height,
        centikelvin,
        saturated,
    })
}
