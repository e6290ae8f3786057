use crate::types::{DisplayTensor, FusionError, FusionOutcome, Grid, ValidityMask};
use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// 8-bit normalization parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeParams {
    /// Lower clip percentile for stretched composites
    pub percentile_low: f64,
    /// Upper clip percentile for stretched composites
    pub percentile_high: f64,
    /// Reflectance mapped to 255 by the fixed true-colour scale
    pub reflectance_ceiling: f32,
}

impl Default for NormalizeParams {
    fn default() -> Self {
        Self {
            percentile_low: 2.0,
            percentile_high: 98.0,
            reflectance_ceiling: 0.3,
        }
    }
}

/// Channel normalizer
pub struct Normalizer {
    params: NormalizeParams,
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            params: NormalizeParams::default(),
        }
    }

    pub fn with_params(params: NormalizeParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &NormalizeParams {
        &self.params
    }

    /// Linear `0..reflectance_ceiling -> 0..255`
    pub fn fixed(&self, values: &Grid, valid: &ValidityMask) -> Array2<u8> {
        fixed_scale_to_8bit(values, valid, self.params.reflectance_ceiling)
    }

    /// Percentile stretch over the positive valid values
    pub fn stretch(&self, values: &Grid, valid: &ValidityMask) -> Array2<u8> {
        percentile_to_8bit(
            values,
            valid,
            self.params.percentile_low,
            self.params.percentile_high,
        )
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Scale values linearly so that `ceiling` maps to 255
///
/// Invalid pixels become 0.
pub fn fixed_scale_to_8bit(values: &Grid, valid: &ValidityMask, ceiling: f32) -> Array2<u8> {
    let ceiling = if ceiling > 0.0 { ceiling } else { 1.0 };
    Zip::from(values).and(valid).map_collect(|v, ok| {
        if *ok && v.is_finite() {
            to_byte(v / ceiling)
        } else {
            0
        }
    })
}

/// Percentile stretch to 8 bits
///
/// The clip range is taken from the positive valid values (defaults to 0..1
/// when there are none). Invalid pixels become 0.
pub fn percentile_to_8bit(values: &Grid, valid: &ValidityMask, low: f64, high: f64) -> Array2<u8> {
    let mut positive: Vec<f32> = values
        .iter()
        .zip(valid.iter())
        .filter_map(|(v, ok)| if *ok && *v > 0.0 { Some(*v) } else { None })
        .collect();

    let (lo, hi) = if positive.is_empty() {
        (0.0, 1.0)
    } else {
        positive.sort_by(|a, b| a.total_cmp(b));
        (percentile(&positive, low), percentile(&positive, high))
    };
    let range = if hi > lo { hi - lo } else { 1.0 };
    log::debug!("Percentile stretch {:.4}..{:.4}", lo, hi);

    Zip::from(values).and(valid).map_collect(|v, ok| {
        if *ok && v.is_finite() {
            to_byte((v - lo) / range)
        } else {
            0
        }
    })
}

/// Linear-interpolated percentile of sorted values, `q` in 0..=100
pub fn percentile(sorted: &[f32], q: f64) -> f32 {
    match sorted.len() {
        0 => f32::NAN,
        1 => sorted[0],
        n => {
            let pos = (q.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = pos.floor() as usize;
            let upper = (lower + 1).min(n - 1);
            let frac = (pos - lower as f64) as f32;
            sorted[lower] + (sorted[upper] - sorted[lower]) * frac
        }
    }
}

/// Stack three channels into a `(3, height, width)` tensor
pub fn stack_channels(channels: &[Array2<u8>; 3]) -> FusionOutcome<DisplayTensor> {
    let views: Vec<_> = channels.iter().map(|c| c.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|e| FusionError::RenderFailed(format!("Channel stack: {}", e)))
}

/// `[0, 1] -> [0, 255]`, truncating
fn to_byte(normalized: f32) -> u8 {
    (normalized.clamp(0.0, 1.0) * 255.0) as u8
}
