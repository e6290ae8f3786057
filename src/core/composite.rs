use crate::types::{FusionError, FusionOutcome, Grid, RasterBand, ValidityMask};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Per-pixel reduction applied to a stack of observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    /// Arithmetic mean of valid observations
    Mean,
    /// Median of valid observations
    #[default]
    Median,
    /// First observation whose quality mask is set, median otherwise
    BestPixel,
    /// Observation with the highest score (NDVI in the fusion pipeline)
    QualityMosaic,
}

impl FromStr for Reducer {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mean" | "average" => Ok(Reducer::Mean),
            "median" => Ok(Reducer::Median),
            "best_pixel" | "best-pixel" | "bestpixel" => Ok(Reducer::BestPixel),
            "mosaic" | "quality_mosaic" | "quality-mosaic" => Ok(Reducer::QualityMosaic),
            other => Err(FusionError::InvalidRequest(format!(
                "Unknown compositing method: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Reducer::Mean => "mean",
            Reducer::Median => "median",
            Reducer::BestPixel => "best_pixel",
            Reducer::QualityMosaic => "quality_mosaic",
        };
        write!(f, "{}", name)
    }
}

/// Optional per-observation inputs that steer the guided reducers
#[derive(Debug, Clone, Default)]
pub struct CompositeGuide {
    /// Usable-pixel masks for `BestPixel`, one per observation, in priority order
    pub quality_masks: Option<Vec<ValidityMask>>,
    /// Score grids for `QualityMosaic`, one per observation
    pub scores: Option<Vec<Grid>>,
}

/// Band compositor
pub struct BandCompositor {
    reducer: Reducer,
}

impl BandCompositor {
    pub fn new(reducer: Reducer) -> Self {
        Self { reducer }
    }

    pub fn reducer(&self) -> Reducer {
        self.reducer
    }

    /// Collapse an ordered stack of same-shape observations into one band
    pub fn reduce(&self, observations: &[RasterBand], guide: &CompositeGuide) -> FusionOutcome<RasterBand> {
        log::debug!(
            "Compositing {} observations with {}",
            observations.len(),
            self.reducer
        );
        match self.reducer {
            Reducer::Mean => composite_mean(observations),
            Reducer::Median => composite_median(observations),
            Reducer::BestPixel => composite_best_pixel(observations, guide.quality_masks.as_deref()),
            Reducer::QualityMosaic => match guide.scores.as_deref() {
                Some(scores) => quality_mosaic(observations, scores),
                None => {
                    log::debug!("No scores supplied for quality mosaic, using median");
                    composite_median(observations)
                }
            },
        }
    }
}

/// Elementwise mean over the valid observations at each pixel
pub fn composite_mean(observations: &[RasterBand]) -> FusionOutcome<RasterBand> {
    let shape = check_stack(observations)?;
    if observations.len() == 1 {
        return Ok(observations[0].clone());
    }
    let (data, valid) = map_pixels(shape, |row, col| {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for obs in observations {
            if let Some(v) = obs.get(row, col) {
                sum += v as f64;
                count += 1;
            }
        }
        if count == 0 {
            None
        } else {
            Some((sum / count as f64) as f32)
        }
    });
    Ok(RasterBand::from_parts(observations[0].band(), data, valid))
}

/// Elementwise median over the valid observations at each pixel
///
/// An even count yields the mean of the two middle values.
pub fn composite_median(observations: &[RasterBand]) -> FusionOutcome<RasterBand> {
    let shape = check_stack(observations)?;
    if observations.len() == 1 {
        return Ok(observations[0].clone());
    }
    let (data, valid) = map_pixels(shape, |row, col| pixel_median(observations, row, col));
    Ok(RasterBand::from_parts(observations[0].band(), data, valid))
}

/// Quality-guided selection
///
/// Per pixel the first observation (caller priority order) that is valid and
/// flagged usable by its quality mask wins. Pixels where no observation
/// qualifies take the median of the valid observations. Without masks this is
/// the median.
pub fn composite_best_pixel(
    observations: &[RasterBand],
    quality_masks: Option<&[ValidityMask]>,
) -> FusionOutcome<RasterBand> {
    let shape = check_stack(observations)?;
    let masks = match quality_masks {
        Some(masks) => masks,
        None => return composite_median(observations),
    };
    if masks.len() != observations.len() {
        return Err(FusionError::InvalidRequest(format!(
            "{} quality masks for {} observations",
            masks.len(),
            observations.len()
        )));
    }
    for mask in masks {
        if mask.dim() != shape {
            return Err(FusionError::ShapeMismatch {
                expected: shape,
                found: mask.dim(),
            });
        }
    }
    if observations.len() == 1 {
        return Ok(observations[0].clone());
    }

    let (data, valid) = map_pixels(shape, |row, col| {
        observations
            .iter()
            .zip(masks)
            .find_map(|(obs, mask)| if mask[[row, col]] { obs.get(row, col) } else { None })
            .or_else(|| pixel_median(observations, row, col))
    });
    Ok(RasterBand::from_parts(observations[0].band(), data, valid))
}

/// Pick, per pixel, the valid observation with the highest finite score
///
/// Ties go to the earlier observation. Pixels where no valid observation has
/// a finite score take the median of the valid observations.
pub fn quality_mosaic(observations: &[RasterBand], scores: &[Grid]) -> FusionOutcome<RasterBand> {
    let shape = check_stack(observations)?;
    if scores.len() != observations.len() {
        return Err(FusionError::InvalidRequest(format!(
            "{} score grids for {} observations",
            scores.len(),
            observations.len()
        )));
    }
    for score in scores {
        if score.dim() != shape {
            return Err(FusionError::ShapeMismatch {
                expected: shape,
                found: score.dim(),
            });
        }
    }
    if observations.len() == 1 {
        return Ok(observations[0].clone());
    }

    let (data, valid) = map_pixels(shape, |row, col| {
        let mut best: Option<(f32, f32)> = None;
        for (obs, score) in observations.iter().zip(scores) {
            let s = score[[row, col]];
            if !s.is_finite() {
                continue;
            }
            if let Some(v) = obs.get(row, col) {
                match best {
                    Some((best_score, _)) if s <= best_score => {}
                    _ => best = Some((s, v)),
                }
            }
        }
        best.map(|(_, v)| v).or_else(|| pixel_median(observations, row, col))
    });
    Ok(RasterBand::from_parts(observations[0].band(), data, valid))
}

/// Median of a slice of values; `None` when empty
pub fn median_of(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

fn pixel_median(observations: &[RasterBand], row: usize, col: usize) -> Option<f32> {
    let mut values: Vec<f32> = observations
        .iter()
        .filter_map(|obs| obs.get(row, col))
        .collect();
    median_of(&mut values)
}

fn check_stack(observations: &[RasterBand]) -> FusionOutcome<(usize, usize)> {
    let first = observations.first().ok_or_else(|| {
        FusionError::NoImageryFound("No observations to composite".to_string())
    })?;
    let shape = first.dim();
    for obs in &observations[1..] {
        obs.ensure_dim(shape)?;
    }
    Ok(shape)
}

/// Evaluate `f` at every pixel; `None` marks the pixel invalid
#[cfg(feature = "parallel")]
pub(crate) fn map_pixels<F>(shape: (usize, usize), f: F) -> (Grid, ValidityMask)
where
    F: Fn(usize, usize) -> Option<f32> + Sync,
{
    use rayon::prelude::*;

    let (height, width) = shape;
    let values: Vec<Option<f32>> = (0..height * width)
        .into_par_iter()
        .map(|k| f(k / width, k % width))
        .collect();
    collect_pixels(shape, values)
}

#[cfg(not(feature = "parallel"))]
pub(crate) fn map_pixels<F>(shape: (usize, usize), f: F) -> (Grid, ValidityMask)
where
    F: Fn(usize, usize) -> Option<f32> + Sync,
{
    let (height, width) = shape;
    let values: Vec<Option<f32>> = (0..height * width)
        .map(|k| f(k / width, k % width))
        .collect();
    collect_pixels(shape, values)
}

fn collect_pixels(shape: (usize, usize), values: Vec<Option<f32>>) -> (Grid, ValidityMask) {
    let (_, width) = shape;
    let data = Array2::from_shape_fn(shape, |(i, j)| values[i * width + j].unwrap_or(f32::NAN));
    let valid = Array2::from_shape_fn(shape, |(i, j)| values[i * width + j].is_some());
    (data, valid)
}
