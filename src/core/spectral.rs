//! Spectral indices
//!
//! All indices are normalized differences `(a - b) / (a + b)`. A zero
//! denominator yields 0, non-finite results are replaced by 0, and the result
//! is clipped to [-1, 1].

use crate::types::{BandId, FusionError, FusionOutcome, Grid, RasterBand, ValidityMask};
use ndarray::Zip;
use serde::{Deserialize, Serialize};

/// Supported normalized-difference indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectralIndex {
    /// Vegetation: (NIR - Red) / (NIR + Red)
    Ndvi,
    /// Water: (Green - NIR) / (Green + NIR)
    Ndwi,
    /// Built-up: (SWIR1 - NIR) / (SWIR1 + NIR)
    Ndbi,
}

impl SpectralIndex {
    /// `(a, b)` of `(a - b) / (a + b)`
    pub fn operands(&self) -> (BandId, BandId) {
        match self {
            SpectralIndex::Ndvi => (BandId::Nir, BandId::Red),
            SpectralIndex::Ndwi => (BandId::Green, BandId::Nir),
            SpectralIndex::Ndbi => (BandId::Swir16, BandId::Nir),
        }
    }
}

impl std::fmt::Display for SpectralIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpectralIndex::Ndvi => "ndvi",
            SpectralIndex::Ndwi => "ndwi",
            SpectralIndex::Ndbi => "ndbi",
        };
        write!(f, "{}", name)
    }
}

/// Index values with their validity
///
/// Invalid pixels hold `NaN`; valid pixels are within [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexGrid {
    pub kind: SpectralIndex,
    pub values: Grid,
    pub valid: ValidityMask,
}

impl IndexGrid {
    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    /// Valid values in row-major order
    pub fn valid_values(&self) -> Vec<f32> {
        self.values
            .iter()
            .zip(self.valid.iter())
            .filter_map(|(v, ok)| if *ok { Some(*v) } else { None })
            .collect()
    }

    /// Two grids can only be merged when they hold the same index on the same shape
    pub fn ensure_mergeable(&self, other: &IndexGrid) -> FusionOutcome<()> {
        if self.kind != other.kind {
            return Err(FusionError::InvalidRequest(format!(
                "Cannot merge {} with {}",
                self.kind, other.kind
            )));
        }
        if self.dim() != other.dim() {
            return Err(FusionError::ShapeMismatch {
                expected: self.dim(),
                found: other.dim(),
            });
        }
        Ok(())
    }

    /// Masked mean of two grids: both valid averages, one valid passes through
    pub fn average(&self, other: &IndexGrid) -> FusionOutcome<IndexGrid> {
        self.ensure_mergeable(other)?;
        let values = Zip::from(&self.values)
            .and(&self.valid)
            .and(&other.values)
            .and(&other.valid)
            .map_collect(|a, a_ok, b, b_ok| match (*a_ok, *b_ok) {
                (true, true) => (a + b) / 2.0,
                (true, false) => *a,
                (false, true) => *b,
                (false, false) => f32::NAN,
            });
        let valid = Zip::from(&self.valid)
            .and(&other.valid)
            .map_collect(|a, b| *a || *b);
        Ok(IndexGrid {
            kind: self.kind,
            values,
            valid,
        })
    }
}

/// Normalized difference of two plain grids with safe division
pub fn normalized_difference(a: &Grid, b: &Grid) -> FusionOutcome<Grid> {
    if a.dim() != b.dim() {
        return Err(FusionError::ShapeMismatch {
            expected: a.dim(),
            found: b.dim(),
        });
    }
    Ok(Zip::from(a).and(b).map_collect(|a, b| clamp_index(safe_ratio(*a, *b))))
}

/// NDVI = (NIR - Red) / (NIR + Red)
pub fn ndvi(nir: &Grid, red: &Grid) -> FusionOutcome<Grid> {
    normalized_difference(nir, red)
}

/// NDWI = (Green - NIR) / (Green + NIR)
pub fn ndwi(green: &Grid, nir: &Grid) -> FusionOutcome<Grid> {
    normalized_difference(green, nir)
}

/// NDBI = (SWIR - NIR) / (SWIR + NIR)
pub fn ndbi(swir: &Grid, nir: &Grid) -> FusionOutcome<Grid> {
    normalized_difference(swir, nir)
}

/// Index from two masked bands
///
/// A pixel is valid when both inputs are valid and the raw ratio is finite.
pub fn index_from_bands(kind: SpectralIndex, a: &RasterBand, b: &RasterBand) -> FusionOutcome<IndexGrid> {
    b.ensure_dim(a.dim())?;

    let raw = Zip::from(a.data()).and(b.data()).map_collect(|a, b| safe_ratio(*a, *b));
    let valid = Zip::from(&raw)
        .and(a.valid())
        .and(b.valid())
        .map_collect(|r, a_ok, b_ok| *a_ok && *b_ok && r.is_finite());
    let values = Zip::from(&raw)
        .and(&valid)
        .map_collect(|r, ok| if *ok { r.clamp(-1.0, 1.0) } else { f32::NAN });

    Ok(IndexGrid { kind, values, valid })
}

pub fn ndvi_band(nir: &RasterBand, red: &RasterBand) -> FusionOutcome<IndexGrid> {
    index_from_bands(SpectralIndex::Ndvi, nir, red)
}

pub fn ndwi_band(green: &RasterBand, nir: &RasterBand) -> FusionOutcome<IndexGrid> {
    index_from_bands(SpectralIndex::Ndwi, green, nir)
}

pub fn ndbi_band(swir: &RasterBand, nir: &RasterBand) -> FusionOutcome<IndexGrid> {
    index_from_bands(SpectralIndex::Ndbi, swir, nir)
}

/// Raw `(a - b) / (a + b)`, 0 for a zero denominator
fn safe_ratio(a: f32, b: f32) -> f32 {
    let denom = a + b;
    if denom == 0.0 {
        0.0
    } else {
        (a - b) / denom
    }
}

fn clamp_index(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
