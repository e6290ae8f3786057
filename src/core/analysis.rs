use crate::core::normalize::percentile;
use crate::core::resample::{ResampleMethod, Resampler};
use crate::core::spectral::{IndexGrid, SpectralIndex};
use crate::types::{FusionError, FusionOutcome};
use serde::{Deserialize, Serialize};

/// Share of valid NDVI pixels per vegetation class, in percent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegetationClassification {
    /// NDVI in [-0.1, 0.1)
    pub bare_soil_percent: f64,
    /// NDVI in [0.1, 0.3)
    pub sparse_vegetation_percent: f64,
    /// NDVI in [0.3, 0.6)
    pub moderate_vegetation_percent: f64,
    /// NDVI >= 0.6
    pub dense_vegetation_percent: f64,
}

/// Summary statistics over the valid pixels of an index grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStatistics {
    pub index: SpectralIndex,
    pub valid_pixels: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub percentile_25: f64,
    pub percentile_75: f64,
    /// Only computed for NDVI
    pub classification: Option<VegetationClassification>,
}

/// Statistics of a cross-sensor index comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexComparison {
    pub overlapping_pixels: usize,
    /// Pearson correlation, 0 when either side is constant
    pub correlation: f64,
    pub primary_mean: f64,
    pub secondary_mean: f64,
    pub mean_difference: f64,
    pub std_difference: f64,
    pub rmse: f64,
}

/// Statistics of an index grid, `None` when no pixel is valid
pub fn index_statistics(grid: &IndexGrid) -> Option<IndexStatistics> {
    let mut values = grid.valid_values();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    let variance = values.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;

    let classification = match grid.kind {
        SpectralIndex::Ndvi => {
            let share = |lo: f32, hi: f32| {
                let count = values.iter().filter(|v| **v >= lo && **v < hi).count();
                round2(count as f64 / n * 100.0)
            };
            Some(VegetationClassification {
                bare_soil_percent: share(-0.1, 0.1),
                sparse_vegetation_percent: share(0.1, 0.3),
                moderate_vegetation_percent: share(0.3, 0.6),
                dense_vegetation_percent: share(0.6, f32::INFINITY),
            })
        }
        _ => None,
    };

    Some(IndexStatistics {
        index: grid.kind,
        valid_pixels: values.len(),
        min: values[0] as f64,
        max: values[values.len() - 1] as f64,
        mean,
        std: variance.sqrt(),
        median: percentile(&values, 50.0) as f64,
        percentile_25: percentile(&values, 25.0) as f64,
        percentile_75: percentile(&values, 75.0) as f64,
        classification,
    })
}

/// Compare two index grids pixel by pixel
///
/// The secondary grid is resampled (bilinear) to the primary's shape when they
/// differ. Only pixels valid in both take part.
pub fn compare_indices(primary: &IndexGrid, secondary: &IndexGrid) -> FusionOutcome<IndexComparison> {
    let (sec_values, sec_valid) = Resampler::new(ResampleMethod::Bilinear).resample_with_mask(
        &secondary.values,
        &secondary.valid,
        primary.dim(),
    )?;

    let pairs: Vec<(f64, f64)> = primary
        .values
        .iter()
        .zip(primary.valid.iter())
        .zip(sec_values.iter().zip(sec_valid.iter()))
        .filter_map(|((p, p_ok), (s, s_ok))| {
            if *p_ok && *s_ok {
                Some((*p as f64, *s as f64))
            } else {
                None
            }
        })
        .collect();

    if pairs.is_empty() {
        return Err(FusionError::NoImageryFound(
            "No valid overlapping pixels to compare".to_string(),
        ));
    }

    let n = pairs.len() as f64;
    let p_mean = pairs.iter().map(|(p, _)| p).sum::<f64>() / n;
    let s_mean = pairs.iter().map(|(_, s)| s).sum::<f64>() / n;
    let diff_mean = p_mean - s_mean;

    let mut cov = 0.0;
    let mut p_var = 0.0;
    let mut s_var = 0.0;
    let mut diff_var = 0.0;
    let mut sq_sum = 0.0;
    for (p, s) in &pairs {
        let dp = p - p_mean;
        let ds = s - s_mean;
        cov += dp * ds;
        p_var += dp * dp;
        s_var += ds * ds;
        let d = p - s;
        diff_var += (d - diff_mean).powi(2);
        sq_sum += d * d;
    }

    let correlation = if p_var > 0.0 && s_var > 0.0 {
        cov / (p_var.sqrt() * s_var.sqrt())
    } else {
        0.0
    };

    Ok(IndexComparison {
        overlapping_pixels: pairs.len(),
        correlation,
        primary_mean: p_mean,
        secondary_mean: s_mean,
        mean_difference: diff_mean,
        std_difference: (diff_var / n).sqrt(),
        rmse: (sq_sum / n).sqrt(),
    })
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn grid(values: ndarray::Array2<f32>) -> IndexGrid {
        let valid = values.mapv(|v| v.is_finite());
        IndexGrid {
            kind: SpectralIndex::Ndvi,
            values,
            valid,
        }
    }

    #[test]
    fn test_ndvi_statistics() {
        let stats = index_statistics(&grid(array![[0.0f32, 0.2, 0.4, 0.8, f32::NAN]])).unwrap();
        assert_eq!(stats.valid_pixels, 4);
        assert_relative_eq!(stats.min, 0.0);
        assert_relative_eq!(stats.max, 0.8, epsilon = 1e-6);
        assert_relative_eq!(stats.mean, 0.35, epsilon = 1e-6);
        assert_relative_eq!(stats.median, 0.3, epsilon = 1e-6);
        let class = stats.classification.unwrap();
        assert_relative_eq!(class.bare_soil_percent, 25.0);
        assert_relative_eq!(class.sparse_vegetation_percent, 25.0);
        assert_relative_eq!(class.moderate_vegetation_percent, 25.0);
        assert_relative_eq!(class.dense_vegetation_percent, 25.0);
    }

    #[test]
    fn test_statistics_empty() {
        assert!(index_statistics(&grid(array![[f32::NAN]])).is_none());
    }

    #[test]
    fn test_compare_identical() {
        let a = grid(array![[0.1f32, 0.2], [0.3, 0.4]]);
        let cmp = compare_indices(&a, &a).unwrap();
        assert_relative_eq!(cmp.correlation, 1.0, epsilon = 1e-9);
        assert_relative_eq!(cmp.rmse, 0.0);
        assert_eq!(cmp.overlapping_pixels, 4);
    }

    #[test]
    fn test_compare_resamples_secondary() {
        let a = grid(ndarray::Array2::from_elem((4, 4), 0.5));
        let b = grid(ndarray::Array2::from_elem((2, 2), 0.3));
        let cmp = compare_indices(&a, &b).unwrap();
        assert_eq!(cmp.overlapping_pixels, 16);
        assert_relative_eq!(cmp.mean_difference, 0.2, epsilon = 1e-6);
        assert_relative_eq!(cmp.correlation, 0.0);
    }

    #[test]
    fn test_compare_no_overlap() {
        let a = grid(array![[0.1f32, f32::NAN]]);
        let b = grid(array![[f32::NAN, 0.2]]);
        assert!(matches!(compare_indices(&a, &b), Err(FusionError::NoImageryFound(_))));
    }
}
