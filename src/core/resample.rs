use crate::types::{BandId, FusionError, FusionOutcome, Grid, RasterBand, ValidityMask};
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Interpolation kernel used when changing grid shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleMethod {
    /// Copy the closest source pixel (exact values, used for categorical bands)
    Nearest,
    /// Weighted average of the four surrounding source pixels
    #[default]
    Bilinear,
}

impl FromStr for ResampleMethod {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(ResampleMethod::Nearest),
            "bilinear" | "linear" => Ok(ResampleMethod::Bilinear),
            other => Err(FusionError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// Grid resampler
///
/// Output pixel `i` samples source coordinate `i * (src - 1) / (dst - 1)` so the
/// corner pixels of both grids coincide. Coordinates outside the source clamp
/// to the nearest edge pixel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resampler {
    method: ResampleMethod,
}

impl Resampler {
    pub fn new(method: ResampleMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> ResampleMethod {
        self.method
    }

    /// Resample a plain grid to `target` `(height, width)`
    pub fn resample(&self, grid: &Grid, target: (usize, usize)) -> FusionOutcome<Grid> {
        check_shapes(grid.dim(), target)?;
        if grid.dim() == target {
            return Ok(grid.clone());
        }
        let valid = Array2::from_elem(grid.dim(), true);
        let (data, _) = self.resample_masked(grid, &valid, target);
        Ok(data)
    }

    /// Resample a band together with its validity mask
    pub fn resample_band(&self, band: &RasterBand, target: (usize, usize)) -> FusionOutcome<RasterBand> {
        check_shapes(band.dim(), target)?;
        if band.dim() == target {
            return Ok(band.clone());
        }
        log::debug!(
            "Resampling {} {:?} -> {:?} ({:?})",
            band.band(),
            band.dim(),
            target,
            self.method
        );
        let (data, valid) = self.resample_masked(band.data(), band.valid(), target);
        Ok(RasterBand::from_parts(band.band(), data, valid))
    }

    /// Resample a grid and a parallel validity mask
    pub fn resample_with_mask(
        &self,
        data: &Grid,
        valid: &ValidityMask,
        target: (usize, usize),
    ) -> FusionOutcome<(Grid, ValidityMask)> {
        check_shapes(data.dim(), target)?;
        if valid.dim() != data.dim() {
            return Err(FusionError::ShapeMismatch {
                expected: data.dim(),
                found: valid.dim(),
            });
        }
        if data.dim() == target {
            return Ok((data.clone(), valid.clone()));
        }
        Ok(self.resample_masked(data, valid, target))
    }

    /// Resample every band of a `(bands, height, width)` stack with the same factors
    pub fn resample_stack(&self, stack: &Array3<f32>, target: (usize, usize)) -> FusionOutcome<Array3<f32>> {
        let (bands, height, width) = stack.dim();
        check_shapes((height, width), target)?;
        if (height, width) == target {
            return Ok(stack.clone());
        }
        log::debug!("Resampling {}-band stack {:?} -> {:?}", bands, (height, width), target);

        let planes: Vec<Grid> = {
            #[cfg(feature = "parallel")]
            {
                use rayon::prelude::*;
                (0..bands)
                    .into_par_iter()
                    .map(|b| self.resample(&stack.index_axis(Axis(0), b).to_owned(), target))
                    .collect::<FusionOutcome<Vec<_>>>()?
            }
            #[cfg(not(feature = "parallel"))]
            {
                (0..bands)
                    .map(|b| self.resample(&stack.index_axis(Axis(0), b).to_owned(), target))
                    .collect::<FusionOutcome<Vec<_>>>()?
            }
        };

        let views: Vec<_> = planes.iter().map(|p| p.view()).collect();
        ndarray::stack(Axis(0), &views)
            .map_err(|e| FusionError::InvalidRequest(format!("Stack error: {}", e)))
    }

    fn resample_masked(&self, data: &Grid, valid: &ValidityMask, target: (usize, usize)) -> (Grid, ValidityMask) {
        let (src_h, src_w) = data.dim();
        let (dst_h, dst_w) = target;
        let rows: Vec<f64> = (0..dst_h).map(|i| source_coordinate(i, src_h, dst_h)).collect();
        let cols: Vec<f64> = (0..dst_w).map(|j| source_coordinate(j, src_w, dst_w)).collect();

        match self.method {
            ResampleMethod::Nearest => {
                let pick = |coord: f64, len: usize| (coord.round() as usize).min(len - 1);
                let out_valid = Array2::from_shape_fn(target, |(i, j)| {
                    valid[[pick(rows[i], src_h), pick(cols[j], src_w)]]
                });
                let out = Array2::from_shape_fn(target, |(i, j)| {
                    data[[pick(rows[i], src_h), pick(cols[j], src_w)]]
                });
                (out, out_valid)
            }
            ResampleMethod::Bilinear => {
                let mut out = Array2::<f32>::zeros(target);
                let mut out_valid = Array2::from_elem(target, false);
                for (i, &y) in rows.iter().enumerate() {
                    let (y1, y2, wy) = neighbours(y, src_h);
                    for (j, &x) in cols.iter().enumerate() {
                        let (x1, x2, wx) = neighbours(x, src_w);
                        let taps = [
                            (y1, x1, (1.0 - wy) * (1.0 - wx)),
                            (y1, x2, (1.0 - wy) * wx),
                            (y2, x1, wy * (1.0 - wx)),
                            (y2, x2, wy * wx),
                        ];
                        let mut ok = true;
                        let mut value = 0.0f64;
                        for &(r, c, w) in &taps {
                            if w <= 0.0 {
                                continue;
                            }
                            if !valid[[r, c]] {
                                ok = false;
                                break;
                            }
                            value += w * data[[r, c]] as f64;
                        }
                        if ok {
                            out[[i, j]] = value as f32;
                            out_valid[[i, j]] = true;
                        }
                    }
                }
                (out, out_valid)
            }
        }
    }
}

/// Resample a band with the given method
pub fn resample(band: &RasterBand, target: (usize, usize), method: ResampleMethod) -> FusionOutcome<RasterBand> {
    Resampler::new(method).resample_band(band, target)
}

/// Method appropriate for a band: categorical QA bands must not be interpolated
pub fn method_for_band(band: BandId, default: ResampleMethod) -> ResampleMethod {
    match band {
        BandId::Qa => ResampleMethod::Nearest,
        _ => default,
    }
}

fn check_shapes(source: (usize, usize), target: (usize, usize)) -> FusionOutcome<()> {
    if source.0 == 0 || source.1 == 0 {
        return Err(FusionError::InvalidRequest(format!(
            "Cannot resample empty grid {:?}",
            source
        )));
    }
    if target.0 == 0 || target.1 == 0 {
        return Err(FusionError::InvalidRequest(format!(
            "Cannot resample to empty shape {:?}",
            target
        )));
    }
    Ok(())
}

fn source_coordinate(index: usize, src_len: usize, dst_len: usize) -> f64 {
    if dst_len <= 1 || src_len <= 1 {
        return 0.0;
    }
    index as f64 * (src_len - 1) as f64 / (dst_len - 1) as f64
}

/// Lower/upper neighbour indices and the fractional weight of the upper one
fn neighbours(coord: f64, len: usize) -> (usize, usize, f64) {
    let lower = (coord.floor().max(0.0) as usize).min(len - 1);
    let upper = (lower + 1).min(len - 1);
    let frac = if upper == lower { 0.0 } else { coord - lower as f64 };
    (lower, upper, frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NoData;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_identity_is_unchanged() {
        let grid = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        for method in [ResampleMethod::Nearest, ResampleMethod::Bilinear] {
            let out = Resampler::new(method).resample(&grid, (2, 3)).unwrap();
            assert_eq!(out, grid);
        }
    }

    #[test]
    fn test_bilinear_upsample_corner_aligned() {
        let grid = array![[0.0f32, 10.0], [20.0, 30.0]];
        let out = Resampler::new(ResampleMethod::Bilinear).resample(&grid, (3, 3)).unwrap();
        assert_relative_eq!(out[[0, 0]], 0.0);
        assert_relative_eq!(out[[0, 1]], 5.0);
        assert_relative_eq!(out[[1, 1]], 15.0);
        assert_relative_eq!(out[[2, 2]], 30.0);
    }

    #[test]
    fn test_nearest_preserves_values() {
        let grid = array![[1.0f32, 2.0], [3.0, 4.0]];
        let out = Resampler::new(ResampleMethod::Nearest).resample(&grid, (6, 6)).unwrap();
        for v in out.iter() {
            assert!([1.0, 2.0, 3.0, 4.0].contains(v));
        }
        assert_eq!(out[[0, 0]], 1.0);
        assert_eq!(out[[5, 5]], 4.0);
    }

    #[test]
    fn test_bilinear_mask_propagation() {
        let band = RasterBand::new(
            BandId::Red,
            array![[1.0f32, f32::NAN], [1.0, 1.0]],
            NoData::Nan,
        );
        let out = resample(&band, (3, 3), ResampleMethod::Bilinear).unwrap();
        // Exact corner hit on a valid pixel stays valid
        assert!(out.valid()[[0, 0]]);
        assert!(out.valid()[[2, 0]]);
        // Anything touching the invalid corner with non-zero weight is invalid
        assert!(!out.valid()[[0, 2]]);
        assert!(!out.valid()[[1, 1]]);
        assert!(out.data()[[1, 1]].is_nan());
    }

    #[test]
    fn test_downsample_shape() {
        let grid = Array2::from_shape_fn((9, 9), |(i, j)| (i * 9 + j) as f32);
        let out = Resampler::new(ResampleMethod::Bilinear).resample(&grid, (3, 3)).unwrap();
        assert_eq!(out.dim(), (3, 3));
        assert_relative_eq!(out[[1, 1]], 40.0);
    }

    #[test]
    fn test_stack_resamples_each_band() {
        let stack = Array3::from_shape_fn((2, 2, 2), |(b, _, _)| b as f32 + 1.0);
        let out = Resampler::default().resample_stack(&stack, (4, 5)).unwrap();
        assert_eq!(out.dim(), (2, 4, 5));
        assert!(out.index_axis(Axis(0), 0).iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(out.index_axis(Axis(0), 1).iter().all(|v| (*v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_unsupported_method_names() {
        assert_eq!("nearest".parse::<ResampleMethod>().unwrap(), ResampleMethod::Nearest);
        assert_eq!("Bilinear".parse::<ResampleMethod>().unwrap(), ResampleMethod::Bilinear);
        for name in ["bicubic", "cubic", "lanczos"] {
            assert!(matches!(
                name.parse::<ResampleMethod>(),
                Err(FusionError::UnsupportedMethod(_))
            ));
        }
    }

    #[test]
    fn test_empty_target_rejected() {
        let grid = array![[1.0f32]];
        assert!(Resampler::default().resample(&grid, (0, 3)).is_err());
    }
}
