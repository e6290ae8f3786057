use crate::core::spectral::{ndvi_band, IndexGrid};
use crate::types::{FusionOutcome, RasterBand};
use ndarray::Zip;

/// NDVI of the primary source, with holes filled from the secondary source
///
/// Pixels where neither source yields a valid NDVI stay invalid.
pub fn gap_fill(
    primary_nir: &RasterBand,
    primary_red: &RasterBand,
    secondary_nir: &RasterBand,
    secondary_red: &RasterBand,
) -> FusionOutcome<IndexGrid> {
    let primary = ndvi_band(primary_nir, primary_red)?;
    let secondary = ndvi_band(secondary_nir, secondary_red)?;
    gap_fill_index(&primary, &secondary)
}

/// Primary index where valid, secondary where the primary is not
pub fn gap_fill_index(primary: &IndexGrid, secondary: &IndexGrid) -> FusionOutcome<IndexGrid> {
    primary.ensure_mergeable(secondary)?;

    let values = Zip::from(&primary.values)
        .and(&primary.valid)
        .and(&secondary.values)
        .and(&secondary.valid)
        .map_collect(|p, p_ok, s, s_ok| {
            if *p_ok {
                *p
            } else if *s_ok {
                *s
            } else {
                f32::NAN
            }
        });
    let valid = Zip::from(&primary.valid)
        .and(&secondary.valid)
        .map_collect(|p, s| *p || *s);

    let filled = valid.iter().filter(|v| **v).count() - primary.valid_count();
    log::debug!(
        "Gap-filled {} of {} pixels from secondary {}",
        filled,
        valid.len(),
        secondary.kind
    );

    Ok(IndexGrid {
        kind: primary.kind,
        values,
        valid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::spectral::SpectralIndex;
    use crate::types::{BandId, FusionError, NoData};
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_primary_wins_where_valid() {
        let p_nir = RasterBand::new(BandId::Nir, array![[0.6f32, f32::NAN]], NoData::Nan);
        let p_red = RasterBand::new(BandId::Red, array![[0.2f32, 0.2]], NoData::Nan);
        let s_nir = RasterBand::new(BandId::Nir, array![[0.2f32, 0.3]], NoData::Nan);
        let s_red = RasterBand::new(BandId::Red, array![[0.6f32, 0.1]], NoData::Nan);

        let out = gap_fill(&p_nir, &p_red, &s_nir, &s_red).unwrap();
        assert_relative_eq!(out.values[[0, 0]], 0.5, epsilon = 1e-6);
        assert_relative_eq!(out.values[[0, 1]], 0.5, epsilon = 1e-6);
        assert!(out.valid.iter().all(|v| *v));
    }

    #[test]
    fn test_both_invalid_stays_invalid() {
        let nan = RasterBand::new(BandId::Nir, array![[f32::NAN]], NoData::Nan);
        let red = RasterBand::new(BandId::Red, array![[0.1f32]], NoData::Nan);
        let out = gap_fill(&nan, &red, &nan, &red).unwrap();
        assert!(!out.valid[[0, 0]]);
        assert!(out.values[[0, 0]].is_nan());
    }

    #[test]
    fn test_shape_mismatch() {
        let a = RasterBand::new(BandId::Nir, array![[0.1f32, 0.2]], NoData::Nan);
        let b = RasterBand::new(BandId::Nir, array![[0.1f32]], NoData::Nan);
        assert!(matches!(
            gap_fill(&a, &a, &b, &b),
            Err(FusionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_mixed_indices_rejected() {
        let grid = |kind| IndexGrid {
            kind,
            values: array![[0.4f32]],
            valid: array![[true]],
        };
        let ndvi = grid(SpectralIndex::Ndvi);
        let ndwi = grid(SpectralIndex::Ndwi);
        assert!(matches!(
            gap_fill_index(&ndvi, &ndwi),
            Err(FusionError::InvalidRequest(_))
        ));
        assert!(gap_fill_index(&ndvi, &grid(SpectralIndex::Ndvi)).is_ok());
    }
}
