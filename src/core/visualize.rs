use crate::core::spectral::SpectralIndex;
use crate::types::{BandId, DisplayTensor, FusionError, Grid, ValidityMask};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Output rendering of a fusion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationMode {
    /// Red, green, blue
    #[default]
    TrueColor,
    /// NIR, red, green (vegetation in red)
    FalseColorNir,
    /// SWIR2, NIR, red (burn scars, geology)
    FalseColorSwir,
    Ndvi,
    Ndwi,
    Ndbi,
    /// Land surface temperature from the thermal band
    Lst,
    /// SWIR2, narrow NIR, blue (agriculture)
    Sci,
    /// Even blend of true colour and SWIR2/SWIR1/red
    TrueColorSwir,
}

impl VisualizationMode {
    pub const ALL: [VisualizationMode; 9] = [
        VisualizationMode::TrueColor,
        VisualizationMode::FalseColorNir,
        VisualizationMode::FalseColorSwir,
        VisualizationMode::Ndvi,
        VisualizationMode::Ndwi,
        VisualizationMode::Ndbi,
        VisualizationMode::Lst,
        VisualizationMode::Sci,
        VisualizationMode::TrueColorSwir,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            VisualizationMode::TrueColor => "true_color",
            VisualizationMode::FalseColorNir => "false_color_nir",
            VisualizationMode::FalseColorSwir => "false_color_swir",
            VisualizationMode::Ndvi => "ndvi",
            VisualizationMode::Ndwi => "ndwi",
            VisualizationMode::Ndbi => "ndbi",
            VisualizationMode::Lst => "lst",
            VisualizationMode::Sci => "sci",
            VisualizationMode::TrueColorSwir => "true_color_swir",
        }
    }

    /// How to derive the RGB output from source bands
    pub fn recipe(&self) -> Recipe {
        use BandId::*;
        match self {
            VisualizationMode::TrueColor => Recipe::Composite {
                channels: [&[(Red, 1.0)], &[(Green, 1.0)], &[(Blue, 1.0)]],
                scaling: ChannelScaling::Fixed,
            },
            VisualizationMode::FalseColorNir => Recipe::Composite {
                channels: [&[(Nir, 1.0)], &[(Red, 1.0)], &[(Green, 1.0)]],
                scaling: ChannelScaling::Percentile,
            },
            VisualizationMode::FalseColorSwir => Recipe::Composite {
                channels: [&[(Swir22, 1.0)], &[(Nir, 1.0)], &[(Red, 1.0)]],
                scaling: ChannelScaling::Percentile,
            },
            VisualizationMode::Sci => Recipe::Composite {
                channels: [&[(Swir22, 1.0)], &[(NirNarrow, 1.0)], &[(Blue, 1.0)]],
                scaling: ChannelScaling::Percentile,
            },
            VisualizationMode::TrueColorSwir => Recipe::Composite {
                channels: [
                    &[(Red, 0.5), (Swir22, 0.5)],
                    &[(Green, 0.5), (Swir16, 0.5)],
                    &[(Blue, 0.5), (Red, 0.5)],
                ],
                scaling: ChannelScaling::Percentile,
            },
            VisualizationMode::Ndvi => Recipe::Index {
                index: SpectralIndex::Ndvi,
                palette: Palette::NDVI,
            },
            VisualizationMode::Ndwi => Recipe::Index {
                index: SpectralIndex::Ndwi,
                palette: Palette::NDWI,
            },
            VisualizationMode::Ndbi => Recipe::Index {
                index: SpectralIndex::Ndbi,
                palette: Palette::NDBI,
            },
            VisualizationMode::Lst => Recipe::Thermal {
                palette: Palette::LST,
            },
        }
    }

    /// Logical bands that must be fetched to render this mode
    pub fn required_bands(&self) -> BTreeSet<BandId> {
        match self.recipe() {
            Recipe::Composite { channels, .. } => channels
                .iter()
                .flat_map(|c| c.iter().map(|(band, _)| *band))
                .collect(),
            Recipe::Index { index, .. } => {
                let (a, b) = index.operands();
                [a, b].into_iter().collect()
            }
            Recipe::Thermal { .. } => [BandId::Thermal].into_iter().collect(),
        }
    }
}

impl FromStr for VisualizationMode {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        VisualizationMode::ALL
            .iter()
            .copied()
            .find(|m| m.name() == lower)
            .ok_or_else(|| FusionError::InvalidRequest(format!("Unknown visualization: {}", s)))
    }
}

impl std::fmt::Display for VisualizationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Weighted band sum feeding one output channel
pub type ChannelRecipe = &'static [(BandId, f32)];

/// Scaling applied to composite channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelScaling {
    /// Reflectance `0..ceiling` mapped linearly
    Fixed,
    /// Per-channel percentile stretch
    Percentile,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Recipe {
    Composite {
        channels: [ChannelRecipe; 3],
        scaling: ChannelScaling,
    },
    Index {
        index: SpectralIndex,
        palette: Palette,
    },
    Thermal {
        palette: Palette,
    },
}

const BROWN: [u8; 3] = [165, 42, 42];
const YELLOW: [u8; 3] = [255, 255, 0];
const GREEN: [u8; 3] = [0, 128, 0];
const CYAN: [u8; 3] = [0, 255, 255];
const BLUE: [u8; 3] = [0, 0, 255];
const GRAY: [u8; 3] = [128, 128, 128];
const WHITE: [u8; 3] = [255, 255, 255];
const RED: [u8; 3] = [255, 0, 0];

/// Evenly spaced colour ramp over `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Palette {
    pub stops: &'static [[u8; 3]],
    pub min: f32,
    pub max: f32,
}

impl Palette {
    pub const NDVI: Palette = Palette {
        stops: &[BROWN, YELLOW, GREEN],
        min: -0.2,
        max: 0.8,
    };
    pub const NDWI: Palette = Palette {
        stops: &[BROWN, YELLOW, CYAN, BLUE],
        min: -1.0,
        max: 1.0,
    };
    pub const NDBI: Palette = Palette {
        stops: &[BLUE, GRAY, WHITE],
        min: -0.3,
        max: 0.5,
    };
    /// Kelvin
    pub const LST: Palette = Palette {
        stops: &[BLUE, CYAN, GREEN, YELLOW, RED],
        min: 273.0,
        max: 323.0,
    };

    /// Colour of a value, clamped to the palette range
    pub fn color(&self, value: f32) -> [u8; 3] {
        let n = self.stops.len();
        if n == 1 {
            return self.stops[0];
        }
        let t = ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0);
        let pos = t * (n - 1) as f32;
        let lower = (pos.floor() as usize).min(n - 2);
        let frac = pos - lower as f32;
        let a = self.stops[lower];
        let b = self.stops[lower + 1];
        let mut out = [0u8; 3];
        for c in 0..3 {
            let v = a[c] as f32 + (b[c] as f32 - a[c] as f32) * frac;
            out[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        out
    }

    /// Render values to RGB; invalid pixels are black
    pub fn apply(&self, values: &Grid, valid: &ValidityMask) -> DisplayTensor {
        let (height, width) = values.dim();
        let mut out = Array3::<u8>::zeros((3, height, width));
        for ((i, j), v) in values.indexed_iter() {
            if !valid[[i, j]] || !v.is_finite() {
                continue;
            }
            let rgb = self.color(*v);
            for c in 0..3 {
                out[[c, i, j]] = rgb[c];
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_palette_endpoints() {
        assert_eq!(Palette::NDVI.color(-0.2), BROWN);
        assert_eq!(Palette::NDVI.color(0.3), YELLOW);
        assert_eq!(Palette::NDVI.color(0.8), GREEN);
        // Clamped outside the range
        assert_eq!(Palette::NDVI.color(-1.0), BROWN);
        assert_eq!(Palette::LST.color(400.0), RED);
        assert_eq!(Palette::NDBI.color(0.1), GRAY);
    }

    #[test]
    fn test_palette_invalid_is_black() {
        let values = array![[0.8f32, 0.8]];
        let valid = array![[true, false]];
        let rgb = Palette::NDVI.apply(&values, &valid);
        assert_eq!(rgb.dim(), (3, 1, 2));
        assert_eq!([rgb[[0, 0, 0]], rgb[[1, 0, 0]], rgb[[2, 0, 0]]], GREEN);
        assert_eq!([rgb[[0, 0, 1]], rgb[[1, 0, 1]], rgb[[2, 0, 1]]], [0, 0, 0]);
    }

    #[test]
    fn test_required_bands() {
        let bands = VisualizationMode::TrueColorSwir.required_bands();
        assert_eq!(bands.len(), 5);
        assert!(bands.contains(&BandId::Swir16));
        let bands = VisualizationMode::Ndwi.required_bands();
        assert!(bands.contains(&BandId::Green) && bands.contains(&BandId::Nir));
        assert_eq!(
            VisualizationMode::Lst.required_bands().into_iter().collect::<Vec<_>>(),
            vec![BandId::Thermal]
        );
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in VisualizationMode::ALL {
            assert_eq!(mode.name().parse::<VisualizationMode>().unwrap(), mode);
        }
        assert!("combined".parse::<VisualizationMode>().is_err());
    }

    #[test]
    fn test_only_true_color_uses_fixed_scale() {
        for mode in VisualizationMode::ALL {
            if let Recipe::Composite { scaling, .. } = mode.recipe() {
                assert_eq!(scaling == ChannelScaling::Fixed, mode == VisualizationMode::TrueColor);
            }
        }
    }
}
