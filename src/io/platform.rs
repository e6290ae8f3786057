//! Sensor platform catalogue: resolutions, band naming, radiometric scaling,
//! quality flags and revisit periods.

use crate::types::{BandId, DateRange, FusionError, RasterBand, ValidityMask};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Imaging platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    /// Sentinel-2 MSI, 10 m
    #[serde(rename = "sentinel")]
    Sentinel2,
    /// Landsat 8/9 OLI/TIRS, 30 m
    #[serde(rename = "landsat")]
    Landsat,
}

/// Sentinel-2 scene classification values treated as usable
/// (vegetation, bare soil, water, unclassified, snow)
const S2_USABLE_SCL: [u16; 5] = [4, 5, 6, 7, 11];

/// Landsat QA_PIXEL bits: fill, dilated cloud, cirrus, cloud, cloud shadow
const LANDSAT_QA_REJECT_BITS: u16 = 0b1_1111;

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Sentinel2, Platform::Landsat];

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Sentinel2 => "sentinel",
            Platform::Landsat => "landsat",
        }
    }

    /// Native ground sampling distance in meters
    pub fn native_resolution_m(&self) -> f64 {
        match self {
            Platform::Sentinel2 => 10.0,
            Platform::Landsat => 30.0,
        }
    }

    /// Days between successive acquisitions of the same area
    pub fn revisit_days(&self) -> i64 {
        match self {
            Platform::Sentinel2 => 5,
            Platform::Landsat => 8,
        }
    }

    /// Band this platform actually provides for a logical band
    ///
    /// Landsat has a single NIR band which stands in for the narrow NIR.
    /// Returns `None` when the platform has no equivalent.
    pub fn resolve_band(&self, band: BandId) -> Option<BandId> {
        match (self, band) {
            (Platform::Sentinel2, BandId::Thermal) => None,
            (Platform::Landsat, BandId::RedEdge1 | BandId::RedEdge2 | BandId::RedEdge3) => None,
            (Platform::Landsat, BandId::NirNarrow) => Some(BandId::Nir),
            (_, band) => Some(band),
        }
    }

    /// Asset name of a band in the platform's product
    pub fn native_band_name(&self, band: BandId) -> Option<&'static str> {
        let band = self.resolve_band(band)?;
        let name = match self {
            Platform::Sentinel2 => match band {
                BandId::Blue => "B2",
                BandId::Green => "B3",
                BandId::Red => "B4",
                BandId::RedEdge1 => "B5",
                BandId::RedEdge2 => "B6",
                BandId::RedEdge3 => "B7",
                BandId::Nir => "B8",
                BandId::NirNarrow => "B8A",
                BandId::Swir16 => "B11",
                BandId::Swir22 => "B12",
                BandId::Qa => "SCL",
                BandId::Thermal => return None,
            },
            Platform::Landsat => match band {
                BandId::Blue => "SR_B2",
                BandId::Green => "SR_B3",
                BandId::Red => "SR_B4",
                BandId::Nir => "SR_B5",
                BandId::Swir16 => "SR_B6",
                BandId::Swir22 => "SR_B7",
                BandId::Thermal => "ST_B10",
                BandId::Qa => "QA_PIXEL",
                _ => return None,
            },
        };
        Some(name)
    }

    /// `(scale, offset)` turning digital numbers into physical units
    ///
    /// Surface reflectance for optical bands, Kelvin for thermal, identity for QA.
    pub fn radiometric_scaling(&self, band: BandId) -> (f32, f32) {
        match (self, band) {
            (_, BandId::Qa) => (1.0, 0.0),
            (Platform::Sentinel2, _) => (0.0001, 0.0),
            (Platform::Landsat, BandId::Thermal) => (0.003_418_02, 149.0),
            (Platform::Landsat, _) => (0.000_027_5, -0.2),
        }
    }

    /// Apply radiometric scaling to a band of digital numbers
    ///
    /// Reflectance is clamped to [0, 1].
    pub fn to_physical(&self, band: &RasterBand) -> RasterBand {
        let (scale, offset) = self.radiometric_scaling(band.band());
        match band.band() {
            BandId::Qa => band.clone(),
            BandId::Thermal => band.map_valid(band.band(), |dn| dn * scale + offset),
            _ => band.map_valid(band.band(), |dn| (dn * scale + offset).clamp(0.0, 1.0)),
        }
    }

    /// Decode a QA band into a usable-pixel mask
    pub fn decode_quality(&self, qa: &RasterBand) -> ValidityMask {
        let data = qa.data();
        let mut usable = ValidityMask::from_elem(qa.dim(), false);
        for ((i, j), ok) in usable.indexed_iter_mut() {
            if !qa.valid()[[i, j]] {
                continue;
            }
            let v = data[[i, j]];
            if v < 0.0 || v > u16::MAX as f32 {
                continue;
            }
            let code = v.round() as u16;
            *ok = match self {
                Platform::Sentinel2 => S2_USABLE_SCL.contains(&code),
                Platform::Landsat => code & LANDSAT_QA_REJECT_BITS == 0,
            };
        }
        usable
    }

    /// Observation dates covering a range, newest first
    ///
    /// Each date stands for the revisit-period slot ending on it.
    pub fn observation_slots(&self, range: &DateRange, max_slots: usize) -> Vec<NaiveDate> {
        let step = Duration::days(self.revisit_days());
        let mut slots = Vec::new();
        let mut date = range.end;
        while date >= range.start && slots.len() < max_slots {
            slots.push(date);
            date = match date.checked_sub_signed(step) {
                Some(d) => d,
                None => break,
            };
        }
        slots
    }

    /// Date range of the slot ending on `slot_end`, limited to `range`
    pub fn slot_range(&self, range: &DateRange, slot_end: NaiveDate) -> DateRange {
        let start = slot_end
            .checked_sub_signed(Duration::days(self.revisit_days() - 1))
            .unwrap_or(range.start)
            .max(range.start);
        DateRange {
            start,
            end: slot_end.min(range.end),
        }
    }
}

impl FromStr for Platform {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sentinel" | "sentinel2" | "sentinel-2" | "s2" => Ok(Platform::Sentinel2),
            "landsat" | "landsat8" | "landsat9" | "l8" | "l9" => Ok(Platform::Landsat),
            other => Err(FusionError::InvalidRequest(format!("Unknown platform: {}", other))),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
