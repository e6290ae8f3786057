use chrono::NaiveDate;
use geo_types::Polygon;
use ndarray::{Array2, Array3, Zip};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::core::analysis::IndexStatistics;
use crate::core::composite::Reducer;
use crate::core::fusion::CrossSensorPolicy;
use crate::core::visualize::VisualizationMode;
use crate::io::platform::Platform;

/// Single-band numeric grid (height x width)
pub type Grid = Array2<f32>;

/// Per-pixel validity mask, `true` marks usable data
pub type ValidityMask = Array2<bool>;

/// 8-bit display tensor (band x height x width)
pub type DisplayTensor = Array3<u8>;

/// Geographic bounding box in degrees (EPSG:4326)
///
/// Always satisfies `west < east` and `south < north`. Construct through
/// [`GeoWindow::new`] or the calculator in [`crate::core::geowindow`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 4]", into = "[f64; 4]")]
pub struct GeoWindow {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
}

impl GeoWindow {
    /// Validated constructor, see [`crate::core::geowindow::validate_window`]
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> FusionOutcome<Self> {
        crate::core::geowindow::validate_window([west, south, east, north])
    }

    pub(crate) fn from_validated(bounds: [f64; 4]) -> Self {
        Self {
            west: bounds[0],
            south: bounds[1],
            east: bounds[2],
            north: bounds[3],
        }
    }

    pub fn west(&self) -> f64 {
        self.west
    }

    pub fn south(&self) -> f64 {
        self.south
    }

    pub fn east(&self) -> f64 {
        self.east
    }

    pub fn north(&self) -> f64 {
        self.north
    }

    /// `[west, south, east, north]`
    pub fn bounds(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }

    /// `(lon, lat)` of the window center
    pub fn center(&self) -> (f64, f64) {
        ((self.west + self.east) / 2.0, (self.south + self.north) / 2.0)
    }

    pub fn width_deg(&self) -> f64 {
        self.east - self.west
    }

    pub fn height_deg(&self) -> f64 {
        self.north - self.south
    }
}

impl TryFrom<[f64; 4]> for GeoWindow {
    type Error = FusionError;

    fn try_from(bounds: [f64; 4]) -> Result<Self, Self::Error> {
        crate::core::geowindow::validate_window(bounds)
    }
}

impl From<GeoWindow> for [f64; 4] {
    fn from(window: GeoWindow) -> Self {
        window.bounds()
    }
}

/// Logical spectral band, independent of any platform's naming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandId {
    Blue,
    Green,
    Red,
    RedEdge1,
    RedEdge2,
    RedEdge3,
    Nir,
    NirNarrow,
    Swir16,
    Swir22,
    Thermal,
    Qa,
}

impl std::fmt::Display for BandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BandId::Blue => "blue",
            BandId::Green => "green",
            BandId::Red => "red",
            BandId::RedEdge1 => "red_edge_1",
            BandId::RedEdge2 => "red_edge_2",
            BandId::RedEdge3 => "red_edge_3",
            BandId::Nir => "nir",
            BandId::NirNarrow => "nir_narrow",
            BandId::Swir16 => "swir16",
            BandId::Swir22 => "swir22",
            BandId::Thermal => "thermal",
            BandId::Qa => "qa",
        };
        write!(f, "{}", name)
    }
}

/// How a source marks missing pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NoData {
    /// Non-finite values are invalid
    Nan,
    /// The given value (and any non-finite value) is invalid
    Sentinel(f32),
}

/// A single band of raster data with an explicit validity mask
///
/// The nodata convention is resolved once, at construction: invalid pixels
/// are `false` in the mask and hold `NaN` in the value grid. Bands are never
/// mutated in place; every transform returns a new band.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBand {
    band: BandId,
    data: Grid,
    valid: ValidityMask,
}

impl RasterBand {
    /// Build a band from raw values using a nodata convention
    pub fn new(band: BandId, data: Grid, nodata: NoData) -> Self {
        let valid = match nodata {
            NoData::Nan => data.mapv(|v| v.is_finite()),
            NoData::Sentinel(sentinel) => data.mapv(|v| v.is_finite() && v != sentinel),
        };
        Self::from_parts(band, data, valid)
    }

    /// Build a band from values and an explicit mask
    pub fn with_mask(band: BandId, data: Grid, valid: ValidityMask) -> FusionOutcome<Self> {
        if data.dim() != valid.dim() {
            return Err(FusionError::ShapeMismatch {
                expected: data.dim(),
                found: valid.dim(),
            });
        }
        // Non-finite values are never valid, whatever the caller's mask says
        let valid = Zip::from(&data)
            .and(&valid)
            .map_collect(|v, ok| *ok && v.is_finite());
        Ok(Self::from_parts(band, data, valid))
    }

    pub(crate) fn from_parts(band: BandId, mut data: Grid, valid: ValidityMask) -> Self {
        Zip::from(&mut data).and(&valid).for_each(|v, ok| {
            if !*ok {
                *v = f32::NAN;
            }
        });
        Self { band, data, valid }
    }

    pub fn band(&self) -> BandId {
        self.band
    }

    pub fn data(&self) -> &Grid {
        &self.data
    }

    pub fn valid(&self) -> &ValidityMask {
        &self.valid
    }

    /// `(height, width)`
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    /// Value at a pixel, `None` if invalid
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if self.valid[[row, col]] {
            Some(self.data[[row, col]])
        } else {
            None
        }
    }

    /// Apply `f` to every valid pixel, producing a new band
    pub fn map_valid<F>(&self, band: BandId, f: F) -> Self
    where
        F: Fn(f32) -> f32,
    {
        let data = self.data.mapv(|v| if v.is_finite() { f(v) } else { v });
        let valid = Zip::from(&data)
            .and(&self.valid)
            .map_collect(|v, ok| *ok && v.is_finite());
        Self::from_parts(band, data, valid)
    }

    /// Same values under a different band id
    pub fn relabel(&self, band: BandId) -> Self {
        Self {
            band,
            data: self.data.clone(),
            valid: self.valid.clone(),
        }
    }

    pub fn into_parts(self) -> (BandId, Grid, ValidityMask) {
        (self.band, self.data, self.valid)
    }

    /// Returns `ShapeMismatch` unless `self` has the given shape
    pub fn ensure_dim(&self, expected: (usize, usize)) -> FusionOutcome<()> {
        if self.dim() != expected {
            return Err(FusionError::ShapeMismatch {
                expected,
                found: self.dim(),
            });
        }
        Ok(())
    }
}

/// Inclusive acquisition date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> FusionOutcome<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    /// Parse `YYYY-MM-DD` dates
    pub fn parse(start: &str, end: &str) -> FusionOutcome<Self> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|e| FusionError::InvalidRequest(format!("Invalid date '{}': {}", s, e)))
        };
        Self::new(parse(start)?, parse(end)?)
    }

    pub fn validate(&self) -> FusionOutcome<()> {
        if self.start > self.end {
            return Err(FusionError::InvalidRequest(format!(
                "Start date {} is after end date {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Number of days covered, both ends included
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Acquisition metadata attached to a platform composite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionMetadata {
    pub date_range: DateRange,
    pub cloud_cover_ceiling: f64,
    pub reducer: Reducer,
    pub observations_used: usize,
    pub observations_dropped: usize,
}

/// One platform's composited band set for a window and date range
#[derive(Debug, Clone)]
pub struct SceneSource {
    pub platform: Platform,
    pub bands: BTreeMap<BandId, RasterBand>,
    pub metadata: AcquisitionMetadata,
}

impl SceneSource {
    /// Band lookup through the platform's band substitution table
    pub fn band(&self, logical: BandId) -> Option<&RasterBand> {
        self.platform
            .resolve_band(logical)
            .and_then(|band| self.bands.get(&band))
    }

    /// Shape shared by every band of the source
    pub fn dim(&self) -> Option<(usize, usize)> {
        self.bands.values().next().map(|b| b.dim())
    }
}

/// Parameters of one fusion run
///
/// The canonical serialization of this value (see
/// [`crate::io::cache::TieredCache::cache_key`]) addresses the cache, so every
/// field that affects the output lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionRequest {
    pub window: GeoWindow,
    pub date_range: DateRange,
    /// Maximum scene cloud cover in percent (0-100)
    pub cloud_cover_ceiling: f64,
    pub visualization: VisualizationMode,
    pub reducer: Reducer,
    pub platforms: BTreeSet<Platform>,
    /// Clip region; takes precedence over `window` when present
    pub polygon: Option<Polygon<f64>>,
    pub cross_sensor: CrossSensorPolicy,
}

impl FusionRequest {
    /// Request over a window with default settings: 20% cloud ceiling, true
    /// colour, median compositing, both platforms
    pub fn new(window: GeoWindow, date_range: DateRange) -> Self {
        Self {
            window,
            date_range,
            cloud_cover_ceiling: 20.0,
            visualization: VisualizationMode::default(),
            reducer: Reducer::default(),
            platforms: [Platform::Sentinel2, Platform::Landsat].into_iter().collect(),
            polygon: None,
            cross_sensor: CrossSensorPolicy::default(),
        }
    }

    /// Request over a polygon; the window is the polygon's bounding box
    pub fn from_polygon(polygon: Polygon<f64>, date_range: DateRange) -> FusionOutcome<Self> {
        let window = crate::core::geowindow::polygon_window(&polygon)?;
        Ok(Self::new(window, date_range).with_polygon(polygon))
    }

    pub fn with_cloud_cover(mut self, ceiling: f64) -> Self {
        self.cloud_cover_ceiling = ceiling;
        self
    }

    pub fn with_visualization(mut self, mode: VisualizationMode) -> Self {
        self.visualization = mode;
        self
    }

    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn with_platforms<I: IntoIterator<Item = Platform>>(mut self, platforms: I) -> Self {
        self.platforms = platforms.into_iter().collect();
        self
    }

    pub fn with_polygon(mut self, polygon: Polygon<f64>) -> Self {
        self.polygon = Some(polygon);
        self
    }

    pub fn with_cross_sensor(mut self, policy: CrossSensorPolicy) -> Self {
        self.cross_sensor = policy;
        self
    }

    /// Reject malformed caller input
    pub fn validate(&self) -> FusionOutcome<()> {
        self.date_range.validate()?;
        if !self.cloud_cover_ceiling.is_finite()
            || !(0.0..=100.0).contains(&self.cloud_cover_ceiling)
        {
            return Err(FusionError::InvalidRequest(format!(
                "Cloud cover ceiling must be within 0-100, got {}",
                self.cloud_cover_ceiling
            )));
        }
        if self.platforms.is_empty() {
            return Err(FusionError::InvalidRequest(
                "At least one platform is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which tier produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Computed,
    Memory,
    Disk,
}

/// Per-platform contribution to a fusion result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformProvenance {
    pub platform: Platform,
    pub native_shape: (usize, usize),
    pub observations_used: usize,
    pub observations_dropped: usize,
}

/// Which sources went into a fusion result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionProvenance {
    pub master_platform: Platform,
    pub master_shape: (usize, usize),
    pub platforms: Vec<PlatformProvenance>,
}

/// Rendered output of one fusion request
#[derive(Debug, Clone)]
pub struct FusionResult {
    /// Content-addressed identifier, `fusion_<12 hex>`
    pub id: String,
    pub cache_key: String,
    /// Area actually covered (the polygon's bounding box for polygon requests)
    pub window: GeoWindow,
    pub visualization: VisualizationMode,
    /// RGB tensor, (3, height, width)
    pub data: DisplayTensor,
    pub provenance: FusionProvenance,
    /// Summary of the derived index for index visualizations
    pub statistics: Option<IndexStatistics>,
    pub served_from: CacheTier,
}

impl FusionResult {
    /// `(height, width)` of the rendered image
    pub fn dim(&self) -> (usize, usize) {
        let (_, h, w) = self.data.dim();
        (h, w)
    }
}

/// Pipeline steps of a fusion run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FusionStage {
    ResolvingGeometry,
    FetchingSources,
    Aligning,
    Compositing,
    DerivingVisualization,
    Normalizing,
    Persisting,
    Done,
    Failed,
}

impl std::fmt::Display for FusionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FusionStage::ResolvingGeometry => "RESOLVING_GEOMETRY",
            FusionStage::FetchingSources => "FETCHING_SOURCES",
            FusionStage::Aligning => "ALIGNING",
            FusionStage::Compositing => "COMPOSITING",
            FusionStage::DerivingVisualization => "DERIVING_VISUALIZATION",
            FusionStage::Normalizing => "NORMALIZING",
            FusionStage::Persisting => "PERSISTING",
            FusionStage::Done => "DONE",
            FusionStage::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Error types for fusion processing
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No imagery found: {0}")]
    NoImageryFound(String),

    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Source fetch failed for {platform} {band}: {reason}")]
    SourceFetchFailed {
        platform: Platform,
        band: BandId,
        reason: String,
    },

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Unsupported resampling method: {0}")]
    UnsupportedMethod(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{stage} failed: {source}")]
    Stage {
        stage: FusionStage,
        #[source]
        source: Box<FusionError>,
    },
}

impl FusionError {
    /// Tag the error with the pipeline stage it happened in.
    /// An already tagged error keeps its original stage.
    pub fn at(self, stage: FusionStage) -> Self {
        match self {
            tagged @ FusionError::Stage { .. } => tagged,
            other => FusionError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub fn stage(&self) -> Option<FusionStage> {
        match self {
            FusionError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The underlying error with any stage tag removed
    pub fn root(&self) -> &FusionError {
        match self {
            FusionError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Maps to a not-found condition for outer layers
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), FusionError::NoImageryFound(_))
    }

    /// Caller input was malformed; retrying the same request cannot succeed
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.root(),
            FusionError::InvalidBounds(_)
                | FusionError::InvalidCoordinate(_)
                | FusionError::InvalidRequest(_)
                | FusionError::UnsupportedMethod(_)
        )
    }
}

impl From<image::ImageError> for FusionError {
    fn from(err: image::ImageError) -> Self {
        FusionError::RenderFailed(err.to_string())
    }
}

/// Result type for fusion operations
pub type FusionOutcome<T> = Result<T, FusionError>;
