//! Raster source collaborator
//!
//! The engine never talks to a catalogue or network itself. It asks a
//! [`RasterSource`] for one band of one platform over a window and date range,
//! in raw digital numbers.

use crate::io::platform::Platform;
use crate::types::{BandId, DateRange, GeoWindow, Grid, NoData, RasterBand};
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Why a band could not be fetched
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// No acquisition matched the window, dates and cloud ceiling
    #[error("no acquisition available")]
    Unavailable,
    /// The source failed while fetching
    #[error("fetch failed: {0}")]
    Failed(String),
}

/// Provider of raw per-band raster windows
pub trait RasterSource: Send + Sync {
    /// Fetch one band over `window` from an acquisition in `date_range` whose
    /// cloud cover is within `cloud_ceiling`, in the platform's digital numbers.
    fn fetch_band_window(
        &self,
        platform: Platform,
        band: BandId,
        window: &GeoWindow,
        date_range: &DateRange,
        cloud_ceiling: f64,
    ) -> Result<RasterBand, FetchError>;
}

impl<T: RasterSource + ?Sized> RasterSource for Arc<T> {
    fn fetch_band_window(
        &self,
        platform: Platform,
        band: BandId,
        window: &GeoWindow,
        date_range: &DateRange,
        cloud_ceiling: f64,
    ) -> Result<RasterBand, FetchError> {
        (**self).fetch_band_window(platform, band, window, date_range, cloud_ceiling)
    }
}

/// One acquisition held by [`MemoryRasterSource`]
#[derive(Debug, Clone)]
pub struct MemoryScene {
    pub platform: Platform,
    pub acquired: NaiveDate,
    /// Scene cloud cover in percent
    pub cloud_cover: f64,
    pub bands: BTreeMap<BandId, Grid>,
    pub nodata: NoData,
}

impl MemoryScene {
    pub fn new(platform: Platform, acquired: NaiveDate, cloud_cover: f64) -> Self {
        Self {
            platform,
            acquired,
            cloud_cover,
            bands: BTreeMap::new(),
            nodata: NoData::Sentinel(0.0),
        }
    }

    pub fn with_band(mut self, band: BandId, data: Grid) -> Self {
        self.bands.insert(band, data);
        self
    }

    pub fn with_nodata(mut self, nodata: NoData) -> Self {
        self.nodata = nodata;
        self
    }
}

/// In-memory raster source
///
/// Serves the newest scene in the requested range whose cloud cover is within
/// the ceiling. The window is ignored; scenes are assumed to cover it.
#[derive(Debug, Default)]
pub struct MemoryRasterSource {
    scenes: Vec<MemoryScene>,
    failing: Mutex<HashSet<(Platform, BandId)>>,
    failing_scenes: Mutex<HashSet<(Platform, NaiveDate)>>,
    fetches: AtomicUsize,
}

impl MemoryRasterSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scene(mut self, scene: MemoryScene) -> Self {
        self.scenes.push(scene);
        self
    }

    pub fn add_scene(&mut self, scene: MemoryScene) {
        self.scenes.push(scene);
    }

    /// Make every fetch of `band` from `platform` fail
    pub fn fail_band(&self, platform: Platform, band: BandId) {
        self.failing.lock().insert((platform, band));
    }

    /// Make every fetch served by the given acquisition fail
    pub fn fail_acquisition(&self, platform: Platform, acquired: NaiveDate) {
        self.failing_scenes.lock().insert((platform, acquired));
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
        self.failing_scenes.lock().clear();
    }

    /// Number of fetch calls served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RasterSource for MemoryRasterSource {
    fn fetch_band_window(
        &self,
        platform: Platform,
        band: BandId,
        _window: &GeoWindow,
        date_range: &DateRange,
        cloud_ceiling: f64,
    ) -> Result<RasterBand, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if self.failing.lock().contains(&(platform, band)) {
            return Err(FetchError::Failed(format!(
                "injected failure for {} {}",
                platform, band
            )));
        }

        let scene = self
            .scenes
            .iter()
            .filter(|s| {
                s.platform == platform
                    && date_range.contains(s.acquired)
                    && s.cloud_cover <= cloud_ceiling
            })
            .max_by_key(|s| s.acquired)
            .ok_or(FetchError::Unavailable)?;

        if self.failing_scenes.lock().contains(&(platform, scene.acquired)) {
            return Err(FetchError::Failed(format!(
                "injected failure for {} scene {}",
                platform, scene.acquired
            )));
        }

        let data = scene.bands.get(&band).ok_or(FetchError::Unavailable)?;
        Ok(RasterBand::new(band, data.clone(), scene.nodata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn source() -> MemoryRasterSource {
        let d = |day| NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
        MemoryRasterSource::new()
            .with_scene(
                MemoryScene::new(Platform::Sentinel2, d(3), 10.0)
                    .with_band(BandId::Red, Array2::from_elem((2, 2), 100.0)),
            )
            .with_scene(
                MemoryScene::new(Platform::Sentinel2, d(8), 50.0)
                    .with_band(BandId::Red, Array2::from_elem((2, 2), 200.0)),
            )
    }

    #[test]
    fn test_cloud_ceiling_and_date_filter() {
        let src = source();
        let window = GeoWindow::new(0.0, 0.0, 1.0, 1.0).unwrap();
        let range = DateRange::parse("2024-06-01", "2024-06-10").unwrap();

        let band = src
            .fetch_band_window(Platform::Sentinel2, BandId::Red, &window, &range, 20.0)
            .unwrap();
        assert_eq!(band.data()[[0, 0]], 100.0);

        let band = src
            .fetch_band_window(Platform::Sentinel2, BandId::Red, &window, &range, 60.0)
            .unwrap();
        assert_eq!(band.data()[[0, 0]], 200.0);

        let later = DateRange::parse("2024-06-20", "2024-06-30").unwrap();
        assert_eq!(
            src.fetch_band_window(Platform::Sentinel2, BandId::Red, &window, &later, 60.0),
            Err(FetchError::Unavailable)
        );
        assert_eq!(src.fetch_count(), 3);
    }

    #[test]
    fn test_injected_failure() {
        let src = source();
        let window = GeoWindow::new(0.0, 0.0, 1.0, 1.0).unwrap();
        let range = DateRange::parse("2024-06-01", "2024-06-10").unwrap();
        src.fail_band(Platform::Sentinel2, BandId::Red);
        assert!(matches!(
            src.fetch_band_window(Platform::Sentinel2, BandId::Red, &window, &range, 100.0),
            Err(FetchError::Failed(_))
        ));
        assert_eq!(
            src.fetch_band_window(Platform::Landsat, BandId::Red, &window, &range, 100.0),
            Err(FetchError::Unavailable)
        );
    }
}
