//! geofusion: multi-resolution Sentinel-2 / Landsat raster fusion
//!
//! Fuses 10 m and 30 m optical imagery of the same area into one aligned,
//! composited, visualization-ready raster. The engine computes geographic
//! windows, fetches per-band windows from a [`io::RasterSource`], aligns the
//! coarser platform onto the finer grid, composites observations over time,
//! derives spectral indices and renders an 8-bit RGB result that is cached in
//! memory and on disk.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BandId, CacheTier, DateRange, FusionError, FusionOutcome, FusionRequest, FusionResult,
    FusionStage, GeoWindow, NoData, RasterBand, SceneSource,
};

pub use core::{FusionConfig, FusionEngine, Reducer, VisualizationMode};
pub use io::{CacheConfig, MemoryRasterSource, MemoryScene, Platform, RasterSource, TieredCache};
