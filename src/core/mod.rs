//! Core fusion processing modules

pub mod geowindow;
pub mod resample;
pub mod composite;
pub mod spectral;
pub mod gap_fill;
pub mod visualize;
pub mod normalize;
pub mod analysis;
pub mod fusion;

// Re-export main types
pub use geowindow::{window_from_center, validate_window, window_dimensions, polygon_mask, polygon_window};
pub use resample::{ResampleMethod, Resampler};
pub use composite::{BandCompositor, CompositeGuide, Reducer};
pub use spectral::{ndvi, ndwi, ndbi, IndexGrid, SpectralIndex};
pub use gap_fill::{gap_fill, gap_fill_index};
pub use visualize::{Palette, VisualizationMode};
pub use normalize::{NormalizeParams, Normalizer};
pub use analysis::{compare_indices, index_statistics, IndexComparison, IndexStatistics};
pub use fusion::{CrossSensorPolicy, FusionConfig, FusionEngine};
