//! Platform catalogue, raster source collaborator, image encoding and result cache

pub mod platform;
pub mod source;
pub mod encode;
pub mod cache;

pub use platform::Platform;
pub use source::{FetchError, MemoryRasterSource, MemoryScene, RasterSource};
pub use cache::{CacheConfig, CacheEntry, CleanupStats, TieredCache};
