//! Fusion orchestrator
//!
//! Runs one request through the pipeline
//!
//! ```text
//! RESOLVING_GEOMETRY -> FETCHING_SOURCES -> ALIGNING -> COMPOSITING
//!   -> DERIVING_VISUALIZATION -> NORMALIZING -> PERSISTING -> DONE
//! ```
//!
//! Any failure ends in FAILED and is returned tagged with the stage it
//! happened in. Nothing is cached unless every stage succeeds.

use crate::core::analysis::{index_statistics, IndexStatistics};
use crate::core::composite::{composite_mean, BandCompositor, CompositeGuide, Reducer};
use crate::core::gap_fill::{gap_fill, gap_fill_index};
use crate::core::geowindow;
use crate::core::normalize::{stack_channels, NormalizeParams, Normalizer};
use crate::core::resample::{method_for_band, ResampleMethod, Resampler};
use crate::core::spectral::{index_from_bands, ndvi_band, IndexGrid, SpectralIndex};
use crate::core::visualize::{ChannelRecipe, ChannelScaling, Recipe};
use crate::io::cache::{CacheConfig, CleanupStats, TieredCache};
use crate::io::platform::Platform;
use crate::io::source::{FetchError, RasterSource};
use crate::types::{
    AcquisitionMetadata, BandId, CacheTier, DateRange, DisplayTensor, FusionError, FusionOutcome,
    FusionProvenance, FusionRequest, FusionResult, FusionStage, GeoWindow, Grid, PlatformProvenance,
    RasterBand, SceneSource, ValidityMask,
};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Instant;

/// How index visualizations merge the per-platform indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossSensorPolicy {
    /// Masked mean of the platforms
    #[default]
    Average,
    /// Master platform first, the others fill its invalid pixels
    GapFill,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Pixel edge length of center-based windows
    pub window_size: usize,
    /// Ground resolution (m) used to size center-based windows
    pub reference_resolution_m: f64,
    /// Worker threads for source fetches
    pub max_workers: usize,
    /// Observation slots fetched per platform
    pub max_observations_per_platform: usize,
    /// Kernel used to align coarser platforms to the master grid
    pub resample_method: ResampleMethod,
    pub normalize: NormalizeParams,
    pub cache: CacheConfig,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            reference_resolution_m: 10.0,
            max_workers: 4,
            max_observations_per_platform: 6,
            resample_method: ResampleMethod::Bilinear,
            normalize: NormalizeParams::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl FusionConfig {
    /// Load a JSON config; missing fields keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> FusionOutcome<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: FusionConfig = serde_json::from_str(&text)?;
        log::debug!("Loaded fusion config from {}", path.as_ref().display());
        Ok(config)
    }
}

/// One platform's fetched observations, newest first
struct PlatformStack {
    platform: Platform,
    native_shape: (usize, usize),
    observations: Vec<BTreeMap<BandId, RasterBand>>,
    dropped: usize,
}

#[derive(Debug, Clone, Copy)]
struct FetchTask {
    platform: Platform,
    slot: usize,
    range: DateRange,
    band: BandId,
}

#[derive(Default)]
struct SlotState {
    bands: BTreeMap<BandId, RasterBand>,
    failed: bool,
    incomplete: bool,
}

/// Visualization output before 8-bit conversion
enum Derived {
    Channels {
        channels: Vec<RasterBand>,
        scaling: ChannelScaling,
    },
    Rendered(DisplayTensor),
}

/// Logs stage transitions and tags errors with the current stage
struct StageTracker {
    id: String,
    stage: FusionStage,
}

impl StageTracker {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            stage: FusionStage::ResolvingGeometry,
        }
    }

    fn enter(&mut self, stage: FusionStage) {
        self.stage = stage;
        log::info!("[{}] {}", self.id, stage);
    }

    fn fail(&self, err: FusionError) -> FusionError {
        err.at(self.stage)
    }
}

/// Multi-resolution fusion engine
pub struct FusionEngine<S: RasterSource> {
    source: S,
    config: FusionConfig,
    cache: TieredCache,
    pool: rayon::ThreadPool,
}

impl<S: RasterSource> FusionEngine<S> {
    /// Create an engine, opening the cache directory
    pub fn new(source: S, config: FusionConfig) -> FusionOutcome<Self> {
        let workers = config.max_workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("geofusion-fetch-{}", i))
            .build()
            .map_err(|e| FusionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let cache = TieredCache::open(config.cache.clone())?;

        log::info!(
            "Fusion engine ready: {} fetch workers, cache at {}",
            workers,
            config.cache.cache_dir.display()
        );
        Ok(Self {
            source,
            config,
            cache,
            pool,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Window of the configured size and resolution around a point
    pub fn window_for_center(&self, lon: f64, lat: f64) -> FusionOutcome<GeoWindow> {
        geowindow::window_from_center(
            lon,
            lat,
            self.config.window_size,
            self.config.reference_resolution_m,
        )
    }

    /// Produce (or fetch from cache) the fused rendering of a request
    pub fn fuse(&self, request: &FusionRequest) -> FusionOutcome<FusionResult> {
        let start = Instant::now();
        let key = TieredCache::cache_key(request).map_err(|e| e.at(FusionStage::ResolvingGeometry))?;
        let id = TieredCache::result_id(&key);

        if let Some(hit) = self.cache.get(&key) {
            log::info!("[{}] served from {:?} cache", id, hit.served_from);
            return Ok(hit);
        }

        match self.run_pipeline(request, &key, &id) {
            Ok(result) => {
                log::info!(
                    "[{}] {} in {:.2}s",
                    id,
                    FusionStage::Done,
                    start.elapsed().as_secs_f64()
                );
                Ok(result)
            }
            Err(e) => {
                log::error!("[{}] {}: {}", id, FusionStage::Failed, e);
                Err(e)
            }
        }
    }

    /// Remove cached results older than `max_age`
    pub fn cleanup(&self, max_age: chrono::Duration) -> FusionOutcome<CleanupStats> {
        self.cache.cleanup(max_age)
    }

    fn run_pipeline(&self, request: &FusionRequest, key: &str, id: &str) -> FusionOutcome<FusionResult> {
        let mut tracker = StageTracker::new(id);

        tracker.enter(FusionStage::ResolvingGeometry);
        request.validate().map_err(|e| tracker.fail(e))?;
        let window = match &request.polygon {
            Some(polygon) => geowindow::polygon_window(polygon).map_err(|e| tracker.fail(e))?,
            None => request.window,
        };
        let required = required_bands(request);
        log::debug!(
            "[{}] window {:?}, dates {}, bands {:?}",
            id,
            window.bounds(),
            request.date_range,
            required
        );

        tracker.enter(FusionStage::FetchingSources);
        let stacks = self
            .fetch_sources(request, &window, &required)
            .map_err(|e| tracker.fail(e))?;

        tracker.enter(FusionStage::Aligning);
        let (stacks, master_shape) = self.align(stacks).map_err(|e| tracker.fail(e))?;

        tracker.enter(FusionStage::Compositing);
        let mut provenance = Vec::with_capacity(stacks.len());
        let mut sources = Vec::with_capacity(stacks.len());
        for stack in &stacks {
            provenance.push(PlatformProvenance {
                platform: stack.platform,
                native_shape: stack.native_shape,
                observations_used: stack.observations.len(),
                observations_dropped: stack.dropped,
            });
            sources.push(composite_stack(stack, request).map_err(|e| tracker.fail(e))?);
        }
        if let Some(polygon) = &request.polygon {
            let inside = geowindow::polygon_mask(polygon, &window, master_shape);
            for source in &mut sources {
                restrict_to(source, &inside).map_err(|e| tracker.fail(e))?;
            }
        }

        tracker.enter(FusionStage::DerivingVisualization);
        let (derived, statistics) = derive_visualization(request, &sources).map_err(|e| tracker.fail(e))?;

        tracker.enter(FusionStage::Normalizing);
        let normalizer = Normalizer::with_params(self.config.normalize.clone());
        let data = render(derived, &normalizer).map_err(|e| tracker.fail(e))?;

        let result = FusionResult {
            id: id.to_string(),
            cache_key: key.to_string(),
            window,
            visualization: request.visualization,
            data,
            provenance: FusionProvenance {
                master_platform: stacks[0].platform,
                master_shape,
                platforms: provenance,
            },
            statistics,
            served_from: CacheTier::Computed,
        };

        tracker.enter(FusionStage::Persisting);
        self.cache.store(&result, request).map_err(|e| tracker.fail(e))?;

        Ok(result)
    }

    /// Fan out one fetch per platform, observation slot and band on the worker pool
    fn fetch_sources(
        &self,
        request: &FusionRequest,
        window: &GeoWindow,
        required: &BTreeSet<BandId>,
    ) -> FusionOutcome<Vec<PlatformStack>> {
        use rayon::prelude::*;

        let mut tasks = Vec::new();
        let mut plans = Vec::new();
        for &platform in &request.platforms {
            let mut native = BTreeSet::new();
            let mut missing = Vec::new();
            for &band in required {
                match platform.resolve_band(band) {
                    Some(b) => {
                        native.insert(b);
                    }
                    None => missing.push(band),
                }
            }
            if !missing.is_empty() {
                log::warn!("{} lacks bands {:?}, skipping platform", platform, missing);
                continue;
            }

            let slots = platform.observation_slots(
                &request.date_range,
                self.config.max_observations_per_platform,
            );
            for (slot, end) in slots.iter().enumerate() {
                let range = platform.slot_range(&request.date_range, *end);
                for &band in &native {
                    tasks.push(FetchTask {
                        platform,
                        slot,
                        range,
                        band,
                    });
                }
            }
            plans.push((platform, slots.len()));
        }

        log::debug!(
            "Submitting {} band fetches to {} workers",
            tasks.len(),
            self.pool.current_num_threads()
        );

        let source = &self.source;
        let cloud_ceiling = request.cloud_cover_ceiling;
        let results: Vec<(FetchTask, Result<RasterBand, FetchError>)> = self.pool.install(|| {
            tasks
                .into_par_iter()
                .map(|task| {
                    let result = source.fetch_band_window(
                        task.platform,
                        task.band,
                        window,
                        &task.range,
                        cloud_ceiling,
                    );
                    (task, result)
                })
                .collect()
        });

        let mut slots: BTreeMap<(Platform, usize), SlotState> = BTreeMap::new();
        for (task, result) in results {
            let state = slots.entry((task.platform, task.slot)).or_default();
            match result {
                Ok(band) => {
                    let band = if band.band() == task.band {
                        band
                    } else {
                        band.relabel(task.band)
                    };
                    state.bands.insert(task.band, band);
                }
                Err(FetchError::Unavailable) => {
                    // Missing QA degrades best-pixel to median, anything else voids the observation
                    if task.band != BandId::Qa {
                        state.incomplete = true;
                    }
                }
                Err(FetchError::Failed(reason)) => {
                    let err = FusionError::SourceFetchFailed {
                        platform: task.platform,
                        band: task.band,
                        reason,
                    };
                    log::warn!("{}; dropping observation {}", err, task.range);
                    state.failed = true;
                }
            }
        }

        let mut stacks = Vec::new();
        for (platform, slot_count) in plans {
            let mut observations = Vec::new();
            let mut dropped = 0;
            for slot in 0..slot_count {
                let state = match slots.remove(&(platform, slot)) {
                    Some(state) => state,
                    None => continue,
                };
                if state.failed {
                    dropped += 1;
                } else if !state.incomplete && state.bands.keys().any(|b| *b != BandId::Qa) {
                    observations.push(state.bands);
                }
            }

            if observations.is_empty() {
                log::warn!(
                    "No usable {} observations in {} ({} dropped)",
                    platform,
                    request.date_range,
                    dropped
                );
                continue;
            }
            log::info!(
                "{}: {} observations, {} dropped",
                platform,
                observations.len(),
                dropped
            );
            stacks.push(prepare_stack(platform, observations, dropped, self.config.resample_method)?);
        }

        if stacks.is_empty() {
            return Err(FusionError::NoImageryFound(format!(
                "No imagery for {:?} between {} and {} under {}% cloud",
                window.bounds(),
                request.date_range.start,
                request.date_range.end,
                request.cloud_cover_ceiling
            )));
        }
        Ok(stacks)
    }

    /// Resample every platform onto the grid of the finest-resolution platform
    ///
    /// The master platform comes first in the returned list.
    fn align(&self, mut stacks: Vec<PlatformStack>) -> FusionOutcome<(Vec<PlatformStack>, (usize, usize))> {
        stacks.sort_by(|a, b| {
            a.platform
                .native_resolution_m()
                .total_cmp(&b.platform.native_resolution_m())
        });
        let master_shape = stacks[0].native_shape;
        log::debug!("Master {} at {:?}", stacks[0].platform, master_shape);

        for stack in stacks.iter_mut().skip(1) {
            if stack.native_shape == master_shape {
                continue;
            }
            log::debug!(
                "Aligning {} {:?} -> {:?}",
                stack.platform,
                stack.native_shape,
                master_shape
            );
            for observation in stack.observations.iter_mut() {
                for band in observation.values_mut() {
                    let resampler = Resampler::new(method_for_band(band.band(), self.config.resample_method));
                    *band = resampler.resample_band(band, master_shape)?;
                }
            }
        }
        Ok((stacks, master_shape))
    }
}

/// Logical bands to fetch for a request
fn required_bands(request: &FusionRequest) -> BTreeSet<BandId> {
    let mut bands = request.visualization.required_bands();
    match request.reducer {
        Reducer::BestPixel => {
            bands.insert(BandId::Qa);
        }
        Reducer::QualityMosaic => {
            bands.insert(BandId::Nir);
            bands.insert(BandId::Red);
        }
        Reducer::Mean | Reducer::Median => {}
    }
    bands
}

/// Put every band of every observation on one grid and convert to physical units
///
/// The grid is the largest band of the newest observation.
fn prepare_stack(
    platform: Platform,
    observations: Vec<BTreeMap<BandId, RasterBand>>,
    dropped: usize,
    method: ResampleMethod,
) -> FusionOutcome<PlatformStack> {
    let native_shape = observations[0]
        .values()
        .map(|b| b.dim())
        .max_by_key(|(h, w)| h * w)
        .unwrap_or((0, 0));

    let observations = observations
        .into_iter()
        .map(|obs| {
            obs.into_iter()
                .map(|(id, band)| -> FusionOutcome<(BandId, RasterBand)> {
                    let band = Resampler::new(method_for_band(id, method)).resample_band(&band, native_shape)?;
                    Ok((id, platform.to_physical(&band)))
                })
                .collect::<FusionOutcome<BTreeMap<_, _>>>()
        })
        .collect::<FusionOutcome<Vec<_>>>()?;

    Ok(PlatformStack {
        platform,
        native_shape,
        observations,
        dropped,
    })
}

/// Temporal compositing of one platform's observations, band by band
fn composite_stack(stack: &PlatformStack, request: &FusionRequest) -> FusionOutcome<SceneSource> {
    let platform = stack.platform;
    let shape = stack.observations[0]
        .values()
        .next()
        .map(|b| b.dim())
        .unwrap_or(stack.native_shape);

    let guide = match request.reducer {
        Reducer::BestPixel => CompositeGuide {
            quality_masks: Some(
                stack
                    .observations
                    .iter()
                    .map(|obs| match obs.get(&BandId::Qa) {
                        Some(qa) => platform.decode_quality(qa),
                        None => ValidityMask::from_elem(shape, false),
                    })
                    .collect(),
            ),
            scores: None,
        },
        Reducer::QualityMosaic => {
            let nir = platform.resolve_band(BandId::Nir).unwrap_or(BandId::Nir);
            let red = platform.resolve_band(BandId::Red).unwrap_or(BandId::Red);
            let scores = stack
                .observations
                .iter()
                .map(|obs| match (obs.get(&nir), obs.get(&red)) {
                    (Some(n), Some(r)) => ndvi_band(n, r).map(|grid| grid.values),
                    _ => Ok(Grid::from_elem(shape, f32::NAN)),
                })
                .collect::<FusionOutcome<Vec<_>>>()?;
            CompositeGuide {
                quality_masks: None,
                scores: Some(scores),
            }
        }
        Reducer::Mean | Reducer::Median => CompositeGuide::default(),
    };

    let compositor = BandCompositor::new(request.reducer);
    let mut bands = BTreeMap::new();
    for &band in stack.observations[0].keys() {
        if band == BandId::Qa {
            continue;
        }
        let observations: Vec<RasterBand> = stack
            .observations
            .iter()
            .filter_map(|obs| obs.get(&band).cloned())
            .collect();
        bands.insert(band, compositor.reduce(&observations, &guide)?);
    }

    Ok(SceneSource {
        platform,
        bands,
        metadata: AcquisitionMetadata {
            date_range: request.date_range,
            cloud_cover_ceiling: request.cloud_cover_ceiling,
            reducer: request.reducer,
            observations_used: stack.observations.len(),
            observations_dropped: stack.dropped,
        },
    })
}

fn derive_visualization(
    request: &FusionRequest,
    sources: &[SceneSource],
) -> FusionOutcome<(Derived, Option<IndexStatistics>)> {
    match request.visualization.recipe() {
        Recipe::Composite { channels, scaling } => {
            let mut fused = Vec::with_capacity(3);
            for recipe in channels {
                let mut per_source = Vec::new();
                for source in sources {
                    if let Some(band) = weighted_channel(source, recipe)? {
                        per_source.push(band);
                    }
                }
                if per_source.is_empty() {
                    return Err(FusionError::NoImageryFound(format!(
                        "No platform provides {:?} for {}",
                        recipe.iter().map(|(b, _)| *b).collect::<Vec<_>>(),
                        request.visualization
                    )));
                }
                fused.push(composite_mean(&per_source)?);
            }
            Ok((
                Derived::Channels {
                    channels: fused,
                    scaling,
                },
                None,
            ))
        }
        Recipe::Index { index, palette } => {
            let merged = merge_index(index, request.cross_sensor, sources)?;
            let statistics = index_statistics(&merged);
            Ok((Derived::Rendered(palette.apply(&merged.values, &merged.valid)), statistics))
        }
        Recipe::Thermal { palette } => {
            let thermal: Vec<RasterBand> = sources
                .iter()
                .filter_map(|s| s.band(BandId::Thermal).cloned())
                .collect();
            if thermal.is_empty() {
                return Err(FusionError::NoImageryFound(
                    "No platform with a thermal band".to_string(),
                ));
            }
            let kelvin = composite_mean(&thermal)?;
            Ok((Derived::Rendered(palette.apply(kelvin.data(), kelvin.valid())), None))
        }
    }
}

/// Weighted band sum for one output channel; `None` if the source lacks a band
fn weighted_channel(source: &SceneSource, recipe: ChannelRecipe) -> FusionOutcome<Option<RasterBand>> {
    let mut acc: Option<(Grid, ValidityMask)> = None;
    for &(band_id, weight) in recipe {
        let band = match source.band(band_id) {
            Some(band) => band,
            None => return Ok(None),
        };
        let weighted = band.data().mapv(|v| v * weight);
        acc = Some(match acc {
            None => (weighted, band.valid().clone()),
            Some((data, valid)) => {
                band.ensure_dim(data.dim())?;
                let valid = Zip::from(&valid).and(band.valid()).map_collect(|a, b| *a && *b);
                (data + &weighted, valid)
            }
        });
    }
    Ok(acc.map(|(data, valid)| RasterBand::from_parts(recipe[0].0, data, valid)))
}

/// Per-platform index merged across platforms; `sources[0]` is the master
fn merge_index(
    index: SpectralIndex,
    policy: CrossSensorPolicy,
    sources: &[SceneSource],
) -> FusionOutcome<IndexGrid> {
    let (a, b) = index.operands();
    let available: Vec<(&RasterBand, &RasterBand)> = sources
        .iter()
        .filter_map(|s| match (s.band(a), s.band(b)) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        })
        .collect();

    if available.is_empty() {
        return Err(FusionError::NoImageryFound(format!(
            "No platform provides {} and {} for {}",
            a, b, index
        )));
    }

    if policy == CrossSensorPolicy::GapFill && index == SpectralIndex::Ndvi && available.len() == 2 {
        let (p_nir, p_red) = available[0];
        let (s_nir, s_red) = available[1];
        return gap_fill(p_nir, p_red, s_nir, s_red);
    }

    let mut grids = available
        .iter()
        .map(|(x, y)| index_from_bands(index, x, y))
        .collect::<FusionOutcome<Vec<_>>>()?
        .into_iter();
    let mut merged = match grids.next() {
        Some(grid) => grid,
        None => {
            return Err(FusionError::NoImageryFound(format!("No {} data", index)));
        }
    };
    for grid in grids {
        merged = match policy {
            CrossSensorPolicy::Average => merged.average(&grid)?,
            CrossSensorPolicy::GapFill => gap_fill_index(&merged, &grid)?,
        };
    }
    Ok(merged)
}

/// Convert the derived visualization to an 8-bit RGB tensor
fn render(derived: Derived, normalizer: &Normalizer) -> FusionOutcome<DisplayTensor> {
    match derived {
        Derived::Rendered(tensor) => Ok(tensor),
        Derived::Channels { channels, scaling } => {
            let scaled: Vec<Array2<u8>> = channels
                .iter()
                .map(|band| match scaling {
                    ChannelScaling::Fixed => normalizer.fixed(band.data(), band.valid()),
                    ChannelScaling::Percentile => normalizer.stretch(band.data(), band.valid()),
                })
                .collect();
            let [r, g, b]: [Array2<u8>; 3] = scaled.try_into().map_err(|v: Vec<Array2<u8>>| {
                FusionError::RenderFailed(format!("Expected 3 channels, got {}", v.len()))
            })?;
            stack_channels(&[r, g, b])
        }
    }
}

/// Invalidate every pixel of every band outside `inside`
///
/// Applied before visualization so index statistics and percentile stretches
/// only see the area of interest. Invalid pixels render black.
fn restrict_to(source: &mut SceneSource, inside: &ValidityMask) -> FusionOutcome<()> {
    let bands = std::mem::take(&mut source.bands);
    source.bands = bands
        .into_iter()
        .map(|(id, band)| {
            band.ensure_dim(inside.dim())?;
            let (band_id, data, valid) = band.into_parts();
            let valid = Zip::from(&valid).and(inside).map_collect(|ok, keep| *ok && *keep);
            Ok((id, RasterBand::from_parts(band_id, data, valid)))
        })
        .collect::<FusionOutcome<_>>()?;
    Ok(())
}
