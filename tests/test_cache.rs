use chrono::{Duration, Utc};
use geofusion::io::cache::{CacheConfig, TieredCache};
use geofusion::io::encode::{decode_png, Derivative};
use geofusion::types::{FusionProvenance, PlatformProvenance};
use geofusion::{
    CacheTier, DateRange, FusionRequest, FusionResult, GeoWindow, Platform, VisualizationMode,
};
use ndarray::Array3;
use tempfile::TempDir;

fn request(day: u32) -> FusionRequest {
    let window = GeoWindow::new(77.2, 28.6, 77.23, 28.63).unwrap();
    let range = DateRange::parse(&format!("2024-03-{:02}", day), "2024-03-28").unwrap();
    FusionRequest::new(window, range)
}

fn result_for(request: &FusionRequest, height: usize, width: usize) -> FusionResult {
    let key = TieredCache::cache_key(request).unwrap();
    FusionResult {
        id: TieredCache::result_id(&key),
        cache_key: key,
        window: request.window,
        visualization: VisualizationMode::TrueColor,
        data: Array3::from_shape_fn((3, height, width), |(c, i, j)| ((c * 80 + i + 2 * j) % 256) as u8),
        provenance: FusionProvenance {
            master_platform: Platform::Sentinel2,
            master_shape: (height, width),
            platforms: vec![PlatformProvenance {
                platform: Platform::Sentinel2,
                native_shape: (height, width),
                observations_used: 1,
                observations_dropped: 0,
            }],
        },
        statistics: None,
        served_from: CacheTier::Computed,
    }
}

fn open(dir: &TempDir) -> TieredCache {
    TieredCache::open(CacheConfig::in_dir(dir.path())).expect("Failed to open cache")
}

#[test]
fn test_store_writes_three_derivatives_and_index() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let cache = open(&dir);
    let req = request(1);
    let result = result_for(&req, 300, 600);

    let entry = cache.store(&result, &req).expect("store failed");
    for derivative in Derivative::ALL {
        let path = cache.derivative_path(&entry.key, derivative);
        assert!(path.exists(), "{} missing", path.display());
    }
    assert!(dir.path().join("metadata.json").exists());
    assert_eq!(entry.original_size, (300, 600));

    let thumb = decode_png(&cache.get_thumbnail(&entry.key).unwrap().unwrap()).unwrap();
    assert_eq!(thumb.dimensions(), (256, 128));
    let preview = decode_png(&cache.get_preview(&entry.key).unwrap().unwrap()).unwrap();
    assert_eq!(preview.dimensions(), (128, 64));

    let stats = cache.stats();
    assert_eq!(stats.total_items, 1);
    assert_eq!(stats.total_bytes, entry.derivative_sizes.total());
}

#[test]
fn test_memory_then_disk_tiers() {
    let dir = TempDir::new().unwrap();
    let req = request(2);
    let result = result_for(&req, 20, 30);
    {
        let cache = open(&dir);
        cache.store(&result, &req).unwrap();
        let hit = cache.get(&result.cache_key).expect("memory hit expected");
        assert_eq!(hit.served_from, CacheTier::Memory);
        assert_eq!(hit.data, result.data);
        assert!(cache.status(&result.cache_key).in_memory);
    }

    // A new instance only has the disk tier
    let cache = open(&dir);
    let status = cache.status(&result.cache_key);
    assert!(status.on_disk && !status.in_memory);
    let hit = cache.get(&result.cache_key).expect("disk hit expected");
    assert_eq!(hit.served_from, CacheTier::Disk);
    assert_eq!(hit.data, result.data);
    assert_eq!(hit.id, result.id);
    assert_eq!(hit.provenance, result.provenance);

    // Promoted to memory
    let again = cache.get(&result.cache_key).unwrap();
    assert_eq!(again.served_from, CacheTier::Memory);
}

#[test]
fn test_zero_ttl_falls_through_to_disk() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        memory_ttl_secs: 0,
        ..CacheConfig::in_dir(dir.path())
    };
    let cache = TieredCache::open(config).unwrap();
    let req = request(3);
    let result = result_for(&req, 8, 8);
    cache.store(&result, &req).unwrap();

    let hit = cache.get(&result.cache_key).unwrap();
    assert_eq!(hit.served_from, CacheTier::Disk);
    assert!(cache.purge_expired_memory() >= 1);
}

#[test]
fn test_memory_tier_evicts_least_recently_used() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        memory_capacity: 3,
        ..CacheConfig::in_dir(dir.path())
    };
    let cache = TieredCache::open(config).unwrap();

    let results: Vec<FusionResult> = (10..15u32)
        .map(|day| {
            let req = request(day);
            let result = result_for(&req, 8, 8);
            cache.store(&result, &req).expect("store failed");
            result
        })
        .collect();

    let stats = cache.stats();
    assert_eq!(stats.memory_items, 3);
    assert_eq!(stats.total_items, 5);

    // The two oldest were evicted but remain on disk
    for evicted in &results[..2] {
        let status = cache.status(&evicted.cache_key);
        assert!(status.on_disk && !status.in_memory);
    }
    let last = cache.get(&results[4].cache_key).unwrap();
    assert_eq!(last.served_from, CacheTier::Memory);

    // Touching the oldest survivor keeps it over the next store
    assert_eq!(cache.get(&results[2].cache_key).unwrap().served_from, CacheTier::Memory);
    let first = cache.get(&results[0].cache_key).unwrap();
    assert_eq!(first.served_from, CacheTier::Disk);
    assert!(cache.status(&results[2].cache_key).in_memory);
    assert!(!cache.status(&results[3].cache_key).in_memory);
    assert_eq!(cache.stats().memory_items, 3);
}

#[test]
fn test_zero_capacity_disables_memory_tier() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        memory_capacity: 0,
        ..CacheConfig::in_dir(dir.path())
    };
    let cache = TieredCache::open(config).unwrap();
    let req = request(6);
    let result = result_for(&req, 8, 8);
    cache.store(&result, &req).unwrap();

    assert_eq!(cache.stats().memory_items, 0);
    assert_eq!(cache.get(&result.cache_key).unwrap().served_from, CacheTier::Disk);
    assert_eq!(cache.stats().memory_items, 0);
}

#[test]
fn test_cleanup_removes_only_old_entries() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);

    let old_req = request(4);
    let old = result_for(&old_req, 40, 40);
    let old_entry = cache
        .store_at(&old, &old_req, Utc::now() - Duration::days(10))
        .unwrap();

    let new_req = request(5);
    let new = result_for(&new_req, 40, 40);
    let new_entry = cache
        .store_at(&new, &new_req, Utc::now() - Duration::days(2))
        .unwrap();

    let stats = cache.cleanup(Duration::days(7)).expect("cleanup failed");
    println!("Cleanup: {:?}", stats);
    assert_eq!(stats.items_removed, 1);
    assert_eq!(stats.bytes_freed, old_entry.derivative_sizes.total());

    for derivative in Derivative::ALL {
        assert!(!cache.derivative_path(&old_entry.key, derivative).exists());
        assert!(cache.derivative_path(&new_entry.key, derivative).exists());
    }
    assert!(cache.get(&old_entry.key).is_none());
    assert!(cache.get(&new_entry.key).is_some());

    // The on-disk index agrees
    let reopened = open(&dir);
    assert_eq!(reopened.stats().total_items, 1);
    assert!(reopened.contains(&new_entry.key));

    let nothing = cache.cleanup(Duration::days(7)).unwrap();
    assert_eq!(nothing.items_removed, 0);
    assert_eq!(nothing.bytes_freed, 0);
}

#[test]
fn test_concurrent_stores_keep_index_consistent() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);

    std::thread::scope(|scope| {
        for day in 1..=8u32 {
            let cache = &cache;
            scope.spawn(move || {
                let req = request(day);
                let result = result_for(&req, 16, 16);
                cache.store(&result, &req).expect("store failed");
            });
        }
    });

    assert_eq!(cache.stats().total_items, 8);
    assert_eq!(open(&dir).stats().total_items, 8);
}

#[test]
fn test_failed_cleanup_keeps_disk_index_in_sync() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir);
    let old = Utc::now() - Duration::days(10);

    let keys: Vec<String> = (20..23u32)
        .map(|day| {
            let req = request(day);
            let result = result_for(&req, 8, 8);
            cache.store_at(&result, &req, old).unwrap().key
        })
        .collect();

    // A directory where a derivative file should be cannot be removed
    let mut sorted = keys.clone();
    sorted.sort();
    let stuck = &sorted[1];
    let path = cache.derivative_path(stuck, Derivative::Thumbnail);
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();

    let outcome = cache.cleanup(Duration::days(7));
    assert!(outcome.is_err());

    // Entries removed before the failure are gone from both views
    let reopened = open(&dir);
    assert_eq!(reopened.stats().total_items, cache.stats().total_items);
    assert_eq!(cache.stats().total_items, 2);
    assert!(!cache.contains(&sorted[0]) && !reopened.contains(&sorted[0]));
    assert!(cache.contains(stuck) && reopened.contains(stuck));
    assert!(cache.get(&sorted[0]).is_none());
}
