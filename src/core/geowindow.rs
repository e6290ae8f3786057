//! Geographic window computation
//!
//! Converts between a center point plus a pixel window and an axis-aligned
//! geographic bounding box, using a spherical meters-per-degree approximation
//! evaluated at the center latitude.

use crate::types::{FusionError, FusionOutcome, GeoWindow, ValidityMask};
use geo_types::{Coord, LineString, Polygon};
use ndarray::Array2;

/// Meters per degree of latitude (and of longitude at the equator)
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Below this cosine the longitude span blows up
const MIN_COS_LAT: f64 = 1e-6;

/// Square window of `window_size_px * ground_resolution_m` meters centered on a point
///
/// # Arguments
/// * `center_lon` - Longitude in degrees, within [-180, 180]
/// * `center_lat` - Latitude in degrees, within [-90, 90]
/// * `window_size_px` - Window edge length in pixels
/// * `ground_resolution_m` - Pixel spacing in meters
pub fn window_from_center(
    center_lon: f64,
    center_lat: f64,
    window_size_px: usize,
    ground_resolution_m: f64,
) -> FusionOutcome<GeoWindow> {
    if !center_lat.is_finite() || center_lat.abs() > 90.0 {
        return Err(FusionError::InvalidCoordinate(format!(
            "Latitude {} outside [-90, 90]",
            center_lat
        )));
    }
    if !center_lon.is_finite() || center_lon.abs() > 180.0 {
        return Err(FusionError::InvalidCoordinate(format!(
            "Longitude {} outside [-180, 180]",
            center_lon
        )));
    }
    if window_size_px == 0 || !ground_resolution_m.is_finite() || ground_resolution_m <= 0.0 {
        return Err(FusionError::InvalidCoordinate(format!(
            "Window of {} px at {} m is empty",
            window_size_px, ground_resolution_m
        )));
    }

    let cos_lat = center_lat.to_radians().cos();
    if cos_lat < MIN_COS_LAT {
        return Err(FusionError::InvalidCoordinate(format!(
            "Longitude span undefined at latitude {}",
            center_lat
        )));
    }

    let half_extent_m = window_size_px as f64 * ground_resolution_m / 2.0;
    let half_lat = half_extent_m / METERS_PER_DEGREE;
    let half_lon = half_extent_m / (METERS_PER_DEGREE * cos_lat);

    log::debug!(
        "Window {}px @ {}m around ({:.5}, {:.5}): +/-{:.6} deg lon, +/-{:.6} deg lat",
        window_size_px,
        ground_resolution_m,
        center_lon,
        center_lat,
        half_lon,
        half_lat
    );

    validate_window([
        center_lon - half_lon,
        center_lat - half_lat,
        center_lon + half_lon,
        center_lat + half_lat,
    ])
}

/// Validate caller-supplied `[west, south, east, north]` bounds
pub fn validate_window(bounds: [f64; 4]) -> FusionOutcome<GeoWindow> {
    let [west, south, east, north] = bounds;
    if bounds.iter().any(|v| !v.is_finite()) {
        return Err(FusionError::InvalidBounds(format!(
            "Non-finite bounds {:?}",
            bounds
        )));
    }
    if west >= east {
        return Err(FusionError::InvalidBounds(format!(
            "West {} must be less than east {}",
            west, east
        )));
    }
    if south >= north {
        return Err(FusionError::InvalidBounds(format!(
            "South {} must be less than north {}",
            south, north
        )));
    }
    Ok(GeoWindow::from_validated(bounds))
}

/// Pixel dimensions `(height, width)` of a window at a ground resolution
pub fn window_dimensions(window: &GeoWindow, ground_resolution_m: f64) -> FusionOutcome<(usize, usize)> {
    if !ground_resolution_m.is_finite() || ground_resolution_m <= 0.0 {
        return Err(FusionError::InvalidRequest(format!(
            "Ground resolution must be positive, got {}",
            ground_resolution_m
        )));
    }
    let (_, center_lat) = window.center();
    let cos_lat = center_lat.to_radians().cos().max(MIN_COS_LAT);

    let height_m = window.height_deg() * METERS_PER_DEGREE;
    let width_m = window.width_deg() * METERS_PER_DEGREE * cos_lat;

    let height = (height_m / ground_resolution_m).round().max(1.0) as usize;
    let width = (width_m / ground_resolution_m).round().max(1.0) as usize;
    Ok((height, width))
}

/// Geographic `(lon, lat)` of a pixel center; row 0 is the northern edge
pub fn pixel_center(window: &GeoWindow, shape: (usize, usize), row: usize, col: usize) -> (f64, f64) {
    let (height, width) = shape;
    let lon = window.west() + (col as f64 + 0.5) / width as f64 * window.width_deg();
    let lat = window.north() - (row as f64 + 0.5) / height as f64 * window.height_deg();
    (lon, lat)
}

/// Bounding box of a polygon's exterior ring
pub fn polygon_window(polygon: &Polygon<f64>) -> FusionOutcome<GeoWindow> {
    let exterior = polygon.exterior();
    if exterior.0.len() < 3 {
        return Err(FusionError::InvalidBounds(format!(
            "Polygon needs at least 3 vertices, got {}",
            exterior.0.len()
        )));
    }

    let mut bounds = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
    for c in exterior.coords() {
        bounds[0] = bounds[0].min(c.x);
        bounds[1] = bounds[1].min(c.y);
        bounds[2] = bounds[2].max(c.x);
        bounds[3] = bounds[3].max(c.y);
    }
    validate_window(bounds)
}

/// Rasterize a polygon onto the window's pixel grid
///
/// A pixel is inside when its center is inside under the even-odd rule over
/// all rings, so interior rings cut holes.
pub fn polygon_mask(polygon: &Polygon<f64>, window: &GeoWindow, shape: (usize, usize)) -> ValidityMask {
    let rings: Vec<&LineString<f64>> = std::iter::once(polygon.exterior())
        .chain(polygon.interiors().iter())
        .collect();

    Array2::from_shape_fn(shape, |(row, col)| {
        let (x, y) = pixel_center(window, shape, row, col);
        let crossings = rings
            .iter()
            .map(|ring| ray_crossings(ring, Coord { x, y }))
            .sum::<usize>();
        crossings % 2 == 1
    })
}

fn ray_crossings(ring: &LineString<f64>, point: Coord<f64>) -> usize {
    let pts = &ring.0;
    if pts.len() < 2 {
        return 0;
    }
    let mut count = 0;
    let n = pts.len();
    for i in 0..n {
        let a = pts[i];
        let b = pts[(i + 1) % n];
        if a == b {
            continue;
        }
        if (a.y > point.y) != (b.y > point.y) {
            let x_cross = a.x + (point.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if point.x < x_cross {
                count += 1;
            }
        }
    }
    count
}
