use approx::assert_relative_eq;
use geofusion::core::geowindow::{
    pixel_center, validate_window, window_dimensions, window_from_center, METERS_PER_DEGREE,
};
use geofusion::FusionError;

#[test]
fn test_delhi_window_extent() {
    let (lon, lat) = (77.209, 28.6139);
    let window = window_from_center(lon, lat, 256, 10.0).expect("Failed to build window");

    let extent_m = 2560.0;
    let expected_lon_span = extent_m / (METERS_PER_DEGREE * lat.to_radians().cos());
    let expected_lat_span = extent_m / METERS_PER_DEGREE;

    println!("Window bounds: {:?}", window.bounds());
    assert_relative_eq!(window.width_deg(), expected_lon_span, epsilon = 1e-9);
    assert_relative_eq!(window.height_deg(), expected_lat_span, epsilon = 1e-9);

    let (c_lon, c_lat) = window.center();
    assert_relative_eq!(c_lon, lon, epsilon = 1e-9);
    assert_relative_eq!(c_lat, lat, epsilon = 1e-9);
    assert!(window.west() < window.east());
    assert!(window.south() < window.north());
}

#[test]
fn test_window_round_trip_dimensions() {
    for &(lon, lat) in &[(0.0, 0.0), (77.209, 28.6139), (-122.4, 37.8), (18.0, -65.0), (150.0, 80.0)] {
        let window = window_from_center(lon, lat, 256, 10.0).expect("Failed to build window");
        let (height, width) = window_dimensions(&window, 10.0).expect("Failed to recover dimensions");
        println!("({}, {}) -> {}x{}", lon, lat, height, width);
        assert!((height as i64 - 256).abs() <= 1);
        assert!((width as i64 - 256).abs() <= 1);
    }
}

#[test]
fn test_coarser_resolution_shrinks_grid() {
    let window = window_from_center(10.0, 45.0, 300, 10.0).expect("Failed to build window");
    let (h10, w10) = window_dimensions(&window, 10.0).unwrap();
    let (h30, w30) = window_dimensions(&window, 30.0).unwrap();
    assert_eq!((h10, w10), (300, 300));
    assert_eq!((h30, w30), (100, 100));
}

#[test]
fn test_rejects_out_of_range_center() {
    for &(lon, lat) in &[(0.0, 90.5), (0.0, -91.0), (181.0, 0.0), (-200.0, 10.0)] {
        let result = window_from_center(lon, lat, 256, 10.0);
        assert!(
            matches!(result, Err(FusionError::InvalidCoordinate(_))),
            "({}, {}) should be rejected",
            lon,
            lat
        );
    }
}

#[test]
fn test_rejects_degenerate_bounds() {
    assert!(matches!(
        validate_window([10.0, 5.0, 10.0, 6.0]),
        Err(FusionError::InvalidBounds(_))
    ));
    assert!(matches!(
        validate_window([10.0, 6.0, 11.0, 5.0]),
        Err(FusionError::InvalidBounds(_))
    ));
    assert!(matches!(
        validate_window([f64::NAN, 5.0, 11.0, 6.0]),
        Err(FusionError::InvalidBounds(_))
    ));
}

#[test]
fn test_pixel_centers_stay_inside_window() {
    let window = window_from_center(77.209, 28.6139, 16, 10.0).unwrap();
    for row in 0..16 {
        for col in 0..16 {
            let (lon, lat) = pixel_center(&window, (16, 16), row, col);
            assert!(lon > window.west() && lon < window.east());
            assert!(lat > window.south() && lat < window.north());
        }
    }
}
