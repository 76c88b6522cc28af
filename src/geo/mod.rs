pub mod index;

pub use index::GeoIndex;

use crate::models::driver::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;
pub const KM_PER_DEGREE_LAT: f64 = 111.32;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * central_angle
}

/// Integer grid cell containing `point` for a grid of `cell_degrees` squares.
pub fn grid_cell(point: &GeoPoint, cell_degrees: f64) -> (i32, i32) {
    (
        (point.lat / cell_degrees).floor() as i32,
        (point.lng / cell_degrees).floor() as i32,
    )
}
