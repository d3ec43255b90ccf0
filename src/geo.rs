use glam::DVec2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Earth radius used by the Web Mercator (EPSG:3857) source projection, in meters
pub const MERCATOR_RADIUS_M: f64 = 6_378_137.0;

/// Mean Earth radius in miles, used for great-circle distances
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Planar Web Mercator coordinate (x, y) in meters
pub type ProjectedPoint = DVec2;

/// A geographic position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    pub const fn new(longitude: f64, latitude: f64) -> Self {
        Self { longitude, latitude }
    }

    /// True if this point may be handed to a map surface
    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        is_valid(self.longitude, self.latitude)
    }

    /// Great-circle distance to another point in miles
    #[inline(always)]
    pub fn distance_miles(&self, other: &GeoPoint) -> f64 {
        haversine_miles(self.longitude, self.latitude, other.longitude, other.latitude)
    }
}

/// Inverse Web Mercator: planar meters to longitude/latitude.
/// Total over finite input; extreme `y` approaches ±90° and is left to `is_valid`.
#[inline(always)]
pub fn project(x: f64, y: f64) -> GeoPoint {
    let longitude = x * (180.0 / (PI * MERCATOR_RADIUS_M));
    let latitude = (y / MERCATOR_RADIUS_M).sinh().atan() * (180.0 / PI);
    GeoPoint { longitude, latitude }
}

/// Forward Web Mercator: longitude/latitude to planar meters
#[inline(always)]
pub fn forward(point: GeoPoint) -> ProjectedPoint {
    let x = point.longitude.to_radians() * MERCATOR_RADIUS_M;
    let y = (PI / 4.0 + point.latitude.to_radians() / 2.0).tan().ln() * MERCATOR_RADIUS_M;
    DVec2::new(x, y)
}

/// Finite and within [-180, 180] x [-90, 90]
#[inline(always)]
pub fn is_valid(longitude: f64, latitude: f64) -> bool {
    longitude.is_finite()
        && latitude.is_finite()
        && (-180.0..=180.0).contains(&longitude)
        && (-90.0..=90.0).contains(&latitude)
}

/// Haversine distance in miles
pub fn haversine_miles(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_MILES * c
}

/// Miles spanned by one degree of latitude
#[inline(always)]
pub fn miles_per_degree() -> f64 {
    EARTH_RADIUS_MILES * PI / 180.0
}
