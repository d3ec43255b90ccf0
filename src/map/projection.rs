use std::f64::consts::PI;

use crate::geo::GeoPoint;

/// Scale factor limits. A factor of 1 fits the whole world across the canvas.
pub const MIN_SCALE: f64 = 0.5;
pub const MAX_SCALE: f64 = (1u64 << 20) as f64;

const MAX_LAT: f64 = 85.0;

/// Normalized Web Mercator y in [0, 1], 0 at the north edge
fn mercator_y(lat: f64) -> f64 {
    let lat_rad = lat.to_radians();
    (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0
}

fn mercator_x(lon: f64) -> f64 {
    (lon + 180.0) / 360.0
}

fn lat_from_mercator_y(y: f64) -> f64 {
    (PI * (1.0 - 2.0 * y)).sinh().atan().to_degrees()
}

/// Visible map area in braille pixels
#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    pub center_lon: f64,
    pub center_lat: f64,
    /// Scale factor (higher = more zoomed in)
    pub zoom: f64,
    pub width: usize,
    pub height: usize,
    /// South-west and north-east corners the center may not leave
    pub bounds: Option<(GeoPoint, GeoPoint)>,
}

impl Viewport {
    pub fn new(center_lon: f64, center_lat: f64, zoom: f64, width: usize, height: usize) -> Self {
        Self {
            center_lon,
            center_lat,
            zoom: zoom.clamp(MIN_SCALE, MAX_SCALE),
            width,
            height,
            bounds: None,
        }
    }

    pub fn world(width: usize, height: usize) -> Self {
        Self::new(0.0, 20.0, 1.0, width, height)
    }

    /// Web-map zoom level: log2 of the scale factor
    pub fn level(&self) -> f64 {
        self.zoom.log2()
    }

    pub fn set_level(&mut self, level: f64) {
        self.zoom = 2f64.powf(level).clamp(MIN_SCALE, MAX_SCALE);
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(self.center_lon, self.center_lat)
    }

    pub fn set_center(&mut self, center: GeoPoint) {
        self.center_lon = center.longitude;
        self.center_lat = center.latitude;
        self.constrain();
    }

    /// Wrap longitude, clamp latitude, then keep the center inside `bounds`
    fn constrain(&mut self) {
        if self.center_lon > 180.0 {
            self.center_lon -= 360.0;
        } else if self.center_lon < -180.0 {
            self.center_lon += 360.0;
        }
        self.center_lat = self.center_lat.clamp(-MAX_LAT, MAX_LAT);

        if let Some((sw, ne)) = self.bounds {
            if ne.longitude - sw.longitude < 360.0 {
                self.center_lon = self.center_lon.clamp(sw.longitude, ne.longitude);
            }
            self.center_lat = self.center_lat.clamp(sw.latitude, ne.latitude);
        }
    }

    fn scale(&self) -> f64 {
        self.zoom * self.width as f64
    }

    /// Pan by a pixel delta
    pub fn pan(&mut self, dx: i32, dy: i32) {
        let scale = self.scale();
        let x = mercator_x(self.center_lon) + dx as f64 / scale;
        let y = (mercator_y(self.center_lat) + dy as f64 / scale).clamp(0.0, 1.0);
        self.center_lon = x * 360.0 - 180.0;
        self.center_lat = lat_from_mercator_y(y);
        self.constrain();
    }

    pub fn zoom_in(&mut self) {
        self.zoom = (self.zoom * 1.5).min(MAX_SCALE);
    }

    pub fn zoom_out(&mut self) {
        self.zoom = (self.zoom / 1.5).max(MIN_SCALE);
    }

    pub fn zoom_in_at(&mut self, px: i32, py: i32) {
        self.zoom_at(px, py, 1.5);
    }

    pub fn zoom_out_at(&mut self, px: i32, py: i32) {
        self.zoom_at(px, py, 1.0 / 1.5);
    }

    /// Zoom by `factor`, keeping the point under (px, py) in place
    fn zoom_at(&mut self, px: i32, py: i32, factor: f64) {
        let (lon, lat) = self.unproject(px, py);
        self.zoom = (self.zoom * factor).clamp(MIN_SCALE, MAX_SCALE);
        let (new_px, new_py) = self.project(lon, lat);
        self.pan(new_px - px, new_py - py);
    }

    /// Pixel coordinates back to (lon, lat)
    pub fn unproject(&self, px: i32, py: i32) -> (f64, f64) {
        let scale = self.scale();
        let x = (px as f64 - self.width as f64 / 2.0) / scale + mercator_x(self.center_lon);
        let y = (py as f64 - self.height as f64 / 2.0) / scale + mercator_y(self.center_lat);
        (x * 360.0 - 180.0, lat_from_mercator_y(y))
    }

    /// (lon, lat) to pixel coordinates
    pub fn project(&self, lon: f64, lat: f64) -> (i32, i32) {
        let (px, py) = self.project_f64(lon, lat);
        (px as i32, py as i32)
    }

    pub fn project_f64(&self, lon: f64, lat: f64) -> (f64, f64) {
        let scale = self.scale();
        let px = (mercator_x(lon) - mercator_x(self.center_lon)) * scale + self.width as f64 / 2.0;
        let py = (mercator_y(lat) - mercator_y(self.center_lat)) * scale + self.height as f64 / 2.0;
        (px, py)
    }

    /// Rough bounding-box test for a segment
    pub fn line_might_be_visible(&self, p1: (i32, i32), p2: (i32, i32)) -> bool {
        p1.0.max(p2.0) >= 0
            && p1.0.min(p2.0) < self.width as i32
            && p1.1.max(p2.1) >= 0
            && p1.1.min(p2.1) < self.height as i32
    }

    /// Center on the bounding box of `points` and zoom so it fits inside
    /// `padding` pixels of margin, never beyond `max_level`
    pub fn fit(&mut self, points: &[GeoPoint], padding: usize, max_level: f64) {
        let Some(first) = points.first() else {
            return;
        };
        let (mut min_x, mut max_x) = (mercator_x(first.longitude), mercator_x(first.longitude));
        let (mut min_y, mut max_y) = (mercator_y(first.latitude), mercator_y(first.latitude));
        for p in &points[1..] {
            let (x, y) = (mercator_x(p.longitude), mercator_y(p.latitude));
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);
        }

        let width = self.width as f64;
        let usable_w = (width - 2.0 * padding as f64).max(1.0);
        let usable_h = (self.height as f64 - 2.0 * padding as f64).max(1.0);
        let max_zoom = 2f64.powf(max_level).min(MAX_SCALE);
        let fit_w = if max_x > min_x { usable_w / ((max_x - min_x) * width) } else { max_zoom };
        let fit_h = if max_y > min_y { usable_h / ((max_y - min_y) * width) } else { max_zoom };
        self.zoom = fit_w.min(fit_h).min(max_zoom).max(MIN_SCALE);

        self.center_lon = (min_x + max_x) / 2.0 * 360.0 - 180.0;
        self.center_lat = lat_from_mercator_y((min_y + max_y) / 2.0);
        self.constrain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_center() {
        let vp = Viewport::new(0.0, 0.0, 1.0, 100, 100);
        assert_eq!(vp.project(0.0, 0.0), (50, 50));
    }

    #[test]
    fn test_unproject_inverts_project() {
        let vp = Viewport::new(-122.4, 37.7, 4096.0, 200, 120);
        let (px, py) = vp.project_f64(-122.41, 37.71);
        let (lon, lat) = vp.unproject(px.round() as i32, py.round() as i32);
        assert!((lon + 122.41).abs() < 1e-3);
        assert!((lat - 37.71).abs() < 1e-3);
    }

    #[test]
    fn test_pan() {
        let mut vp = Viewport::new(0.0, 0.0, 1.0, 100, 100);
        vp.pan(10, 0);
        assert!(vp.center_lon > 0.0);
    }

    #[test]
    fn test_level_round_trip() {
        let mut vp = Viewport::world(100, 100);
        vp.set_level(12.0);
        assert!((vp.level() - 12.0).abs() < 1e-9);
        vp.set_level(40.0);
        assert_eq!(vp.zoom, MAX_SCALE);
    }

    #[test]
    fn test_bounds_clamp_center() {
        let mut vp = Viewport::new(-122.4, 37.7, 4096.0, 100, 100);
        vp.bounds = Some((GeoPoint::new(-123.0, 37.0), GeoPoint::new(-122.0, 38.0)));
        vp.set_center(GeoPoint::new(-100.0, 50.0));
        assert_eq!(vp.center(), GeoPoint::new(-122.0, 38.0));
    }

    #[test]
    fn test_fit_contains_points() {
        let mut vp = Viewport::world(200, 120);
        let points = [GeoPoint::new(-122.5, 37.7), GeoPoint::new(-122.3, 37.8)];
        vp.fit(&points, 10, 15.0);
        for p in points {
            let (px, py) = vp.project(p.longitude, p.latitude);
            assert!((9..=191).contains(&px), "px {px}");
            assert!((9..=111).contains(&py), "py {py}");
        }
        assert!(vp.level() <= 15.0);
    }

    #[test]
    fn test_fit_single_point_uses_max_level() {
        let mut vp = Viewport::world(200, 120);
        vp.fit(&[GeoPoint::new(10.0, 10.0)], 10, 15.0);
        assert!((vp.level() - 15.0).abs() < 1e-9);
        assert!((vp.center_lon - 10.0).abs() < 1e-9);
    }
}
