use anyhow::Result;
use geojson::{GeoJson, Geometry, Value};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::map::{Basemap, LineString, Lod};

/// Coastline files by resolution, coarsest first
const COASTLINES: [(&str, Lod); 3] = [
    ("ne_110m_coastline.json", Lod::Low),
    ("ne_50m_coastline.json", Lod::Medium),
    ("ne_10m_coastline.json", Lod::High),
];

const BORDERS: [(&str, Lod); 2] = [("ne_50m_borders.json", Lod::Medium), ("ne_10m_borders.json", Lod::High)];

/// Load whatever Natural Earth files exist in `data_dir`; returns the number of lines added
pub fn load_basemap(basemap: &mut Basemap, data_dir: &Path) -> usize {
    let mut added = 0;
    for (filename, lod) in COASTLINES {
        added += load_file(data_dir, filename, |line| basemap.add_coastline(line, lod));
    }
    for (filename, lod) in BORDERS {
        added += load_file(data_dir, filename, |line| basemap.add_border(line, lod));
    }
    added
}

fn load_file<F: FnMut(LineString)>(data_dir: &Path, filename: &str, mut add: F) -> usize {
    let path = data_dir.join(filename);
    if !path.exists() {
        return 0;
    }
    let mut count = 0;
    match read_geojson(&path) {
        Ok(geojson) => {
            for_each_line(&geojson, |line| {
                count += 1;
                add(line)
            });
            debug!(file = filename, lines = count, "loaded basemap layer");
        }
        Err(e) => warn!(file = filename, error = %e, "failed to load basemap layer"),
    }
    count
}

fn read_geojson(path: &Path) -> Result<GeoJson> {
    let content = fs::read_to_string(path)?;
    Ok(content.parse()?)
}

/// Call `add_line` for every line and polygon exterior ring
fn for_each_line<F: FnMut(LineString)>(geojson: &GeoJson, mut add_line: F) {
    match geojson {
        GeoJson::FeatureCollection(fc) => {
            for geometry in fc.features.iter().filter_map(|f| f.geometry.as_ref()) {
                geometry_lines(geometry, &mut add_line);
            }
        }
        GeoJson::Feature(f) => {
            if let Some(geometry) = &f.geometry {
                geometry_lines(geometry, &mut add_line);
            }
        }
        GeoJson::Geometry(geometry) => geometry_lines(geometry, &mut add_line),
    }
}

fn to_line(coords: &[Vec<f64>]) -> LineString {
    coords.iter().filter(|c| c.len() >= 2).map(|c| (c[0], c[1])).collect()
}

fn geometry_lines<F: FnMut(LineString)>(geometry: &Geometry, add_line: &mut F) {
    match &geometry.value {
        Value::LineString(coords) => add_line(to_line(coords)),
        Value::MultiLineString(lines) => lines.iter().for_each(|l| add_line(to_line(l))),
        Value::Polygon(rings) => {
            if let Some(exterior) = rings.first() {
                add_line(to_line(exterior));
            }
        }
        Value::MultiPolygon(polygons) => {
            for exterior in polygons.iter().filter_map(|rings| rings.first()) {
                add_line(to_line(exterior));
            }
        }
        Value::GeometryCollection(geometries) => {
            for g in geometries {
                geometry_lines(g, add_line);
            }
        }
        _ => {}
    }
}

/// Coarse outline of the continents for when no coastline file is present
pub fn builtin_outline(basemap: &mut Basemap) {
    let outlines: [&[(f64, f64)]; 6] = [
        // North America
        &[
            (-166.0, 68.0), (-164.0, 60.0), (-150.0, 59.0), (-135.0, 57.0), (-124.5, 48.5),
            (-124.2, 42.0), (-122.5, 37.8), (-117.1, 32.5), (-109.5, 23.0), (-105.0, 20.0),
            (-97.0, 16.0), (-88.0, 15.5), (-83.0, 10.0), (-77.0, 8.0), (-82.0, 16.0),
            (-87.0, 21.5), (-90.5, 21.0), (-97.5, 22.0), (-97.2, 27.8), (-90.0, 29.5),
            (-82.7, 28.0), (-80.1, 25.8), (-81.0, 31.5), (-75.5, 35.3), (-74.0, 40.6),
            (-70.0, 41.8), (-66.9, 44.8), (-61.0, 45.5), (-53.0, 47.5), (-56.0, 52.0),
            (-61.5, 56.5), (-65.0, 60.3), (-78.0, 62.5), (-94.0, 60.0), (-94.5, 68.5),
            (-115.0, 68.5), (-128.0, 70.0), (-141.0, 69.6), (-156.5, 71.3), (-166.0, 68.0),
        ],
        // South America
        &[
            (-77.0, 8.0), (-72.0, 12.0), (-62.0, 10.5), (-51.0, 4.0), (-44.0, -2.5),
            (-35.0, -7.5), (-39.0, -17.0), (-43.0, -23.0), (-48.5, -28.0), (-57.5, -38.0),
            (-65.0, -41.0), (-67.5, -46.5), (-69.0, -52.0), (-74.5, -52.5), (-73.5, -44.0),
            (-71.5, -30.0), (-70.3, -18.5), (-76.5, -13.0), (-81.0, -5.0), (-80.0, 0.5),
            (-77.0, 8.0),
        ],
        // Europe
        &[
            (-9.5, 37.0), (-6.0, 36.2), (0.0, 39.0), (3.2, 43.0), (8.5, 44.2),
            (12.5, 41.8), (15.8, 38.0), (18.5, 40.3), (13.0, 45.7), (19.5, 42.0),
            (23.0, 37.0), (26.0, 40.7), (29.0, 41.2), (28.0, 45.5), (39.0, 47.0),
            (41.5, 41.5), (40.0, 55.0), (33.0, 69.0), (25.0, 71.0), (14.0, 68.0),
            (5.0, 62.0), (5.5, 58.0), (10.5, 59.0), (8.0, 56.5), (8.5, 53.5),
            (4.5, 52.5), (1.5, 50.5), (-4.5, 48.4), (-1.2, 46.0), (-1.8, 43.4),
            (-9.0, 43.0), (-9.5, 37.0),
        ],
        // Africa
        &[
            (-17.0, 21.0), (-16.5, 14.0), (-13.0, 8.0), (-7.5, 4.5), (2.0, 6.3),
            (9.5, 4.0), (9.3, -1.0), (13.0, -9.0), (11.8, -17.0), (15.5, -27.0),
            (18.4, -34.2), (25.5, -34.0), (32.5, -28.5), (35.5, -22.0), (40.5, -15.0),
            (39.5, -5.0), (51.2, 11.5), (43.5, 11.8), (38.5, 18.0), (32.5, 30.0),
            (25.0, 31.8), (20.0, 32.0), (10.5, 36.8), (-1.0, 35.5), (-9.5, 30.5),
            (-17.0, 21.0),
        ],
        // Asia
        &[
            (41.5, 41.5), (49.5, 37.5), (56.5, 27.0), (61.5, 25.0), (67.0, 24.5),
            (72.8, 19.0), (77.0, 8.0), (80.3, 13.0), (87.0, 21.5), (91.8, 22.3),
            (94.0, 16.0), (98.5, 8.0), (103.5, 1.3), (100.5, 13.5), (105.0, 8.6),
            (109.2, 12.0), (106.0, 20.5), (113.5, 22.2), (121.5, 25.0), (121.9, 30.8),
            (119.2, 34.8), (121.5, 39.0), (126.5, 37.5), (129.5, 35.2), (129.7, 42.5),
            (141.0, 52.0), (135.5, 54.8), (143.0, 59.5), (160.0, 61.0), (170.0, 66.0),
            (180.0, 68.5), (140.0, 72.5), (113.0, 73.5), (100.0, 79.0), (80.0, 73.5),
            (68.5, 68.0), (55.0, 68.5), (40.0, 66.0), (40.0, 55.0), (41.5, 41.5),
        ],
        // Australia
        &[
            (113.5, -22.0), (114.2, -27.5), (115.0, -34.3), (118.0, -35.0), (124.0, -33.5),
            (131.0, -31.5), (137.5, -35.5), (140.5, -38.0), (146.0, -39.0), (150.0, -37.5),
            (153.5, -28.0), (153.0, -25.0), (145.5, -15.0), (142.5, -10.7), (141.5, -17.0),
            (136.5, -12.0), (130.0, -11.0), (126.0, -14.0), (121.5, -19.0), (113.5, -22.0),
        ],
    ];
    for outline in outlines {
        basemap.add_coastline(outline.to_vec(), Lod::Low);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygons_and_lines_become_linestrings() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("ne_110m_coastline.json"),
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {},
                 "geometry": {"type": "LineString", "coordinates": [[0, 0], [1, 1]]}},
                {"type": "Feature", "properties": {},
                 "geometry": {"type": "MultiPolygon", "coordinates": [
                    [[[0, 0], [1, 0], [1, 1], [0, 0]], [[0.2, 0.2], [0.4, 0.2], [0.2, 0.4], [0.2, 0.2]]],
                    [[[5, 5], [6, 5], [6, 6], [5, 5]]]
                 ]}}
            ]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("ne_50m_borders.json"), "not geojson").unwrap();

        let mut basemap = Basemap::new();
        assert_eq!(load_basemap(&mut basemap, dir.path()), 3);
        assert!(basemap.has_data());
    }

    #[test]
    fn test_builtin_outline_closes_rings() {
        let mut basemap = Basemap::new();
        builtin_outline(&mut basemap);
        assert!(basemap.has_data());
        assert!(basemap
            .coastlines(Lod::Low)
            .iter()
            .all(|line| line.first() == line.last()));
    }
}
