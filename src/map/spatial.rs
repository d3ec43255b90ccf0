use std::collections::HashMap;

use crate::geo::GeoPoint;

/// Spatial hash grid for region queries over point data.
/// Divides the lon/lat plane into square cells; items keep their insertion index.
pub struct SpatialGrid<T> {
    /// Grid cells indexed by (cell_x, cell_y)
    cells: HashMap<(i32, i32), Vec<usize>>,
    /// All items (indices into this vec stored in cells)
    items: Vec<T>,
    /// Cell size in degrees
    cell_size: f64,
}

impl<T> SpatialGrid<T> {
    /// Create a new spatial grid with given cell size in degrees
    pub fn new(cell_size: f64) -> Self {
        Self {
            cells: HashMap::new(),
            items: Vec::new(),
            cell_size,
        }
    }

    /// Convert lon/lat to cell coordinates
    #[inline(always)]
    fn to_cell(&self, lon: f64, lat: f64) -> (i32, i32) {
        let x = (lon / self.cell_size).floor() as i32;
        let y = (lat / self.cell_size).floor() as i32;
        (x, y)
    }

    /// Insert an item at a geographic position, returning its index
    pub fn insert(&mut self, point: GeoPoint, item: T) -> usize {
        let idx = self.items.len();
        self.items.push(item);

        let cell = self.to_cell(point.longitude, point.latitude);
        self.cells.entry(cell).or_default().push(idx);
        idx
    }

    /// Indices of items in the cells covering a lon/lat box around a point.
    /// May contain false positives; returned in ascending insertion order.
    pub fn query_box(&self, center: GeoPoint, lon_radius: f64, lat_radius: f64) -> Vec<usize> {
        let min_cell = self.to_cell(center.longitude - lon_radius, center.latitude - lat_radius);
        let max_cell = self.to_cell(center.longitude + lon_radius, center.latitude + lat_radius);

        let mut results = Vec::new();
        for y in min_cell.1..=max_cell.1 {
            for x in min_cell.0..=max_cell.0 {
                if let Some(indices) = self.cells.get(&(x, y)) {
                    results.extend_from_slice(indices);
                }
            }
        }

        results.sort_unstable();
        results
    }

    /// Get item by index
    #[inline(always)]
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.items.get(idx)
    }

    /// Number of items
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_box_returns_sorted_indices() {
        let mut grid = SpatialGrid::new(0.5);
        grid.insert(GeoPoint::new(-122.0, 37.0), "b");
        grid.insert(GeoPoint::new(-123.9, 37.1), "a");
        grid.insert(GeoPoint::new(-122.1, 37.2), "c");

        let hits = grid.query_box(GeoPoint::new(-122.05, 37.1), 0.2, 0.2);
        assert_eq!(hits, vec![0, 2]);
        assert_eq!(grid.get(2), Some(&"c"));
        assert_eq!(grid.len(), 3);
    }

    #[test]
    fn test_query_box_spans_cells() {
        let mut grid = SpatialGrid::new(1.0);
        for i in 0..10 {
            grid.insert(GeoPoint::new(i as f64, 0.5), i);
        }
        let hits = grid.query_box(GeoPoint::new(4.5, 0.5), 2.0, 0.1);
        assert_eq!(hits, vec![2, 3, 4, 5, 6]);
    }
}
