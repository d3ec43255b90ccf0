use crate::braille::BrailleCanvas;
use crate::map::geometry::draw_path;
use crate::map::projection::Viewport;

/// A geographic line (sequence of lon/lat coordinates)
pub type LineString = Vec<(f64, f64)>;

/// Level of detail for basemap data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lod {
    Low,    // 110m - world view
    Medium, // 50m - continental
    High,   // 10m - regional
}

impl Lod {
    /// Select LOD from the viewport scale factor
    pub fn from_zoom(zoom: f64) -> Self {
        if zoom < 2.0 {
            Lod::Low
        } else if zoom < 8.0 {
            Lod::Medium
        } else {
            Lod::High
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Lod::Low => "110m",
            Lod::Medium => "50m",
            Lod::High => "10m",
        }
    }
}

/// Coastlines and borders drawn under the markers
#[derive(Default)]
pub struct Basemap {
    coastlines_low: Vec<LineString>,
    coastlines_medium: Vec<LineString>,
    coastlines_high: Vec<LineString>,
    borders_medium: Vec<LineString>,
    borders_high: Vec<LineString>,
    pub show_borders: bool,
}

impl Basemap {
    pub fn new() -> Self {
        Self {
            show_borders: true,
            ..Self::default()
        }
    }

    /// Coastlines for `lod`, falling back to coarser data when finer is missing
    pub fn coastlines(&self, lod: Lod) -> &[LineString] {
        let candidates = match lod {
            Lod::High => [&self.coastlines_high, &self.coastlines_medium, &self.coastlines_low],
            Lod::Medium => [&self.coastlines_medium, &self.coastlines_low, &self.coastlines_low],
            Lod::Low => [&self.coastlines_low, &self.coastlines_low, &self.coastlines_low],
        };
        candidates
            .into_iter()
            .find(|lines| !lines.is_empty())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn borders(&self, lod: Lod) -> &[LineString] {
        match lod {
            Lod::High if !self.borders_high.is_empty() => &self.borders_high,
            _ => &self.borders_medium,
        }
    }

    /// Draw coastlines into `coast` and, when enabled, borders into `borders`
    pub fn render(&self, coast: &mut BrailleCanvas, borders: &mut BrailleCanvas, viewport: &Viewport) {
        let lod = Lod::from_zoom(viewport.zoom);
        for line in self.coastlines(lod) {
            draw_path(coast, line, viewport);
        }
        if self.show_borders {
            for line in self.borders(lod) {
                draw_path(borders, line, viewport);
            }
        }
    }

    pub fn add_coastline(&mut self, line: LineString, lod: Lod) {
        match lod {
            Lod::Low => self.coastlines_low.push(line),
            Lod::Medium => self.coastlines_medium.push(line),
            Lod::High => self.coastlines_high.push(line),
        }
    }

    pub fn add_border(&mut self, line: LineString, lod: Lod) {
        match lod {
            Lod::High => self.borders_high.push(line),
            Lod::Low | Lod::Medium => self.borders_medium.push(line),
        }
    }

    pub fn has_data(&self) -> bool {
        !self.coastlines_low.is_empty()
            || !self.coastlines_medium.is_empty()
            || !self.coastlines_high.is_empty()
    }

    pub fn toggle_borders(&mut self) {
        self.show_borders = !self.show_borders;
    }
}
