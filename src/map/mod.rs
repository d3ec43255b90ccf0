mod basemap;
mod geometry;
mod projection;
mod spatial;
mod surface;

pub use basemap::{Basemap, LineString, Lod};
pub use projection::{Viewport, MAX_SCALE, MIN_SCALE};
pub use spatial::SpatialGrid;
pub use surface::{MapLayers, MarkerGlyph, PlacedMarker, TerminalSurface};
