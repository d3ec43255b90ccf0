//! Braille terminal implementation of the map surface.

use std::collections::BTreeMap;

use tracing::debug;

use crate::braille::BrailleCanvas;
use crate::error::SurfaceError;
use crate::geo::GeoPoint;
use crate::map::basemap::Basemap;
use crate::map::geometry::draw_segment;
use crate::map::projection::Viewport;
use crate::model::ConstraintLevel;
use crate::surface::{
    ClickHandler, EventHandler, FitOptions, LineHandle, LineStyle, ListenerId, MapEvent,
    MapEventKind, MapSurface, MarkerElement, MarkerHandle, Popup, SessionId, SessionOptions,
};

/// Dots per screen pixel when converting pixel padding; a terminal cell is
/// roughly 8 px wide and 2 dots wide
const PIXELS_PER_DOT: u32 = 4;

pub struct PlacedMarker {
    pub point: GeoPoint,
    pub element: MarkerElement,
    pub popup: Popup,
    pub hidden: bool,
    on_click: Option<ClickHandler>,
}

/// A marker glyph positioned on the character grid
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerGlyph {
    pub handle: MarkerHandle,
    pub col: u16,
    pub row: u16,
    pub glyph: char,
    pub tone: ConstraintLevel,
    pub ring: Option<ConstraintLevel>,
}

/// One rendered frame, split into layers the UI colors separately
pub struct MapLayers {
    pub coastlines: BrailleCanvas,
    pub borders: BrailleCanvas,
    pub connections: BrailleCanvas,
    pub highlighted: BrailleCanvas,
    pub dimmed: BrailleCanvas,
    pub markers: Vec<MarkerGlyph>,
}

pub struct TerminalSurface {
    pub viewport: Viewport,
    pub basemap: Basemap,
    session: Option<SessionId>,
    loaded: bool,
    next_id: u64,
    markers: BTreeMap<MarkerHandle, PlacedMarker>,
    lines: BTreeMap<LineHandle, (GeoPoint, GeoPoint, LineStyle)>,
    listeners: Vec<(ListenerId, MapEventKind, EventHandler)>,
}

impl TerminalSurface {
    /// `width` and `height` in braille pixels
    pub fn new(basemap: Basemap, width: usize, height: usize) -> Self {
        Self {
            viewport: Viewport::world(width, height),
            basemap,
            session: None,
            loaded: false,
            next_id: 0,
            markers: BTreeMap::new(),
            lines: BTreeMap::new(),
            listeners: Vec::new(),
        }
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn emit(&mut self, event: &MapEvent) {
        let kind = event.kind();
        for (_, k, handler) in self.listeners.iter_mut() {
            if *k == kind {
                handler(event);
            }
        }
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.viewport.width = width;
        self.viewport.height = height;
    }

    /// A session finishes loading once its first frame has been drawn
    pub fn frame_drawn(&mut self) {
        if self.session.is_some() && !self.loaded {
            self.loaded = true;
            debug!("terminal map session loaded");
            self.emit(&MapEvent::Load);
        }
    }

    pub fn marker(&self, handle: MarkerHandle) -> Option<&PlacedMarker> {
        self.markers.get(&handle)
    }

    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    pub fn pan(&mut self, dx: i32, dy: i32) {
        self.viewport.pan(dx, dy);
    }

    fn zoom_with(&mut self, f: impl FnOnce(&mut Viewport)) {
        let before = self.viewport.zoom;
        f(&mut self.viewport);
        if self.viewport.zoom != before {
            let zoom = self.viewport.level();
            self.emit(&MapEvent::ZoomEnd { zoom });
        }
    }

    pub fn zoom_in(&mut self) {
        self.zoom_with(Viewport::zoom_in);
    }

    pub fn zoom_out(&mut self) {
        self.zoom_with(Viewport::zoom_out);
    }

    pub fn zoom_in_at(&mut self, px: i32, py: i32) {
        self.zoom_with(|vp| vp.zoom_in_at(px, py));
    }

    pub fn zoom_out_at(&mut self, px: i32, py: i32) {
        self.zoom_with(|vp| vp.zoom_out_at(px, py));
    }

    /// Visible marker under a pixel, within one character cell
    pub fn hit_test(&self, px: i32, py: i32) -> Option<MarkerHandle> {
        self.markers
            .iter()
            .filter(|(_, m)| !m.hidden)
            .filter_map(|(handle, m)| {
                let (mx, my) = self.viewport.project(m.point.longitude, m.point.latitude);
                let (dx, dy) = ((mx - px).abs(), (my - py).abs());
                (dx <= 2 && dy <= 4).then_some((dx * dx + dy * dy, *handle))
            })
            .min()
            .map(|(_, handle)| handle)
    }

    /// Click at a pixel: runs the hit marker's handler, then notifies click listeners
    pub fn click_at(&mut self, px: i32, py: i32) -> Option<MarkerHandle> {
        if self.session.is_none() {
            return None;
        }
        let hit = self.hit_test(px, py);
        if let Some(on_click) = hit.and_then(|h| self.markers.get(&h)).and_then(|m| m.on_click.as_ref()) {
            on_click();
        }
        let (lon, lat) = self.viewport.unproject(px, py);
        self.emit(&MapEvent::Click {
            point: GeoPoint::new(lon, lat),
            marker: hit,
        });
        hit
    }

    /// Render a frame of `cols` x `rows` characters
    pub fn render(&self, cols: usize, rows: usize) -> MapLayers {
        let mut viewport = self.viewport.clone();
        viewport.width = cols * 2;
        viewport.height = rows * 4;

        let mut layers = MapLayers {
            coastlines: BrailleCanvas::new(cols, rows),
            borders: BrailleCanvas::new(cols, rows),
            connections: BrailleCanvas::new(cols, rows),
            highlighted: BrailleCanvas::new(cols, rows),
            dimmed: BrailleCanvas::new(cols, rows),
            markers: Vec::new(),
        };
        self.basemap.render(&mut layers.coastlines, &mut layers.borders, &viewport);

        if self.session.is_none() {
            return layers;
        }

        for (from, to, style) in self.lines.values() {
            let canvas = if style.emphasized {
                &mut layers.highlighted
            } else if style.dimmed {
                &mut layers.dimmed
            } else {
                &mut layers.connections
            };
            let a = (from.longitude, from.latitude);
            let b = (to.longitude, to.latitude);
            draw_segment(canvas, a, b, &viewport, style.emphasized);
        }

        for (handle, marker) in &self.markers {
            if marker.hidden {
                continue;
            }
            let (px, py) = viewport.project(marker.point.longitude, marker.point.latitude);
            if px < 0 || py < 0 || px >= viewport.width as i32 || py >= viewport.height as i32 {
                continue;
            }
            layers.markers.push(MarkerGlyph {
                handle: *handle,
                col: (px / 2) as u16,
                row: (py / 4) as u16,
                glyph: marker.element.glyph,
                tone: marker.element.tone,
                ring: marker.element.ring,
            });
        }
        layers
    }
}

impl MapSurface for TerminalSurface {
    fn init(&mut self, options: &SessionOptions) -> Result<SessionId, SurfaceError> {
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(SurfaceError::Rejected("terminal too small for a map".to_string()));
        }
        let id = SessionId(self.next());
        self.session = Some(id);
        self.loaded = false;
        self.viewport.bounds = options.max_bounds;
        self.viewport.set_level(options.zoom);
        self.viewport.set_center(options.center);
        debug!(?id, style = %options.style, zoom = options.zoom, "terminal map session started");
        Ok(id)
    }

    fn is_loaded(&self) -> bool {
        self.session.is_some() && self.loaded
    }

    fn destroy(&mut self, session: SessionId) {
        if self.session != Some(session) {
            return;
        }
        self.markers.clear();
        self.lines.clear();
        self.listeners.clear();
        self.session = None;
        self.loaded = false;
    }

    fn is_alive(&self) -> bool {
        self.session.is_some()
    }

    fn zoom(&self) -> f64 {
        self.viewport.level()
    }

    fn create_marker(
        &mut self,
        point: GeoPoint,
        element: MarkerElement,
        popup: Popup,
        on_click: Option<ClickHandler>,
    ) -> Result<MarkerHandle, SurfaceError> {
        if self.session.is_none() {
            return Err(SurfaceError::NoSession);
        }
        if !point.is_valid() {
            return Err(SurfaceError::Rejected(format!("invalid point {point:?}")));
        }
        let handle = MarkerHandle(self.next());
        self.markers.insert(
            handle,
            PlacedMarker {
                point,
                element,
                popup,
                hidden: false,
                on_click,
            },
        );
        Ok(handle)
    }

    fn remove_marker(&mut self, handle: MarkerHandle) {
        self.markers.remove(&handle);
    }

    fn set_marker_hidden(&mut self, handle: MarkerHandle, hidden: bool) {
        if let Some(marker) = self.markers.get_mut(&handle) {
            marker.hidden = hidden;
        }
    }

    fn add_line(
        &mut self,
        from: GeoPoint,
        to: GeoPoint,
        style: LineStyle,
    ) -> Result<LineHandle, SurfaceError> {
        if self.session.is_none() {
            return Err(SurfaceError::NoSession);
        }
        let handle = LineHandle(self.next());
        self.lines.insert(handle, (from, to, style));
        Ok(handle)
    }

    fn remove_line(&mut self, handle: LineHandle) {
        self.lines.remove(&handle);
    }

    fn fit_bounds(&mut self, points: &[GeoPoint], options: FitOptions) {
        let padding = (options.padding / PIXELS_PER_DOT) as usize;
        let padding = padding.min(self.viewport.width.min(self.viewport.height) / 4);
        self.zoom_with(|vp| vp.fit(points, padding, options.max_zoom));
    }

    fn on(&mut self, kind: MapEventKind, handler: EventHandler) -> ListenerId {
        let id = ListenerId(self.next());
        self.listeners.push((id, kind, handler));
        id
    }

    fn off(&mut self, id: ListenerId) {
        self.listeners.retain(|(lid, _, _)| *lid != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn options() -> SessionOptions {
        SessionOptions {
            style: "terminal".into(),
            center: GeoPoint::new(-122.4194, 37.7749),
            zoom: 12.0,
            max_bounds: None,
        }
    }

    fn element() -> MarkerElement {
        MarkerElement {
            glyph: '●',
            tone: ConstraintLevel::Low,
            ring: None,
        }
    }

    fn live_surface() -> TerminalSurface {
        let mut surface = TerminalSurface::new(Basemap::new(), 160, 96);
        surface.init(&options()).unwrap();
        surface
    }

    #[test]
    fn test_loads_after_first_frame() {
        let mut surface = live_surface();
        let loads = Rc::new(RefCell::new(0));
        let counter = loads.clone();
        surface.on(MapEventKind::Load, Box::new(move |_| *counter.borrow_mut() += 1));

        assert!(!surface.is_loaded());
        surface.frame_drawn();
        surface.frame_drawn();
        assert!(surface.is_loaded());
        assert_eq!(*loads.borrow(), 1);
        assert!((surface.zoom() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_marker_requires_session() {
        let mut surface = TerminalSurface::new(Basemap::new(), 160, 96);
        let result = surface.create_marker(GeoPoint::new(0.0, 0.0), element(), Popup::new("x"), None);
        assert!(matches!(result, Err(SurfaceError::NoSession)));
    }

    #[test]
    fn test_click_hits_marker_at_center() {
        let mut surface = live_surface();
        let clicked = Rc::new(RefCell::new(false));
        let flag = clicked.clone();
        let handle = surface
            .create_marker(
                GeoPoint::new(-122.4194, 37.7749),
                element(),
                Popup::new("center"),
                Some(Box::new(move || *flag.borrow_mut() = true)),
            )
            .unwrap();

        assert_eq!(surface.click_at(80, 48), Some(handle));
        assert!(*clicked.borrow());
        assert_eq!(surface.click_at(0, 0), None);
    }

    #[test]
    fn test_hidden_markers_not_rendered_or_hit() {
        let mut surface = live_surface();
        let handle = surface
            .create_marker(GeoPoint::new(-122.4194, 37.7749), element(), Popup::new("c"), None)
            .unwrap();
        assert_eq!(surface.render(80, 24).markers.len(), 1);

        surface.set_marker_hidden(handle, true);
        assert!(surface.render(80, 24).markers.is_empty());
        assert_eq!(surface.hit_test(80, 48), None);
    }

    #[test]
    fn test_fit_bounds_emits_zoom_end() {
        let mut surface = live_surface();
        let zooms = Rc::new(RefCell::new(Vec::new()));
        let sink = zooms.clone();
        surface.on(
            MapEventKind::ZoomEnd,
            Box::new(move |e| {
                if let MapEvent::ZoomEnd { zoom } = e {
                    sink.borrow_mut().push(*zoom);
                }
            }),
        );
        surface.fit_bounds(
            &[GeoPoint::new(-123.0, 37.0), GeoPoint::new(-121.0, 38.5)],
            FitOptions::default(),
        );
        let zooms = zooms.borrow();
        assert_eq!(zooms.len(), 1);
        assert!(zooms[0] < 12.0);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut surface = live_surface();
        let session = SessionId(1);
        surface
            .create_marker(GeoPoint::new(-122.4, 37.7), element(), Popup::new("a"), None)
            .unwrap();
        surface
            .add_line(GeoPoint::new(-122.4, 37.7), GeoPoint::new(-122.5, 37.8), LineStyle::default())
            .unwrap();
        surface.destroy(session);
        assert!(!surface.is_alive());
        assert_eq!(surface.marker_count(), 0);
        assert!(surface.render(80, 24).markers.is_empty());
    }
}
