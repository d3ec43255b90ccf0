use std::collections::BTreeMap;

use super::{
    ClickHandler, EventHandler, FitOptions, LineHandle, LineStyle, ListenerId, MapEvent,
    MapEventKind, MapSurface, MarkerElement, MarkerHandle, Popup, SessionId, SessionOptions,
};
use crate::error::SurfaceError;
use crate::geo::GeoPoint;

pub struct RecordedMarker {
    pub point: GeoPoint,
    pub element: MarkerElement,
    pub popup: Popup,
    pub hidden: bool,
    on_click: Option<ClickHandler>,
}

/// Headless surface that records every call; used by tests and benches
#[derive(Default)]
pub struct RecordingSurface {
    session: Option<SessionId>,
    next_id: u64,
    loaded: bool,
    /// When false, `init` succeeds but the session never reports loaded
    pub loads_on_init: bool,
    pub zoom: f64,
    pub markers: BTreeMap<MarkerHandle, RecordedMarker>,
    pub lines: BTreeMap<LineHandle, (GeoPoint, GeoPoint, LineStyle)>,
    listeners: Vec<(ListenerId, MapEventKind, EventHandler)>,
    pub created: usize,
    pub removed: usize,
    pub sessions_started: usize,
    pub sessions_destroyed: usize,
    pub last_fit: Option<Vec<GeoPoint>>,
    /// Markers whose popup title is listed here fail to create
    pub reject_titles: Vec<String>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self {
            loads_on_init: true,
            zoom: 12.0,
            ..Self::default()
        }
    }

    /// Surface with a live, loaded session
    pub fn loaded() -> Self {
        let mut surface = Self::new();
        surface.session = Some(SessionId(0));
        surface.loaded = true;
        surface
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Mark the pending session as loaded and notify listeners
    pub fn finish_loading(&mut self) {
        if self.session.is_some() {
            self.loaded = true;
            self.emit(&MapEvent::Load);
        }
    }

    pub fn emit(&mut self, event: &MapEvent) {
        let kind = event.kind();
        for (_, k, handler) in self.listeners.iter_mut() {
            if *k == kind {
                handler(event);
            }
        }
    }

    /// Change zoom and fire zoom-end
    pub fn zoom_to(&mut self, zoom: f64) {
        self.zoom = zoom;
        self.emit(&MapEvent::ZoomEnd { zoom });
    }

    /// Invoke the click handler of a marker, as a user click would
    pub fn click(&mut self, handle: MarkerHandle) {
        let point = match self.markers.get(&handle) {
            Some(marker) => {
                if let Some(on_click) = &marker.on_click {
                    on_click();
                }
                marker.point
            }
            None => return,
        };
        self.emit(&MapEvent::Click {
            point,
            marker: Some(handle),
        });
    }

    /// Drop the session without going through `destroy`, as a crashed renderer would
    pub fn kill(&mut self) {
        self.session = None;
        self.loaded = false;
    }

    pub fn live_markers(&self) -> usize {
        self.markers.len()
    }

    pub fn hidden_markers(&self) -> usize {
        self.markers.values().filter(|m| m.hidden).count()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl MapSurface for RecordingSurface {
    fn init(&mut self, options: &SessionOptions) -> Result<SessionId, SurfaceError> {
        let id = SessionId(self.next());
        self.session = Some(id);
        self.loaded = false;
        self.zoom = options.zoom;
        self.sessions_started += 1;
        if self.loads_on_init {
            self.finish_loading();
        }
        Ok(id)
    }

    fn is_loaded(&self) -> bool {
        self.session.is_some() && self.loaded
    }

    fn destroy(&mut self, session: SessionId) {
        if self.session == Some(session) {
            self.removed += self.markers.len();
            self.markers.clear();
            self.lines.clear();
            self.listeners.clear();
            self.session = None;
            self.loaded = false;
            self.sessions_destroyed += 1;
        }
    }

    fn is_alive(&self) -> bool {
        self.session.is_some()
    }

    fn zoom(&self) -> f64 {
        self.zoom
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
        if self.reject_titles.contains(&popup.title) {
            return Err(SurfaceError::Rejected(popup.title));
        }
        let handle = MarkerHandle(self.next());
        self.markers.insert(
            handle,
            RecordedMarker {
                point,
                element,
                popup,
                hidden: false,
                on_click,
            },
        );
        self.created += 1;
        Ok(handle)
    }

    fn remove_marker(&mut self, handle: MarkerHandle) {
        if self.markers.remove(&handle).is_some() {
            self.removed += 1;
        }
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

    fn fit_bounds(&mut self, points: &[GeoPoint], _options: FitOptions) {
        self.last_fit = Some(points.to_vec());
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
