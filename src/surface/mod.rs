//! Capabilities the engine needs from a map renderer.
//!
//! A surface owns rendered markers and lines and hands out opaque handles for
//! them. Removal on a surface whose session is gone is a no-op, never an error.

mod recording;

pub use recording::{RecordedMarker, RecordingSurface};

use crate::error::SurfaceError;
use crate::geo::GeoPoint;
use crate::model::ConstraintLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkerHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Visual representation of a marker
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerElement {
    pub glyph: char,
    /// Fill severity (risk band for assets)
    pub tone: ConstraintLevel,
    /// Capacity ring around substations and transformers
    pub ring: Option<ConstraintLevel>,
}

/// Text shown when a marker is inspected
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Popup {
    pub title: String,
    pub lines: Vec<String>,
}

impl Popup {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            lines: Vec::new(),
        }
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LineStyle {
    pub emphasized: bool,
    pub dimmed: bool,
}

/// Invoked when a marker is clicked
pub type ClickHandler = Box<dyn Fn()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEventKind {
    Click,
    ZoomEnd,
    Load,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent {
    /// A click on the map; `marker` is set when a marker was hit
    Click {
        point: GeoPoint,
        marker: Option<MarkerHandle>,
    },
    ZoomEnd {
        zoom: f64,
    },
    Load,
}

impl MapEvent {
    pub fn kind(&self) -> MapEventKind {
        match self {
            MapEvent::Click { .. } => MapEventKind::Click,
            MapEvent::ZoomEnd { .. } => MapEventKind::ZoomEnd,
            MapEvent::Load => MapEventKind::Load,
        }
    }
}

pub type EventHandler = Box<dyn FnMut(&MapEvent)>;

/// Parameters of a new map session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub style: String,
    pub center: GeoPoint,
    /// Web-map zoom level (0 = whole world)
    pub zoom: f64,
    /// South-west and north-east corners the camera may not leave
    pub max_bounds: Option<(GeoPoint, GeoPoint)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    /// Padding in screen pixels
    pub padding: u32,
    pub max_zoom: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            padding: 100,
            max_zoom: 15.0,
        }
    }
}

pub trait MapSurface {
    /// Start a session. Loading may complete later; poll `is_loaded`.
    fn init(&mut self, options: &SessionOptions) -> Result<SessionId, SurfaceError>;
    fn is_loaded(&self) -> bool;
    /// Tear down a session and every resource it holds
    fn destroy(&mut self, session: SessionId);
    /// True while a session exists
    fn is_alive(&self) -> bool;
    /// Current web-map zoom level
    fn zoom(&self) -> f64;

    fn create_marker(
        &mut self,
        point: GeoPoint,
        element: MarkerElement,
        popup: Popup,
        on_click: Option<ClickHandler>,
    ) -> Result<MarkerHandle, SurfaceError>;
    fn remove_marker(&mut self, handle: MarkerHandle);
    fn set_marker_hidden(&mut self, handle: MarkerHandle, hidden: bool);

    fn add_line(
        &mut self,
        from: GeoPoint,
        to: GeoPoint,
        style: LineStyle,
    ) -> Result<LineHandle, SurfaceError>;
    fn remove_line(&mut self, handle: LineHandle);

    fn fit_bounds(&mut self, points: &[GeoPoint], options: FitOptions);

    fn on(&mut self, kind: MapEventKind, handler: EventHandler) -> ListenerId;
    fn off(&mut self, id: ListenerId);
}
