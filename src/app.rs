use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Instant;

use gridmap::assign::{self, Assignment, AssignmentStore, ProximityAssigner, SubstationSummary, TargetIndex};
use gridmap::data::{spawn_fetch, DatasetProvider, Datasets, Fetched};
use gridmap::map::{Lod, TerminalSurface};
use gridmap::model::{filter_assets, AssetCategory, AssetFilters};
use gridmap::quota::{QuotaPhase, QuotaState, QuotaStore};
use gridmap::reconcile::{fit_to_points, Markable, RenderSpec, Selection, SelectionSink};
use gridmap::session::{DegradedReason, MapSession, SessionEvent, SessionPhase};
use gridmap::surface::{FitOptions, MapEvent, MapEventKind, MapSurface, MarkerHandle, Popup};
use tracing::{debug, error, info, warn};

/// Things surface callbacks hand back to the app between ticks
#[derive(Debug, Clone, PartialEq)]
enum AppEvent {
    Selected(Selection),
    MapClicked { marker: Option<MarkerHandle> },
    ZoomEnded(f64),
}

type EventQueue = Rc<RefCell<VecDeque<AppEvent>>>;

const REINIT_NOTICE: &str = "Reinitializing map...";

/// Terminal cell to braille pixel, accounting for the one-cell map border
fn cell_to_pixel(col: u16, row: u16) -> (i32, i32) {
    (col.saturating_sub(1) as i32 * 2, row.saturating_sub(1) as i32 * 4)
}

/// Braille pixel size of the map area for a terminal of `width` x `height`
/// cells: two border columns, two border rows and the status bar
fn map_pixels(width: usize, height: usize) -> (usize, usize) {
    (width.saturating_sub(2) * 2, height.saturating_sub(3) * 4)
}

/// Dashboard state
pub struct App<Q: QuotaStore, A: AssignmentStore> {
    pub surface: TerminalSurface,
    pub session: MapSession<Q>,
    assigner: ProximityAssigner<A>,
    provider: Arc<dyn DatasetProvider>,
    pub datasets: Datasets,
    pub assignments: Vec<Assignment>,
    pub filters: AssetFilters,
    pub selection: Option<Selection>,
    /// Last quota snapshot, refreshed every tick
    pub quota: Option<(QuotaState, QuotaPhase)>,
    /// One-line message for the status bar
    pub notice: Option<String>,
    fit: FitOptions,
    queue: EventQueue,
    fetch: Option<Receiver<Fetched>>,
    /// Markers are out of date with datasets, filters or selection
    dirty: bool,
    fit_pending: bool,
    /// Next sync clears each marker layer before reconciling it
    rebuild_pending: bool,
    pub should_quit: bool,
    /// Last mouse position for drag tracking
    pub last_mouse: Option<(u16, u16)>,
    dragged: bool,
}

impl<Q: QuotaStore, A: AssignmentStore> App<Q, A> {
    pub fn new(
        surface: TerminalSurface,
        session: MapSession<Q>,
        assigner: ProximityAssigner<A>,
        provider: Arc<dyn DatasetProvider>,
        filters: AssetFilters,
        fit: FitOptions,
    ) -> Self {
        Self {
            surface,
            session,
            assigner,
            provider,
            datasets: Datasets::default(),
            assignments: Vec::new(),
            filters,
            selection: None,
            quota: None,
            notice: None,
            fit,
            queue: Rc::new(RefCell::new(VecDeque::new())),
            fetch: None,
            dirty: false,
            fit_pending: true,
            rebuild_pending: false,
            should_quit: false,
            last_mouse: None,
            dragged: false,
        }
    }

    /// Request a map session and start loading data
    pub fn start(&mut self, now: Instant) {
        self.session.request_init(now);
        self.refresh_data();
    }

    /// Fetch every dataset again in the background. Results of earlier
    /// fetches still in flight are discarded when they arrive.
    pub fn refresh_data(&mut self) {
        let (markers, _) = self.session.layers_mut();
        let generation = markers.next_generation();
        debug!(generation, "fetching datasets");
        self.fetch = Some(spawn_fetch(Arc::clone(&self.provider), generation));
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch.is_some()
    }

    /// Advance the session, take in fetched data and bring markers up to date
    pub fn tick(&mut self, now: Instant) {
        self.poll_fetch();

        let events = self.session.tick(&mut self.surface, now);
        for event in events {
            self.handle_session_event(event);
        }

        self.process_events();

        if self.dirty && self.session.is_ready() {
            self.sync_map();
        }
        self.refresh_quota();
    }

    fn poll_fetch(&mut self) {
        let Some(rx) = &self.fetch else {
            return;
        };
        match rx.try_recv() {
            Ok(fetched) => {
                self.fetch = None;
                self.accept(fetched);
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                warn!("dataset fetch ended without a result");
                self.fetch = None;
            }
        }
    }

    /// Take in a fetch result unless a newer fetch superseded it
    pub fn accept(&mut self, fetched: Fetched) {
        if !self.session.markers().is_current(fetched.generation) {
            debug!(generation = fetched.generation, "discarding stale datasets");
            return;
        }
        self.datasets = fetched.datasets;
        self.assignments = self.resolve_assignments(false);
        if self.selection.is_some() && self.selection_details().is_none() {
            self.selection = None;
        }
        self.dirty = true;
        self.fit_pending = true;
        self.rebuild_pending = true;
    }

    fn resolve_assignments(&mut self, recompute: bool) -> Vec<Assignment> {
        let houses = &self.datasets.houses;
        let substations = &self.datasets.substations;
        match self.assigner.assign_persisted(houses, substations, recompute) {
            Ok(assignments) => assignments,
            Err(e) => {
                error!(error = %e, "assignment store failed, using unsaved assignments");
                self.notice = Some(format!("Assignments not saved: {e}"));
                assign::assign(houses, substations, self.assigner.max_distance())
            }
        }
    }

    /// Recompute every house assignment, ignoring persisted records
    pub fn recompute_assignments(&mut self) {
        self.assignments = self.resolve_assignments(true);
        info!(assignments = self.assignments.len(), "recomputed assignments");
        self.dirty = true;
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Started(_) => self.register_listeners(),
            SessionEvent::Ready(_) => {
                if self.notice.as_deref() == Some(REINIT_NOTICE) {
                    self.notice = None;
                }
                self.dirty = true;
                self.fit_pending = true;
            }
            SessionEvent::QuotaWarning { remaining } => {
                self.notice = Some(format!("Map loads nearly used up: {remaining} left this month"));
            }
            SessionEvent::QuotaExceeded { count } => {
                self.notice = Some(format!("Monthly map load limit reached ({count} loads)"));
            }
            SessionEvent::AlreadyInitialized => {
                self.notice = Some("Map already initialized; press r to reload".to_string());
            }
            SessionEvent::Degraded(reason) => {
                self.notice = Some(degraded_message(&reason));
            }
        }
    }

    fn register_listeners(&mut self) {
        let queue = Rc::clone(&self.queue);
        self.session.listen(
            &mut self.surface,
            MapEventKind::Click,
            Box::new(move |event| {
                if let MapEvent::Click { marker, .. } = event {
                    queue.borrow_mut().push_back(AppEvent::MapClicked { marker: *marker });
                }
            }),
        );
        let queue = Rc::clone(&self.queue);
        self.session.listen(
            &mut self.surface,
            MapEventKind::ZoomEnd,
            Box::new(move |event| {
                if let MapEvent::ZoomEnd { zoom } = event {
                    queue.borrow_mut().push_back(AppEvent::ZoomEnded(*zoom));
                }
            }),
        );
    }

    fn selection_sink(&self) -> SelectionSink {
        let queue = Rc::clone(&self.queue);
        Rc::new(move |selection| queue.borrow_mut().push_back(AppEvent::Selected(selection)))
    }

    fn process_events(&mut self) {
        let events: Vec<AppEvent> = self.queue.borrow_mut().drain(..).collect();
        for event in events {
            match event {
                AppEvent::Selected(selection) => self.select(selection),
                AppEvent::MapClicked { marker: None } => {
                    if self.selection.take().is_some() {
                        self.dirty = true;
                    }
                }
                AppEvent::MapClicked { marker: Some(_) } => {}
                AppEvent::ZoomEnded(zoom) => {
                    let (markers, _) = self.session.layers_mut();
                    markers.apply_zoom(&mut self.surface, zoom);
                }
            }
        }
    }

    /// Clicking a selected marker again deselects it
    fn select(&mut self, selection: Selection) {
        if self.selection.as_ref() == Some(&selection) {
            self.selection = None;
        } else {
            debug!(?selection, "selected");
            self.selection = Some(selection);
        }
        self.dirty = true;
    }

    pub fn highlighted_substation(&self) -> Option<&str> {
        match &self.selection {
            Some(Selection::Substation(id)) => Some(id),
            _ => None,
        }
    }

    /// Reconcile every marker layer and redraw connection lines
    fn sync_map(&mut self) {
        {
            let index = TargetIndex::new(&self.datasets.substations);
            let spec = RenderSpec {
                substations: Some(&index),
                on_select: Some(self.selection_sink()),
            };
            let assets = filter_assets(&self.datasets.assets, &self.filters);
            let highlighted = match &self.selection {
                Some(Selection::Substation(id)) => Some(id.as_str()),
                _ => None,
            };

            let (markers, connections) = self.session.layers_mut();
            if self.rebuild_pending {
                markers.rebuild(&mut self.surface, &assets, &spec);
                markers.rebuild(&mut self.surface, &self.datasets.houses, &spec);
                markers.rebuild(&mut self.surface, &self.datasets.substations, &spec);
                self.rebuild_pending = false;
            } else {
                markers.reconcile(&mut self.surface, &assets, &spec);
                markers.reconcile(&mut self.surface, &self.datasets.houses, &spec);
                markers.reconcile(&mut self.surface, &self.datasets.substations, &spec);
            }
            connections.sync(
                &mut self.surface,
                &self.assignments,
                &self.datasets.houses,
                &self.datasets.substations,
                highlighted,
            );

            if self.fit_pending {
                let points = assets
                    .iter()
                    .map(|a| a.marker_point())
                    .chain(self.datasets.houses.iter().map(|h| h.point()))
                    .chain(self.datasets.substations.iter().map(|s| s.location));
                if fit_to_points(&mut self.surface, points, self.fit) {
                    self.fit_pending = false;
                }
            }
        }
        self.dirty = false;

        // fit_bounds reports its zoom through the listener queue
        self.process_events();
        let zoom = self.surface.zoom();
        let (markers, _) = self.session.layers_mut();
        markers.apply_zoom(&mut self.surface, zoom);
    }

    fn refresh_quota(&mut self) {
        let governor = self.session.governor_mut();
        let snapshot = governor
            .state()
            .and_then(|state| governor.phase().map(|phase| (state, phase)));
        self.quota = match snapshot {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "quota state unavailable");
                None
            }
        };
    }

    /// Tear the session down and start over
    pub fn reinit(&mut self, now: Instant) {
        info!("manual map reinitialization requested");
        if let Err(e) = self.session.force_reinit(&mut self.surface, now) {
            error!(error = %e, "map reinitialization failed");
            self.notice = Some(format!("Reinitialization failed: {e}"));
            return;
        }
        self.notice = Some(REINIT_NOTICE.to_string());
        self.fit_pending = true;
    }

    /// Called after every drawn frame; the first frame completes a loading session
    pub fn frame_drawn(&mut self) {
        self.surface.frame_drawn();
    }

    pub fn toggle_category(&mut self, category: AssetCategory) {
        self.filters.toggle_type(category);
        self.dirty = true;
    }

    pub fn adjust_risk(&mut self, d_min: f64, d_max: f64) {
        self.filters.adjust_risk(d_min, d_max);
        self.dirty = true;
    }

    pub fn shift_years(&mut self, d_min: i32, d_max: i32) {
        let years = &mut self.filters.year_range;
        years.min = (years.min + d_min).min(years.max);
        years.max = (years.max + d_max).max(years.min);
        self.dirty = true;
    }

    pub fn reset_filters(&mut self) {
        self.filters = AssetFilters::default();
        self.dirty = true;
    }

    pub fn fit_to_data(&mut self) {
        self.fit_pending = true;
        self.dirty = true;
    }

    /// Update map size when the terminal resizes
    pub fn resize(&mut self, width: usize, height: usize) {
        let (w, h) = map_pixels(width, height);
        self.surface.resize(w, h);
    }

    pub fn pan(&mut self, dx: i32, dy: i32) {
        self.surface.pan(dx, dy);
    }

    pub fn zoom_in(&mut self) {
        self.surface.zoom_in();
        self.process_events();
    }

    pub fn zoom_out(&mut self) {
        self.surface.zoom_out();
        self.process_events();
    }

    pub fn zoom_in_at(&mut self, col: u16, row: u16) {
        let (px, py) = cell_to_pixel(col, row);
        self.surface.zoom_in_at(px, py);
        self.process_events();
    }

    pub fn zoom_out_at(&mut self, col: u16, row: u16) {
        let (px, py) = cell_to_pixel(col, row);
        self.surface.zoom_out_at(px, py);
        self.process_events();
    }

    pub fn press(&mut self, col: u16, row: u16) {
        self.last_mouse = Some((col, row));
        self.dragged = false;
    }

    /// Pan while dragging; less sensitive when zoomed out
    pub fn handle_drag(&mut self, col: u16, row: u16) {
        if let Some((last_x, last_y)) = self.last_mouse {
            let dx = last_x as i32 - col as i32;
            let dy = last_y as i32 - row as i32;
            let scale = if self.surface.viewport.zoom < 2.0 {
                2
            } else if self.surface.viewport.zoom < 4.0 {
                3
            } else {
                4
            };
            if dx != 0 || dy != 0 {
                self.dragged = true;
            }
            self.pan(dx * scale, dy * scale);
        }
        self.last_mouse = Some((col, row));
    }

    /// A release without a drag in between is a click
    pub fn release(&mut self, col: u16, row: u16) {
        let clicked = !self.dragged;
        self.last_mouse = None;
        self.dragged = false;
        if clicked {
            self.click(col, row);
        }
    }

    pub fn click(&mut self, col: u16, row: u16) {
        let (px, py) = cell_to_pixel(col, row);
        self.surface.click_at(px, py);
        self.process_events();
    }

    pub fn quit(&mut self) {
        self.should_quit = true;
    }

    /// Web-map zoom level as a string
    pub fn zoom_level(&self) -> String {
        format!("z{:.1}", self.surface.zoom())
    }

    pub fn center_coords(&self) -> String {
        let center = self.surface.viewport.center();
        format!(
            "{:.3}°{}, {:.3}°{}",
            center.latitude.abs(),
            if center.latitude >= 0.0 { "N" } else { "S" },
            center.longitude.abs(),
            if center.longitude >= 0.0 { "E" } else { "W" }
        )
    }

    pub fn lod_level(&self) -> &'static str {
        Lod::from_zoom(self.surface.viewport.zoom).label()
    }

    /// Session state for the status bar
    pub fn session_label(&self) -> &'static str {
        match self.session.phase() {
            SessionPhase::Idle => "idle",
            SessionPhase::Pending { .. } => "starting",
            SessionPhase::Loading { .. } => "loading",
            SessionPhase::Ready { .. } => "ready",
            SessionPhase::Degraded(_) => "degraded",
            SessionPhase::Blocked => "blocked",
        }
    }

    /// Popup for the current selection. Substations also get a summary of
    /// the houses connected to them.
    pub fn selection_details(&self) -> Option<Popup> {
        let index = TargetIndex::new(&self.datasets.substations);
        let spec = RenderSpec {
            substations: Some(&index),
            on_select: None,
        };
        match self.selection.as_ref()? {
            Selection::Asset(id) => {
                let asset = self.datasets.assets.iter().find(|a| &a.id == id)?;
                Some(asset.popup(&spec))
            }
            Selection::House(id) => {
                let house = self.datasets.houses.iter().find(|h| &h.id == id)?;
                Some(house.popup(&spec))
            }
            Selection::Substation(id) => {
                let substation = self.datasets.substations.iter().find(|s| &s.id == id)?;
                let summary = SubstationSummary::compute(substation, &self.datasets.houses, &self.assignments);
                let popup = substation
                    .popup(&spec)
                    .line(format!("Connected Houses: {}", summary.connected_houses))
                    .line(format!(
                        "Total Production: {} kWh",
                        gridmap::reconcile::group_thousands(summary.total_production_kwh)
                    ))
                    .line(format!("Avg System Size: {:.1} kW", summary.average_system_size_kw));
                Some(popup)
            }
        }
    }
}

fn degraded_message(reason: &DegradedReason) -> String {
    match reason {
        DegradedReason::LoadTimeout => "Map did not load in time; press r to reconfigure".to_string(),
        DegradedReason::InitFailed(e) => format!("Map failed to start ({e}); press r to retry"),
        DegradedReason::SessionLost => "Map session lost; press r to reconfigure".to_string(),
        DegradedReason::QuotaStore(e) => format!("Quota state unavailable ({e}); press r to retry"),
    }
}

/// Build the surface for a terminal of `width` x `height` cells
pub fn terminal_surface(basemap: gridmap::map::Basemap, width: usize, height: usize) -> TerminalSurface {
    let (w, h) = map_pixels(width, height);
    TerminalSurface::new(basemap, w, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridmap::assign::InMemoryAssignmentStore;
    use gridmap::data::DemoDatasets;
    use gridmap::geo::GeoPoint;
    use gridmap::map::Basemap;
    use gridmap::quota::{InMemoryQuotaStore, QuotaGovernor, QuotaLimits};
    use gridmap::reconcile::{MarkerLayer, MarkerReconciler};
    use gridmap::session::SessionTimings;
    use gridmap::surface::SessionOptions;
    use std::time::Duration;

    const CENTER: GeoPoint = GeoPoint::new(-122.4194, 37.7749);

    fn app_with(limits: QuotaLimits) -> App<InMemoryQuotaStore, InMemoryAssignmentStore> {
        let governor = QuotaGovernor::new(InMemoryQuotaStore::new(), limits);
        let options = SessionOptions {
            style: "terminal".into(),
            center: CENTER,
            zoom: 12.0,
            max_bounds: None,
        };
        let session = MapSession::new(governor, MarkerReconciler::default(), options, SessionTimings::default());
        App::new(
            terminal_surface(Basemap::new(), 120, 40),
            session,
            ProximityAssigner::new(InMemoryAssignmentStore::new(), 2.0),
            Arc::new(DemoDatasets::new(CENTER, 7)),
            AssetFilters::default(),
            FitOptions::default(),
        )
    }

    /// Start a session and feed demo data synchronously
    fn ready_app() -> App<InMemoryQuotaStore, InMemoryAssignmentStore> {
        let mut app = app_with(QuotaLimits::default());
        let t0 = Instant::now();
        app.session.request_init(t0);
        let demo = DemoDatasets::new(CENTER, 7);
        app.accept(Fetched {
            generation: app.session.markers().generation(),
            datasets: Datasets::fetch(&demo),
        });
        app.tick(t0 + Duration::from_millis(300));
        app.frame_drawn();
        app.tick(t0 + Duration::from_millis(320));
        app
    }

    #[test]
    fn test_session_ready_renders_all_layers() {
        let app = ready_app();
        assert!(app.session.is_ready());
        let markers = app.session.markers();
        let visible_assets = filter_assets(&app.datasets.assets, &app.filters).len();
        assert_eq!(markers.layer_count(MarkerLayer::Assets), visible_assets);
        assert_eq!(markers.layer_count(MarkerLayer::Houses), app.datasets.houses.len());
        assert_eq!(markers.layer_count(MarkerLayer::Substations), app.datasets.substations.len());
        assert_eq!(app.surface.marker_count(), markers.live_count());
        assert!(!app.assignments.is_empty());
        assert!(app.quota.as_ref().is_some_and(|(state, _)| state.count == 1));
    }

    #[test]
    fn test_category_filter_updates_asset_layer_only() {
        let mut app = ready_app();
        let houses = app.session.markers().layer_count(MarkerLayer::Houses);
        app.toggle_category(AssetCategory::Battery);
        app.tick(Instant::now());

        let batteries = app
            .datasets
            .assets
            .iter()
            .filter(|a| a.asset_type == AssetCategory::Battery && app.filters.matches(a))
            .count();
        assert_eq!(app.session.markers().layer_count(MarkerLayer::Assets), batteries);
        assert_eq!(app.session.markers().layer_count(MarkerLayer::Houses), houses);
    }

    #[test]
    fn test_year_filter_moves_from_both_ends() {
        let mut app = ready_app();
        let start = app.filters.year_range;
        app.shift_years(5, 0);
        app.shift_years(0, -3);
        assert_eq!(app.filters.year_range.min, start.min + 5);
        assert_eq!(app.filters.year_range.max, start.max - 3);
        app.tick(Instant::now());

        let visible = app.datasets.assets.iter().filter(|a| app.filters.matches(a)).count();
        assert_eq!(app.session.markers().layer_count(MarkerLayer::Assets), visible);

        // the lower bound never passes the upper one
        app.shift_years(1_000, 0);
        assert_eq!(app.filters.year_range.min, app.filters.year_range.max);
    }

    #[test]
    fn test_stale_fetch_discarded() {
        let mut app = ready_app();
        let stale = app.session.markers().generation();
        app.refresh_data();
        app.accept(Fetched {
            generation: stale,
            datasets: Datasets::default(),
        });
        assert!(!app.datasets.houses.is_empty());
    }

    #[test]
    fn test_substation_selection_toggles() {
        let mut app = ready_app();
        let id = app.datasets.substations[0].id.clone();
        app.select(Selection::Substation(id.clone()));
        assert_eq!(app.highlighted_substation(), Some(id.as_str()));
        let details = app.selection_details().unwrap();
        assert!(details.lines.iter().any(|l| l.starts_with("Connected Houses:")));

        app.select(Selection::Substation(id));
        assert_eq!(app.highlighted_substation(), None);
    }

    #[test]
    fn test_quota_exhausted_blocks_session() {
        let mut app = app_with(QuotaLimits {
            ceiling: 0,
            warning_threshold: 0,
        });
        let t0 = Instant::now();
        app.session.request_init(t0);
        app.tick(t0 + Duration::from_millis(300));
        assert_eq!(app.session_label(), "blocked");
        assert!(!app.surface.is_alive());
        assert!(app.notice.as_deref().is_some_and(|n| n.contains("limit reached")));
    }

    #[test]
    fn test_reinit_starts_new_session() {
        let mut app = ready_app();
        let first = app.session.session_id();
        let t = Instant::now();
        app.reinit(t);
        assert_eq!(app.session.markers().live_count(), 0);
        app.tick(t + Duration::from_millis(300));
        app.frame_drawn();
        app.tick(t + Duration::from_millis(310));
        assert!(app.session.is_ready());
        assert_ne!(app.session.session_id(), first);
        assert!(app.session.markers().live_count() > 0);
    }
}
