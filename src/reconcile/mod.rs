//! Keeps the markers rendered on a map surface in step with the current data.
//!
//! Each pass diffs the desired entity set against the live markers of one
//! layer: new keys are created, missing keys removed, changed content
//! replaced, and everything else left alone.

mod connections;
mod content;

pub use connections::ConnectionLayers;
pub use content::{
    category_glyph, group_thousands, MarkerContent, MarkerKey, MarkerLayer, Markable, RenderSpec,
    Selection, SelectionSink,
};

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::geo::GeoPoint;
use crate::surface::{ClickHandler, FitOptions, MapSurface, MarkerHandle};

/// Markers are hidden below this web-map zoom level
pub const HIDE_BELOW_ZOOM: f64 = 2.0;

#[derive(Debug)]
struct LiveMarker {
    handle: MarkerHandle,
    content: MarkerContent,
}

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub removed: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub skipped_invalid: usize,
    pub failed: usize,
}

impl ReconcileReport {
    /// True when the pass touched no marker
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.removed == 0 && self.replaced == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied(ReconcileReport),
    /// Another pass was in progress; nothing was done
    Busy,
}

pub struct MarkerReconciler {
    live: BTreeMap<MarkerKey, LiveMarker>,
    building: bool,
    generation: u64,
    hidden: bool,
    hide_below_zoom: f64,
}

impl Default for MarkerReconciler {
    fn default() -> Self {
        Self::new(HIDE_BELOW_ZOOM)
    }
}

impl MarkerReconciler {
    pub fn new(hide_below_zoom: f64) -> Self {
        Self {
            live: BTreeMap::new(),
            building: false,
            generation: 0,
            hidden: false,
            hide_below_zoom,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn layer_count(&self, layer: MarkerLayer) -> usize {
        self.live.keys().filter(|k| k.layer == layer).count()
    }

    pub fn contains(&self, key: &MarkerKey) -> bool {
        self.live.contains_key(key)
    }

    pub fn handle(&self, key: &MarkerKey) -> Option<MarkerHandle> {
        self.live.get(key).map(|m| m.handle)
    }

    /// Key of the live marker behind a surface handle
    pub fn key_for(&self, handle: MarkerHandle) -> Option<&MarkerKey> {
        self.live
            .iter()
            .find(|(_, m)| m.handle == handle)
            .map(|(k, _)| k)
    }

    pub fn is_building(&self) -> bool {
        self.building
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Start a new data generation. Results tagged with an older one are stale.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Bring the layer of `T` in line with `entities`.
    ///
    /// Entities with invalid coordinates are skipped. When two entities share
    /// a key the first one wins.
    pub fn reconcile<T, S>(
        &mut self,
        surface: &mut S,
        entities: &[T],
        spec: &RenderSpec<'_>,
    ) -> ReconcileOutcome
    where
        T: Markable,
        S: MapSurface + ?Sized,
    {
        if self.building {
            debug!(layer = ?T::LAYER, "reconcile already in progress, skipping");
            return ReconcileOutcome::Busy;
        }
        self.building = true;
        let report = self.apply(surface, entities, spec);
        self.building = false;

        debug!(layer = ?T::LAYER, ?report, "reconciled markers");
        ReconcileOutcome::Applied(report)
    }

    fn apply<T, S>(&mut self, surface: &mut S, entities: &[T], spec: &RenderSpec<'_>) -> ReconcileReport
    where
        T: Markable,
        S: MapSurface + ?Sized,
    {
        let mut report = ReconcileReport::default();
        let mut seen: HashSet<MarkerKey> = HashSet::with_capacity(entities.len());

        for entity in entities {
            let key = entity.marker_key();
            if !entity.marker_point().is_valid() {
                warn!(key = %key, "skipping marker with invalid coordinates");
                report.skipped_invalid += 1;
                continue;
            }
            if !seen.insert(key.clone()) {
                continue;
            }

            let content = entity.content(spec);
            let replacing = match self.live.get(&key) {
                Some(live) if live.content == content => {
                    report.unchanged += 1;
                    continue;
                }
                Some(live) => Some(live.handle),
                None => None,
            };
            if let Some(old) = replacing {
                surface.remove_marker(old);
                self.live.remove(&key);
            }

            match self.create(surface, entity, content, spec) {
                Some(live) => {
                    self.live.insert(key, live);
                    if replacing.is_some() {
                        report.replaced += 1;
                    } else {
                        report.created += 1;
                    }
                }
                None => report.failed += 1,
            }
        }

        let stale: Vec<MarkerKey> = self
            .live
            .keys()
            .filter(|k| k.layer == T::LAYER && !seen.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(live) = self.live.remove(&key) {
                surface.remove_marker(live.handle);
                report.removed += 1;
            }
        }
        report
    }

    fn create<T, S>(
        &self,
        surface: &mut S,
        entity: &T,
        content: MarkerContent,
        spec: &RenderSpec<'_>,
    ) -> Option<LiveMarker>
    where
        T: Markable,
        S: MapSurface + ?Sized,
    {
        let on_click: Option<ClickHandler> = spec.on_select.clone().map(|sink| {
            let selection = entity.selection();
            Box::new(move || sink(selection.clone())) as ClickHandler
        });

        match surface.create_marker(
            content.point,
            content.element.clone(),
            content.popup.clone(),
            on_click,
        ) {
            Ok(handle) => {
                if self.hidden {
                    surface.set_marker_hidden(handle, true);
                }
                Some(LiveMarker { handle, content })
            }
            Err(e) => {
                warn!(key = %entity.marker_key(), error = %e, "failed to create marker");
                None
            }
        }
    }

    /// Remove every live marker of one layer
    pub fn clear_layer<S: MapSurface + ?Sized>(&mut self, surface: &mut S, layer: MarkerLayer) -> usize {
        let keys: Vec<MarkerKey> = self.live.keys().filter(|k| k.layer == layer).cloned().collect();
        for key in &keys {
            if let Some(live) = self.live.remove(key) {
                surface.remove_marker(live.handle);
            }
        }
        keys.len()
    }

    /// Remove every live marker. Safe on a surface whose session is already gone.
    pub fn clear_all<S: MapSurface + ?Sized>(&mut self, surface: &mut S) -> usize {
        let count = self.live.len();
        for (_, live) in std::mem::take(&mut self.live) {
            surface.remove_marker(live.handle);
        }
        if count > 0 {
            debug!(count, "cleared all markers");
        }
        count
    }

    /// Discard the layer and create it again from scratch
    pub fn rebuild<T, S>(
        &mut self,
        surface: &mut S,
        entities: &[T],
        spec: &RenderSpec<'_>,
    ) -> ReconcileOutcome
    where
        T: Markable,
        S: MapSurface + ?Sized,
    {
        if self.building {
            return ReconcileOutcome::Busy;
        }
        self.clear_layer(surface, T::LAYER);
        self.reconcile(surface, entities, spec)
    }

    /// Forget handles without touching the surface, after the surface dropped them itself
    pub fn forget_all(&mut self) {
        self.live.clear();
    }

    /// Hide or show every live marker. The state also applies to markers created later.
    pub fn set_visibility<S: MapSurface + ?Sized>(&mut self, surface: &mut S, below_threshold: bool) {
        self.hidden = below_threshold;
        for live in self.live.values() {
            surface.set_marker_hidden(live.handle, below_threshold);
        }
    }

    /// Apply the zoom rule; returns whether markers are now hidden
    pub fn apply_zoom<S: MapSurface + ?Sized>(&mut self, surface: &mut S, zoom: f64) -> bool {
        let hide = zoom < self.hide_below_zoom;
        if hide != self.hidden {
            debug!(zoom, hide, "marker visibility changed");
            self.set_visibility(surface, hide);
        }
        hide
    }
}

/// Fit the camera to every valid point; returns false when there is nothing to fit
pub fn fit_to_points<S: MapSurface + ?Sized>(
    surface: &mut S,
    points: impl IntoIterator<Item = GeoPoint>,
    options: FitOptions,
) -> bool {
    let points: Vec<GeoPoint> = points.into_iter().filter(GeoPoint::is_valid).collect();
    if points.is_empty() {
        return false;
    }
    surface.fit_bounds(&points, options);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetCategory, AssetPoint, HouseRecord};
    use crate::surface::RecordingSurface;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    fn asset(id: &str, lon: f64, lat: f64, risk: f64) -> AssetPoint {
        AssetPoint {
            id: id.to_string(),
            asset_type: AssetCategory::Transformer,
            latitude: lat,
            longitude: lon,
            install_year: 2001,
            risk_score: Some(risk),
            grid_capacity: None,
            parent_asset_id: None,
            metadata: BTreeMap::new(),
        }
    }

    fn house(id: &str, lon: f64, lat: f64) -> HouseRecord {
        HouseRecord {
            id: id.to_string(),
            system_id: format!("PS-{id}"),
            latitude: lat,
            longitude: lon,
            install_date: None,
            system_size_kw: Some(5.0),
            annual_production_kwh: None,
            system_type: None,
            city: None,
            state: None,
        }
    }

    fn fleet() -> Vec<AssetPoint> {
        vec![
            asset("a1", -122.40, 37.70, 0.1),
            asset("a2", -122.41, 37.71, 0.5),
            asset("a3", -122.42, 37.72, 0.9),
        ]
    }

    fn applied(outcome: ReconcileOutcome) -> ReconcileReport {
        match outcome {
            ReconcileOutcome::Applied(report) => report,
            ReconcileOutcome::Busy => panic!("reconciler unexpectedly busy"),
        }
    }

    #[test]
    fn test_initial_pass_creates_all() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let report = applied(rec.reconcile(&mut surface, &fleet(), &RenderSpec::default()));
        assert_eq!(report.created, 3);
        assert_eq!(surface.live_markers(), 3);
        assert_eq!(rec.live_count(), 3);
    }

    #[test]
    fn test_identical_pass_is_noop() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let spec = RenderSpec::default();
        rec.reconcile(&mut surface, &fleet(), &spec);
        let (created, removed) = (surface.created, surface.removed);

        let report = applied(rec.reconcile(&mut surface, &fleet(), &spec));
        assert!(report.is_noop());
        assert_eq!(report.unchanged, 3);
        assert_eq!((surface.created, surface.removed), (created, removed));
    }

    #[test]
    fn test_overlapping_pass_is_refused() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let spec = RenderSpec::default();
        rec.reconcile(&mut surface, &fleet(), &spec);
        assert!(!rec.is_building());
        let before = (surface.created, surface.removed);

        // a pass is still running when another trigger arrives
        rec.building = true;
        let more = vec![asset("a4", -122.43, 37.73, 0.2)];
        assert_eq!(rec.reconcile(&mut surface, &more, &spec), ReconcileOutcome::Busy);
        assert_eq!(rec.rebuild(&mut surface, &fleet(), &spec), ReconcileOutcome::Busy);

        assert_eq!((surface.created, surface.removed), before);
        assert_eq!(surface.live_markers(), 3);
        assert_eq!(rec.live_count(), 3);
        assert!(!rec.contains(&MarkerKey::new(MarkerLayer::Assets, "asset-a4")));

        rec.building = false;
        let report = applied(rec.reconcile(&mut surface, &more, &spec));
        assert_eq!((report.created, report.removed), (1, 3));
    }

    #[test]
    fn test_smaller_set_removes_only_missing() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let spec = RenderSpec::default();
        rec.reconcile(&mut surface, &fleet(), &spec);
        let kept = rec.handle(&MarkerKey::new(MarkerLayer::Assets, "asset-a1")).unwrap();

        let subset: Vec<AssetPoint> = fleet().into_iter().filter(|a| a.id == "a1").collect();
        let report = applied(rec.reconcile(&mut surface, &subset, &spec));

        assert_eq!(report.removed, 2);
        assert_eq!(report.created, 0);
        assert_eq!(surface.live_markers(), 1);
        assert!(surface.markers.contains_key(&kept));
    }

    #[test]
    fn test_changed_content_replaces_marker() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let spec = RenderSpec::default();
        rec.reconcile(&mut surface, &fleet(), &spec);

        let mut changed = fleet();
        changed[1].risk_score = Some(0.95);
        let report = applied(rec.reconcile(&mut surface, &changed, &spec));
        assert_eq!(report.replaced, 1);
        assert_eq!(report.created, 0);
        assert_eq!(report.unchanged, 2);
        assert_eq!(surface.live_markers(), 3);
    }

    #[test]
    fn test_layers_are_independent() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let spec = RenderSpec::default();
        rec.reconcile(&mut surface, &fleet(), &spec);
        rec.reconcile(&mut surface, &[house("h1", -122.3, 37.8)], &spec);

        let report = applied(rec.reconcile::<HouseRecord, _>(&mut surface, &[], &spec));
        assert_eq!(report.removed, 1);
        assert_eq!(rec.layer_count(MarkerLayer::Assets), 3);
        assert_eq!(surface.live_markers(), 3);
    }

    #[test]
    fn test_invalid_coordinates_skipped() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let entities = vec![
            asset("ok", -122.4, 37.7, 0.2),
            asset("nan", f64::NAN, 37.7, 0.2),
            asset("far", -122.4, 95.0, 0.2),
        ];
        let report = applied(rec.reconcile(&mut surface, &entities, &RenderSpec::default()));
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped_invalid, 2);
    }

    #[test]
    fn test_duplicate_keys_first_wins() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let entities = vec![asset("dup", -122.4, 37.7, 0.1), asset("dup", -122.5, 37.8, 0.9)];
        rec.reconcile(&mut surface, &entities, &RenderSpec::default());
        assert_eq!(surface.live_markers(), 1);
        let marker = surface.markers.values().next().unwrap();
        assert_eq!(marker.point, GeoPoint::new(-122.4, 37.7));
    }

    #[test]
    fn test_failed_creation_is_counted_and_retried() {
        let mut surface = RecordingSurface::loaded();
        surface.reject_titles.push("Transformer (a2)".to_string());
        let mut rec = MarkerReconciler::default();
        let spec = RenderSpec::default();
        let report = applied(rec.reconcile(&mut surface, &fleet(), &spec));
        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 2);

        surface.reject_titles.clear();
        let report = applied(rec.reconcile(&mut surface, &fleet(), &spec));
        assert_eq!(report.created, 1);
        assert_eq!(surface.live_markers(), 3);
    }

    #[test]
    fn test_clear_all_tolerates_dead_surface() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        rec.reconcile(&mut surface, &fleet(), &RenderSpec::default());
        surface.kill();

        assert_eq!(rec.clear_all(&mut surface), 3);
        assert_eq!(rec.live_count(), 0);
        assert_eq!(rec.clear_all(&mut surface), 0);
    }

    #[test]
    fn test_rebuild_recreates_layer() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let spec = RenderSpec::default();
        rec.reconcile(&mut surface, &fleet(), &spec);
        let report = applied(rec.rebuild(&mut surface, &fleet(), &spec));
        assert_eq!(report.created, 3);
        assert_eq!(surface.created, 6);
        assert_eq!(surface.removed, 3);
    }

    #[test]
    fn test_visibility_applies_to_new_markers() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let spec = RenderSpec::default();
        rec.reconcile(&mut surface, &fleet()[..1], &spec);

        assert!(rec.apply_zoom(&mut surface, 1.5));
        assert_eq!(surface.hidden_markers(), 1);

        rec.reconcile(&mut surface, &fleet(), &spec);
        assert_eq!(surface.hidden_markers(), 3);

        assert!(!rec.apply_zoom(&mut surface, 2.0));
        assert_eq!(surface.hidden_markers(), 0);
    }

    #[test]
    fn test_click_reports_selection() {
        let mut surface = RecordingSurface::loaded();
        let mut rec = MarkerReconciler::default();
        let picked: Rc<RefCell<Vec<Selection>>> = Rc::default();
        let sink = picked.clone();
        let spec = RenderSpec {
            substations: None,
            on_select: Some(Rc::new(move |s| sink.borrow_mut().push(s))),
        };
        rec.reconcile(&mut surface, &fleet(), &spec);

        let key = MarkerKey::new(MarkerLayer::Assets, "asset-a3");
        let handle = rec.handle(&key).unwrap();
        surface.click(handle);
        assert_eq!(*picked.borrow(), vec![Selection::Asset("a3".to_string())]);
        assert_eq!(rec.key_for(handle), Some(&key));
    }

    #[test]
    fn test_generation_marks_stale_results() {
        let mut rec = MarkerReconciler::default();
        let first = rec.next_generation();
        let second = rec.next_generation();
        assert!(!rec.is_current(first));
        assert!(rec.is_current(second));
    }

    #[test]
    fn test_fit_ignores_invalid_points() {
        let mut surface = RecordingSurface::loaded();
        let fitted = fit_to_points(
            &mut surface,
            [GeoPoint::new(f64::NAN, 1.0), GeoPoint::new(-122.0, 37.0)],
            FitOptions::default(),
        );
        assert!(fitted);
        assert_eq!(surface.last_fit, Some(vec![GeoPoint::new(-122.0, 37.0)]));
        assert!(!fit_to_points(&mut surface, [], FitOptions::default()));
    }
}
