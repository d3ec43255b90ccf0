mod store;

pub use store::{AssignmentStore, InMemoryAssignmentStore, JsonFileAssignmentStore};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::geo::{self, GeoPoint};
use crate::map::SpatialGrid;
use crate::model::{AssetPoint, HouseRecord, SubstationPoint};

/// Default connection radius in miles
pub const MAX_DISTANCE_MILES: f64 = 2.0;

/// Grid cell size for the target index, in degrees
const TARGET_CELL_DEGREES: f64 = 0.25;

/// Persisted nearest-neighbor link from a source point to a target point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "distance_miles")]
    pub distance: f64,
}

/// Anything with a stable id and a position
pub trait Located {
    fn id(&self) -> &str;
    fn location(&self) -> GeoPoint;
}

impl Located for HouseRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn location(&self) -> GeoPoint {
        self.point()
    }
}

impl Located for SubstationPoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn location(&self) -> GeoPoint {
        self.location
    }
}

impl Located for AssetPoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn location(&self) -> GeoPoint {
        self.point()
    }
}

/// Index over candidate targets. Ties resolve to the target that comes first in input order.
pub struct TargetIndex<'a, T> {
    targets: &'a [T],
    /// Grid items are indices into `targets`, inserted in ascending order
    grid: SpatialGrid<usize>,
}

impl<'a, T: Located> TargetIndex<'a, T> {
    pub fn new(targets: &'a [T]) -> Self {
        let mut grid = SpatialGrid::new(TARGET_CELL_DEGREES);
        for (idx, target) in targets.iter().enumerate() {
            let point = target.location();
            if point.is_valid() {
                grid.insert(point, idx);
            }
        }
        Self { targets, grid }
    }

    /// Nearest valid target with no distance cap
    pub fn nearest(&self, point: GeoPoint) -> Option<(&'a T, f64)> {
        if !point.is_valid() {
            return None;
        }
        self.scan((0..self.grid.len()).filter_map(|i| self.grid.get(i).copied()), point)
    }

    /// Nearest valid target within `max_distance` miles
    pub fn nearest_within(&self, point: GeoPoint, max_distance: f64) -> Option<(&'a T, f64)> {
        if !point.is_valid() || !(max_distance >= 0.0) {
            return None;
        }

        let lat_radius = max_distance / geo::miles_per_degree();
        let max_lat = (point.latitude.abs() + lat_radius).min(90.0);
        let cos_min = max_lat.to_radians().cos();

        // The box prefilter is only conservative away from the poles and the antimeridian
        let best = if lat_radius > 2.0 || cos_min < 0.2 {
            self.nearest(point)
        } else {
            let lon_radius = 1.5 * lat_radius / cos_min;
            if point.longitude - lon_radius < -180.0 || point.longitude + lon_radius > 180.0 {
                self.nearest(point)
            } else {
                let candidates = self.grid.query_box(point, lon_radius, lat_radius);
                self.scan(candidates.into_iter().filter_map(|i| self.grid.get(i).copied()), point)
            }
        };

        best.filter(|(_, distance)| *distance <= max_distance)
    }

    /// Minimum over target indices in ascending order; strict `<` keeps the first of equals
    fn scan(&self, indices: impl Iterator<Item = usize>, point: GeoPoint) -> Option<(&'a T, f64)> {
        let mut best: Option<(&'a T, f64)> = None;
        for idx in indices {
            let target = &self.targets[idx];
            let distance = point.distance_miles(&target.location());
            match best {
                Some((_, d)) if distance >= d => {}
                _ => best = Some((target, distance)),
            }
        }
        best
    }
}

/// Assign each source to its nearest target within `max_distance` miles.
/// Output follows source order; sources with no target in range are absent.
pub fn assign<S, T>(sources: &[S], targets: &[T], max_distance: f64) -> Vec<Assignment>
where
    S: Located + Sync,
    T: Located + Sync,
{
    let index = TargetIndex::new(targets);
    sources
        .par_iter()
        .filter_map(|source| {
            let point = source.location();
            if !point.is_valid() {
                debug!(source = source.id(), "skipping source with invalid coordinates");
                return None;
            }
            index
                .nearest_within(point, max_distance)
                .map(|(target, distance)| Assignment {
                    source_id: source.id().to_string(),
                    target_id: target.id().to_string(),
                    distance,
                })
        })
        .collect()
}

/// Assignment front-end over a durable store.
/// Existing records are reused per source unless recomputation is requested.
pub struct ProximityAssigner<S: AssignmentStore> {
    store: S,
    max_distance: f64,
}

impl<S: AssignmentStore> ProximityAssigner<S> {
    pub fn new(store: S, max_distance: f64) -> Self {
        Self { store, max_distance }
    }

    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve assignments for `sources`, computing only what is not already persisted.
    /// With `recompute`, every source is recomputed and stale records for unmatched sources are dropped.
    pub fn assign_persisted<A, T>(
        &mut self,
        sources: &[A],
        targets: &[T],
        recompute: bool,
    ) -> Result<Vec<Assignment>, StoreError>
    where
        A: Located + Sync,
        T: Located + Sync,
    {
        let mut resolved: Vec<Option<Assignment>> = Vec::with_capacity(sources.len());
        let mut pending: Vec<usize> = Vec::new();

        for (idx, source) in sources.iter().enumerate() {
            let existing = if recompute {
                None
            } else {
                self.store
                    .get(source.id())?
                    .filter(|a| a.distance <= self.max_distance)
            };
            if existing.is_none() {
                pending.push(idx);
            }
            resolved.push(existing);
        }

        let reused = sources.len() - pending.len();
        let pending_sources: Vec<&A> = pending.iter().map(|&i| &sources[i]).collect();
        let computed = assign(&pending_sources, targets, self.max_distance);

        if recompute {
            for source in &pending_sources {
                let matched = computed.iter().any(|a| a.source_id == source.id());
                if !matched {
                    self.store.remove(source.id())?;
                }
            }
        }
        self.store.upsert_many(computed.clone())?;

        let mut computed = computed.into_iter().peekable();
        for &idx in &pending {
            if computed.peek().is_some_and(|a| a.source_id == sources[idx].id()) {
                resolved[idx] = computed.next();
            }
        }

        let result: Vec<Assignment> = resolved.into_iter().flatten().collect();
        info!(
            sources = sources.len(),
            reused,
            assigned = result.len(),
            recompute,
            "resolved proximity assignments"
        );
        Ok(result)
    }

    /// Drop the persisted record for one source so the next pass recomputes it
    pub fn invalidate(&mut self, source_id: &str) -> Result<bool, StoreError> {
        self.store.remove(source_id)
    }
}

impl<A: Located> Located for &A {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn location(&self) -> GeoPoint {
        (**self).location()
    }
}

/// Source ids assigned to `target_id`
pub fn connected_sources<'a>(assignments: &'a [Assignment], target_id: &str) -> Vec<&'a str> {
    assignments
        .iter()
        .filter(|a| a.target_id == target_id)
        .map(|a| a.source_id.as_str())
        .collect()
}

/// Aggregate figures for the houses connected to one substation
#[derive(Debug, Clone, PartialEq)]
pub struct SubstationSummary {
    pub substation_id: String,
    pub name: String,
    pub connected_houses: usize,
    pub total_production_kwh: f64,
    pub average_system_size_kw: f64,
    pub capacity_kw: f64,
}

impl SubstationSummary {
    pub fn compute(
        substation: &SubstationPoint,
        houses: &[HouseRecord],
        assignments: &[Assignment],
    ) -> Self {
        let ids = connected_sources(assignments, &substation.id);
        let connected: Vec<&HouseRecord> = houses
            .iter()
            .filter(|h| ids.contains(&h.id.as_str()))
            .collect();

        let total_production_kwh = connected
            .iter()
            .map(|h| h.annual_production_kwh.unwrap_or(0.0))
            .sum();
        let average_system_size_kw = if connected.is_empty() {
            0.0
        } else {
            connected.iter().map(|h| h.system_size_kw.unwrap_or(0.0)).sum::<f64>()
                / connected.len() as f64
        };

        Self {
            substation_id: substation.id.clone(),
            name: substation.name.clone(),
            connected_houses: connected.len(),
            total_production_kwh,
            average_system_size_kw,
            capacity_kw: substation.capacity_kw,
        }
    }
}
