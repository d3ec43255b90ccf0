//! Dataset providers and basemap loading.
//!
//! Fetch failures never reach the dashboard: every dataset degrades to an
//! empty list with a warning in the log.

mod basemap;
mod demo;

pub use basemap::{builtin_outline, load_basemap};
pub use demo::DemoDatasets;

use geojson::GeoJson;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::model::{
    merge_substations, AssetPoint, HouseRecord, ProjectedSubstationRecord, SubstationPoint,
    SurveyedSubstationRecord,
};

pub const ASSETS: &str = "assets";
pub const HOUSES: &str = "houses";
pub const SUBSTATIONS: &str = "substations";
pub const UTILITY_SUBSTATIONS: &str = "utility_substations";

/// Source of the point datasets shown on the map
pub trait DatasetProvider: Send + Sync {
    fn assets(&self) -> Result<Vec<AssetPoint>, FetchError>;
    fn houses(&self) -> Result<Vec<HouseRecord>, FetchError>;
    /// Substations already in geographic coordinates
    fn surveyed_substations(&self) -> Result<Vec<SurveyedSubstationRecord>, FetchError>;
    /// Substations in Web Mercator meters
    fn projected_substations(&self) -> Result<Vec<ProjectedSubstationRecord>, FetchError>;
}

/// Which properties receive a GeoJSON point's coordinates
#[derive(Clone, Copy)]
enum PointFields {
    LonLat,
    Xy,
}

impl PointFields {
    fn names(self) -> (&'static str, &'static str) {
        match self {
            PointFields::LonLat => ("longitude", "latitude"),
            PointFields::Xy => ("x", "y"),
        }
    }
}

/// Datasets read from `<dir>/<name>.json` (an array of records) or
/// `<dir>/<name>.geojson` (a FeatureCollection of points)
#[derive(Debug, Clone)]
pub struct FileDatasets {
    dir: PathBuf,
}

impl FileDatasets {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True when at least one dataset file exists
    pub fn has_any(&self) -> bool {
        [ASSETS, HOUSES, SUBSTATIONS, UTILITY_SUBSTATIONS]
            .iter()
            .any(|name| self.locate(name).is_some())
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        ["json", "geojson"]
            .iter()
            .map(|ext| self.dir.join(format!("{name}.{ext}")))
            .find(|path| path.exists())
    }

    fn read<T: DeserializeOwned>(&self, name: &str, fields: PointFields) -> Result<Vec<T>, FetchError> {
        let path = self.locate(name).ok_or_else(|| FetchError::Unavailable {
            dataset: name.to_string(),
            reason: format!("no {name}.json or {name}.geojson in {}", self.dir.display()),
        })?;
        let mut bytes = fs::read(&path).map_err(|e| read_failure(name, &path, e))?;
        debug!(dataset = name, path = %path.display(), bytes = bytes.len(), "reading dataset");

        if path.extension().is_some_and(|ext| ext == "geojson") {
            let text = String::from_utf8(bytes).map_err(|e| malformed(name, e))?;
            let geojson: GeoJson = text.parse().map_err(|e| malformed(name, e))?;
            records_from_features(name, geojson, fields)
        } else {
            simd_json::serde::from_slice(&mut bytes).map_err(|e| malformed(name, e))
        }
    }
}

/// Access denied is a rejection, anything else leaves the dataset unavailable
fn read_failure(dataset: &str, path: &Path, e: io::Error) -> FetchError {
    let dataset = dataset.to_string();
    let reason = format!("{}: {e}", path.display());
    match e.kind() {
        io::ErrorKind::PermissionDenied => FetchError::Rejected { dataset, reason },
        _ => FetchError::Unavailable { dataset, reason },
    }
}

fn malformed(dataset: &str, e: impl std::fmt::Display) -> FetchError {
    FetchError::Malformed {
        dataset: dataset.to_string(),
        reason: e.to_string(),
    }
}

/// Feature properties become record fields; a point geometry fills the
/// coordinate fields unless the properties already carry them
fn records_from_features<T: DeserializeOwned>(
    dataset: &str,
    geojson: GeoJson,
    fields: PointFields,
) -> Result<Vec<T>, FetchError> {
    let GeoJson::FeatureCollection(fc) = geojson else {
        return Err(malformed(dataset, "expected a FeatureCollection"));
    };
    let (x_field, y_field) = fields.names();

    let mut records = Vec::with_capacity(fc.features.len());
    for feature in fc.features {
        let mut props = feature.properties.unwrap_or_default();
        if let Some(geojson::Value::Point(coords)) = feature.geometry.map(|g| g.value) {
            if coords.len() >= 2 {
                props.entry(x_field).or_insert(Value::from(coords[0]));
                props.entry(y_field).or_insert(Value::from(coords[1]));
            }
        }
        let record = serde_json::from_value(Value::Object(props)).map_err(|e| malformed(dataset, e))?;
        records.push(record);
    }
    Ok(records)
}

impl DatasetProvider for FileDatasets {
    fn assets(&self) -> Result<Vec<AssetPoint>, FetchError> {
        self.read(ASSETS, PointFields::LonLat)
    }

    fn houses(&self) -> Result<Vec<HouseRecord>, FetchError> {
        self.read(HOUSES, PointFields::LonLat)
    }

    fn surveyed_substations(&self) -> Result<Vec<SurveyedSubstationRecord>, FetchError> {
        self.read(SUBSTATIONS, PointFields::LonLat)
    }

    fn projected_substations(&self) -> Result<Vec<ProjectedSubstationRecord>, FetchError> {
        self.read(UTILITY_SUBSTATIONS, PointFields::Xy)
    }
}

/// The records, or an empty list when the fetch failed
pub fn fetch_or_default<T>(dataset: &str, result: Result<Vec<T>, FetchError>) -> Vec<T> {
    match result {
        Ok(records) => records,
        Err(FetchError::Unavailable { reason, .. }) => {
            debug!(dataset, %reason, "dataset unavailable, using empty set");
            Vec::new()
        }
        Err(e) => {
            warn!(dataset, error = %e, "dataset fetch failed, using empty set");
            Vec::new()
        }
    }
}

/// Everything the map shows, after coordinate normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Datasets {
    pub assets: Vec<AssetPoint>,
    pub houses: Vec<HouseRecord>,
    /// Surveyed substations first, then projected ones
    pub substations: Vec<SubstationPoint>,
}

impl Datasets {
    pub fn fetch(provider: &dyn DatasetProvider) -> Self {
        let assets = fetch_or_default(ASSETS, provider.assets());
        let houses = fetch_or_default(HOUSES, provider.houses());
        let surveyed = fetch_or_default(SUBSTATIONS, provider.surveyed_substations());
        let projected = fetch_or_default(UTILITY_SUBSTATIONS, provider.projected_substations());

        let unprojectable = projected.iter().filter(|r| r.x.is_none() || r.y.is_none()).count();
        if unprojectable > 0 {
            warn!(count = unprojectable, "utility substations without coordinates dropped");
        }
        let substations = merge_substations(surveyed, projected);

        info!(
            assets = assets.len(),
            houses = houses.len(),
            substations = substations.len(),
            "datasets loaded"
        );
        Self {
            assets,
            houses,
            substations,
        }
    }
}

/// Datasets fetched in the background for one data generation
#[derive(Debug)]
pub struct Fetched {
    pub generation: u64,
    pub datasets: Datasets,
}

/// Fetch every dataset on the rayon pool; the result arrives on the returned channel
pub fn spawn_fetch(provider: Arc<dyn DatasetProvider>, generation: u64) -> Receiver<Fetched> {
    let (tx, rx) = mpsc::channel();
    rayon::spawn(move || {
        let datasets = Datasets::fetch(provider.as_ref());
        if tx.send(Fetched { generation, datasets }).is_err() {
            debug!(generation, "fetch result dropped, receiver gone");
        }
    });
    rx
}
