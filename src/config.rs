use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::GridError;
use crate::geo::GeoPoint;
use crate::model::{AssetCategory, AssetFilters, ScoreRange, YearRange};
use crate::quota::QuotaLimits;
use crate::surface::{FitOptions, SessionOptions};

pub const DEFAULT_CONFIG_FILE: &str = "gridmap.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub quota: QuotaConfig,
    pub assignment: AssignmentConfig,
    pub session: SessionConfig,
    pub markers: MarkerConfig,
    pub filters: FilterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            quota: QuotaConfig::default(),
            assignment: AssignmentConfig::default(),
            session: SessionConfig::default(),
            markers: MarkerConfig::default(),
            filters: FilterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub ceiling: u32,
    pub warning_threshold: u32,
    pub state_file: PathBuf,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let limits = QuotaLimits::default();
        Self {
            ceiling: limits.ceiling,
            warning_threshold: limits.warning_threshold,
            state_file: PathBuf::from(".gridmap/quota.json"),
        }
    }
}

impl QuotaConfig {
    pub fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            ceiling: self.ceiling,
            warning_threshold: self.warning_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub max_distance_miles: f64,
    pub store_file: PathBuf,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            max_distance_miles: crate::assign::MAX_DISTANCE_MILES,
            store_file: PathBuf::from(".gridmap/assignments.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub init_delay_ms: u64,
    pub load_timeout_ms: u64,
    pub style: String,
    /// [longitude, latitude]
    pub center: [f64; 2],
    pub zoom: f64,
    /// [[west, south], [east, north]]
    pub max_bounds: Option<[[f64; 2]; 2]>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_delay_ms: 300,
            load_timeout_ms: 5_000,
            style: "terminal-braille".to_string(),
            center: [-122.4194, 37.7749],
            zoom: 12.0,
            max_bounds: Some([[-270.0, -85.0], [270.0, 85.0]]),
        }
    }
}

impl SessionConfig {
    pub fn init_delay(&self) -> Duration {
        Duration::from_millis(self.init_delay_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            style: self.style.clone(),
            center: GeoPoint::new(self.center[0], self.center[1]),
            zoom: self.zoom,
            max_bounds: self
                .max_bounds
                .map(|[sw, ne]| (GeoPoint::new(sw[0], sw[1]), GeoPoint::new(ne[0], ne[1]))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub hide_below_zoom: f64,
    pub fit_max_zoom: f64,
    pub fit_padding: u32,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        let fit = FitOptions::default();
        Self {
            hide_below_zoom: crate::reconcile::HIDE_BELOW_ZOOM,
            fit_max_zoom: fit.max_zoom,
            fit_padding: fit.padding,
        }
    }
}

impl MarkerConfig {
    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            padding: self.fit_padding,
            max_zoom: self.fit_max_zoom,
        }
    }
}

/// Initial dashboard filters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub asset_types: Vec<AssetCategory>,
    pub risk_min: f64,
    pub risk_max: f64,
    pub year_min: i32,
    pub year_max: i32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let filters = AssetFilters::default();
        Self {
            asset_types: filters.asset_types,
            risk_min: filters.risk_level.min,
            risk_max: filters.risk_level.max,
            year_min: filters.year_range.min,
            year_max: filters.year_range.max,
        }
    }
}

impl FilterConfig {
    pub fn filters(&self) -> AssetFilters {
        AssetFilters {
            asset_types: self.asset_types.clone(),
            risk_level: ScoreRange {
                min: self.risk_min,
                max: self.risk_max,
            },
            year_range: YearRange {
                min: self.year_min,
                max: self.year_max,
            },
        }
    }
}

impl Config {
    /// Read `path`, or `gridmap.toml` in the working directory. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, GridError> {
        let (path, explicit) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !explicit => {
                return Ok(Self::default())
            }
            Err(e) => {
                return Err(GridError::Configuration(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        Self::parse(&content)
            .map_err(|e| GridError::Configuration(format!("{}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = Config::parse(
            r#"
            data_dir = "fixtures"

            [quota]
            ceiling = 100

            [session]
            center = [-71.06, 42.36]
            max_bounds = [[-75.0, 40.0], [-68.0, 45.0]]

            [filters]
            asset_types = ["transformer", "solarPanel"]
            risk_min = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("fixtures"));
        assert_eq!(config.quota.limits().ceiling, 100);
        assert_eq!(config.quota.warning_threshold, 1_000);
        assert_eq!(config.session.load_timeout(), Duration::from_secs(5));

        let options = config.session.options();
        assert_eq!(options.center, GeoPoint::new(-71.06, 42.36));
        assert_eq!(
            options.max_bounds,
            Some((GeoPoint::new(-75.0, 40.0), GeoPoint::new(-68.0, 45.0)))
        );

        let filters = config.filters.filters();
        assert_eq!(
            filters.asset_types,
            vec![AssetCategory::Transformer, AssetCategory::SolarPanel]
        );
        assert_eq!(filters.risk_level, ScoreRange { min: 0.5, max: 1.0 });
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(GridError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridmap.toml");
        fs::write(&path, "[markers]\nhide_below_zoom = 3.5\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.markers.hide_below_zoom, 3.5);
        assert_eq!(config.markers.fit_options(), FitOptions::default());
    }
}
