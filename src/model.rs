use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::geo::{self, GeoPoint};

/// Coordinates arrive as numbers, nulls, or are missing entirely.
/// Anything that is not a number becomes NaN and is rejected by validation later.
fn coord_or_nan<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.unwrap_or(f64::NAN))
}

fn nan() -> f64 {
    f64::NAN
}

/// Kind of grid asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetCategory {
    House,
    Substation,
    Pole,
    Transformer,
    SolarPanel,
    WindTurbine,
    Battery,
}

impl AssetCategory {
    pub const ALL: [AssetCategory; 7] = [
        AssetCategory::House,
        AssetCategory::Substation,
        AssetCategory::Pole,
        AssetCategory::Transformer,
        AssetCategory::SolarPanel,
        AssetCategory::WindTurbine,
        AssetCategory::Battery,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AssetCategory::House => "House",
            AssetCategory::Substation => "Substation",
            AssetCategory::Pole => "Pole",
            AssetCategory::Transformer => "Transformer",
            AssetCategory::SolarPanel => "Solar panel",
            AssetCategory::WindTurbine => "Wind turbine",
            AssetCategory::Battery => "Battery",
        }
    }

    /// Substations and transformers draw a capacity ring around the marker
    pub fn has_capacity_ring(self) -> bool {
        matches!(self, AssetCategory::Substation | AssetCategory::Transformer)
    }
}

impl fmt::Display for AssetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Grid constraint severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ConstraintLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ConstraintLevel::Low => "low",
            ConstraintLevel::Medium => "medium",
            ConstraintLevel::High => "high",
            ConstraintLevel::Critical => "critical",
        }
    }
}

/// Risk band derived from a normalized risk score
pub type RiskBand = ConstraintLevel;

/// Bands: >=0.8 critical, >=0.6 high, >=0.3 medium, otherwise low. No score is low.
pub fn risk_band(score: Option<f64>) -> RiskBand {
    match score {
        Some(s) if s >= 0.8 => ConstraintLevel::Critical,
        Some(s) if s >= 0.6 => ConstraintLevel::High,
        Some(s) if s >= 0.3 => ConstraintLevel::Medium,
        _ => ConstraintLevel::Low,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCapacity {
    pub capacity_percentage: f64,
    pub constraint_level: ConstraintLevel,
    #[serde(default)]
    pub feeder_id: Option<String>,
    #[serde(default)]
    pub substation_id: Option<String>,
}

/// A grid asset as supplied by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetPoint {
    pub id: String,
    pub asset_type: AssetCategory,
    #[serde(default = "nan", deserialize_with = "coord_or_nan")]
    pub latitude: f64,
    #[serde(default = "nan", deserialize_with = "coord_or_nan")]
    pub longitude: f64,
    pub install_year: i32,
    #[serde(default)]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub grid_capacity: Option<GridCapacity>,
    #[serde(default)]
    pub parent_asset_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AssetPoint {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.longitude, self.latitude)
    }

    pub fn risk_band(&self) -> RiskBand {
        risk_band(self.risk_score)
    }

    /// Constraint shown on the capacity ring: explicit grid capacity wins over risk
    pub fn ring_constraint(&self) -> Option<ConstraintLevel> {
        if !self.asset_type.has_capacity_ring() {
            return None;
        }
        match (&self.grid_capacity, self.risk_score) {
            (Some(capacity), _) => Some(capacity.constraint_level),
            (None, Some(score)) if score > 0.0 => Some(risk_band(Some(score))),
            _ => None,
        }
    }
}

/// A residential solar installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseRecord {
    pub id: String,
    #[serde(alias = "palmetto_system_id")]
    pub system_id: String,
    #[serde(default = "nan", deserialize_with = "coord_or_nan")]
    pub latitude: f64,
    #[serde(default = "nan", deserialize_with = "coord_or_nan")]
    pub longitude: f64,
    #[serde(default)]
    pub install_date: Option<String>,
    #[serde(default)]
    pub system_size_kw: Option<f64>,
    #[serde(default)]
    pub annual_production_kwh: Option<f64>,
    #[serde(default)]
    pub system_type: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl HouseRecord {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.longitude, self.latitude)
    }
}

/// Substation record already in geographic coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyedSubstationRecord {
    pub id: String,
    pub name: String,
    #[serde(default = "nan", deserialize_with = "coord_or_nan")]
    pub latitude: f64,
    #[serde(default = "nan", deserialize_with = "coord_or_nan")]
    pub longitude: f64,
    #[serde(default)]
    pub capacity_kw: f64,
    #[serde(default)]
    pub current_load_kw: Option<f64>,
}

/// Utility substation record in Web Mercator meters, identified by name/object id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedSubstationRecord {
    pub objectid: i64,
    #[serde(default)]
    pub substation_name: Option<String>,
    #[serde(default)]
    pub substation_id: Option<i64>,
    #[serde(default)]
    pub division: Option<String>,
    #[serde(default)]
    pub existing_distributed_generation_kw: Option<f64>,
    #[serde(default)]
    pub queued_distributed_generation_kw: Option<f64>,
    #[serde(default)]
    pub total_distributed_generation_kw: Option<f64>,
    #[serde(default)]
    pub last_update_on_map: Option<String>,
    #[serde(default)]
    pub minimum_voltage_kv: Option<f64>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

/// Distributed generation figures carried by projected substation records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationSummary {
    pub existing_kw: Option<f64>,
    pub queued_kw: Option<f64>,
    pub total_kw: Option<f64>,
    pub last_update: Option<String>,
}

/// Which dataset a substation came from
#[derive(Debug, Clone, PartialEq)]
pub enum SubstationOrigin {
    Surveyed { current_load_kw: Option<f64> },
    Projected {
        objectid: i64,
        /// Name as published, before the display fallback is applied
        source_name: Option<String>,
        generation: GenerationSummary,
    },
}

/// A substation after coordinate normalization, regardless of source
#[derive(Debug, Clone, PartialEq)]
pub struct SubstationPoint {
    pub id: String,
    pub name: String,
    pub location: GeoPoint,
    pub capacity_kw: f64,
    pub origin: SubstationOrigin,
}

impl From<SurveyedSubstationRecord> for SubstationPoint {
    fn from(record: SurveyedSubstationRecord) -> Self {
        Self {
            location: GeoPoint::new(record.longitude, record.latitude),
            id: record.id,
            name: record.name,
            capacity_kw: record.capacity_kw,
            origin: SubstationOrigin::Surveyed {
                current_load_kw: record.current_load_kw,
            },
        }
    }
}

impl ProjectedSubstationRecord {
    /// Project into geographic coordinates. Records without both x and y yield None.
    pub fn normalize(self) -> Option<SubstationPoint> {
        let (x, y) = (self.x?, self.y?);
        let location = geo::project(x, y);
        let source_name = self.substation_name.filter(|n| !n.trim().is_empty());
        let name = source_name
            .clone()
            .unwrap_or_else(|| format!("Substation {}", self.objectid));
        Some(SubstationPoint {
            id: format!("pge-{}", self.objectid),
            name,
            location,
            capacity_kw: self.total_distributed_generation_kw.unwrap_or(0.0),
            origin: SubstationOrigin::Projected {
                objectid: self.objectid,
                source_name,
                generation: GenerationSummary {
                    existing_kw: self.existing_distributed_generation_kw,
                    queued_kw: self.queued_distributed_generation_kw,
                    total_kw: self.total_distributed_generation_kw,
                    last_update: self.last_update_on_map,
                },
            },
        })
    }
}

/// Surveyed substations first, then projected ones, in arrival order.
/// This order is the tie-break order used by proximity assignment.
pub fn merge_substations(
    surveyed: Vec<SurveyedSubstationRecord>,
    projected: Vec<ProjectedSubstationRecord>,
) -> Vec<SubstationPoint> {
    let mut merged: Vec<SubstationPoint> = surveyed.into_iter().map(SubstationPoint::from).collect();
    merged.extend(projected.into_iter().filter_map(ProjectedSubstationRecord::normalize));
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub min: i32,
    pub max: i32,
}

/// Dashboard filter state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetFilters {
    /// Empty means every category
    pub asset_types: Vec<AssetCategory>,
    pub risk_level: ScoreRange,
    pub year_range: YearRange,
}

impl Default for AssetFilters {
    fn default() -> Self {
        Self {
            asset_types: Vec::new(),
            risk_level: ScoreRange { min: 0.0, max: 1.0 },
            year_range: YearRange { min: 1980, max: 2023 },
        }
    }
}

impl AssetFilters {
    pub fn matches(&self, asset: &AssetPoint) -> bool {
        let matches_type =
            self.asset_types.is_empty() || self.asset_types.contains(&asset.asset_type);
        let matches_risk = asset
            .risk_score
            .is_some_and(|s| s >= self.risk_level.min && s <= self.risk_level.max);
        let matches_year = asset.install_year >= self.year_range.min
            && asset.install_year <= self.year_range.max;
        matches_type && asset.point().is_valid() && matches_risk && matches_year
    }

    /// Toggle a category in the type filter, keeping the list sorted
    pub fn toggle_type(&mut self, category: AssetCategory) {
        if let Some(pos) = self.asset_types.iter().position(|c| *c == category) {
            self.asset_types.remove(pos);
        } else {
            self.asset_types.push(category);
            self.asset_types.sort();
        }
    }

    /// Shift the risk window bounds, clamped to [0, 1] with min <= max
    pub fn adjust_risk(&mut self, d_min: f64, d_max: f64) {
        let min = (self.risk_level.min + d_min).clamp(0.0, 1.0);
        let max = (self.risk_level.max + d_max).clamp(0.0, 1.0);
        self.risk_level = ScoreRange {
            min: min.min(max),
            max: max.max(min),
        };
    }
}

pub fn filter_assets<'a>(assets: &'a [AssetPoint], filters: &AssetFilters) -> Vec<&'a AssetPoint> {
    assets.iter().filter(|a| filters.matches(a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(id: &str, kind: AssetCategory, risk: Option<f64>, year: i32) -> AssetPoint {
        AssetPoint {
            id: id.to_string(),
            asset_type: kind,
            latitude: 37.77,
            longitude: -122.42,
            install_year: year,
            risk_score: risk,
            grid_capacity: None,
            parent_asset_id: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_risk_bands() {
        assert_eq!(risk_band(Some(0.95)), ConstraintLevel::Critical);
        assert_eq!(risk_band(Some(0.8)), ConstraintLevel::Critical);
        assert_eq!(risk_band(Some(0.6)), ConstraintLevel::High);
        assert_eq!(risk_band(Some(0.3)), ConstraintLevel::Medium);
        assert_eq!(risk_band(Some(0.29)), ConstraintLevel::Low);
        assert_eq!(risk_band(None), ConstraintLevel::Low);
    }

    #[test]
    fn test_filter_requires_risk_score() {
        let filters = AssetFilters::default();
        assert!(filters.matches(&asset("a", AssetCategory::Pole, Some(0.2), 2000)));
        assert!(!filters.matches(&asset("b", AssetCategory::Pole, None, 2000)));
    }

    #[test]
    fn test_filter_types_years_and_coordinates() {
        let mut filters = AssetFilters::default();
        filters.toggle_type(AssetCategory::Battery);
        assert!(!filters.matches(&asset("a", AssetCategory::Pole, Some(0.2), 2000)));
        assert!(filters.matches(&asset("b", AssetCategory::Battery, Some(0.2), 2000)));
        assert!(!filters.matches(&asset("c", AssetCategory::Battery, Some(0.2), 1970)));

        let mut bad = asset("d", AssetCategory::Battery, Some(0.2), 2000);
        bad.longitude = 200.0;
        assert!(!filters.matches(&bad));

        filters.toggle_type(AssetCategory::Battery);
        assert!(filters.asset_types.is_empty());
    }

    #[test]
    fn test_adjust_risk_keeps_order() {
        let mut filters = AssetFilters::default();
        filters.adjust_risk(1.5, 0.0);
        assert_eq!(filters.risk_level.min, 1.0);
        assert_eq!(filters.risk_level.max, 1.0);
        filters.adjust_risk(-0.4, -0.7);
        assert!(filters.risk_level.min <= filters.risk_level.max);
    }

    #[test]
    fn test_null_coordinates_deserialize_as_invalid() {
        let raw = r#"{"id":"h1","system_id":"PS-1","latitude":null}"#;
        let house: HouseRecord = serde_json::from_str(raw).unwrap();
        assert!(!house.point().is_valid());
    }

    #[test]
    fn test_ring_constraint_prefers_grid_capacity() {
        let mut sub = asset("s", AssetCategory::Substation, Some(0.9), 2000);
        assert_eq!(sub.ring_constraint(), Some(ConstraintLevel::Critical));
        sub.grid_capacity = Some(GridCapacity {
            capacity_percentage: 40.0,
            constraint_level: ConstraintLevel::Low,
            feeder_id: None,
            substation_id: None,
        });
        assert_eq!(sub.ring_constraint(), Some(ConstraintLevel::Low));
        assert_eq!(asset("p", AssetCategory::Pole, Some(0.9), 2000).ring_constraint(), None);
    }

    #[test]
    fn test_merge_substations_order_and_projection() {
        let surveyed = vec![SurveyedSubstationRecord {
            id: "s1".into(),
            name: "Mission".into(),
            latitude: 37.76,
            longitude: -122.41,
            capacity_kw: 5000.0,
            current_load_kw: None,
        }];
        let projected = vec![
            ProjectedSubstationRecord {
                objectid: 7,
                substation_name: Some("Potrero".into()),
                substation_id: None,
                division: None,
                existing_distributed_generation_kw: Some(10.0),
                queued_distributed_generation_kw: None,
                total_distributed_generation_kw: Some(30.0),
                last_update_on_map: None,
                minimum_voltage_kv: None,
                x: Some(-13_627_361.0),
                y: Some(4_544_761.0),
            },
            ProjectedSubstationRecord {
                objectid: 8,
                substation_name: None,
                substation_id: None,
                division: None,
                existing_distributed_generation_kw: None,
                queued_distributed_generation_kw: None,
                total_distributed_generation_kw: None,
                last_update_on_map: None,
                minimum_voltage_kv: None,
                x: None,
                y: Some(1.0),
            },
        ];
        let merged = merge_substations(surveyed, projected);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "s1");
        assert_eq!(merged[1].id, "pge-7");
        assert!(merged[1].location.is_valid());
        assert!((merged[1].location.longitude + 122.417).abs() < 0.01);
        assert_eq!(merged[1].capacity_kw, 30.0);
    }
}
