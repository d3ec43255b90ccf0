use std::collections::BTreeMap;

use serde_json::json;

use super::DatasetProvider;
use crate::error::FetchError;
use crate::geo::{self, GeoPoint};
use crate::model::{
    AssetCategory, AssetPoint, ConstraintLevel, GridCapacity, HouseRecord,
    ProjectedSubstationRecord, SurveyedSubstationRecord,
};

/// Half-width of the square the fleet is scattered over, in degrees
const SPREAD: f64 = 0.05;

/// Deterministic demo fleet around a center point, used when no dataset files exist
#[derive(Debug, Clone, Copy)]
pub struct DemoDatasets {
    center: GeoPoint,
    seed: u64,
}

impl DemoDatasets {
    pub fn new(center: GeoPoint, seed: u64) -> Self {
        Self { center, seed }
    }

    /// Uniform in [0, 1) for the n-th draw of stream `stream`
    fn draw(&self, stream: u64, n: u64) -> f64 {
        let key = self.seed ^ stream.rotate_left(32) ^ n.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        (splitmix64(key) >> 11) as f64 / (1u64 << 53) as f64
    }

    fn scatter(&self, stream: u64, n: u64) -> GeoPoint {
        GeoPoint::new(
            self.center.longitude + (self.draw(stream, n * 2) * 2.0 - 1.0) * SPREAD,
            self.center.latitude + (self.draw(stream, n * 2 + 1) * 2.0 - 1.0) * SPREAD,
        )
    }
}

/// splitmix64 finalizer
#[inline(always)]
fn splitmix64(seed: u64) -> u64 {
    let mut x = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn capacity_level(percentage: f64) -> ConstraintLevel {
    if percentage >= 90.0 {
        ConstraintLevel::Critical
    } else if percentage >= 75.0 {
        ConstraintLevel::High
    } else if percentage >= 50.0 {
        ConstraintLevel::Medium
    } else {
        ConstraintLevel::Low
    }
}

impl DatasetProvider for DemoDatasets {
    fn assets(&self) -> Result<Vec<AssetPoint>, FetchError> {
        // (category, count, first install year, year span, risk scale)
        let fleet = [
            (AssetCategory::Pole, 20, 2000, 23, 1.0),
            (AssetCategory::Transformer, 15, 2000, 23, 1.0),
            (AssetCategory::SolarPanel, 10, 2010, 13, 1.0),
            (AssetCategory::WindTurbine, 5, 2010, 13, 1.0),
            (AssetCategory::Battery, 8, 2018, 5, 0.4),
        ];

        let mut assets = Vec::new();
        for (stream, (category, count, first_year, span, risk_scale)) in fleet.into_iter().enumerate() {
            let stream = stream as u64 + 1;
            for i in 0..count {
                let n = i as u64;
                let point = self.scatter(stream, n);
                let grid_capacity = category.has_capacity_ring().then(|| {
                    let pct = (self.draw(stream + 100, n) * 100.0).floor();
                    GridCapacity {
                        capacity_percentage: pct,
                        constraint_level: capacity_level(pct),
                        feeder_id: None,
                        substation_id: None,
                    }
                });
                let mut metadata = BTreeMap::new();
                metadata.insert("demo".to_string(), json!(true));

                assets.push(AssetPoint {
                    id: format!("{}-{i}", category.label().to_lowercase().replace(' ', "-")),
                    asset_type: category,
                    latitude: point.latitude,
                    longitude: point.longitude,
                    install_year: first_year + (self.draw(stream + 200, n) * span as f64) as i32,
                    risk_score: Some(self.draw(stream + 300, n) * risk_scale),
                    grid_capacity,
                    parent_asset_id: None,
                    metadata,
                });
            }
        }
        Ok(assets)
    }

    fn houses(&self) -> Result<Vec<HouseRecord>, FetchError> {
        Ok((0..30u64)
            .map(|i| {
                let point = self.scatter(50, i);
                HouseRecord {
                    id: format!("house-{i}"),
                    system_id: format!("SYS-{}", 1000 + i),
                    latitude: point.latitude,
                    longitude: point.longitude,
                    install_date: Some(format!(
                        "{}-{:02}-{:02}",
                        2020 + (self.draw(51, i) * 3.0) as i32,
                        1 + (self.draw(52, i) * 12.0) as u32,
                        1 + (self.draw(53, i) * 28.0) as u32
                    )),
                    system_size_kw: Some(5.0 + self.draw(54, i) * 5.0),
                    annual_production_kwh: Some(7000.0 + (self.draw(55, i) * 3000.0).floor()),
                    system_type: Some(if self.draw(56, i) > 0.5 { "Residential" } else { "Commercial" }.to_string()),
                    city: None,
                    state: None,
                }
            })
            .collect())
    }

    fn surveyed_substations(&self) -> Result<Vec<SurveyedSubstationRecord>, FetchError> {
        Ok((0..3u64)
            .map(|i| {
                let point = self.scatter(60, i);
                let capacity_kw = 5_000.0 + (self.draw(61, i) * 5_000.0).floor();
                SurveyedSubstationRecord {
                    id: format!("sub-{i}"),
                    name: format!("Demo Substation {}", i + 1),
                    latitude: point.latitude,
                    longitude: point.longitude,
                    capacity_kw,
                    current_load_kw: Some((capacity_kw * self.draw(62, i)).floor()),
                }
            })
            .collect())
    }

    fn projected_substations(&self) -> Result<Vec<ProjectedSubstationRecord>, FetchError> {
        let names = ["Mission", "Potrero", "Hunters Point", "Larkin"];
        Ok(names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let n = i as u64;
                let meters = geo::forward(self.scatter(70, n));
                let existing = (self.draw(71, n) * 20_000.0).floor();
                let queued = (self.draw(72, n) * 10_000.0).floor();
                ProjectedSubstationRecord {
                    objectid: 100 + i as i64,
                    substation_name: Some(name.to_string()),
                    substation_id: Some(9000 + i as i64),
                    division: Some("San Francisco".to_string()),
                    existing_distributed_generation_kw: Some(existing),
                    queued_distributed_generation_kw: Some(queued),
                    total_distributed_generation_kw: Some(existing + queued),
                    last_update_on_map: Some("2024-01-15".to_string()),
                    minimum_voltage_kv: Some(12.0),
                    x: Some(meters.x),
                    y: Some(meters.y),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo() -> DemoDatasets {
        DemoDatasets::new(GeoPoint::new(-122.43, 37.75), 42)
    }

    #[test]
    fn test_fleet_is_deterministic_and_local() {
        let a = demo().assets().unwrap();
        assert_eq!(a, demo().assets().unwrap());
        assert_eq!(a.len(), 58);
        for asset in &a {
            assert!((asset.longitude + 122.43).abs() <= SPREAD + 1e-9);
            assert!((asset.latitude - 37.75).abs() <= SPREAD + 1e-9);
            assert!(asset.risk_score.is_some_and(|r| (0.0..1.0).contains(&r)));
        }
        assert!(a
            .iter()
            .filter(|x| x.asset_type == AssetCategory::Battery)
            .all(|b| b.risk_score.unwrap_or(1.0) < 0.4));
    }

    #[test]
    fn test_projected_substations_project_back_nearby() {
        for record in demo().projected_substations().unwrap() {
            let point = record.normalize().unwrap().location;
            assert!(point.is_valid());
            assert!((point.longitude + 122.43).abs() <= SPREAD + 1e-9);
        }
    }
}
