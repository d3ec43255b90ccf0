use std::fmt;
use std::rc::Rc;

use crate::assign::TargetIndex;
use crate::geo::GeoPoint;
use crate::model::{
    AssetCategory, AssetPoint, ConstraintLevel, HouseRecord, SubstationOrigin, SubstationPoint,
};
use crate::surface::{MarkerElement, Popup};

/// Marker collections reconciled independently of each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MarkerLayer {
    Assets,
    Houses,
    Substations,
}

/// Deterministic marker identity: same entity, same key, every pass
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkerKey {
    pub layer: MarkerLayer,
    name: String,
}

impl MarkerKey {
    pub fn new(layer: MarkerLayer, name: impl Into<String>) -> Self {
        Self {
            layer,
            name: name.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// What a marker click selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Asset(String),
    House(String),
    Substation(String),
}

pub type SelectionSink = Rc<dyn Fn(Selection)>;

/// Desired representation for one reconciliation pass
#[derive(Clone, Default)]
pub struct RenderSpec<'a> {
    /// Substations for "nearest substation" popup lines
    pub substations: Option<&'a TargetIndex<'a, SubstationPoint>>,
    /// Receives selections from marker clicks
    pub on_select: Option<SelectionSink>,
}

/// Everything that decides how a live marker looks
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerContent {
    pub point: GeoPoint,
    pub element: MarkerElement,
    pub popup: Popup,
}

/// An entity that can be rendered as a marker
pub trait Markable {
    const LAYER: MarkerLayer;

    /// Key name, unique within the layer
    fn key_name(&self) -> String;
    fn marker_point(&self) -> GeoPoint;
    fn element(&self) -> MarkerElement;
    fn popup(&self, spec: &RenderSpec<'_>) -> Popup;
    fn selection(&self) -> Selection;

    fn marker_key(&self) -> MarkerKey {
        MarkerKey::new(Self::LAYER, self.key_name())
    }

    fn content(&self, spec: &RenderSpec<'_>) -> MarkerContent {
        MarkerContent {
            point: self.marker_point(),
            element: self.element(),
            popup: self.popup(spec),
        }
    }
}

pub fn category_glyph(category: AssetCategory) -> char {
    match category {
        AssetCategory::House => '⌂',
        AssetCategory::Substation => '■',
        AssetCategory::Pole => '┃',
        AssetCategory::Transformer => '▣',
        AssetCategory::SolarPanel => '☀',
        AssetCategory::WindTurbine => '✣',
        AssetCategory::Battery => '▮',
    }
}

impl Markable for AssetPoint {
    const LAYER: MarkerLayer = MarkerLayer::Assets;

    fn key_name(&self) -> String {
        format!("asset-{}", self.id)
    }

    fn marker_point(&self) -> GeoPoint {
        self.point()
    }

    fn element(&self) -> MarkerElement {
        MarkerElement {
            glyph: category_glyph(self.asset_type),
            tone: self.risk_band(),
            ring: self.ring_constraint(),
        }
    }

    fn popup(&self, _spec: &RenderSpec<'_>) -> Popup {
        let mut popup = Popup::new(format!("{} ({})", self.asset_type, self.id))
            .line(format!("Installed: {}", self.install_year));
        if let Some(score) = self.risk_score {
            popup = popup.line(format!("Risk: {:.2} ({})", score, self.risk_band().as_str()));
        }
        if let Some(capacity) = &self.grid_capacity {
            popup = popup.line(format!(
                "Capacity: {}% ({})",
                capacity.capacity_percentage,
                capacity.constraint_level.as_str()
            ));
        }
        popup
    }

    fn selection(&self) -> Selection {
        Selection::Asset(self.id.clone())
    }
}

impl Markable for HouseRecord {
    const LAYER: MarkerLayer = MarkerLayer::Houses;

    fn key_name(&self) -> String {
        format!("house-{}", self.id)
    }

    fn marker_point(&self) -> GeoPoint {
        self.point()
    }

    fn element(&self) -> MarkerElement {
        MarkerElement {
            glyph: '●',
            tone: ConstraintLevel::Low,
            ring: None,
        }
    }

    fn popup(&self, spec: &RenderSpec<'_>) -> Popup {
        let size = self
            .system_size_kw
            .map(|kw| format!("{kw:.1} kW"))
            .unwrap_or_else(|| "N/A".to_string());
        let production = self
            .annual_production_kwh
            .map(|kwh| format!("{} kWh", group_thousands(kwh)))
            .unwrap_or_else(|| "N/A".to_string());
        let installed = self.install_date.as_deref().unwrap_or("N/A");

        let mut popup = Popup::new(self.system_id.clone())
            .line(format!("System Size: {size}"))
            .line(format!("Annual Production: {production}"))
            .line(format!("Install Date: {installed}"));
        if let Some((substation, _)) = spec.substations.and_then(|idx| idx.nearest(self.point())) {
            popup = popup.line(format!("Nearest Substation: {}", substation.name));
        }
        popup
    }

    fn selection(&self) -> Selection {
        Selection::House(self.id.clone())
    }
}

/// Lowercase with whitespace runs collapsed to '-'
fn slug(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

impl Markable for SubstationPoint {
    const LAYER: MarkerLayer = MarkerLayer::Substations;

    fn key_name(&self) -> String {
        match &self.origin {
            SubstationOrigin::Projected {
                objectid, source_name, ..
            } => {
                let name = source_name.as_deref().map(slug).unwrap_or_default();
                if name.is_empty() {
                    format!("pge-substation-{objectid}")
                } else {
                    format!("pge-substation-{name}")
                }
            }
            SubstationOrigin::Surveyed { .. } => format!("substation-{}", self.id),
        }
    }

    fn marker_point(&self) -> GeoPoint {
        self.location
    }

    fn element(&self) -> MarkerElement {
        let tone = match &self.origin {
            SubstationOrigin::Surveyed {
                current_load_kw: Some(load),
            } if self.capacity_kw > 0.0 => load_level(load / self.capacity_kw),
            _ => ConstraintLevel::Low,
        };
        MarkerElement {
            glyph: '◆',
            tone,
            ring: Some(tone),
        }
    }

    fn popup(&self, _spec: &RenderSpec<'_>) -> Popup {
        let kw = |v: Option<f64>| {
            v.map(|v| format!("{} kW", group_thousands(v)))
                .unwrap_or_else(|| "N/A".to_string())
        };
        let popup = Popup::new(self.name.clone());
        let popup = match &self.origin {
            SubstationOrigin::Projected { generation, .. } => popup
                .line(format!("Existing Generation: {}", kw(generation.existing_kw)))
                .line(format!("Queued Generation: {}", kw(generation.queued_kw)))
                .line(format!("Total Generation: {}", kw(generation.total_kw)))
                .line(format!(
                    "Last Updated: {}",
                    generation.last_update.as_deref().unwrap_or("N/A")
                )),
            SubstationOrigin::Surveyed { current_load_kw } => popup
                .line(format!("Capacity: {}", kw(Some(self.capacity_kw))))
                .line(format!("Current Load: {}", kw(*current_load_kw))),
        };
        popup.line(format!(
            "Coordinates: [{:.5}, {:.5}]",
            self.location.longitude, self.location.latitude
        ))
    }

    fn selection(&self) -> Selection {
        Selection::Substation(self.id.clone())
    }
}

impl<A: Markable> Markable for &A {
    const LAYER: MarkerLayer = A::LAYER;

    fn key_name(&self) -> String {
        (**self).key_name()
    }

    fn marker_point(&self) -> GeoPoint {
        (**self).marker_point()
    }

    fn element(&self) -> MarkerElement {
        (**self).element()
    }

    fn popup(&self, spec: &RenderSpec<'_>) -> Popup {
        (**self).popup(spec)
    }

    fn selection(&self) -> Selection {
        (**self).selection()
    }
}

fn load_level(ratio: f64) -> ConstraintLevel {
    if ratio >= 0.9 {
        ConstraintLevel::Critical
    } else if ratio >= 0.75 {
        ConstraintLevel::High
    } else if ratio >= 0.5 {
        ConstraintLevel::Medium
    } else {
        ConstraintLevel::Low
    }
}

/// 1234567.8 -> "1,234,568"
pub fn group_thousands(value: f64) -> String {
    let rounded = value.round() as i64;
    let digits = rounded.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if rounded < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
