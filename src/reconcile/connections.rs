use std::collections::HashMap;

use tracing::{debug, warn};

use crate::assign::Assignment;
use crate::model::{HouseRecord, SubstationPoint};
use crate::surface::{LineHandle, LineStyle, MapSurface};

/// House-to-substation lines drawn from the current assignments.
///
/// Lines are cheap and have no identity worth preserving, so every sync
/// replaces the whole layer.
#[derive(Debug, Default)]
pub struct ConnectionLayers {
    lines: Vec<LineHandle>,
}

impl ConnectionLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Redraw one line per assignment. Lines to `highlighted` are emphasized and
    /// all others dimmed; with no highlight every line is drawn plainly.
    pub fn sync<S: MapSurface + ?Sized>(
        &mut self,
        surface: &mut S,
        assignments: &[Assignment],
        houses: &[HouseRecord],
        substations: &[SubstationPoint],
        highlighted: Option<&str>,
    ) -> usize {
        self.clear(surface);

        let houses: HashMap<&str, &HouseRecord> = houses.iter().map(|h| (h.id.as_str(), h)).collect();
        let substations: HashMap<&str, &SubstationPoint> =
            substations.iter().map(|s| (s.id.as_str(), s)).collect();

        for assignment in assignments {
            let (Some(house), Some(substation)) = (
                houses.get(assignment.source_id.as_str()),
                substations.get(assignment.target_id.as_str()),
            ) else {
                continue;
            };
            let style = match highlighted {
                Some(id) if id == assignment.target_id => LineStyle {
                    emphasized: true,
                    dimmed: false,
                },
                Some(_) => LineStyle {
                    emphasized: false,
                    dimmed: true,
                },
                None => LineStyle::default(),
            };
            match surface.add_line(house.point(), substation.location, style) {
                Ok(handle) => self.lines.push(handle),
                Err(e) => {
                    warn!(house = %house.id, error = %e, "failed to draw connection");
                    break;
                }
            }
        }

        debug!(lines = self.lines.len(), ?highlighted, "synced connection lines");
        self.lines.len()
    }

    pub fn clear<S: MapSurface + ?Sized>(&mut self, surface: &mut S) {
        for handle in self.lines.drain(..) {
            surface.remove_line(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;
    use crate::model::SubstationOrigin;
    use crate::surface::RecordingSurface;

    fn house(id: &str) -> HouseRecord {
        HouseRecord {
            id: id.to_string(),
            system_id: id.to_string(),
            latitude: 37.7,
            longitude: -122.4,
            install_date: None,
            system_size_kw: None,
            annual_production_kwh: None,
            system_type: None,
            city: None,
            state: None,
        }
    }

    fn substation(id: &str) -> SubstationPoint {
        SubstationPoint {
            id: id.to_string(),
            name: id.to_string(),
            location: GeoPoint::new(-122.41, 37.71),
            capacity_kw: 1000.0,
            origin: SubstationOrigin::Surveyed { current_load_kw: None },
        }
    }

    fn link(source: &str, target: &str) -> Assignment {
        Assignment {
            source_id: source.to_string(),
            target_id: target.to_string(),
            distance: 0.5,
        }
    }

    #[test]
    fn test_sync_highlights_selected_substation() {
        let mut surface = RecordingSurface::loaded();
        let mut layers = ConnectionLayers::new();
        let houses = vec![house("h1"), house("h2")];
        let subs = vec![substation("s1"), substation("s2")];
        let assignments = vec![link("h1", "s1"), link("h2", "s2"), link("ghost", "s1")];

        assert_eq!(layers.sync(&mut surface, &assignments, &houses, &subs, Some("s1")), 2);
        let styles: Vec<LineStyle> = surface.lines.values().map(|(_, _, s)| *s).collect();
        assert_eq!(styles.iter().filter(|s| s.emphasized).count(), 1);
        assert_eq!(styles.iter().filter(|s| s.dimmed).count(), 1);

        layers.sync(&mut surface, &assignments, &houses, &subs, None);
        assert_eq!(surface.lines.len(), 2);
        assert!(surface.lines.values().all(|(_, _, s)| *s == LineStyle::default()));

        layers.clear(&mut surface);
        assert!(surface.lines.is_empty());
        assert!(layers.is_empty());
    }
}
