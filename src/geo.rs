//! Bounding-box geometry for areas of interest.
//!
//! The orchestrator only needs envelope math: admission estimates are keyed
//! on bbox + zoom range, and `AreaLimitExceeded` recovery splits a bbox into
//! its four quadrants. Anything heavier stays with the conversion tooling.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A WGS84 bounding box (west, south, east, north).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bbox {
    /// Create a bbox, validating coordinate order and world bounds.
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Option<Self> {
        let valid = west < east
            && south < north
            && (-180.0..=180.0).contains(&west)
            && (-180.0..=180.0).contains(&east)
            && (-90.0..=90.0).contains(&south)
            && (-90.0..=90.0).contains(&north);
        valid.then_some(Self {
            west,
            south,
            east,
            north,
        })
    }

    /// Envelope of a GeoJSON geometry (Polygon, MultiPolygon, or anything
    /// with nested coordinate arrays). Returns `None` for geometry without
    /// usable coordinates.
    pub fn from_geojson(geometry: &Value) -> Option<Self> {
        let coords = geometry.get("coordinates")?;
        let mut envelope: Option<(f64, f64, f64, f64)> = None;
        collect_positions(coords, &mut envelope);
        let (west, south, east, north) = envelope?;
        Self::new(west, south, east, north)
    }

    /// Area in square degrees. Advisory only, used for logging estimates.
    pub fn area(&self) -> f64 {
        (self.east - self.west) * (self.north - self.south)
    }

    /// Split into exactly four quadrants covering this bbox.
    pub fn quadrants(&self) -> [Bbox; 4] {
        let mid_x = (self.west + self.east) / 2.0;
        let mid_y = (self.south + self.north) / 2.0;
        [
            Bbox {
                west: self.west,
                south: mid_y,
                east: mid_x,
                north: self.north,
            },
            Bbox {
                west: mid_x,
                south: mid_y,
                east: self.east,
                north: self.north,
            },
            Bbox {
                west: self.west,
                south: self.south,
                east: mid_x,
                north: mid_y,
            },
            Bbox {
                west: mid_x,
                south: self.south,
                east: self.east,
                north: mid_y,
            },
        ]
    }

    /// Whether `other` lies entirely within this bbox.
    pub fn contains(&self, other: &Bbox) -> bool {
        self.west <= other.west
            && self.south <= other.south
            && self.east >= other.east
            && self.north >= other.north
    }

    /// GeoJSON Polygon covering this bbox, used as a conversion boundary.
    pub fn to_geojson(&self) -> Value {
        serde_json::json!({
            "type": "Polygon",
            "coordinates": [[
                [self.west, self.south],
                [self.east, self.south],
                [self.east, self.north],
                [self.west, self.north],
                [self.west, self.south],
            ]]
        })
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.4}, {:.4}, {:.4}, {:.4}]",
            self.west, self.south, self.east, self.north
        )
    }
}

fn collect_positions(value: &Value, envelope: &mut Option<(f64, f64, f64, f64)>) {
    match value {
        Value::Array(items) => {
            // A position is a numeric pair; anything else recurses.
            if items.len() >= 2 && items.iter().take(2).all(Value::is_number) {
                let x = items[0].as_f64().unwrap_or(0.0);
                let y = items[1].as_f64().unwrap_or(0.0);
                *envelope = Some(match envelope.take() {
                    Some((w, s, e, n)) => (w.min(x), s.min(y), e.max(x), n.max(y)),
                    None => (x, y, x, y),
                });
            } else {
                for item in items {
                    collect_positions(item, envelope);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_validation() {
        assert!(Bbox::new(-10.0, -10.0, 10.0, 10.0).is_some());
        assert!(Bbox::new(10.0, -10.0, -10.0, 10.0).is_none());
        assert!(Bbox::new(-181.0, -10.0, 10.0, 10.0).is_none());
    }

    #[test]
    fn test_quadrants_cover_parent() {
        let parent = Bbox::new(-10.0, -20.0, 30.0, 40.0).unwrap();
        let quads = parent.quadrants();
        assert_eq!(quads.len(), 4);
        for quad in &quads {
            assert!(parent.contains(quad));
        }
        let total: f64 = quads.iter().map(Bbox::area).sum();
        assert!((total - parent.area()).abs() < 1e-9);
    }

    #[test]
    fn test_envelope_from_polygon() {
        let geom = serde_json::json!({
            "type": "Polygon",
            "coordinates": [[[1.0, 2.0], [3.0, 2.0], [3.0, 5.0], [1.0, 5.0], [1.0, 2.0]]]
        });
        let bbox = Bbox::from_geojson(&geom).unwrap();
        assert_eq!(bbox.west, 1.0);
        assert_eq!(bbox.south, 2.0);
        assert_eq!(bbox.east, 3.0);
        assert_eq!(bbox.north, 5.0);
    }

    #[test]
    fn test_envelope_from_multipolygon() {
        let geom = serde_json::json!({
            "type": "MultiPolygon",
            "coordinates": [
                [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]],
                [[[5.0, 5.0], [6.0, 5.0], [6.0, 7.0], [5.0, 5.0]]]
            ]
        });
        let bbox = Bbox::from_geojson(&geom).unwrap();
        assert_eq!(bbox.west, 0.0);
        assert_eq!(bbox.north, 7.0);
    }

    #[test]
    fn test_boundary_round_trip() {
        let bbox = Bbox::new(-1.5, -2.5, 3.5, 4.5).unwrap();
        let from_json = Bbox::from_geojson(&bbox.to_geojson()).unwrap();
        assert_eq!(bbox, from_json);
    }
}
