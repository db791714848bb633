use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// A named closed polygon over (lat, lon) vertices. The closing edge from the
/// last vertex back to the first is implicit.
#[derive(Debug, Clone, Deserialize)]
pub struct Polygon {
    pub name: String,
    pub points: Vec<(f64, f64)>,
}

impl Polygon {
    /// Even-odd ray cast. Points exactly on an edge may land on either side;
    /// profile geofences are coarse enough that this does not matter.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (lat_i, lon_i) = self.points[i];
            let (lat_j, lon_j) = self.points[j];
            if ((lon_i > lon) != (lon_j > lon))
                && lat < (lat_j - lat_i) * (lon - lon_i) / (lon_j - lon_i) + lat_i
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PolygonFile {
    polygons: Vec<Polygon>,
}

#[derive(Debug, Clone, Default)]
pub struct PolygonSet {
    by_name: HashMap<String, Polygon>,
}

impl PolygonSet {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read polygon file {}", path.display()))?;
        let decoded: PolygonFile =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        let mut by_name = HashMap::new();
        for polygon in decoded.polygons {
            if polygon.points.len() < 3 {
                anyhow::bail!("polygon {} has fewer than 3 vertices", polygon.name);
            }
            if by_name.insert(polygon.name.clone(), polygon).is_some() {
                anyhow::bail!("duplicate polygon name in {}", path.display());
            }
        }
        Ok(Self { by_name })
    }

    pub fn get(&self, name: &str) -> Option<&Polygon> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str, lat: f64, lon: f64) -> bool {
        self.by_name
            .get(name)
            .map(|polygon| polygon.contains(lat, lon))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn insert(&mut self, polygon: Polygon) {
        self.by_name.insert(polygon.name.clone(), polygon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Polygon {
        Polygon {
            name: "sq".to_string(),
            points: vec![(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)],
        }
    }

    #[test]
    fn contains_interior_point() {
        assert!(unit_square().contains(0.5, 0.5));
    }

    #[test]
    fn excludes_exterior_point() {
        let sq = unit_square();
        assert!(!sq.contains(1.5, 0.5));
        assert!(!sq.contains(0.5, -0.1));
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        let line = Polygon {
            name: "line".to_string(),
            points: vec![(0.0, 0.0), (1.0, 1.0)],
        };
        assert!(!line.contains(0.5, 0.5));
    }

    #[test]
    fn unknown_name_is_outside() {
        let set = PolygonSet::default();
        assert!(!set.contains("nope", 0.5, 0.5));
    }
}
