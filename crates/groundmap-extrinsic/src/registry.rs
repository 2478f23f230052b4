//! Registered ground positions of fiducial markers.
//!
//! File layout: `MarkerCount`, then nested records `Marker_{i}` with `ID`,
//! `GroundX` and `GroundY`.

use std::collections::BTreeMap;
use std::path::Path;

use groundmap_core::Document;
use nalgebra::Point2;

use crate::error::MappingIoError;

/// Marker id to ground coordinate. Independent of any frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MarkerRegistry {
    markers: BTreeMap<i32, Point2<f64>>,
}

impl MarkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or move a marker; returns the previous position.
    pub fn set(&mut self, id: i32, ground: Point2<f64>) -> Option<Point2<f64>> {
        self.markers.insert(id, ground)
    }

    pub fn remove(&mut self, id: i32) -> Option<Point2<f64>> {
        self.markers.remove(&id)
    }

    pub fn get(&self, id: i32) -> Option<Point2<f64>> {
        self.markers.get(&id).copied()
    }

    pub fn contains(&self, id: i32) -> bool {
        self.markers.contains_key(&id)
    }

    /// Registered ids, ascending.
    pub fn ids(&self) -> Vec<i32> {
        self.markers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, Point2<f64>)> + '_ {
        self.markers.iter().map(|(id, p)| (*id, *p))
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }

    pub fn to_document(&self) -> Result<Document, MappingIoError> {
        let mut doc = Document::new();
        doc.set("MarkerCount", self.markers.len())?;
        for (i, (id, ground)) in self.iter().enumerate() {
            let mut node = Document::new();
            node.set("ID", id)?;
            node.set("GroundX", ground.x)?;
            node.set("GroundY", ground.y)?;
            doc.set_child(&format!("Marker_{i}"), node);
        }
        Ok(doc)
    }

    /// Parse a registry. A repeated id keeps the last record.
    pub fn from_document(doc: &Document) -> Result<Self, MappingIoError> {
        let count: usize = doc.get("MarkerCount")?;
        let mut registry = Self::new();
        for i in 0..count {
            let node = doc.child(&format!("Marker_{i}"))?;
            let id: i32 = node.get("ID")?;
            let ground = Point2::new(node.real("GroundX")?, node.real("GroundY")?);
            if registry.set(id, ground).is_some() {
                log::warn!("marker {id} is listed more than once, keeping the last entry");
            }
        }
        Ok(registry)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MappingIoError> {
        self.to_document()?.save(path)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MappingIoError> {
        Self::from_document(&Document::load(path)?)
    }
}

impl FromIterator<(i32, Point2<f64>)> for MarkerRegistry {
    fn from_iter<I: IntoIterator<Item = (i32, Point2<f64>)>>(iter: I) -> Self {
        Self {
            markers: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundmap_core::StorageError;

    #[test]
    fn set_get_remove() {
        let mut registry = MarkerRegistry::new();
        assert_eq!(registry.set(7, Point2::new(1.0, 2.0)), None);
        assert_eq!(
            registry.set(7, Point2::new(3.0, 4.0)),
            Some(Point2::new(1.0, 2.0))
        );
        registry.set(-2, Point2::new(0.0, 0.0));
        assert_eq!(registry.ids(), vec![-2, 7]);
        assert_eq!(registry.get(7), Some(Point2::new(3.0, 4.0)));
        assert_eq!(registry.remove(7), Some(Point2::new(3.0, 4.0)));
        assert!(!registry.contains(7));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn save_then_load_keeps_every_marker() {
        let registry: MarkerRegistry = [
            (3, Point2::new(0.0, 0.0)),
            (11, Point2::new(2.5, 0.0)),
            (42, Point2::new(2.5, -1.75)),
        ]
        .into_iter()
        .collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.json");
        registry.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"Marker_2\""));
        assert!(raw.contains("\"GroundY\""));
        assert_eq!(MarkerRegistry::load(&path).unwrap(), registry);
    }

    #[test]
    fn missing_record_is_rejected() {
        let doc = Document::from_json_str(
            r#"{"MarkerCount": 2, "Marker_0": {"ID": 1, "GroundX": 0.0, "GroundY": 1.0}}"#,
        )
        .unwrap();
        assert!(matches!(
            MarkerRegistry::from_document(&doc),
            Err(MappingIoError::Storage(StorageError::MissingKey(_)))
        ));
    }
}
