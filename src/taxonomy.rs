//! Label taxonomy
//!
//! Maps raw detector labels to a display category and description, loaded
//! once at startup from a JSON object of the form
//! `{"door": {"category": "IfcDoor", "description": "Hinged door"}}`.
//! A missing or malformed file leaves the mapping empty.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

pub const UNKNOWN_CATEGORY: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub category: String,
    #[serde(default)]
    pub description: String,
}

impl TaxonomyEntry {
    pub fn unknown() -> Self {
        Self {
            category: UNKNOWN_CATEGORY.to_string(),
            description: String::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "category": self.category,
            "description": self.description,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaxonomyMapper {
    entries: HashMap<String, TaxonomyEntry>,
}

impl TaxonomyMapper {
    pub fn new(entries: HashMap<String, TaxonomyEntry>) -> Self {
        Self { entries }
    }

    /// Load the mapping file, falling back to an empty mapping on any error
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Taxonomy file unreadable, every label maps to {}", UNKNOWN_CATEGORY
                );
                return Self::default();
            }
        };

        match Self::from_json(&raw) {
            Ok(mapper) => {
                info!(path = %path.display(), entries = mapper.len(), "Taxonomy loaded");
                mapper
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Taxonomy file malformed, every label maps to {}", UNKNOWN_CATEGORY
                );
                Self::default()
            }
        }
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        let entries: HashMap<String, TaxonomyEntry> = serde_json::from_str(raw)?;
        Ok(Self { entries })
    }

    pub fn map(&self, label: &str) -> TaxonomyEntry {
        self.entries
            .get(label)
            .cloned()
            .unwrap_or_else(TaxonomyEntry::unknown)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_unknown_label_defaults() {
        let mapper = TaxonomyMapper::default();
        let entry = mapper.map("nonexistent_class");
        assert_eq!(entry.category, "Unknown");
        assert_eq!(entry.description, "");
    }

    #[test]
    fn test_known_label() {
        let mapper = TaxonomyMapper::from_json(
            r#"{"door": {"category": "IfcDoor", "description": "Hinged door"},
                "lamp": {"category": "IfcLightFixture"}}"#,
        )
        .unwrap();
        assert_eq!(mapper.len(), 2);
        assert_eq!(mapper.map("door").category, "IfcDoor");
        assert_eq!(mapper.map("lamp").description, "");
        assert_eq!(mapper.map("chair"), TaxonomyEntry::unknown());
    }

    #[test]
    fn test_missing_file_gives_empty_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = TaxonomyMapper::load(&dir.path().join("absent.json"));
        assert!(mapper.is_empty());
        assert_eq!(mapper.map("door").category, UNKNOWN_CATEGORY);
    }

    #[test]
    fn test_malformed_file_gives_empty_mapping() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"door\": [1, 2, 3]").unwrap();
        let mapper = TaxonomyMapper::load(file.path());
        assert!(mapper.is_empty());
    }

    #[test]
    fn test_entry_json_payload() {
        let entry = TaxonomyEntry {
            category: "IfcDoor".to_string(),
            description: "Hinged door".to_string(),
        };
        let json = entry.to_json();
        assert_eq!(json["category"], "IfcDoor");
        assert_eq!(json["description"], "Hinged door");
    }
}
