//! Configuration: catalog seed documents and engine tuning.

use crate::error::CatalogError;
use influence_types::{Department, DepartmentId, Division, DivisionId, InfluenceCategory};
use serde::{Deserialize, Serialize};
use std::path::Path;

const REFERENCE_SEED: &str = include_str!("../seeds/reference_catalog.json");

/// Seed document the hierarchy catalog is built from at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// The terminal department. Balances scoped to it never convert further.
    pub general_department: DepartmentId,
    /// Global pool division. Must belong to the general department.
    pub default_division: DivisionId,
    /// Divisions with an id at or below this value are flagged pool-equivalent.
    ///
    /// Only meant for importing legacy seeds whose numbering encoded the flag.
    #[serde(default)]
    pub legacy_pool_equivalent_max_id: Option<u64>,
    pub departments: Vec<Department>,
    pub divisions: Vec<Division>,
    pub categories: Vec<InfluenceCategory>,
}

impl CatalogConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The bundled reference hierarchy.
    pub fn reference() -> Result<Self, CatalogError> {
        Self::from_json_str(REFERENCE_SEED)
    }
}

/// Conversion engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Extra attempts after a commit conflict before giving up.
    pub max_conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_seed_parses() {
        let config = CatalogConfig::reference().unwrap();
        assert_eq!(config.general_department, DepartmentId(1));
        assert_eq!(config.default_division, DivisionId(1));
        assert!(!config.categories.is_empty());
    }

    #[test]
    fn legacy_threshold_is_optional() {
        let config = CatalogConfig::from_json_str(
            r#"{
                "general_department": 1,
                "default_division": 1,
                "departments": [{"id": 1, "name": "General"}],
                "divisions": [{"id": 1, "name": "none", "department": 1}],
                "categories": [{"id": 1, "name": "standard"}]
            }"#,
        )
        .unwrap();
        assert!(config.legacy_pool_equivalent_max_id.is_none());
    }

    #[test]
    fn malformed_seed_is_a_serialization_error() {
        let err = CatalogConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, CatalogError::Serialization(_)));
    }

    #[test]
    fn missing_seed_file_is_an_io_error() {
        let err = CatalogConfig::from_path("/nonexistent/influence/catalog.json").unwrap_err();
        assert!(matches!(err, CatalogError::Io(_)));
    }
}
