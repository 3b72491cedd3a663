//! Hierarchy reference data: departments, divisions and influence categories.

use crate::{CategoryId, DepartmentId, DivisionId};
use serde::{Deserialize, Serialize};

/// Name of the distinguished per-department pool division.
pub const POOL_DIVISION_NAME: &str = "none";

/// A top-level organizational unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: DepartmentId,
    pub name: String,
}

impl Department {
    pub fn new(id: impl Into<DepartmentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A sub-unit of exactly one department.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Division {
    pub id: DivisionId,
    pub name: String,
    pub department: DepartmentId,
    /// Balances in this division roll straight to the global pool.
    #[serde(default)]
    pub pool_equivalent: bool,
}

impl Division {
    pub fn new(
        id: impl Into<DivisionId>,
        name: impl Into<String>,
        department: impl Into<DepartmentId>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            department: department.into(),
            pool_equivalent: false,
        }
    }

    pub fn with_pool_equivalent(mut self, pool_equivalent: bool) -> Self {
        self.pool_equivalent = pool_equivalent;
        self
    }

    /// Whether this is its department's `"none"` pool bucket.
    pub fn is_pool(&self) -> bool {
        self.name == POOL_DIVISION_NAME
    }
}

/// Classification tag for balances, conversions and tributes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfluenceCategory {
    pub id: CategoryId,
    pub name: String,
}

impl InfluenceCategory {
    pub fn new(id: impl Into<CategoryId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}
