//! Hierarchy Catalog.
//!
//! Immutable reference data describing departments, divisions and influence
//! categories. Built once from a [`CatalogConfig`] and shared read-only
//! (usually behind an `Arc`). Every lookup failure is a "not found".

use crate::config::CatalogConfig;
use crate::error::{CatalogError, EntityKind};
use influence_types::{
    CategoryId, Department, DepartmentId, Division, DivisionId, InfluenceCategory,
    TributeTransfer,
};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone)]
pub struct HierarchyCatalog {
    departments: BTreeMap<DepartmentId, Department>,
    divisions: BTreeMap<DivisionId, Division>,
    categories: BTreeMap<CategoryId, InfluenceCategory>,
    pools: BTreeMap<DepartmentId, DivisionId>,
    general_department: DepartmentId,
    default_division: DivisionId,
}

impl HierarchyCatalog {
    /// Validate a seed document and build the catalog.
    ///
    /// Pool-equivalence is resolved here: `"none"` divisions always are,
    /// other divisions when the seed flags them (or, for legacy seeds, when
    /// their id falls under `legacy_pool_equivalent_max_id`).
    pub fn from_config(config: CatalogConfig) -> Result<Self, CatalogError> {
        let CatalogConfig {
            general_department,
            default_division,
            legacy_pool_equivalent_max_id,
            departments: seed_departments,
            divisions: seed_divisions,
            categories: seed_categories,
        } = config;

        let mut departments = BTreeMap::new();
        for department in seed_departments {
            let id = department.id;
            if departments.insert(id, department).is_some() {
                return Err(CatalogError::InvalidSeed(format!(
                    "duplicate department id {id}"
                )));
            }
        }

        let mut categories = BTreeMap::new();
        for category in seed_categories {
            let id = category.id;
            if categories.insert(id, category).is_some() {
                return Err(CatalogError::InvalidSeed(format!(
                    "duplicate category id {id}"
                )));
            }
        }

        let mut divisions = BTreeMap::new();
        let mut pools = BTreeMap::new();
        for mut division in seed_divisions {
            if !departments.contains_key(&division.department) {
                return Err(CatalogError::InvalidSeed(format!(
                    "division {} references unknown department {}",
                    division.id, division.department
                )));
            }

            if division.is_pool() {
                if let Some(existing) = pools.insert(division.department, division.id) {
                    return Err(CatalogError::InvalidSeed(format!(
                        "department {} has two pool divisions ({} and {})",
                        division.department, existing, division.id
                    )));
                }
                division.pool_equivalent = true;
            }

            if let Some(max_id) = legacy_pool_equivalent_max_id {
                if division.id.get() <= max_id {
                    division.pool_equivalent = true;
                }
            }

            let id = division.id;
            if divisions.insert(id, division).is_some() {
                return Err(CatalogError::InvalidSeed(format!("duplicate division id {id}")));
            }
        }

        let missing_pool = departments
            .keys()
            .find(|department| !pools.contains_key(*department));
        if let Some(department) = missing_pool {
            return Err(CatalogError::InvalidSeed(format!(
                "department {department} has no pool division"
            )));
        }

        if !departments.contains_key(&general_department) {
            return Err(CatalogError::InvalidSeed(format!(
                "general department {general_department} is not defined"
            )));
        }

        match divisions.get(&default_division) {
            None => {
                return Err(CatalogError::InvalidSeed(format!(
                    "default division {default_division} is not defined"
                )))
            }
            Some(division) if division.department != general_department => {
                return Err(CatalogError::InvalidSeed(format!(
                    "default division {default_division} is not part of the general department"
                )))
            }
            Some(_) => {}
        }

        Ok(Self {
            departments,
            divisions,
            categories,
            pools,
            general_department,
            default_division,
        })
    }

    /// Catalog for the bundled reference hierarchy.
    pub fn reference() -> Result<Self, CatalogError> {
        Self::from_config(CatalogConfig::reference()?)
    }

    pub fn department(&self, id: DepartmentId) -> Result<&Department, CatalogError> {
        self.departments
            .get(&id)
            .ok_or_else(|| CatalogError::not_found(EntityKind::Department, id))
    }

    pub fn division(&self, id: DivisionId) -> Result<&Division, CatalogError> {
        self.divisions
            .get(&id)
            .ok_or_else(|| CatalogError::not_found(EntityKind::Division, id))
    }

    pub fn category(&self, id: CategoryId) -> Result<&InfluenceCategory, CatalogError> {
        self.categories
            .get(&id)
            .ok_or_else(|| CatalogError::not_found(EntityKind::Category, id))
    }

    pub fn department_of(&self, division: DivisionId) -> Result<&Department, CatalogError> {
        let division = self.division(division)?;
        self.department(division.department)
    }

    /// The global pool at the top of the hierarchy.
    pub fn default_division(&self) -> &Division {
        // Presence checked in `from_config`.
        &self.divisions[&self.default_division]
    }

    pub fn general_department(&self) -> &Department {
        &self.departments[&self.general_department]
    }

    /// The `"none"` division of a department.
    pub fn pool_division(&self, department: DepartmentId) -> Result<&Division, CatalogError> {
        let pool = self
            .pools
            .get(&department)
            .ok_or_else(|| CatalogError::not_found(EntityKind::Department, department))?;
        self.division(*pool)
    }

    pub fn is_general_department(&self, department: DepartmentId) -> bool {
        department == self.general_department
    }

    /// Whether balances in `division` escape straight to the global pool.
    pub fn is_near_general(&self, division: DivisionId) -> Result<bool, CatalogError> {
        Ok(self.division(division)?.pool_equivalent)
    }

    pub fn division_by_name(
        &self,
        name: &str,
        department: DepartmentId,
    ) -> Result<&Division, CatalogError> {
        self.department(department)?;
        self.divisions
            .values()
            .find(|division| division.department == department && division.name == name)
            .ok_or_else(|| {
                CatalogError::InvalidReference(format!(
                    "no division named '{name}' in department {department}"
                ))
            })
    }

    pub fn divisions_of(&self, department: DepartmentId) -> Vec<&Division> {
        self.divisions
            .values()
            .filter(|division| division.department == department)
            .collect()
    }

    pub fn departments(&self) -> impl Iterator<Item = &Department> {
        self.departments.values()
    }

    pub fn divisions(&self) -> impl Iterator<Item = &Division> {
        self.divisions.values()
    }

    pub fn categories(&self) -> impl Iterator<Item = &InfluenceCategory> {
        self.categories.values()
    }

    /// Check the catalog references carried by a tribute transfer.
    pub fn validate_tribute(&self, tribute: &TributeTransfer) -> Result<(), CatalogError> {
        if tribute.amount == 0 {
            return Err(CatalogError::InvalidReference(
                "tribute amount must be at least 1".to_string(),
            ));
        }

        self.category(tribute.category)?;
        self.department(tribute.department)?;
        let division = self.division(tribute.division)?;
        if division.department != tribute.department {
            return Err(CatalogError::InvalidReference(format!(
                "division {} does not belong to department {}",
                division.id, tribute.department
            )));
        }
        Ok(())
    }

    /// Distinct division ids, keeping first occurrence order.
    pub(crate) fn dedup_divisions(
        &self,
        divisions: impl IntoIterator<Item = DivisionId>,
    ) -> Result<Vec<DivisionId>, CatalogError> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        for id in divisions {
            self.division(id)?;
            if seen.insert(id) {
                ordered.push(id);
            }
        }
        Ok(ordered)
    }
}
