//! Storage backends and backend selection.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(test)]
pub(crate) mod testing;

use crate::error::{StorageError, StorageResult};
use crate::store::InfluenceStorage;
use std::sync::Arc;

pub use memory::InMemoryInfluenceStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresInfluenceStorage;

/// Ledger persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Keep balances, members and the conversion log in process memory only.
    #[default]
    Memory,
    /// Persist everything in PostgreSQL (requires the `postgres` feature).
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Connect the configured backend and make sure its schema exists.
pub async fn bootstrap_storage(config: StorageConfig) -> StorageResult<Arc<dyn InfluenceStorage>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(InMemoryInfluenceStorage::new())),
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store =
                PostgresInfluenceStorage::connect_with_options(&database_url, max_connections, 5)
                    .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(StorageError::Backend(
            "postgres storage requested but the `postgres` feature is not enabled".to_string(),
        )),
    }
}

#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
pub(crate) fn to_i64(value: u64, field: &str) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::Backend(format!("{field} {value} exceeds BIGINT range")))
}

#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
pub(crate) fn from_i64(value: i64, field: &str) -> StorageResult<u64> {
    u64::try_from(value)
        .map_err(|_| StorageError::InvariantViolation(format!("negative {field} {value} in storage")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use influence_types::BalanceKey;

    #[tokio::test]
    async fn memory_backend_bootstraps() {
        let storage = bootstrap_storage(StorageConfig::memory()).await.unwrap();
        let balance = storage
            .get_or_create_balance(&BalanceKey::new(1, 12, 1))
            .await
            .unwrap();
        assert_eq!(balance.amount, 0);
    }

    #[test]
    fn labels_match_backends() {
        assert_eq!(StorageConfig::memory().label(), "memory");
        assert_eq!(StorageConfig::postgres("postgres://x", 2).label(), "postgres");
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn postgres_without_feature_is_a_backend_error() {
        let result = bootstrap_storage(StorageConfig::postgres("postgres://localhost/x", 1)).await;
        assert!(matches!(result, Err(StorageError::Backend(_))));
    }

    #[test]
    fn integer_bounds_are_checked() {
        assert!(to_i64(u64::MAX, "amount").is_err());
        assert_eq!(to_i64(42, "amount").unwrap(), 42);
        assert!(from_i64(-1, "amount").is_err());
    }
}
