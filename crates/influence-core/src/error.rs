use influence_types::MemberLedgerError;
use thiserror::Error;

/// Kind of entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Department,
    Division,
    Category,
    Member,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Department => "department",
            Self::Division => "division",
            Self::Category => "category",
            Self::Member => "member",
        };
        f.write_str(label)
    }
}

/// Hierarchy catalog errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: u64 },

    #[error("invalid catalog seed: {0}")]
    InvalidSeed(String),

    #[error("invalid catalog reference: {0}")]
    InvalidReference(String),

    #[error("catalog seed IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog seed serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CatalogError {
    pub fn not_found(kind: EntityKind, id: impl Into<u64>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// A concurrent writer changed a record between read and commit.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Errors surfaced by the conversion engine and member directory.
///
/// Logical refusals (terminal source, insufficient balance) are not errors;
/// they are reported through `ConversionOutcome::Rejected`.
#[derive(Debug, Error)]
pub enum InfluenceError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: u64 },

    #[error("catalog error: {0}")]
    Catalog(CatalogError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("conversion kept conflicting after {attempts} attempts, try again")]
    ConflictRetriesExhausted { attempts: u32 },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("member ledger error: {0}")]
    MemberLedger(#[from] MemberLedgerError),
}

impl InfluenceError {
    pub fn not_found(kind: EntityKind, id: impl Into<u64>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Transient failures the caller may simply retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConflictRetriesExhausted { .. })
    }
}

impl From<CatalogError> for InfluenceError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound { kind, id } => Self::NotFound { kind, id },
            other => Self::Catalog(other),
        }
    }
}
