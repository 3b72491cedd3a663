//! Hierarchical influence ledger.
//!
//! This crate owns the mutable side of the influence model:
//! - the immutable hierarchy catalog (departments, divisions, categories)
//! - per-member balances with optimistic, version-checked writes
//! - the conversion engine rolling balances up the hierarchy
//! - the append-only, hash-chained conversion audit log
//! - member enrollment and influence earning
//!
//! Design stance:
//! - A conversion is one atomic storage commit: both balances and the audit
//!   record land together or not at all.
//! - Conversions for one member are serialized in the engine; different
//!   members proceed in parallel.
//! - Earning (credits and tributes) commits the touched members and the
//!   credited balance together; member records are version-checked like
//!   balances.
//! - Postgres (feature `postgres`) is the transactional source of truth;
//!   the in-memory backend is the default for tests and embedding.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod audit;
mod catalog;
mod config;
mod engine;
mod error;
mod member;
pub mod storage;
mod store;

pub use catalog::HierarchyCatalog;
pub use config::{CatalogConfig, EngineConfig};
pub use engine::{ConversionEngine, ConversionOutcome, ConversionRejection};
pub use error::{CatalogError, EntityKind, InfluenceError, StorageError, StorageResult};
pub use member::MemberDirectory;
pub use storage::{bootstrap_storage, InMemoryInfluenceStorage, StorageConfig};
#[cfg(feature = "postgres")]
pub use storage::PostgresInfluenceStorage;
pub use store::{
    BalanceStore, CommittedConversion, CommittedEarning, ConversionCommit, ConversionCommitter,
    ConversionFilter, ConversionLog, EarningCommit, EarningCommitter, InfluenceStorage,
    MemberStore, QueryWindow,
};
