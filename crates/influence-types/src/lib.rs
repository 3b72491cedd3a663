//! Influence Ledger Domain Types
//!
//! This crate defines the data model shared by the influence ledger:
//! the two-level organizational hierarchy, per-member influence balances,
//! the immutable conversion records produced when balances roll up the
//! hierarchy, and the corporateer aggregate that owns them.
//!
//! # Key Concepts
//!
//! - **Department / Division**: a fixed two-level hierarchy. Each department
//!   owns a distinguished `"none"` division acting as its pool bucket.
//! - **Influence Category**: a tag that makes balances non-fungible.
//! - **Balance**: one record per (member, division, category).
//! - **Conversion**: an append-only audit record of one roll-up move.
//! - **Member (Corporateer)**: summary counters plus the key that scopes
//!   every balance and conversion.
//!
//! # Architecture
//!
//! Pure types crate with no runtime dependencies. All types implement
//! `Clone`, `Debug`, `Serialize`, `Deserialize`. IDs use the newtype pattern
//! and implement `Display` and `new()`.

#![deny(unsafe_code)]

mod balance;
mod conversion;
mod errors;
mod hierarchy;
mod ids;
mod member;
mod tribute;

pub use balance::*;
pub use conversion::*;
pub use errors::*;
pub use hierarchy::*;
pub use ids::*;
pub use member::*;
pub use tribute::*;
