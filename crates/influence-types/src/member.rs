//! Corporateer aggregate.
//!
//! The summary counters here are maintained by the earning/tribute path.
//! Moving influence between scopes of the same member never changes them.

use crate::{DivisionId, MemberId, MemberLedgerError, RankId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rank {
    pub id: RankId,
    pub name: String,
}

impl Rank {
    pub fn new(id: impl Into<RankId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A member holding influence balances across the hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    /// Tributes the member can still hand out.
    pub tributes: u64,
    pub total_influence: u64,
    /// Never decreases.
    pub lifetime_influence: u64,
    pub main_division: DivisionId,
    pub rank: Rank,
    /// Optimistic concurrency token; `0` means never stored.
    #[serde(default)]
    pub version: u64,
}

impl Member {
    pub fn new(
        id: impl Into<MemberId>,
        name: impl Into<String>,
        main_division: impl Into<DivisionId>,
        rank: Rank,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tributes: 0,
            total_influence: 0,
            lifetime_influence: 0,
            main_division: main_division.into(),
            rank,
            version: 0,
        }
    }

    /// Record newly earned influence.
    pub fn credit_influence(&mut self, amount: u64) -> Result<(), MemberLedgerError> {
        let total = self
            .total_influence
            .checked_add(amount)
            .ok_or(MemberLedgerError::Overflow)?;
        let lifetime = self
            .lifetime_influence
            .checked_add(amount)
            .ok_or(MemberLedgerError::Overflow)?;
        self.total_influence = total;
        self.lifetime_influence = lifetime;
        Ok(())
    }

    /// Remove influence from the running total. Lifetime influence is kept.
    pub fn debit_influence(&mut self, amount: u64) -> Result<(), MemberLedgerError> {
        self.total_influence = self.total_influence.checked_sub(amount).ok_or(
            MemberLedgerError::InsufficientInfluence {
                required: amount,
                available: self.total_influence,
            },
        )?;
        Ok(())
    }

    pub fn grant_tributes(&mut self, count: u64) -> Result<(), MemberLedgerError> {
        self.tributes = self
            .tributes
            .checked_add(count)
            .ok_or(MemberLedgerError::Overflow)?;
        Ok(())
    }

    pub fn spend_tribute(&mut self) -> Result<(), MemberLedgerError> {
        self.tributes = self
            .tributes
            .checked_sub(1)
            .ok_or(MemberLedgerError::NoTributesLeft)?;
        Ok(())
    }
}
