use crate::{CategoryId, DivisionId, MemberId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique scope of a balance: at most one balance exists per key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub member: MemberId,
    pub division: DivisionId,
    pub category: CategoryId,
}

impl BalanceKey {
    pub fn new(
        member: impl Into<MemberId>,
        division: impl Into<DivisionId>,
        category: impl Into<CategoryId>,
    ) -> Self {
        Self {
            member: member.into(),
            division: division.into(),
            category: category.into(),
        }
    }

    /// Same member and category, different division.
    pub fn with_division(self, division: DivisionId) -> Self {
        Self { division, ..self }
    }
}

impl std::fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "member={} division={} category={}",
            self.member, self.division, self.category
        )
    }
}

/// Influence held by one member in one division for one category.
///
/// `version` is bumped by the store on every persisted write and is used
/// for optimistic concurrency checks. A freshly created balance has
/// version 0 and amount 0; zero is a valid amount and distinct from absence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub key: BalanceKey,
    pub amount: u64,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn empty(key: BalanceKey) -> Self {
        Self {
            key,
            amount: 0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_amount(mut self, amount: u64) -> Self {
        self.amount = amount;
        self
    }

    pub fn member(&self) -> MemberId {
        self.key.member
    }

    pub fn division(&self) -> DivisionId {
        self.key.division
    }

    pub fn category(&self) -> CategoryId {
        self.key.category
    }
}
