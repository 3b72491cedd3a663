use crate::{BalanceKey, CategoryId, DivisionId, MemberId};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conversion prepared by the engine but not yet appended to the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionDraft {
    pub conversion_id: Uuid,
    /// Whole-second UTC timestamp.
    pub timestamp: DateTime<Utc>,
    pub member: MemberId,
    pub from_division: DivisionId,
    pub to_division: DivisionId,
    pub category: CategoryId,
    pub amount: u64,
}

impl ConversionDraft {
    pub fn new(source: BalanceKey, to_division: DivisionId, amount: u64) -> Self {
        Self {
            conversion_id: Uuid::new_v4(),
            timestamp: Utc::now().trunc_subsecs(0),
            member: source.member,
            from_division: source.division,
            to_division,
            category: source.category,
            amount,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(0);
        self
    }
}

/// Immutable audit record of one successful conversion.
///
/// Records are hash-chained: `entry_hash` covers the record contents and
/// `previous_hash`, so any later edit of the log is detectable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    pub conversion_id: Uuid,
    /// 1-based position in the conversion log.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub member: MemberId,
    pub from_division: DivisionId,
    pub to_division: DivisionId,
    pub category: CategoryId,
    pub amount: u64,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl Conversion {
    pub fn draft(&self) -> ConversionDraft {
        ConversionDraft {
            conversion_id: self.conversion_id,
            timestamp: self.timestamp,
            member: self.member,
            from_division: self.from_division,
            to_division: self.to_division,
            category: self.category,
            amount: self.amount,
        }
    }

    pub fn source_key(&self) -> BalanceKey {
        BalanceKey::new(self.member, self.from_division, self.category)
    }

    pub fn destination_key(&self) -> BalanceKey {
        BalanceKey::new(self.member, self.to_division, self.category)
    }
}
