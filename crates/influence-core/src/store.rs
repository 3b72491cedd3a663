//! Storage contracts for the influence ledger.
//!
//! - balances, one record per (member, division, category)
//! - the append-only conversion log
//! - corporateer aggregates
//! - a transactional commit covering one conversion
//! - a transactional commit covering one earning (credit or tribute)
//!
//! Individual stores give no cross-record atomicity. The only multi-record
//! writes are [`ConversionCommitter::commit_conversion`] and
//! [`EarningCommitter::commit_earning`].

use crate::error::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use influence_types::{
    Balance, BalanceKey, CategoryId, Conversion, ConversionDraft, Member, MemberId,
};
use serde::{Deserialize, Serialize};

/// Generic query window for paged reads. A zero limit means "no limit".
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl QueryWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn page(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    pub(crate) fn apply<T>(&self, values: Vec<T>) -> Vec<T> {
        let iter = values.into_iter().skip(self.offset);
        if self.limit == 0 {
            iter.collect()
        } else {
            iter.take(self.limit).collect()
        }
    }
}

/// Reporting filter over the conversion log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionFilter {
    pub member: Option<MemberId>,
    pub category: Option<CategoryId>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
}

impl ConversionFilter {
    pub fn for_member(member: MemberId) -> Self {
        Self {
            member: Some(member),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: CategoryId) -> Self {
        self.category = Some(category);
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn matches(&self, conversion: &Conversion) -> bool {
        self.member.map_or(true, |m| conversion.member == m)
            && self.category.map_or(true, |c| conversion.category == c)
            && self.since.map_or(true, |t| conversion.timestamp >= t)
            && self.until.map_or(true, |t| conversion.timestamp < t)
    }
}

/// Both balance writes and the audit draft of a single conversion.
///
/// `source` and `destination` carry the new amounts and the versions that
/// were read; the commit fails with a conflict if either stored version moved.
#[derive(Debug, Clone)]
pub struct ConversionCommit {
    pub source: Balance,
    pub destination: Balance,
    pub draft: ConversionDraft,
}

/// Stored state after a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedConversion {
    pub source: Balance,
    pub destination: Balance,
    pub conversion: Conversion,
}

/// Member aggregates and the balance a single earning raises.
///
/// Every record carries the version that was read; the commit fails with a
/// conflict if any stored version moved.
#[derive(Debug, Clone)]
pub struct EarningCommit {
    pub members: Vec<Member>,
    pub balance: Balance,
}

/// Stored state after a successful earning commit, members in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEarning {
    pub members: Vec<Member>,
    pub balance: Balance,
}

/// Storage interface for influence balances.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn get_balance(&self, key: &BalanceKey) -> StorageResult<Option<Balance>>;

    /// Return the balance for `key`, creating it with amount 0 if absent.
    async fn get_or_create_balance(&self, key: &BalanceKey) -> StorageResult<Balance>;

    /// Persist `balance.amount` if the stored version still equals
    /// `balance.version`. Returns the stored record with its new version.
    async fn save_balance(&self, balance: &Balance) -> StorageResult<Balance>;

    async fn list_member_balances(&self, member: MemberId) -> StorageResult<Vec<Balance>>;
}

/// Storage interface for the append-only conversion log.
#[async_trait]
pub trait ConversionLog: Send + Sync {
    /// Append a conversion and return the sequenced, hash-linked record.
    async fn record_conversion(&self, draft: ConversionDraft) -> StorageResult<Conversion>;

    /// Read matching conversions oldest-first.
    async fn list_conversions(
        &self,
        filter: &ConversionFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<Conversion>>;

    /// Recompute the hash chain over the whole log.
    async fn verify_conversion_chain(&self) -> StorageResult<bool>;
}

/// Storage interface for corporateer aggregates.
#[async_trait]
pub trait MemberStore: Send + Sync {
    async fn get_member(&self, id: MemberId) -> StorageResult<Option<Member>>;

    /// Insert (`version == 0`) or update a member if the stored version still
    /// equals `member.version`. Returns the stored record with its new version.
    /// Lowering `lifetime_influence` is an invariant violation.
    async fn upsert_member(&self, member: Member) -> StorageResult<Member>;

    async fn list_members(&self, window: QueryWindow) -> StorageResult<Vec<Member>>;
}

/// Transactional boundary around one conversion.
#[async_trait]
pub trait ConversionCommitter: Send + Sync {
    /// Atomically write both balances and append the conversion.
    ///
    /// Either every write lands or none does.
    async fn commit_conversion(&self, commit: ConversionCommit)
        -> StorageResult<CommittedConversion>;
}

/// Transactional boundary around one earning.
#[async_trait]
pub trait EarningCommitter: Send + Sync {
    /// Atomically write every member aggregate and the raised balance.
    async fn commit_earning(&self, commit: EarningCommit) -> StorageResult<CommittedEarning>;
}

/// Unified storage bundle used by the engine and the member directory.
pub trait InfluenceStorage:
    BalanceStore + ConversionLog + MemberStore + ConversionCommitter + EarningCommitter + Send + Sync
{
}

impl<T> InfluenceStorage for T where
    T: BalanceStore
        + ConversionLog
        + MemberStore
        + ConversionCommitter
        + EarningCommitter
        + Send
        + Sync
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use influence_types::DivisionId;

    fn conversion_at(timestamp: DateTime<Utc>) -> Conversion {
        Conversion {
            conversion_id: uuid::Uuid::new_v4(),
            sequence: 1,
            timestamp,
            member: MemberId(1),
            from_division: DivisionId(12),
            to_division: DivisionId(3),
            category: CategoryId(2),
            amount: 10,
            previous_hash: None,
            entry_hash: String::new(),
        }
    }

    #[test]
    fn filter_matches_member_and_category() {
        let conversion = conversion_at(Utc::now());
        assert!(ConversionFilter::default().matches(&conversion));
        assert!(ConversionFilter::for_member(MemberId(1))
            .with_category(CategoryId(2))
            .matches(&conversion));
        assert!(!ConversionFilter::for_member(MemberId(2)).matches(&conversion));
        assert!(!ConversionFilter::for_member(MemberId(1))
            .with_category(CategoryId(1))
            .matches(&conversion));
    }

    #[test]
    fn filter_time_range_is_half_open() {
        let now = Utc::now();
        let conversion = conversion_at(now);
        let filter = ConversionFilter::default().between(now, now + Duration::seconds(1));
        assert!(filter.matches(&conversion));

        let filter = ConversionFilter::default().between(now - Duration::seconds(1), now);
        assert!(!filter.matches(&conversion));
    }

    #[test]
    fn window_applies_offset_and_limit() {
        let values = vec![1, 2, 3, 4, 5];
        assert_eq!(QueryWindow::page(2, 1).apply(values.clone()), vec![2, 3]);
        assert_eq!(QueryWindow::all().apply(values), vec![1, 2, 3, 4, 5]);
    }
}
