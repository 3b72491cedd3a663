//! Corporateer directory.
//!
//! Enrollment provisions a member's zero balances across the hierarchy; the
//! earning path credits influence and keeps the aggregate counters in step.
//! Every earning lands as one version-checked commit of the touched members
//! and the credited balance. Conversions never go through here.

use crate::catalog::HierarchyCatalog;
use crate::config::EngineConfig;
use crate::error::{EntityKind, InfluenceError};
use crate::store::{EarningCommit, InfluenceStorage, QueryWindow};
use influence_types::{
    Balance, BalanceKey, CategoryId, DivisionId, Member, MemberId, TributeTransfer,
};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Create zero balances for every category in each scope the member needs.
///
/// Scopes are the member's main division, the listed divisions and the
/// global pool. Existing balances are returned untouched.
pub(crate) async fn provision_balances(
    catalog: &HierarchyCatalog,
    storage: &dyn InfluenceStorage,
    member: &Member,
    divisions: impl IntoIterator<Item = DivisionId>,
) -> Result<Vec<Balance>, InfluenceError> {
    let scopes = catalog.dedup_divisions(
        std::iter::once(member.main_division)
            .chain(divisions)
            .chain(std::iter::once(catalog.default_division().id)),
    )?;

    let mut balances = Vec::with_capacity(scopes.len());
    for division in scopes {
        for category in catalog.categories() {
            let key = BalanceKey {
                member: member.id,
                division,
                category: category.id,
            };
            balances.push(storage.get_or_create_balance(&key).await?);
        }
    }
    Ok(balances)
}

/// Member registry on top of the shared storage.
#[derive(Clone)]
pub struct MemberDirectory {
    catalog: Arc<HierarchyCatalog>,
    storage: Arc<dyn InfluenceStorage>,
    config: EngineConfig,
}

impl MemberDirectory {
    pub fn new(catalog: Arc<HierarchyCatalog>, storage: Arc<dyn InfluenceStorage>) -> Self {
        Self {
            catalog,
            storage,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn member(&self, id: MemberId) -> Result<Member, InfluenceError> {
        self.storage
            .get_member(id)
            .await?
            .ok_or_else(|| InfluenceError::not_found(EntityKind::Member, id))
    }

    pub async fn members(&self, window: QueryWindow) -> Result<Vec<Member>, InfluenceError> {
        Ok(self.storage.list_members(window).await?)
    }

    /// Register a member and provision its balances.
    ///
    /// Re-enrolling an existing member updates its name, main division and
    /// rank; tributes and influence counters stay as stored.
    pub async fn enroll(
        &self,
        member: Member,
        divisions: impl IntoIterator<Item = DivisionId>,
    ) -> Result<Vec<Balance>, InfluenceError> {
        self.catalog.division(member.main_division)?;
        let divisions: Vec<DivisionId> = divisions.into_iter().collect();
        // Reject unknown divisions before anything is written.
        self.catalog.dedup_divisions(divisions.iter().copied())?;

        let stored = self
            .with_retries("enroll", || self.try_enroll(&member))
            .await?;
        let balances =
            provision_balances(&self.catalog, self.storage.as_ref(), &stored, divisions).await?;

        info!(
            member = %stored.id,
            main_division = %stored.main_division,
            balances = balances.len(),
            "Member enrolled"
        );
        Ok(balances)
    }

    async fn try_enroll(&self, member: &Member) -> Result<Member, InfluenceError> {
        let record = match self.storage.get_member(member.id).await? {
            Some(mut existing) => {
                existing.name = member.name.clone();
                existing.main_division = member.main_division;
                existing.rank = member.rank.clone();
                existing
            }
            None => Member {
                version: 0,
                ..member.clone()
            },
        };
        Ok(self.storage.upsert_member(record).await?)
    }

    /// Hand out tributes a member can later spend.
    pub async fn grant_tributes(&self, id: MemberId, count: u64) -> Result<Member, InfluenceError> {
        self.with_retries("grant_tributes", || self.try_grant(id, count))
            .await
    }

    async fn try_grant(&self, id: MemberId, count: u64) -> Result<Member, InfluenceError> {
        let mut member = self.member(id).await?;
        member.grant_tributes(count)?;
        Ok(self.storage.upsert_member(member).await?)
    }

    /// Earn influence into one scope.
    ///
    /// Raises the balance and both aggregate counters in one commit.
    pub async fn credit_influence(
        &self,
        id: MemberId,
        division: DivisionId,
        category: CategoryId,
        amount: u64,
    ) -> Result<Balance, InfluenceError> {
        self.catalog.division(division)?;
        self.catalog.category(category)?;
        let key = BalanceKey {
            member: id,
            division,
            category,
        };

        let balance = self
            .with_retries("credit_influence", || self.try_earn(None, key, amount))
            .await?;

        info!(member = %id, division = %division, category = %category, amount, "Influence credited");
        Ok(balance)
    }

    /// Apply a tribute: the sender spends one tribute, the receiver earns
    /// `amount` influence in the tribute's division and category.
    pub async fn record_tribute(&self, tribute: &TributeTransfer) -> Result<Balance, InfluenceError> {
        self.catalog.validate_tribute(tribute)?;
        if tribute.sender == tribute.receiver {
            return Err(InfluenceError::InvariantViolation(format!(
                "member {} cannot pay tribute to itself",
                tribute.sender
            )));
        }
        let key = BalanceKey {
            member: tribute.receiver,
            division: tribute.division,
            category: tribute.category,
        };

        let balance = self
            .with_retries("record_tribute", || {
                self.try_earn(Some(tribute.sender), key, tribute.amount)
            })
            .await?;

        info!(
            sender = %tribute.sender,
            receiver = %tribute.receiver,
            division = %tribute.division,
            category = %tribute.category,
            amount = tribute.amount,
            "Tribute recorded"
        );
        Ok(balance)
    }

    /// One earning attempt against fresh reads: optionally spend a tribute
    /// from `sender`, credit the owner of `key`, and commit both members
    /// with the raised balance.
    async fn try_earn(
        &self,
        sender: Option<MemberId>,
        key: BalanceKey,
        amount: u64,
    ) -> Result<Balance, InfluenceError> {
        // Receiver must exist before the sender's tribute is spent.
        let mut receiver = self.member(key.member).await?;
        let mut touched = Vec::with_capacity(2);
        if let Some(sender) = sender {
            let mut payer = self.member(sender).await?;
            if let Err(err) = payer.spend_tribute() {
                warn!(member = %payer.id, "Tribute rejected: no tributes left");
                return Err(err.into());
            }
            touched.push(payer);
        }
        receiver.credit_influence(amount)?;
        touched.push(receiver);

        let current = self
            .storage
            .get_balance(&key)
            .await?
            .unwrap_or_else(|| Balance::empty(key));
        let raised = current.amount.checked_add(amount).ok_or_else(|| {
            InfluenceError::InvariantViolation(format!("balance {key} would overflow"))
        })?;

        let committed = self
            .storage
            .commit_earning(EarningCommit {
                members: touched,
                balance: current.with_amount(raised),
            })
            .await?;
        Ok(committed.balance)
    }

    /// Run `attempt` until it stops conflicting, at most
    /// `max_conflict_retries + 1` times.
    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt: F,
    ) -> Result<T, InfluenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InfluenceError>>,
    {
        let attempts = self.config.max_conflict_retries.saturating_add(1);
        for round in 1..=attempts {
            match attempt().await {
                Err(InfluenceError::Storage(err)) if err.is_conflict() => {
                    warn!(operation, attempt = round, error = %err, "Member write conflicted, retrying");
                }
                outcome => return outcome,
            }
        }
        warn!(operation, attempts, "Member write gave up after repeated conflicts");
        Err(InfluenceError::ConflictRetriesExhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::FaultInjectingStorage;
    use crate::storage::InMemoryInfluenceStorage;
    use chrono::Utc;
    use influence_types::{DepartmentId, MemberLedgerError, Rank};

    const NO_DIVISIONS: [DivisionId; 0] = [];

    fn directory() -> MemberDirectory {
        directory_on(Arc::new(InMemoryInfluenceStorage::new()))
    }

    fn directory_on(storage: Arc<dyn InfluenceStorage>) -> MemberDirectory {
        MemberDirectory::new(Arc::new(HierarchyCatalog::reference().unwrap()), storage)
    }

    async fn balance_of(directory: &MemberDirectory, key: BalanceKey) -> u64 {
        directory
            .storage
            .get_balance(&key)
            .await
            .unwrap()
            .map(|b| b.amount)
            .unwrap_or(0)
    }

    fn member(id: u64, main_division: u64) -> Member {
        Member::new(id, format!("member-{id}"), main_division, Rank::new(1, "Associate"))
    }

    fn tribute(sender: u64, receiver: u64, amount: u64) -> TributeTransfer {
        TributeTransfer {
            sender: MemberId(sender),
            receiver: MemberId(receiver),
            amount,
            category: CategoryId(1),
            division: DivisionId(12),
            department: DepartmentId(3),
            message: "well done".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enroll_provisions_every_scope_and_category() {
        let directory = directory();
        let balances = directory
            .enroll(member(1, 12), [DivisionId(13), DivisionId(12)])
            .await
            .unwrap();

        // divisions 12, 13 and the global pool, two categories each
        assert_eq!(balances.len(), 6);
        assert!(balances.iter().all(|b| b.amount == 0));
        assert!(balances.iter().any(|b| b.division() == DivisionId(1)));
        assert_eq!(directory.member(MemberId(1)).await.unwrap().name, "member-1");
    }

    #[tokio::test]
    async fn enroll_with_unknown_division_writes_nothing() {
        let directory = directory();
        let err = directory
            .enroll(member(1, 12), [DivisionId(999)])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(directory.member(MemberId(1)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn re_enrolling_keeps_existing_amounts() {
        let directory = directory();
        directory.enroll(member(1, 12), NO_DIVISIONS).await.unwrap();
        directory
            .credit_influence(MemberId(1), DivisionId(12), CategoryId(1), 25)
            .await
            .unwrap();

        let mut again = member(1, 13);
        again.name = "renamed".to_string();
        let balances = directory.enroll(again, [DivisionId(12)]).await.unwrap();
        let research = balances
            .iter()
            .find(|b| b.key == BalanceKey::new(1, 12, 1))
            .unwrap();
        assert_eq!(research.amount, 25);

        let stored = directory.member(MemberId(1)).await.unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.main_division, DivisionId(13));
        assert_eq!(stored.total_influence, 25);
        assert_eq!(stored.lifetime_influence, 25);
    }

    #[tokio::test]
    async fn credit_raises_balance_and_counters() {
        let directory = directory();
        directory.enroll(member(1, 12), NO_DIVISIONS).await.unwrap();
        let balance = directory
            .credit_influence(MemberId(1), DivisionId(12), CategoryId(2), 40)
            .await
            .unwrap();
        assert_eq!(balance.amount, 40);

        let stored = directory.member(MemberId(1)).await.unwrap();
        assert_eq!(stored.total_influence, 40);
        assert_eq!(stored.lifetime_influence, 40);
    }

    #[tokio::test]
    async fn credit_for_unknown_member_is_not_found() {
        let err = directory()
            .credit_influence(MemberId(7), DivisionId(12), CategoryId(1), 1)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn tribute_spends_sender_and_credits_receiver() {
        let directory = directory();
        directory.enroll(member(1, 12), NO_DIVISIONS).await.unwrap();
        directory.enroll(member(2, 12), NO_DIVISIONS).await.unwrap();
        directory.grant_tributes(MemberId(1), 2).await.unwrap();

        let balance = directory.record_tribute(&tribute(1, 2, 5)).await.unwrap();
        assert_eq!(balance.key, BalanceKey::new(2, 12, 1));
        assert_eq!(balance.amount, 5);
        assert_eq!(directory.member(MemberId(1)).await.unwrap().tributes, 1);
        assert_eq!(directory.member(MemberId(2)).await.unwrap().lifetime_influence, 5);
    }

    #[tokio::test]
    async fn tribute_without_tributes_left_is_refused() {
        let directory = directory();
        directory.enroll(member(1, 12), NO_DIVISIONS).await.unwrap();
        directory.enroll(member(2, 12), NO_DIVISIONS).await.unwrap();

        let err = directory.record_tribute(&tribute(1, 2, 5)).await.unwrap_err();
        assert!(matches!(
            err,
            InfluenceError::MemberLedger(MemberLedgerError::NoTributesLeft)
        ));
        assert_eq!(directory.member(MemberId(2)).await.unwrap().total_influence, 0);
    }

    #[tokio::test]
    async fn tribute_to_self_is_an_invariant_violation() {
        let directory = directory();
        directory.enroll(member(1, 12), NO_DIVISIONS).await.unwrap();
        directory.grant_tributes(MemberId(1), 1).await.unwrap();
        let err = directory.record_tribute(&tribute(1, 1, 5)).await.unwrap_err();
        assert!(matches!(err, InfluenceError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn interleaved_credits_are_both_kept() {
        let storage = Arc::new(FaultInjectingStorage::new().yielding_member_reads());
        let directory = directory_on(storage);
        directory.enroll(member(1, 12), NO_DIVISIONS).await.unwrap();

        let (first, second) = tokio::join!(
            directory.credit_influence(MemberId(1), DivisionId(12), CategoryId(1), 10),
            directory.credit_influence(MemberId(1), DivisionId(12), CategoryId(1), 10),
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(balance_of(&directory, BalanceKey::new(1, 12, 1)).await, 20);
        let stored = directory.member(MemberId(1)).await.unwrap();
        assert_eq!(stored.total_influence, 20);
        assert_eq!(stored.lifetime_influence, 20);
    }

    #[tokio::test]
    async fn a_single_tribute_is_spent_once() {
        let storage = Arc::new(FaultInjectingStorage::new().yielding_member_reads());
        let directory = directory_on(storage);
        for id in 1..=3 {
            directory.enroll(member(id, 12), NO_DIVISIONS).await.unwrap();
        }
        directory.grant_tributes(MemberId(1), 1).await.unwrap();

        let first = tribute(1, 2, 5);
        let second = tribute(1, 3, 5);
        let (to_two, to_three) = tokio::join!(
            directory.record_tribute(&first),
            directory.record_tribute(&second),
        );

        let results = [to_two, to_three];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(InfluenceError::MemberLedger(MemberLedgerError::NoTributesLeft))
        )));

        assert_eq!(directory.member(MemberId(1)).await.unwrap().tributes, 0);
        let earned = directory.member(MemberId(2)).await.unwrap().total_influence
            + directory.member(MemberId(3)).await.unwrap().total_influence;
        assert_eq!(earned, 5);
    }

    #[tokio::test]
    async fn concurrent_grants_add_up() {
        let storage = Arc::new(FaultInjectingStorage::new().yielding_member_reads());
        let directory = directory_on(storage);
        directory.enroll(member(1, 12), NO_DIVISIONS).await.unwrap();

        let (first, second) = tokio::join!(
            directory.grant_tributes(MemberId(1), 2),
            directory.grant_tributes(MemberId(1), 3),
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(directory.member(MemberId(1)).await.unwrap().tributes, 5);
    }

    #[tokio::test]
    async fn failed_tribute_commit_leaves_everyone_untouched() {
        let storage = Arc::new(FaultInjectingStorage::new().with_earning_failures(1));
        let directory = directory_on(storage);
        directory.enroll(member(1, 12), NO_DIVISIONS).await.unwrap();
        directory.enroll(member(2, 12), NO_DIVISIONS).await.unwrap();
        directory.grant_tributes(MemberId(1), 1).await.unwrap();

        let err = directory.record_tribute(&tribute(1, 2, 5)).await.unwrap_err();
        assert!(matches!(err, InfluenceError::Storage(_)));

        assert_eq!(directory.member(MemberId(1)).await.unwrap().tributes, 1);
        let receiver = directory.member(MemberId(2)).await.unwrap();
        assert_eq!(receiver.total_influence, 0);
        assert_eq!(receiver.lifetime_influence, 0);
        assert_eq!(balance_of(&directory, BalanceKey::new(2, 12, 1)).await, 0);

        // The next attempt goes through in full.
        directory.record_tribute(&tribute(1, 2, 5)).await.unwrap();
        assert_eq!(directory.member(MemberId(1)).await.unwrap().tributes, 0);
        assert_eq!(balance_of(&directory, BalanceKey::new(2, 12, 1)).await, 5);
    }

    #[tokio::test]
    async fn failed_credit_commit_leaves_counters_untouched() {
        let storage = Arc::new(FaultInjectingStorage::new().with_earning_failures(1));
        let directory = directory_on(storage);
        directory.enroll(member(1, 12), NO_DIVISIONS).await.unwrap();

        let err = directory
            .credit_influence(MemberId(1), DivisionId(12), CategoryId(2), 40)
            .await
            .unwrap_err();
        assert!(!err.is_not_found());

        let stored = directory.member(MemberId(1)).await.unwrap();
        assert_eq!(stored.total_influence, 0);
        assert_eq!(stored.lifetime_influence, 0);
        assert_eq!(balance_of(&directory, BalanceKey::new(1, 12, 2)).await, 0);
    }
}
