//! Conversion Engine.
//!
//! Moves influence one step up the hierarchy: from a division to its
//! department's pool, or from a pool (or pool-equivalent division) to the
//! global pool. Each conversion is a single version-checked commit that
//! writes both balances and appends one audit record.
//!
//! Conversions for the same member are serialized through a per-member
//! async lock held from the balance re-read to the commit.

use crate::audit;
use crate::catalog::HierarchyCatalog;
use crate::config::EngineConfig;
use crate::error::{EntityKind, InfluenceError};
use crate::member::provision_balances;
use crate::store::{
    CommittedConversion, ConversionCommit, ConversionFilter, InfluenceStorage, QueryWindow,
};
use influence_types::{
    Balance, BalanceKey, CategoryId, Conversion, ConversionDraft, DivisionId, Member, MemberId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Why a conversion was refused without touching any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionRejection {
    /// The source division belongs to the general department.
    TerminalSource,
    InsufficientBalance { available: u64, requested: u64 },
}

/// Result of a conversion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionOutcome {
    Converted(CommittedConversion),
    /// Zero amount: accepted, nothing written.
    Unchanged { destination: DivisionId },
    Rejected(ConversionRejection),
}

impl ConversionOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }

    pub fn committed(&self) -> Option<&CommittedConversion> {
        match self {
            Self::Converted(committed) => Some(committed),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<ConversionRejection> {
        match self {
            Self::Rejected(rejection) => Some(*rejection),
            _ => None,
        }
    }
}

/// Per-member async locks. Entries live only while someone holds or waits
/// on them.
#[derive(Default)]
struct MemberLocks {
    locks: Mutex<HashMap<MemberId, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemberLocks {
    async fn acquire(&self, member: MemberId) -> Result<MemberLockGuard<'_>, InfluenceError> {
        let lock = {
            let mut locks = self.locks.lock().map_err(|_| {
                InfluenceError::InvariantViolation("member lock table poisoned".to_string())
            })?;
            locks.entry(member).or_default().clone()
        };
        Ok(MemberLockGuard {
            guard: Some(lock.lock_owned().await),
            member,
            locks: self,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

struct MemberLockGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    member: MemberId,
    locks: &'a MemberLocks,
}

impl Drop for MemberLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters clone the Arc under the table lock, so a count of one
        // means the table holds the last reference.
        if let Ok(mut locks) = self.locks.locks.lock() {
            if locks
                .get(&self.member)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&self.member);
            }
        }
    }
}

/// Hierarchical conversion engine.
pub struct ConversionEngine {
    catalog: Arc<HierarchyCatalog>,
    storage: Arc<dyn InfluenceStorage>,
    locks: MemberLocks,
    config: EngineConfig,
}

impl ConversionEngine {
    pub fn new(catalog: Arc<HierarchyCatalog>, storage: Arc<dyn InfluenceStorage>) -> Self {
        Self {
            catalog,
            storage,
            locks: MemberLocks::default(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(&self) -> &Arc<HierarchyCatalog> {
        &self.catalog
    }

    pub fn storage(&self) -> &Arc<dyn InfluenceStorage> {
        &self.storage
    }

    /// Division a balance in `division` converts into.
    ///
    /// Pool-equivalent divisions and forced conversions go to the global
    /// pool; everything else goes to its department's pool.
    pub fn resolve_destination(
        &self,
        division: DivisionId,
        force_to_general: bool,
    ) -> Result<DivisionId, InfluenceError> {
        let destination = if force_to_general || self.catalog.is_near_general(division)? {
            self.catalog.default_division().id
        } else {
            let department = self.catalog.department_of(division)?;
            self.catalog.pool_division(department.id)?.id
        };

        debug!(
            source = %division,
            destination = %destination,
            force_to_general,
            "Resolved conversion destination"
        );
        Ok(destination)
    }

    /// Convert `amount` out of `source` one step up the hierarchy.
    ///
    /// Only the key of `source` is used; the balance is re-read under the
    /// member lock before the sufficiency check.
    pub async fn convert(
        &self,
        source: &Balance,
        amount: u64,
        force_to_general: bool,
    ) -> Result<ConversionOutcome, InfluenceError> {
        let key = source.key;
        self.catalog.category(key.category)?;
        let department = self.catalog.department_of(key.division)?.id;

        if self.catalog.is_general_department(department) {
            warn!(
                member = %key.member,
                division = %key.division,
                "Conversion rejected: source division is terminal"
            );
            return Ok(ConversionOutcome::Rejected(
                ConversionRejection::TerminalSource,
            ));
        }

        let destination = self.resolve_destination(key.division, force_to_general)?;
        if destination == key.division {
            return Err(InfluenceError::InvariantViolation(format!(
                "division {} resolves to itself",
                key.division
            )));
        }

        let _guard = self.locks.acquire(key.member).await?;

        let attempts = self.config.max_conflict_retries.saturating_add(1);
        for attempt in 1..=attempts {
            match self.try_convert(key, destination, amount).await {
                Err(InfluenceError::Storage(err)) if err.is_conflict() => {
                    warn!(
                        member = %key.member,
                        division = %key.division,
                        attempt,
                        error = %err,
                        "Conversion commit conflicted"
                    );
                }
                outcome => return outcome,
            }
        }

        warn!(member = %key.member, attempts, "Conversion gave up after repeated conflicts");
        Err(InfluenceError::ConflictRetriesExhausted { attempts })
    }

    async fn try_convert(
        &self,
        key: BalanceKey,
        destination: DivisionId,
        amount: u64,
    ) -> Result<ConversionOutcome, InfluenceError> {
        let source = self
            .storage
            .get_balance(&key)
            .await?
            .unwrap_or_else(|| Balance::empty(key));

        if amount > source.amount {
            warn!(
                member = %key.member,
                division = %key.division,
                available = source.amount,
                requested = amount,
                "Conversion rejected: insufficient balance"
            );
            return Ok(ConversionOutcome::Rejected(
                ConversionRejection::InsufficientBalance {
                    available: source.amount,
                    requested: amount,
                },
            ));
        }

        if amount == 0 {
            debug!(member = %key.member, division = %key.division, "Zero-amount conversion");
            return Ok(ConversionOutcome::Unchanged { destination });
        }

        let target = self
            .storage
            .get_or_create_balance(&key.with_division(destination))
            .await?;

        let remaining = source.amount - amount;
        let raised = target.amount.checked_add(amount).ok_or_else(|| {
            InfluenceError::InvariantViolation(format!("balance {} would overflow", target.key))
        })?;

        let before = u128::from(source.amount) + u128::from(target.amount);
        let after = u128::from(remaining) + u128::from(raised);
        if before != after {
            return Err(InfluenceError::InvariantViolation(format!(
                "conversion of {amount} from {key} does not conserve influence"
            )));
        }

        let commit = ConversionCommit {
            draft: ConversionDraft::new(key, destination, amount),
            source: source.with_amount(remaining),
            destination: target.with_amount(raised),
        };
        let committed = self.storage.commit_conversion(commit).await?;

        info!(
            member = %key.member,
            from_division = %key.division,
            to_division = %destination,
            category = %key.category,
            amount,
            sequence = committed.conversion.sequence,
            "Conversion committed"
        );
        Ok(ConversionOutcome::Converted(committed))
    }

    /// Convert a member's balance identified by its scope.
    ///
    /// Unknown member, division or category is `NotFound`; a missing balance
    /// behaves as a zero balance.
    pub async fn convert_influence(
        &self,
        member: MemberId,
        division: DivisionId,
        category: CategoryId,
        amount: u64,
        force_to_general: bool,
    ) -> Result<ConversionOutcome, InfluenceError> {
        self.storage
            .get_member(member)
            .await?
            .ok_or_else(|| InfluenceError::not_found(EntityKind::Member, member))?;
        self.catalog.division(division)?;
        self.catalog.category(category)?;

        let key = BalanceKey {
            member,
            division,
            category,
        };
        self.convert(&Balance::empty(key), amount, force_to_general)
            .await
    }

    /// Create the zero balances a member converts between.
    pub async fn provision_member(
        &self,
        member: &Member,
        divisions: impl IntoIterator<Item = DivisionId>,
    ) -> Result<Vec<Balance>, InfluenceError> {
        provision_balances(&self.catalog, self.storage.as_ref(), member, divisions).await
    }

    pub async fn balances(&self, member: MemberId) -> Result<Vec<Balance>, InfluenceError> {
        Ok(self.storage.list_member_balances(member).await?)
    }

    pub async fn conversion_history(
        &self,
        filter: &ConversionFilter,
        window: QueryWindow,
    ) -> Result<Vec<Conversion>, InfluenceError> {
        Ok(self.storage.list_conversions(filter, window).await?)
    }

    /// Net per-balance movement recorded for a member, optionally narrowed
    /// to one category.
    pub async fn replay_conversions(
        &self,
        member: MemberId,
        category: Option<CategoryId>,
    ) -> Result<BTreeMap<BalanceKey, i128>, InfluenceError> {
        let mut filter = ConversionFilter::for_member(member);
        filter.category = category;
        let conversions = self
            .storage
            .list_conversions(&filter, QueryWindow::all())
            .await?;
        Ok(audit::replay(&conversions))
    }

    pub async fn verify_audit_log(&self) -> Result<bool, InfluenceError> {
        Ok(self.storage.verify_conversion_chain().await?)
    }
}
