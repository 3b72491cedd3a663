//! In-memory reference implementation of the influence storage traits.
//!
//! Deterministic and test-friendly. Balances, members and the conversion
//! log share a single lock so every multi-record commit is all-or-nothing.

use crate::audit::ConversionChain;
use crate::error::{StorageError, StorageResult};
use crate::store::{
    BalanceStore, CommittedConversion, CommittedEarning, ConversionCommit, ConversionCommitter,
    ConversionFilter, ConversionLog, EarningCommit, EarningCommitter, MemberStore, QueryWindow,
};
use async_trait::async_trait;
use chrono::Utc;
use influence_types::{Balance, BalanceKey, Conversion, ConversionDraft, Member, MemberId};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<BalanceKey, Balance>,
    members: HashMap<MemberId, Member>,
    conversions: ConversionChain,
}

impl LedgerState {
    /// Version-check `balance` against the stored record and return the
    /// record that would be written.
    fn stage_write(&self, balance: &Balance) -> StorageResult<Balance> {
        let stored_version = self.balances.get(&balance.key).map(|stored| stored.version);
        match stored_version {
            Some(version) if version == balance.version => {}
            None if balance.version == 0 => {}
            Some(version) => {
                return Err(StorageError::Conflict(format!(
                    "balance {} is at version {}, expected {}",
                    balance.key, version, balance.version
                )))
            }
            None => {
                return Err(StorageError::Conflict(format!(
                    "balance {} vanished, expected version {}",
                    balance.key, balance.version
                )))
            }
        }

        Ok(Balance {
            key: balance.key,
            amount: balance.amount,
            version: balance.version + 1,
            updated_at: Utc::now(),
        })
    }

    /// Same check for a member aggregate, plus the lifetime floor.
    fn stage_member(&self, member: &Member) -> StorageResult<Member> {
        match self.members.get(&member.id) {
            Some(stored) if stored.version == member.version => {
                if member.lifetime_influence < stored.lifetime_influence {
                    return Err(StorageError::InvariantViolation(format!(
                        "lifetime influence of member {} cannot decrease",
                        member.id
                    )));
                }
            }
            None if member.version == 0 => {}
            Some(stored) => {
                return Err(StorageError::Conflict(format!(
                    "member {} is at version {}, expected {}",
                    member.id, stored.version, member.version
                )))
            }
            None => {
                return Err(StorageError::Conflict(format!(
                    "member {} vanished, expected version {}",
                    member.id, member.version
                )))
            }
        }

        let mut staged = member.clone();
        staged.version = member.version + 1;
        Ok(staged)
    }
}

/// In-memory influence storage adapter.
#[derive(Default)]
pub struct InMemoryInfluenceStorage {
    ledger: RwLock<LedgerState>,
}

impl InMemoryInfluenceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from previously exported state, verifying the conversion chain.
    pub fn from_parts(
        balances: Vec<Balance>,
        conversions: Vec<Conversion>,
        members: Vec<Member>,
    ) -> StorageResult<Self> {
        let mut by_key = HashMap::with_capacity(balances.len());
        for balance in balances {
            let key = balance.key;
            if by_key.insert(key, balance).is_some() {
                return Err(StorageError::InvariantViolation(format!(
                    "duplicate balance for {key}"
                )));
            }
        }

        let mut by_id = HashMap::with_capacity(members.len());
        for member in members {
            let id = member.id;
            if by_id.insert(id, member).is_some() {
                return Err(StorageError::InvariantViolation(format!(
                    "duplicate member {id}"
                )));
            }
        }

        Ok(Self {
            ledger: RwLock::new(LedgerState {
                balances: by_key,
                members: by_id,
                conversions: ConversionChain::from_entries(conversions)?,
            }),
        })
    }

    fn read_ledger(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, LedgerState>> {
        self.ledger
            .read()
            .map_err(|_| StorageError::Backend("ledger lock poisoned".to_string()))
    }

    fn write_ledger(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, LedgerState>> {
        self.ledger
            .write()
            .map_err(|_| StorageError::Backend("ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl BalanceStore for InMemoryInfluenceStorage {
    async fn get_balance(&self, key: &BalanceKey) -> StorageResult<Option<Balance>> {
        let guard = self.read_ledger()?;
        Ok(guard.balances.get(key).cloned())
    }

    async fn get_or_create_balance(&self, key: &BalanceKey) -> StorageResult<Balance> {
        let mut guard = self.write_ledger()?;
        let balance = guard
            .balances
            .entry(*key)
            .or_insert_with(|| Balance::empty(*key));
        Ok(balance.clone())
    }

    async fn save_balance(&self, balance: &Balance) -> StorageResult<Balance> {
        let mut guard = self.write_ledger()?;
        let stored = guard.stage_write(balance)?;
        guard.balances.insert(stored.key, stored.clone());
        Ok(stored)
    }

    async fn list_member_balances(&self, member: MemberId) -> StorageResult<Vec<Balance>> {
        let guard = self.read_ledger()?;
        let mut values = guard
            .balances
            .values()
            .filter(|balance| balance.key.member == member)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by_key(|balance| balance.key);
        Ok(values)
    }
}

#[async_trait]
impl ConversionLog for InMemoryInfluenceStorage {
    async fn record_conversion(&self, draft: ConversionDraft) -> StorageResult<Conversion> {
        let mut guard = self.write_ledger()?;
        let entry = guard.conversions.build_entry(draft)?;
        guard.conversions.commit_entry(entry.clone())?;
        Ok(entry)
    }

    async fn list_conversions(
        &self,
        filter: &ConversionFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<Conversion>> {
        let guard = self.read_ledger()?;
        let values = guard
            .conversions
            .entries()
            .iter()
            .filter(|conversion| filter.matches(conversion))
            .cloned()
            .collect::<Vec<_>>();
        Ok(window.apply(values))
    }

    async fn verify_conversion_chain(&self) -> StorageResult<bool> {
        let guard = self.read_ledger()?;
        Ok(guard.conversions.verify_chain())
    }
}

#[async_trait]
impl MemberStore for InMemoryInfluenceStorage {
    async fn get_member(&self, id: MemberId) -> StorageResult<Option<Member>> {
        let guard = self.read_ledger()?;
        Ok(guard.members.get(&id).cloned())
    }

    async fn upsert_member(&self, member: Member) -> StorageResult<Member> {
        let mut guard = self.write_ledger()?;
        let stored = guard.stage_member(&member)?;
        guard.members.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn list_members(&self, window: QueryWindow) -> StorageResult<Vec<Member>> {
        let guard = self.read_ledger()?;
        let mut values = guard.members.values().cloned().collect::<Vec<_>>();
        values.sort_by_key(|member| member.id);
        Ok(window.apply(values))
    }
}

#[async_trait]
impl ConversionCommitter for InMemoryInfluenceStorage {
    async fn commit_conversion(
        &self,
        commit: ConversionCommit,
    ) -> StorageResult<CommittedConversion> {
        let ConversionCommit {
            source,
            destination,
            draft,
        } = commit;

        if source.key == destination.key {
            return Err(StorageError::InvariantViolation(format!(
                "conversion source and destination are the same balance {}",
                source.key
            )));
        }

        let mut guard = self.write_ledger()?;

        // Stage everything first; nothing is written unless every check passes.
        let staged_source = guard.stage_write(&source)?;
        let staged_destination = guard.stage_write(&destination)?;
        let conversion = guard.conversions.build_entry(draft)?;

        guard.conversions.commit_entry(conversion.clone())?;
        guard
            .balances
            .insert(staged_source.key, staged_source.clone());
        guard
            .balances
            .insert(staged_destination.key, staged_destination.clone());

        Ok(CommittedConversion {
            source: staged_source,
            destination: staged_destination,
            conversion,
        })
    }
}

#[async_trait]
impl EarningCommitter for InMemoryInfluenceStorage {
    async fn commit_earning(&self, commit: EarningCommit) -> StorageResult<CommittedEarning> {
        let EarningCommit { members, balance } = commit;

        let mut seen = HashSet::with_capacity(members.len());
        if let Some(duplicate) = members.iter().find(|member| !seen.insert(member.id)) {
            return Err(StorageError::InvariantViolation(format!(
                "member {} appears twice in one earning",
                duplicate.id
            )));
        }

        let mut guard = self.write_ledger()?;

        let staged_members = members
            .iter()
            .map(|member| guard.stage_member(member))
            .collect::<StorageResult<Vec<_>>>()?;
        let staged_balance = guard.stage_write(&balance)?;

        for member in &staged_members {
            guard.members.insert(member.id, member.clone());
        }
        guard
            .balances
            .insert(staged_balance.key, staged_balance.clone());

        Ok(CommittedEarning {
            members: staged_members,
            balance: staged_balance,
        })
    }
}
