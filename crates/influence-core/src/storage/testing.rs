//! Storage wrapper for exercising failure and interleaving paths in tests.

use crate::error::{StorageError, StorageResult};
use crate::storage::InMemoryInfluenceStorage;
use crate::store::{
    BalanceStore, CommittedConversion, CommittedEarning, ConversionCommit, ConversionCommitter,
    ConversionFilter, ConversionLog, EarningCommit, EarningCommitter, MemberStore, QueryWindow,
};
use async_trait::async_trait;
use influence_types::{Balance, BalanceKey, Conversion, ConversionDraft, Member, MemberId};
use std::sync::atomic::{AtomicU32, Ordering};

/// In-memory storage that can fail commits on demand and yield on member
/// reads so concurrent callers interleave.
#[derive(Default)]
pub(crate) struct FaultInjectingStorage {
    inner: InMemoryInfluenceStorage,
    conversion_conflicts: AtomicU32,
    earning_failures: AtomicU32,
    yield_on_member_read: bool,
}

impl FaultInjectingStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` conversion commits with a conflict.
    pub(crate) fn with_conversion_conflicts(self, count: u32) -> Self {
        self.conversion_conflicts.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` earning commits with a backend error.
    pub(crate) fn with_earning_failures(self, count: u32) -> Self {
        self.earning_failures.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn yielding_member_reads(mut self) -> Self {
        self.yield_on_member_read = true;
        self
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BalanceStore for FaultInjectingStorage {
    async fn get_balance(&self, key: &BalanceKey) -> StorageResult<Option<Balance>> {
        self.inner.get_balance(key).await
    }

    async fn get_or_create_balance(&self, key: &BalanceKey) -> StorageResult<Balance> {
        self.inner.get_or_create_balance(key).await
    }

    async fn save_balance(&self, balance: &Balance) -> StorageResult<Balance> {
        self.inner.save_balance(balance).await
    }

    async fn list_member_balances(&self, member: MemberId) -> StorageResult<Vec<Balance>> {
        self.inner.list_member_balances(member).await
    }
}

#[async_trait]
impl ConversionLog for FaultInjectingStorage {
    async fn record_conversion(&self, draft: ConversionDraft) -> StorageResult<Conversion> {
        self.inner.record_conversion(draft).await
    }

    async fn list_conversions(
        &self,
        filter: &ConversionFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<Conversion>> {
        self.inner.list_conversions(filter, window).await
    }

    async fn verify_conversion_chain(&self) -> StorageResult<bool> {
        self.inner.verify_conversion_chain().await
    }
}

#[async_trait]
impl MemberStore for FaultInjectingStorage {
    async fn get_member(&self, id: MemberId) -> StorageResult<Option<Member>> {
        let member = self.inner.get_member(id).await?;
        if self.yield_on_member_read {
            tokio::task::yield_now().await;
        }
        Ok(member)
    }

    async fn upsert_member(&self, member: Member) -> StorageResult<Member> {
        self.inner.upsert_member(member).await
    }

    async fn list_members(&self, window: QueryWindow) -> StorageResult<Vec<Member>> {
        self.inner.list_members(window).await
    }
}

#[async_trait]
impl ConversionCommitter for FaultInjectingStorage {
    async fn commit_conversion(
        &self,
        commit: ConversionCommit,
    ) -> StorageResult<CommittedConversion> {
        if Self::take(&self.conversion_conflicts) {
            return Err(StorageError::Conflict("injected conversion conflict".to_string()));
        }
        self.inner.commit_conversion(commit).await
    }
}

#[async_trait]
impl EarningCommitter for FaultInjectingStorage {
    async fn commit_earning(&self, commit: EarningCommit) -> StorageResult<CommittedEarning> {
        if Self::take(&self.earning_failures) {
            return Err(StorageError::Backend("injected earning failure".to_string()));
        }
        self.inner.commit_earning(commit).await
    }
}
