//! PostgreSQL adapter for the influence ledger.
//!
//! Transactional source of truth. Balance uniqueness and non-negativity are
//! enforced by the schema itself (`PRIMARY KEY` and `CHECK`), and a
//! conversion or earning commit runs in one transaction with version-checked
//! updates.

use crate::audit::{seal_conversion, ConversionChain};
use crate::error::{StorageError, StorageResult};
use crate::storage::{from_i64, to_i64};
use crate::store::{
    BalanceStore, CommittedConversion, CommittedEarning, ConversionCommit, ConversionCommitter,
    ConversionFilter, ConversionLog, EarningCommit, EarningCommitter, MemberStore, QueryWindow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use influence_types::{
    Balance, BalanceKey, CategoryId, Conversion, ConversionDraft, DivisionId, Member, MemberId,
    Rank, RankId,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresInfluenceStorage {
    pool: PgPool,
}

impl PostgresInfluenceStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS influence_balances (
                member_id BIGINT NOT NULL,
                division_id BIGINT NOT NULL,
                category_id BIGINT NOT NULL,
                amount BIGINT NOT NULL CHECK (amount >= 0),
                version BIGINT NOT NULL CHECK (version >= 0),
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (member_id, division_id, category_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS influence_conversions (
                sequence BIGINT PRIMARY KEY,
                conversion_id UUID NOT NULL UNIQUE,
                occurred_at TIMESTAMPTZ NOT NULL,
                member_id BIGINT NOT NULL,
                from_division_id BIGINT NOT NULL,
                to_division_id BIGINT NOT NULL,
                category_id BIGINT NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL,
                CHECK (from_division_id <> to_division_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS influence_members (
                member_id BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                tributes BIGINT NOT NULL CHECK (tributes >= 0),
                total_influence BIGINT NOT NULL CHECK (total_influence >= 0),
                lifetime_influence BIGINT NOT NULL CHECK (lifetime_influence >= 0),
                main_division_id BIGINT NOT NULL,
                rank_id BIGINT NOT NULL,
                rank_name TEXT NOT NULL,
                version BIGINT NOT NULL DEFAULT 0 CHECK (version >= 0)
            )
            "#,
            "ALTER TABLE influence_members ADD COLUMN IF NOT EXISTS version BIGINT NOT NULL DEFAULT 0",
            "CREATE INDEX IF NOT EXISTS idx_influence_conversions_member ON influence_conversions (member_id, category_id)",
            "CREATE INDEX IF NOT EXISTS idx_influence_conversions_time ON influence_conversions (occurred_at)",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn load_conversions(&self) -> StorageResult<Vec<Conversion>> {
        let rows = sqlx::query(&format!("{CONVERSION_SELECT} ORDER BY sequence ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("postgres load failed: {e}")))?;
        rows.iter().map(conversion_from_row).collect()
    }
}

const BALANCE_SELECT: &str = r#"
    SELECT member_id, division_id, category_id, amount, version, updated_at
      FROM influence_balances
"#;

const MEMBER_SELECT: &str = r#"
    SELECT member_id, name, tributes, total_influence, lifetime_influence,
           main_division_id, rank_id, rank_name, version
      FROM influence_members
"#;

const CONVERSION_SELECT: &str = r#"
    SELECT sequence, conversion_id, occurred_at, member_id, from_division_id,
           to_division_id, category_id, amount, previous_hash, entry_hash
      FROM influence_conversions
"#;

#[async_trait]
impl BalanceStore for PostgresInfluenceStorage {
    async fn get_balance(&self, key: &BalanceKey) -> StorageResult<Option<Balance>> {
        let row = sqlx::query(&format!(
            "{BALANCE_SELECT} WHERE member_id = $1 AND division_id = $2 AND category_id = $3"
        ))
        .bind(to_i64(key.member.get(), "member_id")?)
        .bind(to_i64(key.division.get(), "division_id")?)
        .bind(to_i64(key.category.get(), "category_id")?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.as_ref().map(balance_from_row).transpose()
    }

    async fn get_or_create_balance(&self, key: &BalanceKey) -> StorageResult<Balance> {
        sqlx::query(
            r#"
            INSERT INTO influence_balances
                (member_id, division_id, category_id, amount, version, updated_at)
            VALUES ($1, $2, $3, 0, 0, $4)
            ON CONFLICT (member_id, division_id, category_id) DO NOTHING
            "#,
        )
        .bind(to_i64(key.member.get(), "member_id")?)
        .bind(to_i64(key.division.get(), "division_id")?)
        .bind(to_i64(key.category.get(), "category_id")?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        self.get_balance(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("balance {key} missing after insert")))
    }

    async fn save_balance(&self, balance: &Balance) -> StorageResult<Balance> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        write_balance(&mut conn, balance).await
    }

    async fn list_member_balances(&self, member: MemberId) -> StorageResult<Vec<Balance>> {
        let rows = sqlx::query(&format!(
            "{BALANCE_SELECT} WHERE member_id = $1 ORDER BY division_id, category_id"
        ))
        .bind(to_i64(member.get(), "member_id")?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter().map(balance_from_row).collect()
    }
}

#[async_trait]
impl ConversionLog for PostgresInfluenceStorage {
    async fn record_conversion(&self, draft: ConversionDraft) -> StorageResult<Conversion> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let conversion = append_conversion(&mut tx, draft).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(conversion)
    }

    async fn list_conversions(
        &self,
        filter: &ConversionFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<Conversion>> {
        let member = filter
            .member
            .map(|m| to_i64(m.get(), "member_id"))
            .transpose()?;
        let category = filter
            .category
            .map(|c| to_i64(c.get(), "category_id"))
            .transpose()?;
        let limit = if window.limit == 0 {
            None
        } else {
            Some(to_i64(window.limit as u64, "limit")?)
        };

        let rows = sqlx::query(&format!(
            r#"{CONVERSION_SELECT}
             WHERE ($1::BIGINT IS NULL OR member_id = $1)
               AND ($2::BIGINT IS NULL OR category_id = $2)
               AND ($3::TIMESTAMPTZ IS NULL OR occurred_at >= $3)
               AND ($4::TIMESTAMPTZ IS NULL OR occurred_at < $4)
             ORDER BY sequence ASC
             LIMIT $5 OFFSET $6"#
        ))
        .bind(member)
        .bind(category)
        .bind(filter.since)
        .bind(filter.until)
        .bind(limit)
        .bind(to_i64(window.offset as u64, "offset")?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter().map(conversion_from_row).collect()
    }

    async fn verify_conversion_chain(&self) -> StorageResult<bool> {
        let entries = self.load_conversions().await?;
        Ok(ConversionChain::from_entries(entries).is_ok())
    }
}

#[async_trait]
impl MemberStore for PostgresInfluenceStorage {
    async fn get_member(&self, id: MemberId) -> StorageResult<Option<Member>> {
        let row = sqlx::query(&format!("{MEMBER_SELECT} WHERE member_id = $1"))
            .bind(to_i64(id.get(), "member_id")?)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.as_ref().map(member_from_row).transpose()
    }

    async fn upsert_member(&self, member: Member) -> StorageResult<Member> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let stored = write_member(&mut tx, &member).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(stored)
    }

    async fn list_members(&self, window: QueryWindow) -> StorageResult<Vec<Member>> {
        let limit = if window.limit == 0 {
            None
        } else {
            Some(to_i64(window.limit as u64, "limit")?)
        };
        let rows = sqlx::query(&format!(
            "{MEMBER_SELECT} ORDER BY member_id ASC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(to_i64(window.offset as u64, "offset")?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter().map(member_from_row).collect()
    }
}

#[async_trait]
impl ConversionCommitter for PostgresInfluenceStorage {
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        // Dropping `tx` on any early return rolls every write back.
        let source = write_balance(&mut tx, &source).await?;
        let destination = write_balance(&mut tx, &destination).await?;
        let conversion = append_conversion(&mut tx, draft).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(CommittedConversion {
            source,
            destination,
            conversion,
        })
    }
}

#[async_trait]
impl EarningCommitter for PostgresInfluenceStorage {
    async fn commit_earning(&self, commit: EarningCommit) -> StorageResult<CommittedEarning> {
        let EarningCommit { members, balance } = commit;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut stored = Vec::with_capacity(members.len());
        for member in &members {
            if stored.iter().any(|written: &Member| written.id == member.id) {
                return Err(StorageError::InvariantViolation(format!(
                    "member {} appears twice in one earning",
                    member.id
                )));
            }
            stored.push(write_member(&mut tx, member).await?);
        }
        let balance = write_balance(&mut tx, &balance).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(CommittedEarning {
            members: stored,
            balance,
        })
    }
}

/// Version-checked write of one member row.
///
/// Version `0` inserts; anything else must match the stored row, which is
/// locked until the surrounding transaction ends.
async fn write_member(conn: &mut PgConnection, member: &Member) -> StorageResult<Member> {
    let id = to_i64(member.id.get(), "member_id")?;
    let tributes = to_i64(member.tributes, "tributes")?;
    let total = to_i64(member.total_influence, "total_influence")?;
    let lifetime = to_i64(member.lifetime_influence, "lifetime_influence")?;
    let main_division = to_i64(member.main_division.get(), "main_division_id")?;
    let rank = to_i64(member.rank.id.get(), "rank_id")?;

    if member.version == 0 {
        let inserted = sqlx::query(
            r#"
            INSERT INTO influence_members
                (member_id, name, tributes, total_influence, lifetime_influence,
                 main_division_id, rank_id, rank_name, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
            ON CONFLICT (member_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(&member.name)
        .bind(tributes)
        .bind(total)
        .bind(lifetime)
        .bind(main_division)
        .bind(rank)
        .bind(&member.rank.name)
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if inserted.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "member {} already exists",
                member.id
            )));
        }
    } else {
        let current = sqlx::query(
            "SELECT version, lifetime_influence FROM influence_members WHERE member_id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let Some(row) = current else {
            return Err(StorageError::Conflict(format!(
                "member {} vanished, expected version {}",
                member.id, member.version
            )));
        };
        let stored_version = get_u64(&row, "version")?;
        if stored_version != member.version {
            return Err(StorageError::Conflict(format!(
                "member {} is at version {}, expected {}",
                member.id, stored_version, member.version
            )));
        }
        if member.lifetime_influence < get_u64(&row, "lifetime_influence")? {
            return Err(StorageError::InvariantViolation(format!(
                "lifetime influence of member {} cannot decrease",
                member.id
            )));
        }

        sqlx::query(
            r#"
            UPDATE influence_members
               SET name = $2, tributes = $3, total_influence = $4, lifetime_influence = $5,
                   main_division_id = $6, rank_id = $7, rank_name = $8, version = version + 1
             WHERE member_id = $1
            "#,
        )
        .bind(id)
        .bind(&member.name)
        .bind(tributes)
        .bind(total)
        .bind(lifetime)
        .bind(main_division)
        .bind(rank)
        .bind(&member.rank.name)
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    }

    let mut stored = member.clone();
    stored.version = member.version + 1;
    Ok(stored)
}

/// Version-checked write of one balance row.
async fn write_balance(conn: &mut PgConnection, balance: &Balance) -> StorageResult<Balance> {
    let updated_at = Utc::now();
    let member = to_i64(balance.key.member.get(), "member_id")?;
    let division = to_i64(balance.key.division.get(), "division_id")?;
    let category = to_i64(balance.key.category.get(), "category_id")?;
    let amount = to_i64(balance.amount, "amount")?;
    let expected_version = to_i64(balance.version, "version")?;

    let updated = sqlx::query(
        r#"
        UPDATE influence_balances
           SET amount = $4, version = version + 1, updated_at = $5
         WHERE member_id = $1 AND division_id = $2 AND category_id = $3 AND version = $6
        "#,
    )
    .bind(member)
    .bind(division)
    .bind(category)
    .bind(amount)
    .bind(updated_at)
    .bind(expected_version)
    .execute(&mut *conn)
    .await
    .map_err(|e| StorageError::Backend(e.to_string()))?;

    if updated.rows_affected() == 0 {
        let inserted = if balance.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO influence_balances
                    (member_id, division_id, category_id, amount, version, updated_at)
                VALUES ($1, $2, $3, $4, 1, $5)
                ON CONFLICT (member_id, division_id, category_id) DO NOTHING
                "#,
            )
            .bind(member)
            .bind(division)
            .bind(category)
            .bind(amount)
            .bind(updated_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .rows_affected()
        } else {
            0
        };

        if inserted == 0 {
            return Err(StorageError::Conflict(format!(
                "balance {} moved past version {}",
                balance.key, balance.version
            )));
        }
    }

    Ok(Balance {
        key: balance.key,
        amount: balance.amount,
        version: balance.version + 1,
        updated_at,
    })
}

/// Append one conversion under an exclusive table lock so sequence and
/// hash links stay gap-free across concurrent writers.
async fn append_conversion(
    conn: &mut PgConnection,
    draft: ConversionDraft,
) -> StorageResult<Conversion> {
    sqlx::query("LOCK TABLE influence_conversions IN EXCLUSIVE MODE")
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    let last = sqlx::query(
        "SELECT sequence, entry_hash FROM influence_conversions ORDER BY sequence DESC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| StorageError::Backend(e.to_string()))?;

    let (sequence, previous_hash) = match last {
        Some(row) => {
            let seq: i64 = row
                .try_get("sequence")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let hash: String = row
                .try_get("entry_hash")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            (from_i64(seq, "sequence")? + 1, Some(hash))
        }
        None => (1, None),
    };

    let conversion = seal_conversion(draft, sequence, previous_hash)?;

    sqlx::query(
        r#"
        INSERT INTO influence_conversions
            (sequence, conversion_id, occurred_at, member_id, from_division_id,
             to_division_id, category_id, amount, previous_hash, entry_hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(to_i64(conversion.sequence, "sequence")?)
    .bind(conversion.conversion_id)
    .bind(conversion.timestamp)
    .bind(to_i64(conversion.member.get(), "member_id")?)
    .bind(to_i64(conversion.from_division.get(), "from_division_id")?)
    .bind(to_i64(conversion.to_division.get(), "to_division_id")?)
    .bind(to_i64(conversion.category.get(), "category_id")?)
    .bind(to_i64(conversion.amount, "amount")?)
    .bind(&conversion.previous_hash)
    .bind(&conversion.entry_hash)
    .execute(&mut *conn)
    .await
    .map_err(|e| StorageError::Backend(format!("postgres insert failed: {e}")))?;

    Ok(conversion)
}

fn get_u64(row: &PgRow, column: &str) -> StorageResult<u64> {
    let value: i64 = row
        .try_get(column)
        .map_err(|e| StorageError::Backend(format!("postgres decode {column} failed: {e}")))?;
    from_i64(value, column)
}

fn balance_from_row(row: &PgRow) -> StorageResult<Balance> {
    let updated_at: DateTime<Utc> = row
        .try_get("updated_at")
        .map_err(|e| StorageError::Backend(format!("postgres decode updated_at failed: {e}")))?;
    Ok(Balance {
        key: BalanceKey {
            member: MemberId(get_u64(row, "member_id")?),
            division: DivisionId(get_u64(row, "division_id")?),
            category: CategoryId(get_u64(row, "category_id")?),
        },
        amount: get_u64(row, "amount")?,
        version: get_u64(row, "version")?,
        updated_at,
    })
}

fn conversion_from_row(row: &PgRow) -> StorageResult<Conversion> {
    let conversion_id: Uuid = row
        .try_get("conversion_id")
        .map_err(|e| StorageError::Backend(format!("postgres decode conversion_id failed: {e}")))?;
    let timestamp: DateTime<Utc> = row
        .try_get("occurred_at")
        .map_err(|e| StorageError::Backend(format!("postgres decode occurred_at failed: {e}")))?;
    let previous_hash: Option<String> = row
        .try_get("previous_hash")
        .map_err(|e| StorageError::Backend(format!("postgres decode previous_hash failed: {e}")))?;
    let entry_hash: String = row
        .try_get("entry_hash")
        .map_err(|e| StorageError::Backend(format!("postgres decode entry_hash failed: {e}")))?;

    Ok(Conversion {
        conversion_id,
        sequence: get_u64(row, "sequence")?,
        timestamp,
        member: MemberId(get_u64(row, "member_id")?),
        from_division: DivisionId(get_u64(row, "from_division_id")?),
        to_division: DivisionId(get_u64(row, "to_division_id")?),
        category: CategoryId(get_u64(row, "category_id")?),
        amount: get_u64(row, "amount")?,
        previous_hash,
        entry_hash,
    })
}

fn member_from_row(row: &PgRow) -> StorageResult<Member> {
    let name: String = row
        .try_get("name")
        .map_err(|e| StorageError::Backend(format!("postgres decode name failed: {e}")))?;
    let rank_name: String = row
        .try_get("rank_name")
        .map_err(|e| StorageError::Backend(format!("postgres decode rank_name failed: {e}")))?;

    Ok(Member {
        id: MemberId(get_u64(row, "member_id")?),
        name,
        tributes: get_u64(row, "tributes")?,
        total_influence: get_u64(row, "total_influence")?,
        lifetime_influence: get_u64(row, "lifetime_influence")?,
        main_division: DivisionId(get_u64(row, "main_division_id")?),
        rank: Rank {
            id: RankId(get_u64(row, "rank_id")?),
            name: rank_name,
        },
        version: get_u64(row, "version")?,
    })
}
