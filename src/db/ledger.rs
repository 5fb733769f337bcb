use crate::db::models::{LedgerEntryRow, WalletRow};
use crate::domain::{LedgerEntry, Wallet, WalletRates};
use crate::error::LedgerError;
use crate::ports::{Committed, LedgerStore, WalletMutation};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

/// Ledger store backed by the `wallets` and `wallet_transactions` tables.
///
/// Every mutation runs in one transaction holding `FOR UPDATE` on the wallet
/// row, so concurrent mutations of one wallet serialize while other wallets
/// proceed in parallel.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ensure_wallet(
        &self,
        account_id: Uuid,
        rates: &WalletRates,
    ) -> Result<Wallet, LedgerError> {
        let fresh = Wallet::new(account_id, rates);
        sqlx::query(
            "INSERT INTO wallets (id, account_id, balance, inbound_rate, outbound_rate, purchased_total, spent_total, segments_used, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (account_id) DO NOTHING",
        )
        .bind(fresh.id)
        .bind(fresh.account_id)
        .bind(&fresh.balance)
        .bind(&fresh.inbound_rate)
        .bind(&fresh.outbound_rate)
        .bind(&fresh.purchased_total)
        .bind(&fresh.spent_total)
        .bind(fresh.segments_used)
        .bind(fresh.created_at)
        .bind(fresh.updated_at)
        .execute(&self.pool)
        .await?;

        self.wallet(account_id)
            .await?
            .ok_or(LedgerError::WalletNotFound(account_id))
    }

    async fn wallet(&self, account_id: Uuid) -> Result<Option<Wallet>, LedgerError> {
        let row = sqlx::query_as::<_, WalletRow>("SELECT * FROM wallets WHERE account_id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Wallet::from))
    }

    async fn mutate(
        &self,
        account_id: Uuid,
        mutation: WalletMutation,
    ) -> Result<Committed, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, WalletRow>(
            "SELECT * FROM wallets WHERE account_id = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut wallet = Wallet::from(row.ok_or(LedgerError::WalletNotFound(account_id))?);

        // An error here drops `tx`, rolling back and releasing the row lock.
        let draft = mutation(&mut wallet)?;
        wallet.updated_at = Utc::now();

        sqlx::query(
            "UPDATE wallets SET balance = $2, inbound_rate = $3, outbound_rate = $4, purchased_total = $5, \
             spent_total = $6, segments_used = $7, external_ref = $8, updated_at = $9 WHERE id = $1",
        )
        .bind(wallet.id)
        .bind(&wallet.balance)
        .bind(&wallet.inbound_rate)
        .bind(&wallet.outbound_rate)
        .bind(&wallet.purchased_total)
        .bind(&wallet.spent_total)
        .bind(wallet.segments_used)
        .bind(&wallet.external_ref)
        .bind(wallet.updated_at)
        .execute(&mut *tx)
        .await?;

        let entry = match draft {
            Some(draft) => {
                let entry = draft.into_entry(&wallet);
                sqlx::query(
                    "INSERT INTO wallet_transactions (id, wallet_id, kind, amount, balance_after, description, reference_id, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(entry.id)
                .bind(entry.wallet_id)
                .bind(entry.kind.as_str())
                .bind(&entry.amount)
                .bind(&entry.balance_after)
                .bind(&entry.description)
                .bind(&entry.reference_id)
                .bind(entry.created_at)
                .execute(&mut *tx)
                .await?;
                Some(entry)
            }
            None => None,
        };

        tx.commit().await?;
        Ok(Committed { wallet, entry })
    }

    async fn history(&self, account_id: Uuid, limit: i64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query_as::<_, LedgerEntryRow>(
            "SELECT t.* FROM wallet_transactions t \
             JOIN wallets w ON w.id = t.wallet_id \
             WHERE w.account_id = $1 \
             ORDER BY t.created_at DESC, t.id DESC \
             LIMIT $2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn mirrored_wallets(&self) -> Result<Vec<Wallet>, LedgerError> {
        let rows = sqlx::query_as::<_, WalletRow>(
            "SELECT * FROM wallets WHERE external_ref IS NOT NULL ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Wallet::from).collect())
    }
}
