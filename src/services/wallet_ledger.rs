//! Charge, refund, top-up and deduct against one account's wallet.
//!
//! Every operation is a single `LedgerStore::mutate` unit: the balance, the
//! derived counters and the ledger entry commit together or not at all.

use crate::domain::segments::billable_segments;
use crate::domain::wallet::to_ledger_amount;
use crate::domain::{Direction, EntryDraft, LedgerEntry, Wallet, WalletRates};
use crate::error::LedgerError;
use crate::ports::{Committed, LedgerStore};
use bigdecimal::{BigDecimal, Zero};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of a successful charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub segments: i64,
    pub cost: BigDecimal,
    pub balance_after: BigDecimal,
}

#[derive(Clone)]
pub struct WalletLedger {
    store: Arc<dyn LedgerStore>,
    default_rates: WalletRates,
}

impl WalletLedger {
    pub fn new(store: Arc<dyn LedgerStore>, default_rates: WalletRates) -> Self {
        Self {
            store,
            default_rates,
        }
    }

    /// The account's wallet, created with the default rates on first use.
    pub async fn wallet(&self, account_id: Uuid) -> Result<Wallet, LedgerError> {
        self.store
            .ensure_wallet(account_id, &self.default_rates)
            .await
    }

    async fn apply<F>(&self, account_id: Uuid, mutation: F) -> Result<Committed, LedgerError>
    where
        F: FnOnce(&mut Wallet) -> Result<Option<EntryDraft>, LedgerError> + Send + 'static,
    {
        self.wallet(account_id).await?;
        self.store.mutate(account_id, Box::new(mutation)).await
    }

    /// Bill one message. The price is read from the wallet under its lock, so a
    /// concurrent rate change is never half-applied.
    pub async fn charge(
        &self,
        account_id: Uuid,
        direction: Direction,
        body: &str,
        reference_id: Option<String>,
    ) -> Result<Charge, LedgerError> {
        let segments = billable_segments(body);
        let description = format!("SMS {} charge ({} segments)", direction, segments);

        let result = self
            .apply(account_id, move |wallet| {
                let cost = to_ledger_amount(&(BigDecimal::from(segments) * wallet.rate(direction)));
                wallet.debit(&cost)?;
                Ok(Some(EntryDraft::debit(&cost, description, reference_id)))
            })
            .await;

        let committed = match result {
            Ok(committed) => committed,
            Err(e) => {
                if e.is_insufficient_funds() {
                    debug!(%account_id, %direction, segments, "Charge declined: {}", e);
                }
                return Err(e);
            }
        };

        let cost = committed
            .entry
            .map(|entry| entry.amount)
            .unwrap_or_else(BigDecimal::zero);
        debug!(%account_id, %direction, segments, %cost, "Charged wallet");
        Ok(Charge {
            segments,
            cost,
            balance_after: committed.wallet.balance,
        })
    }

    /// Return `amount` to the wallet. Always succeeds for a known wallet.
    pub async fn refund(
        &self,
        account_id: Uuid,
        amount: &BigDecimal,
        reference_id: Option<String>,
        description: Option<String>,
    ) -> Result<BigDecimal, LedgerError> {
        let amount = positive_amount(amount)?;
        let description = description.unwrap_or_else(|| "Refund".to_string());
        let committed = self
            .apply(account_id, move |wallet| {
                wallet.refund(&amount);
                Ok(Some(EntryDraft::credit(&amount, description, reference_id)))
            })
            .await?;
        info!(%account_id, balance = %committed.wallet.balance, "Refund credited");
        Ok(committed.wallet.balance)
    }

    /// Credit purchased or gifted funds. Draining the account's queue is the
    /// caller's follow-up once this has committed; see `BillingService`.
    pub async fn add_funds(
        &self,
        account_id: Uuid,
        amount: &BigDecimal,
        reference_id: Option<String>,
        gift: bool,
    ) -> Result<BigDecimal, LedgerError> {
        let amount = positive_amount(amount)?;
        let description = if gift {
            format!("Gifted credits: {}", amount)
        } else {
            format!("Purchased credits: {}", amount)
        };
        let committed = self
            .apply(account_id, move |wallet| {
                wallet.top_up(&amount);
                Ok(Some(EntryDraft::credit(&amount, description, reference_id)))
            })
            .await?;
        info!(%account_id, gift, balance = %committed.wallet.balance, "Funds added");
        Ok(committed.wallet.balance)
    }

    /// Administrative debit of a caller-chosen amount.
    pub async fn deduct_funds(
        &self,
        account_id: Uuid,
        amount: &BigDecimal,
        reference_id: Option<String>,
        description: Option<String>,
    ) -> Result<BigDecimal, LedgerError> {
        let amount = positive_amount(amount)?;
        let description = description.unwrap_or_else(|| "Manual deduction".to_string());
        let committed = self
            .apply(account_id, move |wallet| {
                wallet.debit(&amount)?;
                Ok(Some(EntryDraft::debit(&amount, description, reference_id)))
            })
            .await?;
        info!(%account_id, balance = %committed.wallet.balance, "Funds deducted");
        Ok(committed.wallet.balance)
    }

    pub async fn set_rates(&self, account_id: Uuid, rates: WalletRates) -> Result<Wallet, LedgerError> {
        if rates.inbound < BigDecimal::zero() || rates.outbound < BigDecimal::zero() {
            return Err(LedgerError::InvalidAmount("rates must not be negative".to_string()));
        }
        let committed = self
            .apply(account_id, move |wallet| {
                wallet.set_rates(&rates);
                Ok(None)
            })
            .await?;
        info!(
            %account_id,
            inbound = %committed.wallet.inbound_rate,
            outbound = %committed.wallet.outbound_rate,
            "Wallet rates updated"
        );
        Ok(committed.wallet)
    }

    /// Record the id of the wallet's mirror in the system of record.
    pub async fn link_external_ref(
        &self,
        account_id: Uuid,
        external_ref: String,
    ) -> Result<Wallet, LedgerError> {
        if external_ref.trim().is_empty() {
            return Err(LedgerError::InvalidArgument("external ref must not be empty".to_string()));
        }
        let committed = self
            .apply(account_id, move |wallet| {
                wallet.external_ref = Some(external_ref);
                Ok(None)
            })
            .await?;
        Ok(committed.wallet)
    }

    pub async fn history(&self, account_id: Uuid, limit: i64) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.history(account_id, limit).await
    }

    pub async fn mirrored_wallets(&self) -> Result<Vec<Wallet>, LedgerError> {
        self.store.mirrored_wallets().await
    }
}

fn positive_amount(amount: &BigDecimal) -> Result<BigDecimal, LedgerError> {
    let amount = to_ledger_amount(amount);
    if amount <= BigDecimal::zero() {
        return Err(LedgerError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(amount)
}
