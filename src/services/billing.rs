use crate::error::LedgerError;
use crate::services::queue_drainer::{DrainReport, QueueDrainer};
use crate::services::wallet_ledger::WalletLedger;
use bigdecimal::BigDecimal;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopUp {
    pub balance: BigDecimal,
    /// `None` when the follow-up drain could not run.
    pub drain: Option<DrainReport>,
}

/// Top-ups with their follow-up drain.
pub struct BillingService {
    ledger: WalletLedger,
    drainer: Arc<QueueDrainer>,
}

impl BillingService {
    pub fn new(ledger: WalletLedger, drainer: Arc<QueueDrainer>) -> Self {
        Self { ledger, drainer }
    }

    /// Credit the wallet, then drain the account's queue. The drain runs after
    /// the credit has committed and outside its lock; a failing drain does not
    /// undo the top-up.
    pub async fn add_funds(
        &self,
        account_id: Uuid,
        amount: &BigDecimal,
        reference_id: Option<String>,
        gift: bool,
    ) -> Result<TopUp, LedgerError> {
        let balance = self
            .ledger
            .add_funds(account_id, amount, reference_id, gift)
            .await?;

        let drain = match self.drainer.drain(account_id).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(%account_id, "Queue drain after top-up failed: {}", e);
                None
            }
        };

        Ok(TopUp { balance, drain })
    }
}
