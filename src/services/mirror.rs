//! Periodic push of each wallet's counters to its record in the CRM.
//! The local ledger stays authoritative; a missed push is caught up on the
//! next run.

use crate::crm::{LedgerMirror, MirrorSnapshot};
use crate::error::LedgerError;
use crate::services::rate_limiter::{Admission, RateLimiter};
use crate::services::scheduler::Job;
use crate::services::wallet_ledger::WalletLedger;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SECOND_WINDOW_RETRIES: u32 = 8;
const SECOND_WINDOW_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub pushed: usize,
    pub failed: usize,
    /// Wallets left for the next run because the request budget ran out.
    pub skipped: usize,
}

pub struct WalletMirror {
    ledger: WalletLedger,
    mirror: Arc<dyn LedgerMirror>,
    limiter: Arc<RateLimiter>,
}

impl WalletMirror {
    pub fn new(ledger: WalletLedger, mirror: Arc<dyn LedgerMirror>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            ledger,
            mirror,
            limiter,
        }
    }

    pub async fn sync_all(&self) -> Result<MirrorReport, LedgerError> {
        let wallets = self.ledger.mirrored_wallets().await?;
        let total = wallets.len();
        let mut report = MirrorReport::default();

        'wallets: for (index, wallet) in wallets.into_iter().enumerate() {
            let Some(external_ref) = wallet.external_ref.as_deref() else {
                continue;
            };

            let mut waits = 0;
            let permit = loop {
                match self.limiter.acquire().await {
                    Ok(Admission::Allowed(permit)) => break permit,
                    Ok(Admission::SecondExhausted) if waits < SECOND_WINDOW_RETRIES => {
                        waits += 1;
                        tokio::time::sleep(SECOND_WINDOW_WAIT).await;
                    }
                    Ok(Admission::SecondExhausted) => {
                        report.skipped += 1;
                        continue 'wallets;
                    }
                    Ok(Admission::DayExhausted) => {
                        report.skipped += total - index;
                        warn!(skipped = report.skipped, "Daily CRM budget exhausted, mirror sync cut short");
                        break 'wallets;
                    }
                    Err(e) => {
                        warn!(wallet_id = %wallet.id, "Rate counter unavailable: {}", e);
                        report.failed += 1;
                        continue 'wallets;
                    }
                }
            };

            let snapshot = MirrorSnapshot::from_wallet(&wallet);
            match self.mirror.push_counters(external_ref, &snapshot).await {
                Ok(()) => report.pushed += 1,
                Err(e) => {
                    warn!(wallet_id = %wallet.id, external_ref, "Mirror push failed: {}", e);
                    report.failed += 1;
                    if let Err(e) = self.limiter.release(permit).await {
                        warn!("Failed to release rate limit slot: {}", e);
                    }
                }
            }
        }

        info!(
            pushed = report.pushed,
            failed = report.failed,
            skipped = report.skipped,
            "Wallet mirror sync finished"
        );
        Ok(report)
    }
}

/// Scheduler adapter for `WalletMirror`.
pub struct WalletMirrorJob {
    mirror: Arc<WalletMirror>,
    schedule: String,
}

impl WalletMirrorJob {
    pub fn new(mirror: Arc<WalletMirror>, schedule: String) -> Self {
        Self { mirror, schedule }
    }
}

#[async_trait]
impl Job for WalletMirrorJob {
    fn name(&self) -> &str {
        "wallet_mirror_sync"
    }

    fn schedule(&self) -> &str {
        &self.schedule
    }

    async fn execute(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.mirror.sync_all().await?;
        Ok(())
    }
}
