pub mod config;
pub mod crm;
pub mod db;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod ports;
pub mod services;
pub mod utils;

use crate::config::Config;
use crate::crm::{CrmClient, CrmSink, LedgerMirror};
use crate::db::{PgAccountRepository, PgLedgerStore, PgMessageRepository};
use crate::domain::WalletRates;
use crate::gateway::{SmsGateway, TransmitClient};
use crate::ports::{AccountRepository, LedgerStore, MessageRepository};
use crate::services::{
    BillingService, DispatchSettings, Dispatcher, QueueDrainer, RateCounter, RateLimiter,
    RateLimits, RedisCounter, ReporterHandle, RetryPolicy, StatusReporter, WalletLedger,
    WalletMirror,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const CRM_RATE_PREFIX: &str = "crm-rate";

/// Collaborators the service graph is built from.
pub struct AppParts {
    pub ledger_store: Arc<dyn LedgerStore>,
    pub messages: Arc<dyn MessageRepository>,
    pub accounts: Arc<dyn AccountRepository>,
    pub gateway: Arc<dyn SmsGateway>,
    pub crm: Arc<dyn CrmSink>,
    pub mirror: Arc<dyn LedgerMirror>,
    pub rate_counter: Arc<dyn RateCounter>,
    pub default_rates: WalletRates,
    pub rate_limits: RateLimits,
    pub dispatch: DispatchSettings,
    pub retry: RetryPolicy,
}

/// The running service graph. The status reporter worker is started on build
/// and lives until `shutdown`.
pub struct App {
    pub accounts: Arc<dyn AccountRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub ledger: WalletLedger,
    pub dispatcher: Arc<Dispatcher>,
    pub drainer: Arc<QueueDrainer>,
    pub billing: BillingService,
    pub mirror: Arc<WalletMirror>,
    pub limiter: Arc<RateLimiter>,
    pub reporter: ReporterHandle,
    worker: JoinHandle<()>,
}

impl App {
    pub fn from_parts(parts: AppParts) -> Self {
        let ledger = WalletLedger::new(parts.ledger_store, parts.default_rates);
        let limiter = Arc::new(RateLimiter::new(
            parts.rate_counter,
            parts.rate_limits,
            CRM_RATE_PREFIX,
        ));
        let (reporter, inbox) = ReporterHandle::channel();

        let dispatcher = Arc::new(Dispatcher::new(
            ledger.clone(),
            parts.messages.clone(),
            parts.gateway,
            parts.crm.clone(),
            reporter.clone(),
            parts.dispatch,
        ));
        let drainer = Arc::new(QueueDrainer::new(dispatcher.clone(), parts.messages.clone()));
        let billing = BillingService::new(ledger.clone(), drainer.clone());
        let mirror = Arc::new(WalletMirror::new(ledger.clone(), parts.mirror, limiter.clone()));

        let status_reporter = Arc::new(StatusReporter::new(
            limiter.clone(),
            parts.crm,
            dispatcher.clone(),
            parts.messages.clone(),
            reporter.clone(),
            parts.retry,
        ));
        let worker = tokio::spawn(status_reporter.run(inbox));

        Self {
            accounts: parts.accounts,
            messages: parts.messages,
            ledger,
            dispatcher,
            drainer,
            billing,
            mirror,
            limiter,
            reporter,
            worker,
        }
    }

    /// Production wiring: Postgres stores, the SMS gateway and CRM clients,
    /// and Redis-backed rate counters.
    pub fn from_config(config: &Config, pool: sqlx::PgPool) -> anyhow::Result<Self> {
        let gateway = TransmitClient::new(
            config.gateway_base_url.clone(),
            required(&config.gateway_api_key, "GATEWAY_API_KEY")?,
            required(&config.gateway_api_secret, "GATEWAY_API_SECRET")?,
        );
        let crm = Arc::new(CrmClient::new(
            config.crm_base_url.clone(),
            required(&config.crm_access_token, "CRM_ACCESS_TOKEN")?,
            required(&config.crm_location_id, "CRM_LOCATION_ID")?,
            required(&config.crm_object_key, "CRM_OBJECT_KEY")?,
        ));

        Ok(Self::from_parts(AppParts {
            ledger_store: Arc::new(PgLedgerStore::new(pool.clone())),
            messages: Arc::new(PgMessageRepository::new(pool.clone())),
            accounts: Arc::new(PgAccountRepository::new(pool)),
            gateway: Arc::new(gateway),
            crm: crm.clone(),
            mirror: crm,
            rate_counter: Arc::new(RedisCounter::new(&config.redis_url)?),
            default_rates: config.default_rates(),
            rate_limits: RateLimits {
                per_second: config.crm_rate_per_second,
                per_day: config.crm_rate_per_day,
            },
            dispatch: DispatchSettings::from_callback_base(
                config.callback_base_url.as_deref(),
                config.delivery_timeout(),
            ),
            retry: RetryPolicy::default(),
        }))
    }

    /// Wait up to `grace` for queued reporter jobs, then stop the worker.
    /// Returns false if jobs were still pending.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let idle = self.reporter.wait_idle(grace).await;
        if !idle {
            tracing::warn!(pending = self.reporter.pending(), "Stopping with reporter jobs pending");
        }
        self.worker.abort();
        idle
    }
}

fn required(value: &Option<String>, key: &str) -> anyhow::Result<String> {
    value
        .clone()
        .ok_or_else(|| anyhow::anyhow!("{} must be set", key))
}
