#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use smsledger::crm::{CrmError, CrmSink, LedgerMirror, MirrorSnapshot};
use smsledger::db::memory::{MemoryAccountRepository, MemoryLedgerStore, MemoryMessageRepository};
use smsledger::domain::{Message, MessageStatus, WalletRates};
use smsledger::gateway::{GatewayError, SendReceipt, SendRequest, SmsGateway};
use smsledger::services::{DispatchSettings, MemoryCounter, RateLimits, RetryPolicy};
use smsledger::{App, AppParts};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

/// Gateway double. Answers from a script, then succeeds.
#[derive(Default)]
pub struct FakeGateway {
    script: Mutex<VecDeque<Result<SendReceipt, GatewayError>>>,
    pub requests: Mutex<Vec<SendRequest>>,
    next_id: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn push_failure(&self, error: GatewayError) {
        self.script.lock().await.push_back(Err(error));
    }

    pub async fn sent(&self) -> Vec<SendRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl SmsGateway for FakeGateway {
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, GatewayError> {
        self.requests.lock().await.push(request.clone());
        if let Some(scripted) = self.script.lock().await.pop_front() {
            return scripted;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendReceipt {
            gateway_message_id: format!("gw-{}", id),
        })
    }
}

/// CRM double recording every call. Inbound pushes can be made to fail and
/// status updates can be answered with 429s.
#[derive(Default)]
pub struct FakeCrm {
    pub statuses: Mutex<Vec<(String, MessageStatus)>>,
    pub inbound: Mutex<Vec<Message>>,
    pub snapshots: Mutex<Vec<(String, MirrorSnapshot)>>,
    pub inbound_failures: AtomicU32,
    pub rate_limited: AtomicU32,
}

impl FakeCrm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn statuses_for(&self, crm_message_id: &str) -> Vec<MessageStatus> {
        self.statuses
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == crm_message_id)
            .map(|(_, s)| *s)
            .collect()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl CrmSink for FakeCrm {
    async fn update_message_status(
        &self,
        crm_message_id: &str,
        status: MessageStatus,
    ) -> Result<(), CrmError> {
        if take_one(&self.rate_limited) {
            return Err(CrmError::RateLimited);
        }
        self.statuses
            .lock()
            .await
            .push((crm_message_id.to_string(), status));
        Ok(())
    }

    async fn push_inbound(&self, message: &Message) -> Result<(), CrmError> {
        if take_one(&self.inbound_failures) {
            return Err(CrmError::Rejected {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        self.inbound.lock().await.push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl LedgerMirror for FakeCrm {
    async fn push_counters(&self, external_ref: &str, snapshot: &MirrorSnapshot) -> Result<(), CrmError> {
        self.snapshots
            .lock()
            .await
            .push((external_ref.to_string(), snapshot.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub app: App,
    pub store: Arc<MemoryLedgerStore>,
    pub messages: Arc<MemoryMessageRepository>,
    pub gateway: Arc<FakeGateway>,
    pub crm: Arc<FakeCrm>,
}

/// Retry delays short enough for real-time tests.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        second_backoff: Duration::from_millis(20),
        daily_backoff: Duration::from_millis(50),
        max_daily_hits: 2,
        upstream_backoff: Duration::from_millis(10),
        upstream_backoff_cap: Duration::from_millis(50),
        max_attempts: 3,
    }
}

pub fn harness() -> Harness {
    harness_with(
        WalletRates::new(dec("0.05"), dec("0.02")),
        RateLimits {
            per_second: 100,
            per_day: 10_000,
        },
    )
}

pub fn harness_with(default_rates: WalletRates, rate_limits: RateLimits) -> Harness {
    let store = Arc::new(MemoryLedgerStore::new());
    let messages = Arc::new(MemoryMessageRepository::new());
    let gateway = FakeGateway::new();
    let crm = FakeCrm::new();

    let app = App::from_parts(AppParts {
        ledger_store: store.clone(),
        messages: messages.clone(),
        accounts: Arc::new(MemoryAccountRepository::new()),
        gateway: gateway.clone(),
        crm: crm.clone(),
        mirror: crm.clone(),
        rate_counter: Arc::new(MemoryCounter::new()),
        default_rates,
        rate_limits,
        dispatch: DispatchSettings::from_callback_base(
            Some("https://hooks.example.com/"),
            Duration::from_secs(2),
        ),
        retry: fast_retry(),
    });

    Harness {
        app,
        store,
        messages,
        gateway,
        crm,
    }
}
