mod common;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::{dec, FakeCrm, FakeGateway};
use smsledger::crm::{CrmError, CrmSink};
use smsledger::db::memory::{MemoryLedgerStore, MemoryMessageRepository};
use smsledger::domain::{Direction, Message, MessageStatus, NewMessage, WalletRates};
use smsledger::ports::MessageRepository;
use smsledger::services::rate_limiter::Clock;
use smsledger::services::{
    DispatchSettings, Dispatcher, MemoryCounter, RateLimiter, RateLimits, ReportJob,
    ReporterHandle, RetryPolicy, StatusReporter, WalletLedger,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// Wall clock that follows tokio's (possibly paused) clock.
fn tokio_clock() -> Clock {
    let start = Instant::now();
    let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    Arc::new(move || base + chrono::Duration::from_std(start.elapsed()).unwrap())
}

/// Records when each status update arrived.
#[derive(Default)]
struct TimedCrm {
    calls: Mutex<Vec<(String, Instant)>>,
}

#[async_trait]
impl CrmSink for TimedCrm {
    async fn update_message_status(
        &self,
        crm_message_id: &str,
        _status: MessageStatus,
    ) -> Result<(), CrmError> {
        self.calls
            .lock()
            .await
            .push((crm_message_id.to_string(), Instant::now()));
        Ok(())
    }

    async fn push_inbound(&self, _message: &Message) -> Result<(), CrmError> {
        Ok(())
    }
}

struct Rig {
    handle: ReporterHandle,
    messages: Arc<MemoryMessageRepository>,
    ledger: WalletLedger,
}

fn start_reporter(crm: Arc<dyn CrmSink>, limits: RateLimits, policy: RetryPolicy) -> Rig {
    let messages = Arc::new(MemoryMessageRepository::new());
    let ledger = WalletLedger::new(
        Arc::new(MemoryLedgerStore::new()),
        WalletRates::new(dec("0.05"), dec("0.02")),
    );
    let limiter = Arc::new(RateLimiter::with_clock(
        Arc::new(MemoryCounter::new()),
        limits,
        "crm-rate",
        tokio_clock(),
    ));
    let (handle, inbox) = ReporterHandle::channel();
    let dispatcher = Arc::new(Dispatcher::new(
        ledger.clone(),
        messages.clone(),
        FakeGateway::new(),
        crm.clone(),
        handle.clone(),
        DispatchSettings::from_callback_base(None, Duration::from_secs(5)),
    ));
    let reporter = Arc::new(StatusReporter::new(
        limiter,
        crm,
        dispatcher,
        messages.clone(),
        handle.clone(),
        policy,
    ));
    tokio::spawn(reporter.run(inbox));

    Rig {
        handle,
        messages,
        ledger,
    }
}

fn status_job(crm_message_id: &str, message_id: Option<Uuid>) -> ReportJob {
    ReportJob::Status {
        crm_message_id: crm_message_id.to_string(),
        status: MessageStatus::Delivered,
        message_id,
    }
}

#[tokio::test(start_paused = true)]
async fn test_per_second_cap_delays_instead_of_dropping() {
    let crm = Arc::new(TimedCrm::default());
    let rig = start_reporter(
        crm.clone(),
        RateLimits {
            per_second: 2,
            per_day: 1_000,
        },
        RetryPolicy::default(),
    );

    let started = Instant::now();
    for i in 0..5 {
        assert!(rig.handle.enqueue(status_job(&format!("crm-{}", i), None)));
    }
    assert!(rig.handle.wait_idle(Duration::from_secs(60)).await);

    let calls = crm.calls.lock().await;
    assert_eq!(calls.len(), 5, "every update is eventually sent");

    let mut per_window = std::collections::HashMap::new();
    for (_, at) in calls.iter() {
        *per_window.entry(at.duration_since(started).as_secs()).or_insert(0) += 1;
    }
    assert!(per_window.values().all(|count| *count <= 2), "{:?}", per_window);
    assert!(per_window.len() >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_daily_exhaustion_gives_up_and_annotates() {
    let crm = FakeCrm::new();
    let rig = start_reporter(
        crm.clone(),
        RateLimits {
            per_second: 10,
            per_day: 1,
        },
        RetryPolicy {
            daily_backoff: Duration::from_secs(60),
            max_daily_hits: 2,
            ..RetryPolicy::default()
        },
    );

    let message = Message::new(
        NewMessage {
            account_id: Uuid::new_v4(),
            body: "hello".into(),
            crm_message_id: Some("crm-late".into()),
            ..Default::default()
        },
        Direction::Outbound,
        MessageStatus::Sent,
    );
    rig.messages.insert(&message).await.unwrap();

    rig.handle.enqueue(status_job("crm-first", None));
    assert!(rig.handle.wait_idle(Duration::from_secs(60)).await);
    rig.handle.enqueue(status_job("crm-late", Some(message.id)));
    assert!(rig.handle.wait_idle(Duration::from_secs(600)).await);

    assert_eq!(crm.statuses_for("crm-first").await, vec![MessageStatus::Delivered]);
    assert!(crm.statuses_for("crm-late").await.is_empty());

    let stored = rig.messages.get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
    assert!(stored.error_message.unwrap().contains("daily"));
}

#[tokio::test(start_paused = true)]
async fn test_crm_429_is_retried() {
    let crm = FakeCrm::new();
    crm.rate_limited.store(2, Ordering::SeqCst);
    let rig = start_reporter(
        crm.clone(),
        RateLimits {
            per_second: 10,
            per_day: 1_000,
        },
        RetryPolicy::default(),
    );

    rig.handle.enqueue(status_job("crm-busy", None));
    assert!(rig.handle.wait_idle(Duration::from_secs(30)).await);

    assert_eq!(crm.statuses_for("crm-busy").await, vec![MessageStatus::Delivered]);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_that_never_gets_budget_fails_without_charge() {
    let crm = FakeCrm::new();
    let rig = start_reporter(
        crm.clone(),
        RateLimits {
            per_second: 10,
            per_day: 0,
        },
        RetryPolicy {
            daily_backoff: Duration::from_secs(60),
            max_daily_hits: 1,
            ..RetryPolicy::default()
        },
    );

    let account = Uuid::new_v4();
    rig.ledger.add_funds(account, &dec("0.10"), None, false).await.unwrap();
    let message = Message::new(
        NewMessage {
            account_id: account,
            body: "inbound".into(),
            crm_conversation_id: Some("conv-1".into()),
            ..Default::default()
        },
        Direction::Inbound,
        MessageStatus::Queued,
    );
    rig.messages.insert(&message).await.unwrap();

    rig.handle.enqueue(ReportJob::Inbound {
        message_id: message.id,
    });
    assert!(rig.handle.wait_idle(Duration::from_secs(600)).await);

    let stored = rig.messages.get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
    assert!(crm.inbound.lock().await.is_empty());
    assert_eq!(rig.ledger.wallet(account).await.unwrap().balance, dec("0.10"));
}
