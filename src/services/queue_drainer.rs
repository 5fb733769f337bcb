use crate::domain::Direction;
use crate::ports::MessageRepository;
use crate::services::dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
use crate::services::status_reporter::ReportJob;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    pub still_queued: usize,
    /// Inbound messages passed to the reporter worker.
    pub handed_off: usize,
    /// Messages another worker claimed between the read and the dispatch.
    pub skipped: usize,
    pub errors: usize,
}

/// Retries an account's queued messages, oldest first, after a top-up.
pub struct QueueDrainer {
    dispatcher: Arc<Dispatcher>,
    messages: Arc<dyn MessageRepository>,
    running: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl QueueDrainer {
    pub fn new(dispatcher: Arc<Dispatcher>, messages: Arc<dyn MessageRepository>) -> Self {
        Self {
            dispatcher,
            messages,
            running: Mutex::new(HashMap::new()),
        }
    }

    async fn account_lock(&self, account_id: Uuid) -> Arc<Mutex<()>> {
        self.running
            .lock()
            .await
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the account's lock once no other drain holds or waits on it.
    async fn release_lock(&self, account_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut running = self.running.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            running.remove(&account_id);
        }
    }

    /// Accounts with a drain running or waiting in this process.
    pub async fn active_accounts(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Walk the queue snapshot taken now. Outbound draining stops at the first
    /// message that still cannot be paid for; the rest keep their place.
    /// One message's error never aborts the walk.
    ///
    /// Drains of one account are serialized in-process. Across processes each
    /// message is claimed with a status compare-and-set before it is charged.
    pub async fn drain(&self, account_id: Uuid) -> Result<DrainReport, DispatchError> {
        let lock = self.account_lock(account_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.walk(account_id).await
        };
        self.release_lock(account_id, lock).await;
        result
    }

    async fn walk(&self, account_id: Uuid) -> Result<DrainReport, DispatchError> {
        let queued = self.messages.queued_for_account(account_id).await?;
        let mut report = DrainReport::default();
        let mut exhausted = false;

        for mut message in queued {
            if message.direction == Direction::Inbound {
                if self.dispatcher.reporter().enqueue(ReportJob::Inbound {
                    message_id: message.id,
                }) {
                    report.handed_off += 1;
                }
                continue;
            }

            if exhausted {
                report.still_queued += 1;
                continue;
            }

            match self.dispatcher.handle_outbound(&mut message).await {
                Ok(DispatchOutcome::Sent { .. }) => report.sent += 1,
                Ok(DispatchOutcome::Failed(_)) => report.failed += 1,
                Ok(DispatchOutcome::Skipped) => report.skipped += 1,
                Ok(DispatchOutcome::Queued { .. }) => {
                    report.still_queued += 1;
                    exhausted = true;
                }
                Err(e) => {
                    report.errors += 1;
                    error!(message_id = %message.id, %account_id, "Drain step failed: {}", e);
                }
            }
        }

        info!(
            %account_id,
            sent = report.sent,
            failed = report.failed,
            still_queued = report.still_queued,
            handed_off = report.handed_off,
            skipped = report.skipped,
            errors = report.errors,
            "Queue drained"
        );
        Ok(report)
    }
}
