//! Asynchronous worker that pushes status updates and inbound messages to the
//! CRM under its request caps.
//!
//! Waiting for a rate window never holds a worker: a job that must wait is
//! handed to a timer task that re-enqueues it once the delay has passed.

use crate::crm::{CrmError, CrmSink};
use crate::domain::{Direction, MessageStatus};
use crate::ports::MessageRepository;
use crate::services::dispatcher::{Dispatcher, InboundAttempt};
use crate::services::rate_limiter::{Admission, Permit, RateLimiter};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportJob {
    /// Mirror a message status onto the CRM conversation.
    Status {
        crm_message_id: String,
        status: MessageStatus,
        message_id: Option<Uuid>,
    },
    /// Charge for and push a queued inbound message.
    Inbound { message_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub job: ReportJob,
    /// Failed calls so far (upstream errors and CRM-side 429s).
    pub attempts: u32,
    /// Times the daily window was found exhausted.
    pub daily_hits: u32,
}

impl Envelope {
    pub fn new(job: ReportJob) -> Self {
        Self {
            job,
            attempts: 0,
            daily_hits: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Done,
    Retry(Duration),
    GaveUp(String),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub second_backoff: Duration,
    pub daily_backoff: Duration,
    pub max_daily_hits: u32,
    pub upstream_backoff: Duration,
    pub upstream_backoff_cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            second_backoff: Duration::from_millis(250),
            daily_backoff: Duration::from_secs(3600),
            max_daily_hits: 3,
            upstream_backoff: Duration::from_secs(3),
            upstream_backoff_cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay after the `attempts`-th upstream failure.
    pub fn upstream_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.upstream_backoff
            .saturating_mul(factor)
            .min(self.upstream_backoff_cap)
    }
}

/// Sending side of the reporter queue. Cheap to clone.
#[derive(Clone)]
pub struct ReporterHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    pending: Arc<AtomicUsize>,
    inbound_in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

pub struct ReporterInbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl ReporterHandle {
    pub fn channel() -> (ReporterHandle, ReporterInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ReporterHandle {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            inbound_in_flight: Arc::new(Mutex::new(HashSet::new())),
        };
        (handle, ReporterInbox { rx })
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        match self.inbound_in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a job. Returns false when the job was not queued, either because
    /// the same inbound message is already in flight or the worker is gone.
    pub fn enqueue(&self, job: ReportJob) -> bool {
        if let ReportJob::Inbound { message_id } = &job {
            if !self.in_flight().insert(*message_id) {
                debug!(%message_id, "Inbound message already in flight");
                return false;
            }
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        match self.tx.send(Envelope::new(job)) {
            Ok(()) => true,
            Err(mpsc::error::SendError(envelope)) => {
                warn!(job = ?envelope.job, "Status reporter is not running, job dropped");
                self.finish(&envelope.job);
                false
            }
        }
    }

    fn requeue(&self, envelope: Envelope) {
        if let Err(mpsc::error::SendError(envelope)) = self.tx.send(envelope) {
            warn!(job = ?envelope.job, "Status reporter stopped before retry");
            self.finish(&envelope.job);
        }
    }

    fn finish(&self, job: &ReportJob) {
        if let ReportJob::Inbound { message_id } = job {
            self.in_flight().remove(message_id);
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Jobs queued, running or waiting for a retry.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every queued job has settled. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

pub struct StatusReporter {
    limiter: Arc<RateLimiter>,
    crm: Arc<dyn CrmSink>,
    dispatcher: Arc<Dispatcher>,
    messages: Arc<dyn MessageRepository>,
    handle: ReporterHandle,
    policy: RetryPolicy,
    concurrency: usize,
}

impl StatusReporter {
    pub fn new(
        limiter: Arc<RateLimiter>,
        crm: Arc<dyn CrmSink>,
        dispatcher: Arc<Dispatcher>,
        messages: Arc<dyn MessageRepository>,
        handle: ReporterHandle,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            limiter,
            crm,
            dispatcher,
            messages,
            handle,
            policy,
            concurrency: 8,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn run(self: Arc<Self>, mut inbox: ReporterInbox) {
        info!(concurrency = self.concurrency, "Status reporter started");
        let slots = Arc::new(Semaphore::new(self.concurrency));

        while let Some(mut envelope) = inbox.rx.recv().await {
            let Ok(slot) = slots.clone().acquire_owned().await else {
                break;
            };
            let reporter = self.clone();
            tokio::spawn(async move {
                let step = reporter.process(&mut envelope).await;
                drop(slot);
                reporter.settle(envelope, step).await;
            });
        }

        info!("Status reporter stopped");
    }

    async fn settle(&self, envelope: Envelope, step: Step) {
        match step {
            Step::Done => self.handle.finish(&envelope.job),
            Step::Retry(delay) => {
                debug!(job = ?envelope.job, ?delay, attempts = envelope.attempts, "Rescheduling");
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    handle.requeue(envelope);
                });
            }
            Step::GaveUp(reason) => {
                error!(job = ?envelope.job, attempts = envelope.attempts, "Giving up: {}", reason);
                self.give_up(&envelope.job, &reason).await;
                self.handle.finish(&envelope.job);
            }
        }
    }

    async fn give_up(&self, job: &ReportJob, reason: &str) {
        let result = match job {
            ReportJob::Status {
                message_id: Some(id),
                ..
            } => self
                .messages
                .annotate_error(*id, &format!("Status sync failed: {}", reason))
                .await
                .map_err(|e| e.to_string()),
            ReportJob::Status { .. } => Ok(()),
            ReportJob::Inbound { message_id } => self
                .dispatcher
                .fail_queued(*message_id, reason)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
        };
        if let Err(e) = result {
            error!(job = ?job, "Failed to record give-up: {}", e);
        }
    }

    /// Run one attempt of a job and decide what happens next.
    pub async fn process(&self, envelope: &mut Envelope) -> Step {
        let permit = match self.limiter.acquire().await {
            Ok(Admission::Allowed(permit)) => permit,
            Ok(Admission::SecondExhausted) => return Step::Retry(self.policy.second_backoff),
            Ok(Admission::DayExhausted) => {
                envelope.daily_hits += 1;
                if envelope.daily_hits > self.policy.max_daily_hits {
                    return Step::GaveUp("daily CRM request limit exhausted".to_string());
                }
                warn!(job = ?envelope.job, hits = envelope.daily_hits, "Daily CRM limit reached");
                return Step::Retry(self.policy.daily_backoff);
            }
            Err(e) => return self.upstream_failure(envelope, format!("rate counter: {}", e)),
        };

        match envelope.job.clone() {
            ReportJob::Status {
                crm_message_id,
                status,
                ..
            } => match self.crm.update_message_status(&crm_message_id, status).await {
                Ok(()) => {
                    debug!(crm_message_id, %status, "CRM status updated");
                    Step::Done
                }
                Err(e) => {
                    self.release(permit).await;
                    self.crm_failure(envelope, e)
                }
            },
            ReportJob::Inbound { message_id } => self.process_inbound(envelope, message_id, permit).await,
        }
    }

    async fn process_inbound(&self, envelope: &mut Envelope, message_id: Uuid, permit: Permit) -> Step {
        let mut message = match self.messages.get(message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.release(permit).await;
                return Step::GaveUp(format!("message {} not found", message_id));
            }
            Err(e) => {
                self.release(permit).await;
                return self.upstream_failure(envelope, e.to_string());
            }
        };
        if message.direction != Direction::Inbound || message.status != MessageStatus::Queued {
            self.release(permit).await;
            return Step::Done;
        }

        match self.dispatcher.handle_inbound(&mut message).await {
            Ok(InboundAttempt::Delivered) => Step::Done,
            Ok(InboundAttempt::Skipped) => {
                self.release(permit).await;
                Step::Done
            }
            Ok(InboundAttempt::Queued) => {
                // Waits for the next top-up to hand it back.
                self.release(permit).await;
                Step::Done
            }
            Ok(InboundAttempt::PushFailed(e)) => {
                self.release(permit).await;
                self.crm_failure(envelope, e)
            }
            Err(e) => {
                self.release(permit).await;
                self.upstream_failure(envelope, e.to_string())
            }
        }
    }

    fn crm_failure(&self, envelope: &mut Envelope, error: CrmError) -> Step {
        match error {
            CrmError::RateLimited => {
                envelope.attempts += 1;
                if envelope.attempts >= self.policy.max_attempts {
                    return Step::GaveUp("CRM kept answering 429".to_string());
                }
                Step::Retry(self.policy.second_backoff)
            }
            CrmError::MissingContext(_) => Step::GaveUp(error.to_string()),
            other => self.upstream_failure(envelope, other.to_string()),
        }
    }

    fn upstream_failure(&self, envelope: &mut Envelope, reason: String) -> Step {
        envelope.attempts += 1;
        if envelope.attempts >= self.policy.max_attempts {
            return Step::GaveUp(reason);
        }
        warn!(job = ?envelope.job, attempts = envelope.attempts, "CRM call failed: {}", reason);
        Step::Retry(self.policy.upstream_delay(envelope.attempts))
    }

    async fn release(&self, permit: Permit) {
        if let Err(e) = self.limiter.release(permit).await {
            warn!("Failed to release rate limit slot: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.upstream_delay(1), Duration::from_secs(3));
        assert_eq!(policy.upstream_delay(2), Duration::from_secs(6));
        assert_eq!(policy.upstream_delay(3), Duration::from_secs(12));
        assert_eq!(policy.upstream_delay(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_handle_tracks_pending_and_dedups_inbound() {
        let (handle, mut inbox) = ReporterHandle::channel();
        let id = Uuid::new_v4();

        assert!(handle.enqueue(ReportJob::Inbound { message_id: id }));
        assert!(!handle.enqueue(ReportJob::Inbound { message_id: id }));
        assert_eq!(handle.pending(), 1);

        let envelope = inbox.rx.recv().await.unwrap();
        handle.finish(&envelope.job);
        assert_eq!(handle.pending(), 0);
        assert!(handle.enqueue(ReportJob::Inbound { message_id: id }));
    }

    #[tokio::test]
    async fn test_enqueue_without_worker_is_dropped() {
        let (handle, inbox) = ReporterHandle::channel();
        drop(inbox);
        assert!(!handle.enqueue(ReportJob::Status {
            crm_message_id: "crm-1".into(),
            status: MessageStatus::Sent,
            message_id: None,
        }));
        assert_eq!(handle.pending(), 0);
    }
}
