//! Drives one message from submission to a settled status: charge, deliver,
//! and refund when delivery does not happen.

use crate::crm::{CrmError, CrmSink};
use crate::domain::segments::billable_segments;
use crate::domain::{Direction, Message, MessageStatus, NewMessage};
use crate::error::{LedgerError, RepositoryError};
use crate::gateway::{GatewayError, SendRequest, SmsGateway};
use crate::ports::MessageRepository;
use crate::services::status_reporter::{ReportJob, ReporterHandle};
use crate::services::wallet_ledger::WalletLedger;
use crate::utils::phone::format_international;
use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("Message {id} cannot be dispatched from {direction}/{status}")]
    InvalidState {
        id: Uuid,
        direction: Direction,
        status: MessageStatus,
    },
    #[error("Message not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The provider refused the message.
    DeliveryFailed(String),
    /// Network error, timeout, 5xx or open circuit breaker.
    UpstreamUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent {
        gateway_message_id: String,
        cost: BigDecimal,
        segments: i64,
    },
    /// Not enough funds; nothing was charged.
    Queued { segments: i64 },
    /// Delivery did not happen and the charge was refunded.
    Failed(FailureReason),
    /// Another worker took the message off the queue first.
    Skipped,
}

/// Result of one inbound attempt. A failed push leaves the message queued
/// with its charge refunded; the caller owns the retry policy.
#[derive(Debug)]
pub enum InboundAttempt {
    Delivered,
    Queued,
    PushFailed(CrmError),
    /// Another worker took the message off the queue first.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Applied(MessageStatus),
    /// The message had already left `sent`; nothing changed.
    Duplicate,
    /// Intermediate provider status, recorded but not a transition.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub delivery_callback: Option<String>,
    pub reply_callback: Option<String>,
    pub delivery_timeout: Duration,
    pub country_code: String,
}

impl DispatchSettings {
    pub fn from_callback_base(base: Option<&str>, delivery_timeout: Duration) -> Self {
        let base = base.map(|b| b.trim_end_matches('/').to_string());
        Self {
            delivery_callback: base.as_ref().map(|b| format!("{}/sms/delivery-receipt", b)),
            reply_callback: base.as_ref().map(|b| format!("{}/sms/reply", b)),
            delivery_timeout,
            country_code: crate::utils::phone::DEFAULT_COUNTRY_CODE.to_string(),
        }
    }
}

pub struct Dispatcher {
    ledger: WalletLedger,
    messages: Arc<dyn MessageRepository>,
    gateway: Arc<dyn SmsGateway>,
    crm: Arc<dyn CrmSink>,
    reporter: ReporterHandle,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        ledger: WalletLedger,
        messages: Arc<dyn MessageRepository>,
        gateway: Arc<dyn SmsGateway>,
        crm: Arc<dyn CrmSink>,
        reporter: ReporterHandle,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            ledger,
            messages,
            gateway,
            crm,
            reporter,
            settings,
        }
    }

    pub fn ledger(&self) -> &WalletLedger {
        &self.ledger
    }

    pub fn reporter(&self) -> &ReporterHandle {
        &self.reporter
    }

    /// Record a new outbound message and dispatch it immediately.
    pub async fn submit_outbound(
        &self,
        new: NewMessage,
    ) -> Result<(Message, DispatchOutcome), DispatchError> {
        let mut message = Message::new(new, Direction::Outbound, MessageStatus::Pending);
        self.messages.insert(&message).await?;
        let outcome = self.handle_outbound(&mut message).await?;
        Ok((message, outcome))
    }

    pub async fn handle_outbound(&self, message: &mut Message) -> Result<DispatchOutcome, DispatchError> {
        if message.direction != Direction::Outbound
            || !matches!(message.status, MessageStatus::Pending | MessageStatus::Queued)
        {
            return Err(invalid_state(message));
        }
        let from_queue = message.status == MessageStatus::Queued;
        if !self.claim(message).await? {
            return Ok(DispatchOutcome::Skipped);
        }

        let reference = message.reference();
        let charge = match self
            .ledger
            .charge(message.account_id, Direction::Outbound, &message.body, Some(reference.clone()))
            .await
        {
            Ok(charge) => charge,
            Err(e) if e.is_insufficient_funds() => {
                let segments = billable_segments(&message.body);
                message.status = MessageStatus::Queued;
                message.cost = BigDecimal::zero();
                message.segments = segments;
                self.messages.save(message).await?;
                info!(message_id = %message.id, account_id = %message.account_id, "Insufficient funds, message queued");
                self.report_status(message);
                return Ok(DispatchOutcome::Queued { segments });
            }
            Err(e) => {
                // A fresh message must not be left pending; a queued one goes
                // back on the queue for the next drain.
                if from_queue {
                    message.status = MessageStatus::Queued;
                    if let Err(save_err) = self.messages.save(message).await {
                        error!(message_id = %message.id, "Failed to requeue message: {}", save_err);
                    }
                } else {
                    message.status = MessageStatus::Failed;
                    message.error_message = Some(e.to_string());
                    if let Err(save_err) = self.messages.save(message).await {
                        error!(message_id = %message.id, "Failed to record charge error: {}", save_err);
                    }
                    self.report_status(message);
                }
                return Err(e.into());
            }
        };

        message.cost = charge.cost.clone();
        message.segments = charge.segments;

        let request = self.send_request(message);
        let result = match tokio::time::timeout(self.settings.delivery_timeout, self.gateway.send(&request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.settings.delivery_timeout)),
        };

        match result {
            Ok(receipt) => {
                message.status = MessageStatus::Sent;
                message.gateway_message_id = Some(receipt.gateway_message_id.clone());
                message.sent_at = Some(Utc::now());
                message.error_message = None;
                self.messages.save(message).await?;
                info!(
                    message_id = %message.id,
                    gateway_message_id = %receipt.gateway_message_id,
                    cost = %charge.cost,
                    "Message sent"
                );
                self.report_status(message);
                Ok(DispatchOutcome::Sent {
                    gateway_message_id: receipt.gateway_message_id,
                    cost: charge.cost,
                    segments: charge.segments,
                })
            }
            Err(e) => {
                warn!(message_id = %message.id, "Delivery failed: {}", e);
                let refund = self
                    .compensate(
                        message,
                        &charge.cost,
                        reference,
                        format!("Refund for undelivered message {}", message.id),
                    )
                    .await;

                message.status = MessageStatus::Failed;
                message.error_message = Some(e.to_string());
                if let Err(refund_err) = refund {
                    error!(
                        message_id = %message.id,
                        amount = %charge.cost,
                        "Compensating refund failed: {}",
                        refund_err
                    );
                    message.error_message = Some(format!("{}; refund pending: {}", e, refund_err));
                    self.messages.save(message).await?;
                    self.report_status(message);
                    return Err(refund_err.into());
                }

                message.cost = BigDecimal::zero();
                self.messages.save(message).await?;
                self.report_status(message);

                let reason = if e.is_upstream_unavailable() {
                    FailureReason::UpstreamUnavailable(e.to_string())
                } else {
                    FailureReason::DeliveryFailed(e.to_string())
                };
                Ok(DispatchOutcome::Failed(reason))
            }
        }
    }

    fn send_request(&self, message: &Message) -> SendRequest {
        let from = format_international(&message.from_number, &self.settings.country_code);
        SendRequest {
            body: message.body.clone(),
            to: format_international(&message.to_number, &self.settings.country_code),
            from: (!from.is_empty()).then_some(from),
            delivery_callback: self.settings.delivery_callback.clone(),
            reply_callback: self.settings.reply_callback.clone(),
        }
    }

    /// Take a queued message off the queue before it is charged. Returns
    /// false when the stored row has already left `queued`.
    async fn claim(&self, message: &mut Message) -> Result<bool, DispatchError> {
        if message.status != MessageStatus::Queued {
            return Ok(true);
        }
        match self
            .messages
            .transition(message.id, MessageStatus::Queued, MessageStatus::Pending)
            .await?
        {
            Some(claimed) => {
                *message = claimed;
                Ok(true)
            }
            None => {
                debug!(message_id = %message.id, "Message already claimed");
                Ok(false)
            }
        }
    }

    /// Give a charge back. A zero-cost charge has nothing to return.
    async fn compensate(
        &self,
        message: &Message,
        cost: &BigDecimal,
        reference: String,
        description: String,
    ) -> Result<(), LedgerError> {
        if cost.is_zero() {
            return Ok(());
        }
        self.ledger
            .refund(message.account_id, cost, Some(reference), Some(description))
            .await
            .map(|_| ())
    }

    /// Record an inbound message and hand it to the reporter worker.
    /// Never waits on funds or rate limits.
    pub async fn receive_inbound(&self, new: NewMessage) -> Result<Message, DispatchError> {
        let message = Message::new(new, Direction::Inbound, MessageStatus::Queued);
        self.messages.insert(&message).await?;
        self.reporter.enqueue(ReportJob::Inbound {
            message_id: message.id,
        });
        debug!(message_id = %message.id, "Inbound message queued");
        Ok(message)
    }

    /// Charge for and push one queued inbound message.
    pub async fn handle_inbound(&self, message: &mut Message) -> Result<InboundAttempt, DispatchError> {
        if message.direction != Direction::Inbound || message.status != MessageStatus::Queued {
            return Err(invalid_state(message));
        }
        if !self.claim(message).await? {
            return Ok(InboundAttempt::Skipped);
        }

        let reference = message.reference();
        let charge = match self
            .ledger
            .charge(message.account_id, Direction::Inbound, &message.body, Some(reference.clone()))
            .await
        {
            Ok(charge) => charge,
            Err(e) if e.is_insufficient_funds() => {
                message.status = MessageStatus::Queued;
                message.cost = BigDecimal::zero();
                message.segments = billable_segments(&message.body);
                self.messages.save(message).await?;
                info!(message_id = %message.id, "Insufficient funds for inbound message, left queued");
                return Ok(InboundAttempt::Queued);
            }
            Err(e) => {
                message.status = MessageStatus::Queued;
                if let Err(save_err) = self.messages.save(message).await {
                    error!(message_id = %message.id, "Failed to requeue inbound message: {}", save_err);
                }
                return Err(e.into());
            }
        };

        message.cost = charge.cost.clone();
        message.segments = charge.segments;

        match self.crm.push_inbound(message).await {
            Ok(()) => {
                message.status = MessageStatus::Delivered;
                message.delivered_at = Some(Utc::now());
                message.error_message = None;
                self.messages.save(message).await?;
                info!(message_id = %message.id, cost = %charge.cost, "Inbound message delivered");
                Ok(InboundAttempt::Delivered)
            }
            Err(e) => {
                warn!(message_id = %message.id, "Inbound push failed: {}", e);
                message.status = MessageStatus::Queued;
                if let Err(refund_err) = self
                    .compensate(
                        message,
                        &charge.cost,
                        reference,
                        format!("Refund for undelivered inbound message {}", message.id),
                    )
                    .await
                {
                    error!(message_id = %message.id, amount = %charge.cost, "Inbound refund failed: {}", refund_err);
                    message.error_message = Some(format!("{}; refund pending: {}", e, refund_err));
                    self.messages.save(message).await?;
                    return Err(refund_err.into());
                }
                message.cost = BigDecimal::zero();
                message.error_message = Some(e.to_string());
                self.messages.save(message).await?;
                Ok(InboundAttempt::PushFailed(e))
            }
        }
    }

    /// Settle a queued message as failed. Returns false if it had already left
    /// the queue.
    pub async fn fail_queued(&self, message_id: Uuid, reason: &str) -> Result<bool, DispatchError> {
        let Some(message) = self
            .messages
            .transition(message_id, MessageStatus::Queued, MessageStatus::Failed)
            .await?
        else {
            return Ok(false);
        };
        self.messages.annotate_error(message_id, reason).await?;
        warn!(%message_id, "Queued message failed: {}", reason);
        self.report_status(&message);
        Ok(true)
    }

    /// Apply a provider delivery receipt. The move out of `sent` is a
    /// compare-and-set, so a receipt delivered twice refunds at most once.
    pub async fn apply_delivery_receipt(
        &self,
        gateway_message_id: &str,
        raw_status: &str,
        raw: serde_json::Value,
    ) -> Result<ReceiptOutcome, DispatchError> {
        let message = self
            .messages
            .find_by_gateway_id(gateway_message_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("gateway message {}", gateway_message_id)))?;

        let Some(next) = MessageStatus::from_receipt(raw_status) else {
            self.messages.record_receipt(message.id, &raw).await?;
            debug!(gateway_message_id, raw_status, "Intermediate delivery receipt");
            return Ok(ReceiptOutcome::Ignored);
        };

        let Some(mut updated) = self
            .messages
            .transition(message.id, MessageStatus::Sent, next)
            .await?
        else {
            debug!(gateway_message_id, status = %next, "Duplicate or late delivery receipt");
            return Ok(ReceiptOutcome::Duplicate);
        };

        let error_description = raw
            .get("error_description")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);
        updated.delivery_status = Some(raw);
        match next {
            MessageStatus::Delivered => updated.delivered_at = Some(Utc::now()),
            MessageStatus::Failed | MessageStatus::Expired => {
                updated.error_message = Some(
                    error_description
                        .unwrap_or_else(|| format!("Delivery {}", raw_status.trim().to_lowercase())),
                );
                if updated.cost > BigDecimal::zero() {
                    self.ledger
                        .refund(
                            updated.account_id,
                            &updated.cost,
                            Some(updated.reference()),
                            Some(format!("Refund for {} message {}", next, updated.id)),
                        )
                        .await
                        .map_err(|e| {
                            error!(message_id = %updated.id, amount = %updated.cost, "Receipt refund failed: {}", e);
                            e
                        })?;
                    updated.cost = BigDecimal::zero();
                }
            }
            _ => {}
        }

        self.messages.save(&updated).await?;
        info!(message_id = %updated.id, status = %next, "Delivery receipt applied");
        self.report_status(&updated);
        Ok(ReceiptOutcome::Applied(next))
    }

    fn report_status(&self, message: &Message) {
        if let Some(crm_message_id) = &message.crm_message_id {
            self.reporter.enqueue(ReportJob::Status {
                crm_message_id: crm_message_id.clone(),
                status: message.status,
                message_id: Some(message.id),
            });
        }
    }
}

fn invalid_state(message: &Message) -> DispatchError {
    DispatchError::InvalidState {
        id: message.id,
        direction: message.direction,
        status: message.status,
    }
}
