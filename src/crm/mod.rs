//! The external system of record: conversation status updates, inbound
//! message pushes and the wallet mirror record.

pub mod client;

use crate::domain::{Message, MessageStatus, Wallet};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use serde_json::json;
use thiserror::Error;

pub use client::CrmClient;

#[derive(Error, Debug)]
pub enum CrmError {
    #[error("CRM rate limit exceeded")]
    RateLimited,
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("CRM rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Message {0} has no CRM context")]
    MissingContext(String),
}

/// Status vocabulary accepted by the conversations API. It has no `failed`,
/// so failures surface as `pending` for the user to retry.
pub fn crm_status(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Failed | MessageStatus::Queued | MessageStatus::Pending => "pending",
        MessageStatus::Expired => "undelivered",
        other => other.as_str(),
    }
}

#[async_trait]
pub trait CrmSink: Send + Sync {
    async fn update_message_status(
        &self,
        crm_message_id: &str,
        status: MessageStatus,
    ) -> Result<(), CrmError>;

    async fn push_inbound(&self, message: &Message) -> Result<(), CrmError>;
}

/// Counters pushed to a wallet's mirror record.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorSnapshot {
    pub remaining_credits: BigDecimal,
    pub segments_remaining: i64,
    pub spent_total: BigDecimal,
    pub segments_used: i64,
    pub outbound_rate: BigDecimal,
}

impl MirrorSnapshot {
    pub fn from_wallet(wallet: &Wallet) -> Self {
        Self {
            remaining_credits: wallet.remaining_credits().clone(),
            segments_remaining: wallet.segments_remaining(),
            spent_total: wallet.spent_total.clone(),
            segments_used: wallet.segments_used,
            outbound_rate: wallet.outbound_rate.clone(),
        }
    }

    /// Record properties in the shape the custom-object API expects. Money
    /// leaves the exact decimal type only here, at the wire.
    pub fn to_properties(&self) -> serde_json::Value {
        fn money(value: &BigDecimal) -> serde_json::Value {
            json!({ "currency": "default", "value": value.to_f64().unwrap_or(0.0) })
        }
        json!({
            "cred_remaining": money(&self.remaining_credits),
            "seg_remaining": self.segments_remaining,
            "cred_spent": money(&self.spent_total),
            "seg_used": self.segments_used,
            "seg_rates": money(&self.outbound_rate),
        })
    }
}

#[async_trait]
pub trait LedgerMirror: Send + Sync {
    async fn push_counters(
        &self,
        external_ref: &str,
        snapshot: &MirrorSnapshot,
    ) -> Result<(), CrmError>;
}
