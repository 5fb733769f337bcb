//! Message entity and its status lifecycle.

use crate::domain::segments::billable_segments;
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Lifecycle of a message.
///
/// ```text
/// pending -> sent | failed | queued
/// queued  -> sent | delivered | failed | queued
/// sent    -> delivered | failed | expired
/// ```
/// `delivered`, `failed` and `expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered | MessageStatus::Failed | MessageStatus::Expired
        )
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (*self, next),
            (Pending, Sent | Failed | Queued)
                | (Queued, Sent | Delivered | Failed | Queued)
                | (Sent, Delivered | Failed | Expired)
        )
    }

    /// Map a gateway delivery receipt status onto the lifecycle. Unknown
    /// receipts (e.g. intermediate `enroute`) map to `None`.
    pub fn from_receipt(raw: &str) -> Option<MessageStatus> {
        match raw.trim().to_lowercase().as_str() {
            "delivered" | "success" => Some(MessageStatus::Delivered),
            "failed" | "error" | "hard-bounce" | "soft-bounce" => Some(MessageStatus::Failed),
            "expired" => Some(MessageStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "queued" => Ok(MessageStatus::Queued),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "failed" => Ok(MessageStatus::Failed),
            "expired" => Ok(MessageStatus::Expired),
            other => Err(format!("unknown message status: {}", other)),
        }
    }
}

/// Fields supplied when traffic is submitted or received.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub account_id: Uuid,
    pub body: String,
    pub to_number: String,
    pub from_number: String,
    pub crm_message_id: Option<String>,
    pub crm_conversation_id: Option<String>,
    pub crm_contact_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub account_id: Uuid,
    pub direction: Direction,
    pub body: String,
    pub to_number: String,
    pub from_number: String,
    pub status: MessageStatus,
    pub cost: BigDecimal,
    pub segments: i64,
    pub gateway_message_id: Option<String>,
    pub crm_message_id: Option<String>,
    pub crm_conversation_id: Option<String>,
    pub crm_contact_id: Option<String>,
    pub delivery_status: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(new: NewMessage, direction: Direction, status: MessageStatus) -> Self {
        let now = Utc::now();
        let segments = billable_segments(&new.body);
        Self {
            id: Uuid::new_v4(),
            account_id: new.account_id,
            direction,
            body: new.body,
            to_number: new.to_number,
            from_number: new.from_number,
            status,
            cost: BigDecimal::zero(),
            segments,
            gateway_message_id: None,
            crm_message_id: new.crm_message_id,
            crm_conversation_id: new.crm_conversation_id,
            crm_contact_id: new.crm_contact_id,
            delivery_status: None,
            error_message: None,
            sent_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Correlation id used for ledger entries tied to this message.
    pub fn reference(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Queued,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Failed,
            MessageStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("processing".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn test_transitions() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Pending.can_transition_to(Sent));
        assert!(Queued.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Delivered));
        assert!(Sent.can_transition_to(Expired));
        assert!(!Sent.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Delivered.can_transition_to(Failed));
        assert!(!Expired.can_transition_to(Delivered));
    }

    #[test]
    fn test_terminal_states() {
        assert!(MessageStatus::Delivered.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(MessageStatus::Expired.is_terminal());
        assert!(!MessageStatus::Queued.is_terminal());
        assert!(!MessageStatus::Sent.is_terminal());
    }

    #[test]
    fn test_receipt_mapping() {
        assert_eq!(MessageStatus::from_receipt("DELIVERED"), Some(MessageStatus::Delivered));
        assert_eq!(MessageStatus::from_receipt("success"), Some(MessageStatus::Delivered));
        assert_eq!(MessageStatus::from_receipt("hard-bounce"), Some(MessageStatus::Failed));
        assert_eq!(MessageStatus::from_receipt("soft-bounce"), Some(MessageStatus::Failed));
        assert_eq!(MessageStatus::from_receipt("expired"), Some(MessageStatus::Expired));
        assert_eq!(MessageStatus::from_receipt("enroute"), None);
    }

    #[test]
    fn test_new_message_defaults() {
        let msg = Message::new(
            NewMessage {
                account_id: Uuid::new_v4(),
                body: "hi".to_string(),
                to_number: "61400000000".to_string(),
                from_number: "61400000001".to_string(),
                ..Default::default()
            },
            Direction::Outbound,
            MessageStatus::Pending,
        );
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.cost, BigDecimal::zero());
        assert_eq!(msg.segments, 1);
        assert_eq!(msg.reference(), msg.id.to_string());
    }
}
