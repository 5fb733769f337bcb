//! Row shapes as stored in Postgres, and their conversion to domain types.

use crate::domain::{Account, LedgerEntry, Message, Wallet};
use crate::error::{LedgerError, RepositoryError};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub struct WalletRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub balance: BigDecimal,
    pub inbound_rate: BigDecimal,
    pub outbound_rate: BigDecimal,
    pub purchased_total: BigDecimal,
    pub spent_total: BigDecimal,
    pub segments_used: i64,
    pub external_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WalletRow> for Wallet {
    fn from(row: WalletRow) -> Self {
        Wallet {
            id: row.id,
            account_id: row.account_id,
            balance: row.balance,
            inbound_rate: row.inbound_rate,
            outbound_rate: row.outbound_rate,
            purchased_total: row.purchased_total,
            spent_total: row.spent_total,
            segments_used: row.segments_used,
            external_ref: row.external_ref,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct LedgerEntryRow {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub kind: String,
    pub amount: BigDecimal,
    pub balance_after: BigDecimal,
    pub description: String,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<LedgerEntryRow> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(row: LedgerEntryRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: row.id,
            wallet_id: row.wallet_id,
            kind: row.kind.parse().map_err(LedgerError::Corrupt)?,
            amount: row.amount,
            balance_after: row.balance_after,
            description: row.description,
            reference_id: row.reference_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub direction: String,
    pub body: String,
    pub to_number: String,
    pub from_number: String,
    pub status: String,
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

impl TryFrom<MessageRow> for Message {
    type Error = RepositoryError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            account_id: row.account_id,
            direction: row.direction.parse().map_err(RepositoryError::Corrupt)?,
            body: row.body,
            to_number: row.to_number,
            from_number: row.from_number,
            status: row.status.parse().map_err(RepositoryError::Corrupt)?,
            cost: row.cost,
            segments: row.segments,
            gateway_message_id: row.gateway_message_id,
            crm_message_id: row.crm_message_id,
            crm_conversation_id: row.crm_conversation_id,
            crm_contact_id: row.crm_contact_id,
            delivery_status: row.delivery_status,
            error_message: row.error_message,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct AccountRow {
    pub id: Uuid,
    pub external_id: String,
    pub display_name: String,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub sender_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: row.id,
            external_id: row.external_id,
            display_name: row.display_name,
            contact_name: row.contact_name,
            contact_email: row.contact_email,
            contact_phone: row.contact_phone,
            sender_number: row.sender_number,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
