use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A customer location in the external system of record. Owns one wallet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
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

#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub external_id: String,
    pub display_name: String,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub sender_number: Option<String>,
}

impl Account {
    pub fn new(new: NewAccount) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            external_id: new.external_id,
            display_name: new.display_name,
            contact_name: new.contact_name,
            contact_email: new.contact_email,
            contact_phone: new.contact_phone,
            sender_number: new.sender_number,
            created_at: now,
            updated_at: now,
        }
    }
}
