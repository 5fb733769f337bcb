//! Wallet and ledger entry entities.
//!
//! All money is `BigDecimal` at a fixed ledger scale. Segment counters are
//! segment-equivalents of credits at the outbound rate: `segments_remaining`
//! and `segments_purchased` are derived on read and never stored.

use crate::domain::message::Direction;
use crate::domain::segments::billable_segments;
use crate::error::LedgerError;
use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Decimal places kept for every stored amount and rate.
pub const LEDGER_SCALE: i64 = 4;

/// Coerce an amount to the ledger's exact representation.
pub fn to_ledger_amount(amount: &BigDecimal) -> BigDecimal {
    amount.with_scale(LEDGER_SCALE)
}

/// Whole segments purchasable with `credits` at `rate`, truncated toward zero.
/// A non-positive rate yields 0.
pub fn credits_to_segments(credits: &BigDecimal, rate: &BigDecimal) -> i64 {
    if *rate <= BigDecimal::zero() || *credits <= BigDecimal::zero() {
        return 0;
    }
    (credits / rate).with_scale(0).to_i64().unwrap_or(0).max(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletRates {
    pub inbound: BigDecimal,
    pub outbound: BigDecimal,
}

impl WalletRates {
    pub fn new(inbound: BigDecimal, outbound: BigDecimal) -> Self {
        Self {
            inbound: to_ledger_amount(&inbound),
            outbound: to_ledger_amount(&outbound),
        }
    }
}

/// Price of one message for a given wallet and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub segments: i64,
    pub cost: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wallet {
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

impl Wallet {
    pub fn new(account_id: Uuid, rates: &WalletRates) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            balance: to_ledger_amount(&BigDecimal::zero()),
            inbound_rate: rates.inbound.clone(),
            outbound_rate: rates.outbound.clone(),
            purchased_total: to_ledger_amount(&BigDecimal::zero()),
            spent_total: to_ledger_amount(&BigDecimal::zero()),
            segments_used: 0,
            external_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Remaining credits are the balance; there is no second copy to drift.
    pub fn remaining_credits(&self) -> &BigDecimal {
        &self.balance
    }

    pub fn segments_remaining(&self) -> i64 {
        credits_to_segments(&self.balance, &self.outbound_rate)
    }

    pub fn segments_purchased(&self) -> i64 {
        credits_to_segments(&self.purchased_total, &self.outbound_rate)
    }

    pub fn rate(&self, direction: Direction) -> &BigDecimal {
        match direction {
            Direction::Inbound => &self.inbound_rate,
            Direction::Outbound => &self.outbound_rate,
        }
    }

    pub fn quote(&self, direction: Direction, body: &str) -> Quote {
        let segments = billable_segments(body);
        let cost = to_ledger_amount(&(BigDecimal::from(segments) * self.rate(direction)));
        Quote { segments, cost }
    }

    /// Remove `amount` from the balance. Fails without touching any field when
    /// the balance does not cover it.
    pub fn debit(&mut self, amount: &BigDecimal) -> Result<(), LedgerError> {
        let amount = to_ledger_amount(amount);
        if self.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available: self.balance.clone(),
            });
        }
        self.segments_used += credits_to_segments(&amount, &self.outbound_rate);
        self.spent_total = to_ledger_amount(&(&self.spent_total + &amount));
        self.balance = to_ledger_amount(&(&self.balance - &amount));
        Ok(())
    }

    /// Return `amount` to the balance, unwinding spend counters (floored at zero).
    pub fn refund(&mut self, amount: &BigDecimal) {
        let amount = to_ledger_amount(amount);
        let segments = credits_to_segments(&amount, &self.outbound_rate);
        self.segments_used = (self.segments_used - segments).max(0);
        let spent = &self.spent_total - &amount;
        self.spent_total = if spent < BigDecimal::zero() {
            to_ledger_amount(&BigDecimal::zero())
        } else {
            to_ledger_amount(&spent)
        };
        self.balance = to_ledger_amount(&(&self.balance + &amount));
    }

    pub fn top_up(&mut self, amount: &BigDecimal) {
        let amount = to_ledger_amount(amount);
        self.purchased_total = to_ledger_amount(&(&self.purchased_total + &amount));
        self.balance = to_ledger_amount(&(&self.balance + &amount));
    }

    pub fn set_rates(&mut self, rates: &WalletRates) {
        self.inbound_rate = rates.inbound.clone();
        self.outbound_rate = rates.outbound.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Credit,
    Debit,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Credit => "credit",
            EntryKind::Debit => "debit",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(EntryKind::Credit),
            "debit" => Ok(EntryKind::Debit),
            other => Err(format!("unknown ledger entry kind: {}", other)),
        }
    }
}

/// Immutable record of one committed balance mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub kind: EntryKind,
    pub amount: BigDecimal,
    pub balance_after: BigDecimal,
    pub description: String,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Ledger entry produced by a wallet mutation before the store stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub kind: EntryKind,
    pub amount: BigDecimal,
    pub description: String,
    pub reference_id: Option<String>,
}

impl EntryDraft {
    pub fn credit(amount: &BigDecimal, description: impl Into<String>, reference_id: Option<String>) -> Self {
        Self {
            kind: EntryKind::Credit,
            amount: to_ledger_amount(amount),
            description: description.into(),
            reference_id,
        }
    }

    pub fn debit(amount: &BigDecimal, description: impl Into<String>, reference_id: Option<String>) -> Self {
        Self {
            kind: EntryKind::Debit,
            amount: to_ledger_amount(amount),
            description: description.into(),
            reference_id,
        }
    }

    pub fn into_entry(self, wallet: &Wallet) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            kind: self.kind,
            amount: self.amount,
            balance_after: wallet.balance.clone(),
            description: self.description,
            reference_id: self.reference_id,
            created_at: Utc::now(),
        }
    }
}
