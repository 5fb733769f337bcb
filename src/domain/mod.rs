//! Framework-agnostic billing entities.

pub mod account;
pub mod message;
pub mod segments;
pub mod wallet;

pub use account::{Account, NewAccount};
pub use message::{Direction, Message, MessageStatus, NewMessage};
pub use wallet::{EntryDraft, EntryKind, LedgerEntry, Quote, Wallet, WalletRates};
