//! Storage seams. The Postgres implementations live in `db`, the in-memory
//! ones in `db::memory`.

use crate::domain::{
    Account, EntryDraft, LedgerEntry, Message, MessageStatus, NewAccount, Wallet, WalletRates,
};
use crate::error::{LedgerError, RepositoryError};
use async_trait::async_trait;
use uuid::Uuid;

/// A read-modify-write step applied to a wallet while its row is locked.
/// Returning `Err` aborts the whole unit; returning `Some(draft)` appends one
/// ledger entry in the same unit.
pub type WalletMutation =
    Box<dyn FnOnce(&mut Wallet) -> Result<Option<EntryDraft>, LedgerError> + Send>;

/// Result of a committed wallet mutation.
#[derive(Debug, Clone)]
pub struct Committed {
    pub wallet: Wallet,
    pub entry: Option<LedgerEntry>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Return the account's wallet, creating it with `rates` on first use.
    async fn ensure_wallet(&self, account_id: Uuid, rates: &WalletRates)
        -> Result<Wallet, LedgerError>;

    async fn wallet(&self, account_id: Uuid) -> Result<Option<Wallet>, LedgerError>;

    /// Apply `mutation` under an exclusive lock on the account's wallet.
    /// Mutations on different wallets never wait on each other.
    async fn mutate(&self, account_id: Uuid, mutation: WalletMutation)
        -> Result<Committed, LedgerError>;

    /// Ledger entries, newest first.
    async fn history(&self, account_id: Uuid, limit: i64) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Wallets that have a record in the external system of record.
    async fn mirrored_wallets(&self) -> Result<Vec<Wallet>, LedgerError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn insert(&self, message: &Message) -> Result<(), RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<Message>, RepositoryError>;

    async fn find_by_gateway_id(
        &self,
        gateway_message_id: &str,
    ) -> Result<Option<Message>, RepositoryError>;

    /// Queued messages of one account, oldest first.
    async fn queued_for_account(&self, account_id: Uuid) -> Result<Vec<Message>, RepositoryError>;

    async fn save(&self, message: &Message) -> Result<(), RepositoryError>;

    /// Compare-and-set on status. Returns the updated message only when the
    /// stored status was `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<Option<Message>, RepositoryError>;

    async fn annotate_error(&self, id: Uuid, error: &str) -> Result<(), RepositoryError>;

    /// Store a raw provider receipt. Status and cost are left as they are.
    async fn record_receipt(&self, id: Uuid, receipt: &serde_json::Value)
        -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Insert or update by `external_id`. The internal id never changes.
    async fn upsert(&self, account: NewAccount) -> Result<Account, RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<Account>, RepositoryError>;

    async fn find_by_external_id(&self, external_id: &str)
        -> Result<Option<Account>, RepositoryError>;
}
