//! In-process stores with the same locking contract as the Postgres ones.
//! Used by the service and scenario tests.

use crate::domain::{Account, LedgerEntry, Message, MessageStatus, NewAccount, Wallet, WalletRates};
use crate::error::{LedgerError, RepositoryError};
use crate::ports::{AccountRepository, Committed, LedgerStore, MessageRepository, WalletMutation};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

struct WalletCell {
    wallet: Wallet,
    entries: Vec<LedgerEntry>,
}

/// One mutex per wallet: mutations of a wallet serialize, different wallets
/// never contend beyond the brief map lookup.
#[derive(Default)]
pub struct MemoryLedgerStore {
    wallets: RwLock<HashMap<Uuid, Arc<Mutex<WalletCell>>>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cell(&self, account_id: Uuid) -> Option<Arc<Mutex<WalletCell>>> {
        self.wallets.read().await.get(&account_id).cloned()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn ensure_wallet(
        &self,
        account_id: Uuid,
        rates: &WalletRates,
    ) -> Result<Wallet, LedgerError> {
        let cell = {
            let mut wallets = self.wallets.write().await;
            wallets
                .entry(account_id)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(WalletCell {
                        wallet: Wallet::new(account_id, rates),
                        entries: Vec::new(),
                    }))
                })
                .clone()
        };
        let guard = cell.lock().await;
        Ok(guard.wallet.clone())
    }

    async fn wallet(&self, account_id: Uuid) -> Result<Option<Wallet>, LedgerError> {
        match self.cell(account_id).await {
            Some(cell) => Ok(Some(cell.lock().await.wallet.clone())),
            None => Ok(None),
        }
    }

    async fn mutate(
        &self,
        account_id: Uuid,
        mutation: WalletMutation,
    ) -> Result<Committed, LedgerError> {
        let cell = self
            .cell(account_id)
            .await
            .ok_or(LedgerError::WalletNotFound(account_id))?;
        let mut guard = cell.lock().await;

        // Work on a copy so a failed mutation leaves the stored wallet untouched.
        let mut wallet = guard.wallet.clone();
        let draft = mutation(&mut wallet)?;
        wallet.updated_at = Utc::now();

        let entry = draft.map(|draft| draft.into_entry(&wallet));
        if let Some(entry) = &entry {
            guard.entries.push(entry.clone());
        }
        guard.wallet = wallet.clone();
        Ok(Committed { wallet, entry })
    }

    async fn history(&self, account_id: Uuid, limit: i64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let Some(cell) = self.cell(account_id).await else {
            return Ok(Vec::new());
        };
        let guard = cell.lock().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(guard.entries.iter().rev().take(limit).cloned().collect())
    }

    async fn mirrored_wallets(&self) -> Result<Vec<Wallet>, LedgerError> {
        let cells: Vec<_> = self.wallets.read().await.values().cloned().collect();
        let mut wallets = Vec::new();
        for cell in cells {
            let guard = cell.lock().await;
            if guard.wallet.external_ref.is_some() {
                wallets.push(guard.wallet.clone());
            }
        }
        wallets.sort_by_key(|w| w.created_at);
        Ok(wallets)
    }
}

#[derive(Default)]
pub struct MemoryMessageRepository {
    messages: RwLock<HashMap<Uuid, (u64, Message)>>,
    seq: AtomicU64,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Message> {
        let messages = self.messages.read().await;
        let mut all: Vec<_> = messages.values().cloned().collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, m)| m).collect()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn insert(&self, message: &Message) -> Result<(), RepositoryError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.messages
            .write()
            .await
            .insert(message.id, (seq, message.clone()));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>, RepositoryError> {
        Ok(self.messages.read().await.get(&id).map(|(_, m)| m.clone()))
    }

    async fn find_by_gateway_id(
        &self,
        gateway_message_id: &str,
    ) -> Result<Option<Message>, RepositoryError> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .map(|(_, m)| m)
            .find(|m| m.gateway_message_id.as_deref() == Some(gateway_message_id))
            .cloned())
    }

    async fn queued_for_account(&self, account_id: Uuid) -> Result<Vec<Message>, RepositoryError> {
        let messages = self.messages.read().await;
        let mut queued: Vec<_> = messages
            .values()
            .filter(|(_, m)| m.account_id == account_id && m.status == MessageStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by(|(a_seq, a), (b_seq, b)| {
            a.created_at.cmp(&b.created_at).then(a_seq.cmp(b_seq))
        });
        Ok(queued.into_iter().map(|(_, m)| m).collect())
    }

    async fn save(&self, message: &Message) -> Result<(), RepositoryError> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&message.id) {
            Some((_, stored)) => {
                *stored = message.clone();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("message {}", message.id))),
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<Option<Message>, RepositoryError> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&id) {
            Some((_, stored)) if stored.status == from => {
                stored.status = to;
                stored.updated_at = Utc::now();
                Ok(Some(stored.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn annotate_error(&self, id: Uuid, error: &str) -> Result<(), RepositoryError> {
        if let Some((_, stored)) = self.messages.write().await.get_mut(&id) {
            stored.error_message = Some(error.to_string());
            stored.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_receipt(
        &self,
        id: Uuid,
        receipt: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        if let Some((_, stored)) = self.messages.write().await.get_mut(&id) {
            stored.delivery_status = Some(receipt.clone());
            stored.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAccountRepository {
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn upsert(&self, account: NewAccount) -> Result<Account, RepositoryError> {
        let mut accounts = self.accounts.write().await;
        let stored = match accounts.get(&account.external_id) {
            Some(existing) => Account {
                id: existing.id,
                created_at: existing.created_at,
                ..Account::new(account)
            },
            None => Account::new(account),
        };
        accounts.insert(stored.external_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Account>, RepositoryError> {
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Account>, RepositoryError> {
        Ok(self.accounts.read().await.get(external_id).cloned())
    }
}
