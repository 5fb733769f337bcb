use crate::db::models::AccountRow;
use crate::domain::{Account, NewAccount};
use crate::error::RepositoryError;
use crate::ports::AccountRepository;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgAccountRepository {
    pool: PgPool,
}

impl PgAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    async fn upsert(&self, account: NewAccount) -> Result<Account, RepositoryError> {
        let fresh = Account::new(account);
        let row = sqlx::query_as::<_, AccountRow>(
            "INSERT INTO accounts (id, external_id, display_name, contact_name, contact_email, contact_phone, sender_number, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (external_id) DO UPDATE SET \
                display_name = EXCLUDED.display_name, \
                contact_name = EXCLUDED.contact_name, \
                contact_email = EXCLUDED.contact_email, \
                contact_phone = EXCLUDED.contact_phone, \
                sender_number = EXCLUDED.sender_number, \
                updated_at = NOW() \
             RETURNING *",
        )
        .bind(fresh.id)
        .bind(&fresh.external_id)
        .bind(&fresh.display_name)
        .bind(&fresh.contact_name)
        .bind(&fresh.contact_email)
        .bind(&fresh.contact_phone)
        .bind(&fresh.sender_number)
        .bind(fresh.created_at)
        .bind(fresh.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Account>, RepositoryError> {
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Account::from))
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Account>, RepositoryError> {
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Account::from))
    }
}
