use crate::db::models::MessageRow;
use crate::domain::{Message, MessageStatus};
use crate::error::RepositoryError;
use crate::ports::MessageRepository;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn insert(&self, message: &Message) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO messages (id, account_id, direction, body, to_number, from_number, status, cost, segments, \
             gateway_message_id, crm_message_id, crm_conversation_id, crm_contact_id, delivery_status, error_message, \
             sent_at, delivered_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
        )
        .bind(message.id)
        .bind(message.account_id)
        .bind(message.direction.as_str())
        .bind(&message.body)
        .bind(&message.to_number)
        .bind(&message.from_number)
        .bind(message.status.as_str())
        .bind(&message.cost)
        .bind(message.segments)
        .bind(&message.gateway_message_id)
        .bind(&message.crm_message_id)
        .bind(&message.crm_conversation_id)
        .bind(&message.crm_contact_id)
        .bind(&message.delivery_status)
        .bind(&message.error_message)
        .bind(message.sent_at)
        .bind(message.delivered_at)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Message::try_from).transpose()
    }

    async fn find_by_gateway_id(
        &self,
        gateway_message_id: &str,
    ) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE gateway_message_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(gateway_message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Message::try_from).transpose()
    }

    async fn queued_for_account(&self, account_id: Uuid) -> Result<Vec<Message>, RepositoryError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE account_id = $1 AND status = 'queued' ORDER BY created_at ASC, id ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn save(&self, message: &Message) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE messages SET status = $2, cost = $3, segments = $4, gateway_message_id = $5, \
             delivery_status = $6, error_message = $7, sent_at = $8, delivered_at = $9, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(message.id)
        .bind(message.status.as_str())
        .bind(&message.cost)
        .bind(message.segments)
        .bind(&message.gateway_message_id)
        .bind(&message.delivery_status)
        .bind(&message.error_message)
        .bind(message.sent_at)
        .bind(message.delivered_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("message {}", message.id)));
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query_as::<_, MessageRow>(
            "UPDATE messages SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2 RETURNING *",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Message::try_from).transpose()
    }

    async fn annotate_error(&self, id: Uuid, error: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE messages SET error_message = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_receipt(
        &self,
        id: Uuid,
        receipt: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE messages SET delivery_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
