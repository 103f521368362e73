use crate::audit::AuditLogger;
use crate::errors::{is_unique_violation, AppError};
use crate::models::{
    AuditAction, Conversation, Lead, Message, MessageDirection, MessageStatus,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

/// Default and maximum page sizes for message listing.
const MESSAGE_PAGE_DEFAULT: i64 = 50;
const MESSAGE_PAGE_CAP: i64 = 200;

/// A message about to be appended to a conversation.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub body: String,
    pub direction: MessageDirection,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub status: MessageStatus,
}

impl NewMessage {
    pub fn inbound(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            direction: MessageDirection::Inbound,
            media_type: None,
            media_url: None,
            // Inbound messages already reached us.
            status: MessageStatus::Delivered,
        }
    }

    pub fn outbound(
        body: impl Into<String>,
        media_type: Option<String>,
        media_url: Option<String>,
    ) -> Self {
        Self {
            body: body.into(),
            direction: MessageDirection::Outbound,
            media_type,
            media_url,
            status: MessageStatus::Pending,
        }
    }
}

/// Outcome of applying an asynchronous status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAdvance {
    /// The callback moved the status forward.
    Advanced(MessageStatus),
    /// Duplicate or out-of-order callback; status untouched.
    Ignored(MessageStatus),
}

/// Owns the Conversation entity: one record per (canonical identifier,
/// company), regardless of how many channels touch it.
#[derive(Clone)]
pub struct ConversationStore {
    pool: PgPool,
}

impl ConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Looks up the conversation for the lead's canonical identifier, creating
    /// one tied to the given channel instance when absent.
    ///
    /// Uniqueness on (company_id, identifier) is the store's constraint; a
    /// concurrent creation loses the insert race and re-fetches the winner.
    pub async fn get_or_create(
        &self,
        lead: &Lead,
        instance_id: &str,
    ) -> Result<Conversation, AppError> {
        let identifier = lead.canonical_identifier().ok_or_else(|| {
            AppError::BadRequest(format!("Lead {} has no external identifier", lead.id))
        })?;

        if let Some(existing) = self.find_by_identifier(&lead.company_id, identifier).await? {
            return Ok(existing);
        }

        let insert = sqlx::query_as::<_, Conversation>(
            r#"
            INSERT INTO conversations (id, company_id, lead_id, identifier, instance_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&lead.company_id)
        .bind(lead.id)
        .bind(identifier)
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await;

        match insert {
            Ok(conversation) => {
                tracing::info!(
                    "Created conversation {} for lead {} ({})",
                    conversation.id,
                    lead.id,
                    identifier
                );
                Ok(conversation)
            }
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(
                    "Conversation creation race for ({}, {}); re-fetching",
                    lead.company_id,
                    identifier
                );
                self.find_by_identifier(&lead.company_id, identifier)
                    .await?
                    .ok_or_else(|| {
                        AppError::Conflict(format!(
                            "Conversation for {} exists but could not be re-fetched",
                            identifier
                        ))
                    })
            }
            Err(e) => Err(AppError::DatabaseError(e)),
        }
    }

    pub async fn find_by_identifier(
        &self,
        company_id: &str,
        identifier: &str,
    ) -> Result<Option<Conversation>, AppError> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE company_id = $1 AND identifier = $2 LIMIT 1",
        )
        .bind(company_id)
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conversation)
    }

    pub async fn get(&self, conversation_id: Uuid) -> Result<Option<Conversation>, AppError> {
        let conversation =
            sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(conversation)
    }

    /// Appends a message. History is never reordered or overwritten.
    pub async fn append_message(
        &self,
        conversation_id: Uuid,
        message: NewMessage,
    ) -> Result<Message, AppError> {
        let row = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages
                (id, conversation_id, body, direction, media_type, media_url, status, dispatch_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(&message.body)
        .bind(message.direction.as_str())
        .bind(&message.media_type)
        .bind(&message.media_url)
        .bind(message.status.as_str())
        .fetch_one(&self.pool)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = now() WHERE id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        Ok(row)
    }

    /// Lists messages ascending by creation time.
    ///
    /// Pagination is a timestamp cursor (`since` = created_at of the last seen
    /// message), not an offset, so concurrent inserts don't shift pages.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, AppError> {
        let limit = limit.unwrap_or(MESSAGE_PAGE_DEFAULT).clamp(1, MESSAGE_PAGE_CAP);

        let messages = match since {
            Some(cursor) => {
                sqlx::query_as::<_, Message>(
                    r#"
                    SELECT * FROM messages
                    WHERE conversation_id = $1 AND created_at > $2
                    ORDER BY created_at ASC
                    LIMIT $3
                    "#,
                )
                .bind(conversation_id)
                .bind(cursor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Message>(
                    r#"
                    SELECT * FROM messages
                    WHERE conversation_id = $1
                    ORDER BY created_at ASC
                    LIMIT $2
                    "#,
                )
                .bind(conversation_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(messages)
    }

    pub async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>, AppError> {
        let message = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(message)
    }

    /// Applies an asynchronous delivery/read callback.
    ///
    /// Only forward transitions are applied; duplicates and out-of-order
    /// reports are ignored, not errored. The update is optimistic: a callback
    /// racing another one re-reads and retries once through the same guard.
    pub async fn apply_status_callback(
        &self,
        message_id: Uuid,
        reported: MessageStatus,
    ) -> Result<StatusAdvance, AppError> {
        for _ in 0..2 {
            let message = self.get_message(message_id).await?.ok_or_else(|| {
                AppError::NotFound(format!("Message {} not found", message_id))
            })?;

            let current = MessageStatus::from_str(&message.status).ok_or_else(|| {
                AppError::InternalError(format!(
                    "Message {} has unknown status '{}'",
                    message_id, message.status
                ))
            })?;

            if !current.can_advance_to(reported) {
                tracing::debug!(
                    "Ignoring stale status callback for {}: {} -> {}",
                    message_id,
                    current.as_str(),
                    reported.as_str()
                );
                return Ok(StatusAdvance::Ignored(current));
            }

            let updated = sqlx::query(
                "UPDATE messages SET status = $2 WHERE id = $1 AND status = $3",
            )
            .bind(message_id)
            .bind(reported.as_str())
            .bind(current.as_str())
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() > 0 {
                tracing::info!(
                    "Message {} status: {} -> {}",
                    message_id,
                    current.as_str(),
                    reported.as_str()
                );
                return Ok(StatusAdvance::Advanced(reported));
            }
            // Lost the race against another callback; re-read and re-check.
        }

        let current = self
            .get_message(message_id)
            .await?
            .and_then(|m| MessageStatus::from_str(&m.status))
            .unwrap_or(MessageStatus::Pending);
        Ok(StatusAdvance::Ignored(current))
    }

    /// Explicit cascade deletion: messages, then conversations, then the lead.
    ///
    /// The database does not cascade for us; the order here is the contract.
    /// The audit event snapshots the lead name so the record stays readable
    /// after the row is gone.
    pub async fn delete_lead_cascade(
        &self,
        company_id: &str,
        lead_id: Uuid,
        actor_user_id: Option<Uuid>,
        audit: &AuditLogger,
    ) -> Result<(), AppError> {
        let lead = sqlx::query_as::<_, Lead>(
            "SELECT * FROM leads WHERE id = $1 AND company_id = $2",
        )
        .bind(lead_id)
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM messages
            WHERE conversation_id IN (SELECT id FROM conversations WHERE lead_id = $1)
            "#,
        )
        .bind(lead_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM conversations WHERE lead_id = $1")
            .bind(lead_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM leads WHERE id = $1")
            .bind(lead_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!("Deleted lead {} and its conversation history", lead_id);

        audit
            .record(
                company_id,
                actor_user_id,
                AuditAction::LeadDeleted,
                json!({
                    "lead_id": lead_id.to_string(),
                    "lead_name": lead.name,
                }),
            )
            .await;

        Ok(())
    }
}
