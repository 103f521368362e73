use crate::audit::AuditLogger;
use crate::circuit_breaker::DeliveryCircuitBreaker;
use crate::conversation::{ConversationStore, NewMessage};
use crate::errors::{AppError, ResultExt};
use crate::models::{AuditAction, DispatchPayloadItem, MessageStatus};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use uuid::Uuid;

/// Delivery-provider level failures, split by what we know about the outcome.
#[derive(Debug)]
pub enum DeliveryError {
    /// The call timed out: the provider may or may not have received it.
    Timeout,
    /// The call never reached the provider. Safe to retry.
    Network(String),
    /// The provider answered non-2xx. Terminal for this message.
    Rejected { status: u16, body: String },
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Timeout => write!(f, "delivery request timed out"),
            DeliveryError::Network(msg) => write!(f, "delivery request failed: {}", msg),
            DeliveryError::Rejected { status, body } => {
                write!(f, "delivery provider returned {}: {}", status, body)
            }
        }
    }
}

/// Client for the external delivery provider's webhook endpoint.
///
/// The payload is a single-element array keyed by the internal message id;
/// the provider treats duplicate ids as no-ops, which is what makes retries
/// and reconciliation redispatches idempotent.
#[derive(Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    webhook_url: String,
    token: String,
}

impl DeliveryClient {
    pub fn new(
        webhook_url: String,
        token: String,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                AppError::ExternalDeliveryError(format!("Failed to create delivery client: {}", e))
            })?;

        Ok(Self {
            client,
            webhook_url,
            token,
        })
    }

    /// Submits one outbound message to the provider.
    pub async fn deliver(&self, item: &DispatchPayloadItem) -> Result<(), DeliveryError> {
        tracing::info!(
            "Dispatching message {} for conversation {}",
            item.message_id,
            item.conversa_id
        );

        let response = self
            .client
            .post(&self.webhook_url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&[item])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DeliveryError::Rejected { status, body });
        }

        tracing::info!("Message {} accepted by provider", item.message_id);
        Ok(())
    }

    /// Asks the provider whether it has received the given message id.
    /// 200 means received, 404 means unknown; anything else is a probe failure.
    pub async fn check_receipt(&self, message_id: Uuid) -> Result<bool, DeliveryError> {
        let url = format!(
            "{}/receipts/{}",
            self.webhook_url.trim_end_matches('/'),
            message_id
        );

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Network(e.to_string())
                }
            })?;

        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                Err(DeliveryError::Rejected { status, body })
            }
        }
    }
}

/// Outcome of a dispatch, surfaced to the caller.
///
/// `Pending` means the provider call timed out with an unknown outcome; the
/// message is left for the reconciliation sweep rather than resent blindly.
#[derive(Debug, Serialize)]
pub struct DispatchResult {
    pub message_id: Uuid,
    pub status: MessageStatus,
}

/// Summary of one reconciliation sweep over stale pending messages.
#[derive(Debug, Default, Serialize)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub confirmed_sent: usize,
    pub redispatched: usize,
    pub failed: usize,
}

/// A pending outbound message joined with its conversation coordinates.
#[derive(Debug, FromRow)]
struct PendingOutbound {
    id: Uuid,
    conversation_id: Uuid,
    body: String,
    media_type: Option<String>,
    media_url: Option<String>,
    dispatch_attempts: i32,
    company_id: String,
}

/// Outbound message submission with idempotency and status reconciliation.
#[derive(Clone)]
pub struct DispatchGateway {
    pool: PgPool,
    store: ConversationStore,
    delivery: DeliveryClient,
    breaker: DeliveryCircuitBreaker,
    audit: AuditLogger,
    /// Additional attempts after the first (network failures only).
    max_retries: u32,
}

impl DispatchGateway {
    pub fn new(
        pool: PgPool,
        store: ConversationStore,
        delivery: DeliveryClient,
        breaker: DeliveryCircuitBreaker,
        audit: AuditLogger,
        max_retries: u32,
    ) -> Self {
        Self {
            pool,
            store,
            delivery,
            breaker,
            audit,
            max_retries,
        }
    }

    /// Dispatches one outbound message.
    ///
    /// The message is persisted as `pending` before any network call, so a
    /// crash between persist and send is recoverable by the reconciliation
    /// sweep rather than silently lost. A timed-out provider call is treated
    /// as unknown-outcome: the message stays `pending` and is never resent
    /// from this path.
    pub async fn send(
        &self,
        conversation_id: Uuid,
        body: &str,
        media_type: Option<String>,
        media_url: Option<String>,
        actor_user_id: Option<Uuid>,
    ) -> Result<DispatchResult, AppError> {
        let conversation = self
            .store
            .get(conversation_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Conversation {} not found", conversation_id))
            })?;

        let message = self
            .store
            .append_message(
                conversation_id,
                NewMessage::outbound(body, media_type.clone(), media_url.clone()),
            )
            .await?;

        let item = DispatchPayloadItem {
            conversa_id: conversation.id,
            empresa_id: conversation.company_id.clone(),
            mensage_body: body.to_string(),
            message_type: media_type.unwrap_or_else(|| "text".to_string()),
            message_midia_url: media_url,
            message_id: message.id,
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.bump_attempts(message.id).await?;

            match self.call_provider(&item).await {
                Ok(()) => {
                    self.mark_sent(message.id).await?;
                    self.audit
                        .record(
                            &conversation.company_id,
                            actor_user_id,
                            AuditAction::MessageDispatched,
                            json!({
                                "lead_id": conversation.lead_id.to_string(),
                                "conversation_id": conversation.id.to_string(),
                                "message_id": message.id.to_string(),
                                "attempts": attempt,
                            }),
                        )
                        .await;
                    return Ok(DispatchResult {
                        message_id: message.id,
                        status: MessageStatus::Sent,
                    });
                }
                Err(ProviderCall::CircuitOpen) => {
                    // The breaker refused before any network traffic: the
                    // message was definitely not sent.
                    let reason = "delivery circuit open".to_string();
                    self.mark_failed(message.id, &reason).await?;
                    return Err(AppError::ExternalDeliveryError(reason));
                }
                Err(ProviderCall::Delivery(DeliveryError::Timeout)) => {
                    tracing::warn!(
                        "Dispatch of {} timed out; leaving pending for reconciliation",
                        message.id
                    );
                    return Ok(DispatchResult {
                        message_id: message.id,
                        status: MessageStatus::Pending,
                    });
                }
                Err(ProviderCall::Delivery(err @ DeliveryError::Rejected { .. })) => {
                    let reason = err.to_string();
                    self.mark_failed(message.id, &reason).await?;
                    return Err(AppError::ExternalDeliveryError(reason));
                }
                Err(ProviderCall::Delivery(err @ DeliveryError::Network(_))) => {
                    if attempt <= self.max_retries {
                        let delay = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                        tracing::warn!(
                            "Dispatch of {} failed ({}); retrying in {:?}",
                            message.id,
                            err,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    let reason = err.to_string();
                    self.mark_failed(message.id, &reason).await?;
                    return Err(AppError::ExternalDeliveryError(reason));
                }
            }
        }
    }

    /// Sweeps stale pending outbound messages and settles their fate.
    ///
    /// For each one, the provider is asked whether it received the message:
    /// received means the original call worked and only our acknowledgement
    /// was lost; not received allows at most one idempotent redispatch before
    /// the message is failed. Probe failures leave the message for the next
    /// sweep.
    pub async fn reconcile_pending(
        &self,
        older_than: chrono::Duration,
    ) -> Result<ReconcileSummary, AppError> {
        let cutoff = Utc::now() - older_than;

        let stale = sqlx::query_as::<_, PendingOutbound>(
            r#"
            SELECT m.id, m.conversation_id, m.body, m.media_type, m.media_url,
                   m.dispatch_attempts, c.company_id
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE m.direction = 'out' AND m.status = 'pending' AND m.created_at < $1
            ORDER BY m.created_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("fetching stale pending outbound messages")?;

        let mut summary = ReconcileSummary {
            examined: stale.len(),
            ..Default::default()
        };

        for pending in stale {
            match self.delivery.check_receipt(pending.id).await {
                Ok(true) => {
                    self.mark_sent(pending.id).await?;
                    summary.confirmed_sent += 1;
                }
                Ok(false) => {
                    if pending.dispatch_attempts <= self.max_retries as i32 {
                        self.redispatch(&pending, &mut summary).await?;
                    } else {
                        self.mark_failed(
                            pending.id,
                            "not received by provider after retries",
                        )
                        .await?;
                        summary.failed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Receipt probe for {} failed ({}); will retry next sweep",
                        pending.id,
                        e
                    );
                }
            }
        }

        if summary.examined > 0 {
            tracing::info!(
                "Reconciliation: {} examined, {} confirmed, {} redispatched, {} failed",
                summary.examined,
                summary.confirmed_sent,
                summary.redispatched,
                summary.failed
            );
        }

        Ok(summary)
    }

    /// One idempotent redispatch of a message the provider never received.
    async fn redispatch(
        &self,
        pending: &PendingOutbound,
        summary: &mut ReconcileSummary,
    ) -> Result<(), AppError> {
        let item = DispatchPayloadItem {
            conversa_id: pending.conversation_id,
            empresa_id: pending.company_id.clone(),
            mensage_body: pending.body.clone(),
            message_type: pending
                .media_type
                .clone()
                .unwrap_or_else(|| "text".to_string()),
            message_midia_url: pending.media_url.clone(),
            message_id: pending.id,
        };

        self.bump_attempts(pending.id).await?;
        summary.redispatched += 1;

        match self.call_provider(&item).await {
            Ok(()) => {
                self.mark_sent(pending.id).await?;
                summary.confirmed_sent += 1;
            }
            Err(ProviderCall::Delivery(DeliveryError::Timeout)) => {
                // Unknown outcome again; attempts are exhausted now, so the
                // next sweep settles it from the receipt probe alone.
                tracing::warn!("Redispatch of {} timed out; left pending", pending.id);
            }
            Err(e) => {
                let reason = match e {
                    ProviderCall::CircuitOpen => "delivery circuit open".to_string(),
                    ProviderCall::Delivery(err) => err.to_string(),
                };
                self.mark_failed(pending.id, &reason).await?;
                summary.failed += 1;
            }
        }

        Ok(())
    }

    async fn call_provider(&self, item: &DispatchPayloadItem) -> Result<(), ProviderCall> {
        use failsafe::futures::CircuitBreaker;

        self.breaker
            .call(self.delivery.deliver(item))
            .await
            .map_err(|e| match e {
                failsafe::Error::Inner(delivery) => ProviderCall::Delivery(delivery),
                failsafe::Error::Rejected => ProviderCall::CircuitOpen,
            })
    }

    async fn bump_attempts(&self, message_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE messages SET dispatch_attempts = dispatch_attempts + 1 WHERE id = $1",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_sent(&self, message_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE messages SET status = 'sent' WHERE id = $1 AND status = 'pending'")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, message_id: Uuid, reason: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE messages SET status = 'failed', error_message = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(message_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

enum ProviderCall {
    Delivery(DeliveryError),
    CircuitOpen,
}
