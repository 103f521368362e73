use crate::audit::AuditLogger;
use crate::config::Config;
use crate::conversation::{ConversationStore, StatusAdvance};
use crate::dispatch::{DispatchGateway, ReconcileSummary};
use crate::errors::AppError;
use crate::identity::IdentityResolver;
use crate::intake::validate_webhook_secret;
use crate::models::{
    AuditEvent, DeliveryCallback, Handler, Message, MessageStatus, QualificationRequest,
    ResponsibleEntry, SendMessageRequest, ToggleRequest, ToggleResponse, TransferRequest,
};
use crate::realtime::{RealtimeEvent, RealtimePublisher};
use crate::responsibility::ResponsibilityEngine;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub resolver: IdentityResolver,
    pub store: ConversationStore,
    pub engine: ResponsibilityEngine,
    pub gateway: DispatchGateway,
    pub audit: AuditLogger,
    pub realtime: RealtimePublisher,
    /// Short-TTL dedup of repeated intake webhook deliveries.
    pub recent_event_cache: Cache<String, i64>,
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    sqlx::query("SELECT 1").execute(&state.db).await?;

    Ok(Json(json!({
        "status": "healthy",
        "service": "conversa-core",
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// Send an outbound message on a conversation.
///
/// Returns 200 with the message id and its status after the dispatch
/// attempt. A provider timeout leaves the message pending; the
/// reconciliation sweep settles it later.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.body.trim().is_empty() {
        return Err(AppError::BadRequest("Message body is empty".to_string()));
    }

    let result = state
        .gateway
        .send(
            conversation_id,
            &req.body,
            req.media_type,
            req.media_url,
            req.actor_user_id,
        )
        .await?;

    state.realtime.publish(&RealtimeEvent::new(
        "message:dispatched",
        "",
        json!({
            "conversation_id": conversation_id.to_string(),
            "message_id": result.message_id.to_string(),
            "status": result.status.as_str(),
        }),
    ));

    Ok(Json(json!({
        "message_id": result.message_id,
        "status": result.status.as_str(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    /// Return only messages strictly newer than this timestamp.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// List messages of a conversation, oldest first, with an incremental
/// `since` cursor for polling clients.
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<Message>>, AppError> {
    state
        .store
        .get(conversation_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Conversation {} not found", conversation_id)))?;

    let messages = state
        .store
        .list_messages(conversation_id, query.since, query.limit)
        .await?;

    Ok(Json(messages))
}

/// Flip who answers the lead's conversation between human and agent.
pub async fn toggle_responsibility(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<ToggleResponse>, AppError> {
    let hint = req.current_status.as_deref().and_then(Handler::from_label);
    let context = req.context.as_deref().unwrap_or("api");

    let new_handler = state
        .engine
        .toggle(&req.company_id, lead_id, hint, req.actor_user_id, context)
        .await?;

    state.realtime.publish(&RealtimeEvent::new(
        "responsibility:toggled",
        &req.company_id,
        json!({
            "lead_id": lead_id.to_string(),
            "quem_atende": new_handler.as_str(),
        }),
    ));

    Ok(Json(ToggleResponse {
        lead_id,
        quem_atende: new_handler.as_str().to_string(),
    }))
}

/// Reassign the lead to a specific human or agent.
pub async fn transfer_lead(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
    Json(req): Json<TransferRequest>,
) -> Result<StatusCode, AppError> {
    let context = req.context.as_deref().unwrap_or("api").to_string();
    let company_id = req.company_id.clone();

    state
        .engine
        .transfer(&company_id, lead_id, req.target, req.actor_user_id, &context)
        .await?;

    state.realtime.publish(&RealtimeEvent::new(
        "lead:transferred",
        &company_id,
        json!({ "lead_id": lead_id.to_string() }),
    ));

    Ok(StatusCode::NO_CONTENT)
}

/// Update the lead's qualification label.
pub async fn update_qualification(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
    Json(req): Json<QualificationRequest>,
) -> Result<StatusCode, AppError> {
    state
        .engine
        .update_qualification(&req.company_id, lead_id, &req.qualification, req.actor_user_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CompanyScope {
    pub company_id: String,
    pub actor_user_id: Option<Uuid>,
}

/// Delete a lead with its conversations and messages.
pub async fn delete_lead(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
    Query(scope): Query<CompanyScope>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .delete_lead_cascade(&scope.company_id, lead_id, scope.actor_user_id, &state.audit)
        .await?;

    state.realtime.publish(&RealtimeEvent::new(
        "lead:deleted",
        &scope.company_id,
        json!({ "lead_id": lead_id.to_string() }),
    ));

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ResyncRequest {
    pub company_id: String,
    pub actor_user_id: Option<Uuid>,
}

/// Rebuild the company's responsibles projection from its profiles.
pub async fn resync_responsibles(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResyncRequest>,
) -> Result<Json<Vec<ResponsibleEntry>>, AppError> {
    let entries = state
        .engine
        .resync(&req.company_id, req.actor_user_id)
        .await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct ResponsiblesQuery {
    pub company_id: String,
}

/// List the company's current responsibles (cache first, table fallback).
pub async fn list_responsibles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResponsiblesQuery>,
) -> Result<Json<Vec<ResponsibleEntry>>, AppError> {
    let entries = state.engine.list_responsibles(&query.company_id).await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub company_id: String,
    pub limit: Option<i64>,
    /// Cursor: return only events strictly older than this timestamp.
    pub before: Option<DateTime<Utc>>,
}

/// Query the audit trail, newest first.
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, AppError> {
    let events = state
        .audit
        .query(&query.company_id, query.limit, query.before)
        .await?;

    Ok(Json(events))
}

#[derive(Debug, Serialize)]
pub struct DeliveryStatusResponse {
    pub message_id: Uuid,
    pub applied: bool,
}

/// Delivery provider status callback.
///
/// Maps the provider's marker onto the message status ladder and applies it
/// when it advances the current status. Stale or out-of-order callbacks are
/// acknowledged without effect, so provider retries stay harmless.
pub async fn delivery_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(callback): Json<DeliveryCallback>,
) -> Result<Json<DeliveryStatusResponse>, AppError> {
    validate_webhook_secret(&state, &headers)?;

    let reported = MessageStatus::from_callback_marker(&callback.status).ok_or_else(|| {
        AppError::BadRequest(format!("Unknown delivery status '{}'", callback.status))
    })?;

    let advance = state
        .store
        .apply_status_callback(callback.message_id, reported)
        .await?;

    let applied = matches!(advance, StatusAdvance::Advanced(_));
    if applied {
        state.realtime.publish(&RealtimeEvent::new(
            "message:status",
            "",
            json!({
                "message_id": callback.message_id.to_string(),
                "status": reported.as_str(),
            }),
        ));
    }

    Ok(Json(DeliveryStatusResponse {
        message_id: callback.message_id,
        applied,
    }))
}

/// Manually trigger one reconciliation sweep over stale pending messages.
///
/// The same sweep runs on a timer in the background; this endpoint exists
/// for operators who do not want to wait for the next tick.
pub async fn reconcile_dispatches(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReconcileSummary>, AppError> {
    let older_than = chrono::Duration::seconds(state.config.dispatch_timeout_secs as i64 * 2);
    let summary = state.gateway.reconcile_pending(older_than).await?;

    Ok(Json(summary))
}
