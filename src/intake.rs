use crate::errors::AppError;
use crate::handlers::AppState;
use crate::identity::{normalize_identifiers, ContactIdentifiers};
use crate::models::{
    AuditAction, Channel, Handler, IntakeEvent, IntakePayload, IntakeResponse,
};
use crate::realtime::RealtimeEvent;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

/// Inbound event intake webhook.
///
/// Receives lead/message events from the CRM ingestion boundary, resolves
/// each to a canonical identity and conversation, applies the routing rule
/// and records the trail. Accepts a single event object or an array of them;
/// one bad event never blocks the rest of the batch.
///
/// Authentication: X-Webhook-Token header must match WEBHOOK_SECRET env var.
pub async fn intake_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<IntakePayload>,
) -> Result<(StatusCode, Json<IntakeResponse>), AppError> {
    tracing::info!("Received intake webhook");

    validate_webhook_secret(&state, &headers)?;

    let events = payload.into_events();
    let total_received = events.len();
    tracing::info!("Processing {} intake event(s)", total_received);

    let mut processed = 0;
    let mut duplicates = 0;

    for event in events {
        match process_intake_event(&state, event).await {
            Ok(ProcessResult::Processed) => {
                processed += 1;
            }
            Ok(ProcessResult::Duplicate) => {
                duplicates += 1;
                tracing::debug!("Skipped duplicate intake event");
            }
            Err(e) => {
                tracing::error!("Failed to process intake event: {}", e);
                // Continue processing other events even if one fails
            }
        }
    }

    tracing::info!(
        "Intake processing complete: {} received, {} processed, {} duplicates",
        total_received,
        processed,
        duplicates
    );

    Ok((
        StatusCode::OK,
        Json(IntakeResponse {
            status: "received".to_string(),
            received: total_received,
            processed,
            duplicates,
        }),
    ))
}

/// Validate webhook secret from X-Webhook-Token header
pub(crate) fn validate_webhook_secret(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), AppError> {
    // If no secret is configured, skip validation (warn was already logged at startup)
    let Some(ref expected_secret) = state.config.webhook_secret else {
        return Ok(());
    };

    let token = headers
        .get("X-Webhook-Token")
        .or_else(|| headers.get("x-webhook-token"))
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Webhook-Token header".to_string()))?;

    // Constant-time comparison to prevent timing attacks
    if !constant_time_compare(token, expected_secret) {
        tracing::warn!("Invalid webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison (basic implementation)
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[derive(Debug)]
enum ProcessResult {
    Processed,
    Duplicate,
}

/// Process a single intake event end to end.
async fn process_intake_event(
    state: &Arc<AppState>,
    event: IntakeEvent,
) -> Result<ProcessResult, AppError> {
    let ids = normalize_identifiers(&ContactIdentifiers {
        phone: event.phone.clone(),
        jid: None,
        email: event.email.clone(),
    });

    if ids.is_empty() {
        return Err(AppError::BadRequest(
            "Intake event carries no usable phone or email".to_string(),
        ));
    }

    let identifier = ids.canonical().unwrap_or("?").to_string();

    // Repeated webhook deliveries of the same payload within the TTL window
    // are duplicates; distinct messages for the same identifier are not.
    let dedup_key = format!(
        "{}|{}|{}",
        event.company_id,
        identifier,
        event.message.as_deref().unwrap_or("")
    );
    if state.recent_event_cache.get(&dedup_key).await.is_some() {
        return Ok(ProcessResult::Duplicate);
    }
    state
        .recent_event_cache
        .insert(dedup_key, Utc::now().timestamp())
        .await;

    let channel = Channel::from_label(event.channel.as_deref().unwrap_or(""));

    // 1. Resolve identity, creating the lead if this contact is new.
    let resolution = state
        .resolver
        .resolve_or_create(&event.company_id, &ids, &event.name)
        .await?;

    let was_created = resolution.was_created();
    let mut lead = resolution.into_lead();

    if was_created {
        // New leads start with the automated agent answering; a human picks
        // the conversation up via toggle or transfer.
        sqlx::query(
            r#"
            UPDATE leads
            SET quem_atende = 'Agente',
                responsible = $2,
                responsible_agent_id = $2,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(lead.id)
        .bind(&state.config.agent_display_name)
        .execute(&state.db)
        .await?;
        lead.quem_atende = Some("Agente".to_string());

        state
            .audit
            .record(
                &event.company_id,
                None,
                AuditAction::LeadCreated,
                json!({
                    "lead_id": lead.id.to_string(),
                    "lead_name": lead.name,
                    "source": event.source,
                    "channel": channel.as_str(),
                }),
            )
            .await;
    }

    // 2. One conversation per (company, identifier), no matter the channel.
    let conversation = state.store.get_or_create(&lead, channel.as_str()).await?;

    // 3. Append the inbound message, when the event carries one.
    if let Some(ref body) = event.message {
        state
            .store
            .append_message(
                conversation.id,
                crate::conversation::NewMessage::inbound(body.as_str()),
            )
            .await?;
    }

    // 4. Routing rule: agent-owned conversations answer automatically when an
    //    auto-reply is configured. A dispatch failure is that message's
    //    problem, not the intake's.
    let handled_by = lead.quem_atende.as_deref().and_then(Handler::from_label);
    if handled_by == Some(Handler::Agent) {
        if let Some(ref reply) = state.config.auto_reply_body {
            if event.message.is_some() {
                if let Err(e) = state
                    .gateway
                    .send(conversation.id, reply, None, None, None)
                    .await
                {
                    tracing::error!(
                        "Auto-reply dispatch failed for conversation {}: {}",
                        conversation.id,
                        e
                    );
                }
            }
        }
    }

    state.realtime.publish(&RealtimeEvent::new(
        "message:received",
        &event.company_id,
        json!({
            "lead_id": lead.id.to_string(),
            "conversation_id": conversation.id.to_string(),
            "channel": channel.as_str(),
            "new_lead": was_created,
        }),
    ));

    Ok(ProcessResult::Processed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_compare_basics() {
        assert!(constant_time_compare("segredo", "segredo"));
        assert!(!constant_time_compare("segredo", "segredos"));
        assert!(!constant_time_compare("segredo", "sEgredo"));
        assert!(!constant_time_compare("", "x"));
    }
}
