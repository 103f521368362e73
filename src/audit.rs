use crate::errors::AppError;
use crate::models::{AuditAction, AuditEvent};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Hard cap on audit query page size.
pub const AUDIT_PAGE_CAP: i64 = 100;

/// Append-only event record of ownership, qualification and transfer actions.
///
/// Writes are best-effort: an audit failure must never abort the business
/// action it documents, so `record` swallows errors and reports them to
/// telemetry only.
#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records one audit event. Never raises to the caller.
    ///
    /// `details` should carry display-name snapshots (e.g. `lead_name`) at
    /// write time when available, so records stay readable after the
    /// referenced rows are edited or deleted.
    pub async fn record(
        &self,
        company_id: &str,
        actor_user_id: Option<Uuid>,
        action: AuditAction,
        details: Value,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_events (id, company_id, actor_user_id, action, details)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(company_id)
        .bind(actor_user_id)
        .bind(action.as_str())
        .bind(&details)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                "Audit write failed (action={}, company={}): {}",
                action.as_str(),
                company_id,
                e
            );
        } else {
            tracing::debug!("Audit: {} for company {}", action.as_str(), company_id);
        }
    }

    /// Company-scoped query, newest first, capped at [`AUDIT_PAGE_CAP`].
    ///
    /// `before` is a timestamp cursor: pass the `created_at` of the last event
    /// of the previous page to continue. Events whose details reference a lead
    /// without a name snapshot are backfilled with one batch lookup for the
    /// whole page; a deleted lead simply stays unresolved.
    pub async fn query(
        &self,
        company_id: &str,
        limit: Option<i64>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEvent>, AppError> {
        let limit = limit.unwrap_or(AUDIT_PAGE_CAP).clamp(1, AUDIT_PAGE_CAP);

        let mut events = match before {
            Some(cursor) => {
                sqlx::query_as::<_, AuditEvent>(
                    r#"
                    SELECT * FROM audit_events
                    WHERE company_id = $1 AND created_at < $2
                    ORDER BY created_at DESC
                    LIMIT $3
                    "#,
                )
                .bind(company_id)
                .bind(cursor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, AuditEvent>(
                    r#"
                    SELECT * FROM audit_events
                    WHERE company_id = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(company_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        self.backfill_lead_names(&mut events).await;

        Ok(events)
    }

    /// One best-effort batch lookup per page, never per event, and never
    /// persisted: audit rows are immutable, the snapshot is view enrichment.
    async fn backfill_lead_names(&self, events: &mut [AuditEvent]) {
        let missing: Vec<Uuid> = events
            .iter()
            .filter_map(|event| needs_lead_name(&event.details))
            .collect();

        if missing.is_empty() {
            return;
        }

        let names = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, name FROM leads WHERE id = ANY($1)",
        )
        .bind(&missing)
        .fetch_all(&self.pool)
        .await;

        let names = match names {
            Ok(rows) => rows,
            Err(e) => {
                // Enrichment only; the page is still served.
                tracing::warn!("Audit name backfill lookup failed: {}", e);
                return;
            }
        };

        for event in events.iter_mut() {
            if let Some(lead_id) = needs_lead_name(&event.details) {
                if let Some((_, name)) = names.iter().find(|(id, _)| *id == lead_id) {
                    event.details["lead_name"] = Value::String(name.clone());
                }
            }
        }
    }
}

/// Extracts the referenced lead id when the details lack a name snapshot.
fn needs_lead_name(details: &Value) -> Option<Uuid> {
    if details.get("lead_name").and_then(Value::as_str).is_some() {
        return None;
    }
    details
        .get("lead_id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_present_skips_backfill() {
        let details = json!({
            "lead_id": Uuid::new_v4().to_string(),
            "lead_name": "Ana"
        });
        assert!(needs_lead_name(&details).is_none());
    }

    #[test]
    fn missing_snapshot_yields_lead_id() {
        let id = Uuid::new_v4();
        let details = json!({ "lead_id": id.to_string() });
        assert_eq!(needs_lead_name(&details), Some(id));
    }

    #[test]
    fn unrelated_details_need_nothing() {
        assert!(needs_lead_name(&json!({ "note": "x" })).is_none());
        assert!(needs_lead_name(&json!({ "lead_id": "not-a-uuid" })).is_none());
    }
}
