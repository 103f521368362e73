use crate::audit::AuditLogger;
use crate::errors::{AppError, ResultExt};
use crate::models::{
    AuditAction, Handler, Lead, Profile, Responsible, ResponsibleEntry,
};
use moka::future::Cache;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

/// Recomputes the eligible Responsibles list for a company.
///
/// Every active human profile contributes an entry; the automated agent's
/// display entry is included only when at least one profile has that agent in
/// its personal set. Output is sorted for deterministic full-replace writes.
pub fn compute_responsibles(
    company_id: &str,
    profiles: &[Profile],
    agent_name: &str,
) -> Vec<ResponsibleEntry> {
    let mut entries: Vec<ResponsibleEntry> = profiles
        .iter()
        .filter(|p| p.active)
        .map(|p| ResponsibleEntry {
            company_id: company_id.to_string(),
            display_name: p.display_name.clone(),
            kind: "human".to_string(),
            profile_id: Some(p.id),
        })
        .collect();

    entries.sort_by(|a, b| a.display_name.cmp(&b.display_name));

    let agent_enabled = profiles.iter().any(|p| p.active && p.has_agent(agent_name));
    if agent_enabled {
        entries.push(ResponsibleEntry {
            company_id: company_id.to_string(),
            display_name: agent_name.to_string(),
            kind: "agent".to_string(),
            profile_id: None,
        });
    }

    entries
}

/// State machine governing who owns a conversation and the rules for
/// hand-off between the human specialists and the automated agent.
#[derive(Clone)]
pub struct ResponsibilityEngine {
    pool: PgPool,
    audit: AuditLogger,
    /// Cached projection of the per-company Responsibles list. Resynchronized
    /// whenever a profile's agent set changes; the table is the fallback.
    cache: Cache<String, Vec<ResponsibleEntry>>,
    /// Display name (and id) of the automated agent.
    agent_name: String,
}

impl ResponsibilityEngine {
    pub fn new(
        pool: PgPool,
        audit: AuditLogger,
        cache: Cache<String, Vec<ResponsibleEntry>>,
        agent_name: String,
    ) -> Self {
        Self {
            pool,
            audit,
            cache,
            agent_name,
        }
    }

    async fn fetch_lead(&self, company_id: &str, lead_id: Uuid) -> Result<Lead, AppError> {
        sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1 AND company_id = $2")
            .bind(lead_id)
            .bind(company_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))
    }

    /// Toggles who answers the lead: Agente ⇄ Humano.
    ///
    /// The current state is taken from the optional hint, falling back to the
    /// stored discriminator. An unknown state toggles to Humano, the safe
    /// default for a conversation nobody claimed yet.
    pub async fn toggle(
        &self,
        company_id: &str,
        lead_id: Uuid,
        hint: Option<Handler>,
        actor_user_id: Option<Uuid>,
        context: &str,
    ) -> Result<Handler, AppError> {
        let lead = self.fetch_lead(company_id, lead_id).await?;

        let current = hint.or_else(|| {
            lead.quem_atende
                .as_deref()
                .and_then(Handler::from_label)
        });
        let next = Handler::next_after_toggle(current);

        sqlx::query(
            "UPDATE leads SET quem_atende = $2, updated_at = now() WHERE id = $1",
        )
        .bind(lead_id)
        .bind(next.as_str())
        .execute(&self.pool)
        .await?;

        tracing::info!(
            "Lead {} quem_atende: {} -> {} ({})",
            lead_id,
            current.map(|h| h.as_str()).unwrap_or("?"),
            next.as_str(),
            context
        );

        self.audit
            .record(
                company_id,
                actor_user_id,
                AuditAction::ResponsibilityToggled,
                json!({
                    "lead_id": lead_id.to_string(),
                    "lead_name": lead.name,
                    "old_state": current.map(|h| h.as_str()),
                    "new_state": next.as_str(),
                    "context": context,
                }),
            )
            .await;

        Ok(next)
    }

    /// Explicit reassignment to a named responsible.
    ///
    /// Transfer changes who answers next only when the new responsible implies
    /// a discriminator change. Re-applying the current assignment is a no-op
    /// that still logs.
    pub async fn transfer(
        &self,
        company_id: &str,
        lead_id: Uuid,
        target: Responsible,
        actor_user_id: Option<Uuid>,
        context: &str,
    ) -> Result<(), AppError> {
        let lead = self.fetch_lead(company_id, lead_id).await?;

        let current_handler = lead.quem_atende.as_deref().and_then(Handler::from_label);
        let implied = target.implied_handler();
        let new_handler = match current_handler {
            Some(handler) if handler == implied => handler,
            _ => implied,
        };

        let (profile_id, agent_id) = match &target {
            Responsible::Human { profile_id, .. } => (Some(*profile_id), None),
            Responsible::Agent { agent_id, .. } => (None, Some(agent_id.clone())),
        };

        sqlx::query(
            r#"
            UPDATE leads
            SET responsible = $2,
                responsible_profile_id = $3,
                responsible_agent_id = $4,
                quem_atende = $5,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(lead_id)
        .bind(target.display_name())
        .bind(profile_id)
        .bind(&agent_id)
        .bind(new_handler.as_str())
        .execute(&self.pool)
        .await?;

        tracing::info!(
            "Lead {} transferred: {} -> {} ({})",
            lead_id,
            lead.responsible.as_deref().unwrap_or("?"),
            target.display_name(),
            context
        );

        self.audit
            .record(
                company_id,
                actor_user_id,
                AuditAction::ConversationTransferred,
                json!({
                    "lead_id": lead_id.to_string(),
                    "lead_name": lead.name,
                    "old_responsible": lead.responsible,
                    "new_responsible": target.display_name(),
                    "old_state": current_handler.map(|h| h.as_str()),
                    "new_state": new_handler.as_str(),
                    "context": context,
                }),
            )
            .await;

        Ok(())
    }

    /// Updates the lead's qualification status, with its audit trail entry.
    pub async fn update_qualification(
        &self,
        company_id: &str,
        lead_id: Uuid,
        qualification: &str,
        actor_user_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let lead = self.fetch_lead(company_id, lead_id).await?;

        sqlx::query(
            "UPDATE leads SET qualification = $2, updated_at = now() WHERE id = $1",
        )
        .bind(lead_id)
        .bind(qualification)
        .execute(&self.pool)
        .await?;

        self.audit
            .record(
                company_id,
                actor_user_id,
                AuditAction::LeadQualificationUpdated,
                json!({
                    "lead_id": lead_id.to_string(),
                    "lead_name": lead.name,
                    "old_qualification": lead.qualification,
                    "new_qualification": qualification,
                }),
            )
            .await;

        Ok(())
    }

    /// Recomputes and fully replaces the company's Responsibles projection.
    ///
    /// The list is a materialized view of the active profiles plus the agent
    /// entry, never authoritative state. Full replace is intentional: rows
    /// added outside the profile set do not survive a resync.
    pub async fn resync(
        &self,
        company_id: &str,
        actor_user_id: Option<Uuid>,
    ) -> Result<Vec<ResponsibleEntry>, AppError> {
        let profiles = sqlx::query_as::<_, Profile>(
            "SELECT * FROM profiles WHERE company_id = $1",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .context("loading profiles for responsibles resync")?;

        let entries = compute_responsibles(company_id, &profiles, &self.agent_name);

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM responsibles WHERE company_id = $1")
            .bind(company_id)
            .execute(&mut *tx)
            .await?;

        for entry in &entries {
            sqlx::query(
                r#"
                INSERT INTO responsibles (company_id, display_name, kind, profile_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&entry.company_id)
            .bind(&entry.display_name)
            .bind(&entry.kind)
            .bind(entry.profile_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.cache
            .insert(company_id.to_string(), entries.clone())
            .await;

        tracing::info!(
            "Resynced responsibles for company {}: {} entries",
            company_id,
            entries.len()
        );

        self.audit
            .record(
                company_id,
                actor_user_id,
                AuditAction::ResponsiblesResynced,
                json!({ "entries": entries.len() }),
            )
            .await;

        Ok(entries)
    }

    /// Reads the cached projection, falling back to the table on a cold cache.
    pub async fn list_responsibles(
        &self,
        company_id: &str,
    ) -> Result<Vec<ResponsibleEntry>, AppError> {
        if let Some(cached) = self.cache.get(company_id).await {
            return Ok(cached);
        }

        let entries = sqlx::query_as::<_, ResponsibleEntry>(
            "SELECT * FROM responsibles WHERE company_id = $1 ORDER BY kind, display_name",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;

        self.cache
            .insert(company_id.to_string(), entries.clone())
            .await;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile(name: &str, active: bool, agents: serde_json::Value) -> Profile {
        Profile {
            id: Uuid::new_v4(),
            company_id: "C1".to_string(),
            display_name: name.to_string(),
            active,
            agents,
        }
    }

    #[test]
    fn inactive_profiles_are_excluded() {
        let profiles = vec![
            profile("Jéssica", true, json!([])),
            profile("Rafael", false, json!([])),
        ];
        let entries = compute_responsibles("C1", &profiles, "Assistente");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].display_name, "Jéssica");
    }

    #[test]
    fn agent_entry_requires_one_active_profile_with_agent() {
        let without = vec![profile("Jéssica", true, json!([]))];
        let entries = compute_responsibles("C1", &without, "Assistente");
        assert!(entries.iter().all(|e| e.kind == "human"));

        let with = vec![
            profile("Jéssica", true, json!([])),
            profile("Rafael", true, json!(["Assistente"])),
        ];
        let entries = compute_responsibles("C1", &with, "Assistente");
        assert_eq!(entries.last().unwrap().kind, "agent");
        assert_eq!(entries.last().unwrap().display_name, "Assistente");
    }

    #[test]
    fn inactive_profile_agent_does_not_count() {
        let profiles = vec![
            profile("Jéssica", true, json!([])),
            profile("Rafael", false, json!(["Assistente"])),
        ];
        let entries = compute_responsibles("C1", &profiles, "Assistente");
        assert!(entries.iter().all(|e| e.kind == "human"));
    }

    #[test]
    fn recompute_is_idempotent() {
        let profiles = vec![
            profile("Bia", true, json!(["Assistente"])),
            profile("Ana", true, json!([])),
        ];
        let first = compute_responsibles("C1", &profiles, "Assistente");
        let second = compute_responsibles("C1", &profiles, "Assistente");
        assert_eq!(first, second);
        // deterministic ordering: humans sorted, agent last
        assert_eq!(first[0].display_name, "Ana");
        assert_eq!(first[1].display_name, "Bia");
        assert_eq!(first[2].kind, "agent");
    }
}
