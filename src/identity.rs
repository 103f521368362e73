use crate::errors::{is_unique_violation, AppError};
use crate::models::Lead;
use regex::Regex;
use sqlx::PgPool;
use std::sync::OnceLock;
use uuid::Uuid;

/// External contact references carried by an inbound or outbound event.
/// Values are raw; the resolver normalizes before matching.
#[derive(Debug, Clone, Default)]
pub struct ContactIdentifiers {
    pub phone: Option<String>,
    pub jid: Option<String>,
    pub email: Option<String>,
}

/// Normalized counterpart of [`ContactIdentifiers`]. Matching is exact
/// equality on these values, never fuzzy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIdentifiers {
    pub phone: Option<String>,
    pub jid: Option<String>,
    pub email: Option<String>,
}

impl NormalizedIdentifiers {
    pub fn is_empty(&self) -> bool {
        self.phone.is_none() && self.jid.is_none() && self.email.is_none()
    }

    /// Canonical conversation key: phone first, then JID, then email.
    pub fn canonical(&self) -> Option<&str> {
        self.phone
            .as_deref()
            .or(self.jid.as_deref())
            .or(self.email.as_deref())
    }
}

/// Canonicalizes a phone number to its digit form, preserving an explicit
/// leading `+`. Rejects values outside 8-15 digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 8 || digits.len() > 15 {
        return None;
    }
    if trimmed.starts_with('+') {
        Some(format!("+{}", digits))
    } else {
        Some(digits)
    }
}

fn email_shape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap())
}

/// Lowercases and validates an email address; malformed values are discarded.
pub fn normalize_email(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    if email_shape().is_match(&lowered) {
        Some(lowered)
    } else {
        None
    }
}

/// JIDs are provider-issued opaque ids; trimming is the only safe
/// canonicalization.
pub fn normalize_jid(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalizes all provided identifiers, dropping the malformed ones.
pub fn normalize_identifiers(ids: &ContactIdentifiers) -> NormalizedIdentifiers {
    NormalizedIdentifiers {
        phone: ids.phone.as_deref().and_then(normalize_phone),
        jid: ids.jid.as_deref().and_then(normalize_jid),
        email: ids.email.as_deref().and_then(normalize_email),
    }
}

/// Maps an external contact reference to one canonical lead identity.
///
/// Resolution order is deterministic: phone, then channel JID, then email.
/// A JID is a stronger identity claim than an email but weaker than a phone.
pub struct IdentityResolver {
    pool: PgPool,
}

impl IdentityResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolves the identifiers to an existing lead.
    ///
    /// `Ok(None)` is the NotFound condition: no lead matches and the caller
    /// did not ask for creation. Distinct leads sharing a partial identifier
    /// are never merged; each column is matched independently and exactly.
    pub async fn resolve(
        &self,
        company_id: &str,
        ids: &NormalizedIdentifiers,
    ) -> Result<Option<Lead>, AppError> {
        if ids.is_empty() {
            return Err(AppError::BadRequest(
                "At least one identifier required (phone, jid, or email)".to_string(),
            ));
        }

        if let Some(ref phone) = ids.phone {
            if let Some(lead) = self.find_by_column(company_id, "phone", phone).await? {
                return Ok(Some(lead));
            }
        }

        if let Some(ref jid) = ids.jid {
            if let Some(lead) = self.find_by_column(company_id, "jid", jid).await? {
                return Ok(Some(lead));
            }
        }

        if let Some(ref email) = ids.email {
            if let Some(lead) = self.find_by_column(company_id, "email", email).await? {
                return Ok(Some(lead));
            }
        }

        Ok(None)
    }

    /// Explicit create-if-absent path.
    ///
    /// The uniqueness invariant lives in the store (partial-unique indexes on
    /// (company_id, identifier)); a unique violation from a concurrent
    /// creation is caught and resolved by re-fetching the winner's row.
    pub async fn resolve_or_create(
        &self,
        company_id: &str,
        ids: &NormalizedIdentifiers,
        name: &str,
    ) -> Result<Resolution, AppError> {
        if let Some(lead) = self.resolve(company_id, ids).await? {
            return Ok(Resolution::Existing(lead));
        }

        let insert = sqlx::query_as::<_, Lead>(
            r#"
            INSERT INTO leads (id, company_id, name, phone, jid, email, lifecycle_status)
            VALUES ($1, $2, $3, $4, $5, $6, 'novo')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(company_id)
        .bind(name)
        .bind(&ids.phone)
        .bind(&ids.jid)
        .bind(&ids.email)
        .fetch_one(&self.pool)
        .await;

        match insert {
            Ok(lead) => {
                tracing::info!(
                    "Created lead {} for company {} ({})",
                    lead.id,
                    company_id,
                    ids.canonical().unwrap_or("?")
                );
                Ok(Resolution::Created(lead))
            }
            Err(e) if is_unique_violation(&e) => {
                // Another request created the same identity between our check
                // and the insert. The constraint won; fetch its row.
                tracing::debug!(
                    "Lead creation race for company {} ({}); re-fetching",
                    company_id,
                    ids.canonical().unwrap_or("?")
                );
                match self.resolve(company_id, ids).await? {
                    Some(lead) => Ok(Resolution::Existing(lead)),
                    None => Err(AppError::Conflict(format!(
                        "Lead for {} exists but could not be re-fetched",
                        ids.canonical().unwrap_or("?")
                    ))),
                }
            }
            Err(e) => Err(AppError::DatabaseError(e)),
        }
    }

    async fn find_by_column(
        &self,
        company_id: &str,
        column: &str,
        value: &str,
    ) -> Result<Option<Lead>, AppError> {
        // Column name comes from a fixed internal set, never from input.
        let query = format!(
            "SELECT * FROM leads WHERE company_id = $1 AND {} = $2 LIMIT 1",
            column
        );
        let lead = sqlx::query_as::<_, Lead>(&query)
            .bind(company_id)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        Ok(lead)
    }
}

/// Outcome of a create-if-absent resolution.
#[derive(Debug)]
pub enum Resolution {
    Existing(Lead),
    Created(Lead),
}

impl Resolution {
    pub fn lead(&self) -> &Lead {
        match self {
            Resolution::Existing(lead) => lead,
            Resolution::Created(lead) => lead,
        }
    }

    pub fn into_lead(self) -> Lead {
        match self {
            Resolution::Existing(lead) => lead,
            Resolution::Created(lead) => lead,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Resolution::Created(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_normalization_strips_punctuation() {
        assert_eq!(
            normalize_phone("+1 (555) 123-4567").as_deref(),
            Some("+15551234567")
        );
        assert_eq!(normalize_phone("11 98765-4321").as_deref(), Some("11987654321"));
        assert_eq!(normalize_phone("123"), None);
    }

    #[test]
    fn email_normalization_lowercases_and_validates() {
        assert_eq!(
            normalize_email(" Ana.Silva@Example.COM ").as_deref(),
            Some("ana.silva@example.com")
        );
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(normalize_email("a@b"), None);
    }

    #[test]
    fn canonical_prefers_phone_then_jid_then_email() {
        let ids = NormalizedIdentifiers {
            phone: Some("+15551234567".into()),
            jid: Some("5511@s.whatsapp.net".into()),
            email: Some("ana@example.com".into()),
        };
        assert_eq!(ids.canonical(), Some("+15551234567"));

        let ids = NormalizedIdentifiers {
            phone: None,
            jid: Some("5511@s.whatsapp.net".into()),
            email: Some("ana@example.com".into()),
        };
        assert_eq!(ids.canonical(), Some("5511@s.whatsapp.net"));
    }
}
