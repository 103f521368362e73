use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============ Database Models ============

/// Canonical party a company communicates with, scoped to its tenant.
///
/// External identifiers (phone, channel JID, email) are stored normalized and
/// are partial-unique per company. The `responsible` label is a denormalized
/// display cache; `responsible_profile_id` / `responsible_agent_id` carry the
/// typed assignment.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Lead {
    /// Unique identifier for the lead.
    pub id: Uuid,
    /// Tenant scope.
    pub company_id: String,
    /// Display name.
    pub name: String,
    /// Normalized phone number, if known.
    pub phone: Option<String>,
    /// Channel-specific contact id (e.g. a WhatsApp JID), if known.
    pub jid: Option<String>,
    /// Normalized email address, if known.
    pub email: Option<String>,
    /// Display label of the current responsible (human name or agent name).
    pub responsible: Option<String>,
    /// Profile id when the responsible is a human.
    pub responsible_profile_id: Option<Uuid>,
    /// Agent id when the responsible is the automated agent.
    pub responsible_agent_id: Option<String>,
    /// Who is actively handling: "Humano" or "Agente".
    pub quem_atende: Option<String>,
    /// Lifecycle status (e.g. "novo", "em_atendimento", "encerrado").
    pub lifecycle_status: Option<String>,
    /// Qualification status.
    pub qualification: Option<String>,
    /// Timestamp of creation.
    pub created_at: DateTime<Utc>,
    /// Timestamp of last update.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Lead {
    /// The canonical identifier a conversation is keyed on: phone first, then
    /// JID, then email. A lead always has at least one of them.
    pub fn canonical_identifier(&self) -> Option<&str> {
        self.phone
            .as_deref()
            .or(self.jid.as_deref())
            .or(self.email.as_deref())
    }
}

/// The channel-agnostic thread tied to one resolved identity.
///
/// At most one per (company_id, identifier); the constraint lives in the
/// store, not in application code.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub company_id: String,
    pub lead_id: Uuid,
    /// Normalized canonical identifier the thread is keyed on.
    pub identifier: String,
    /// Channel instance the thread was opened on.
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A single message in a conversation. Append-only; once delivery begins the
/// row is only touched by asynchronous status callbacks.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub body: String,
    /// "in" or "out".
    pub direction: String,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    /// pending | sent | delivered | read | failed.
    pub status: String,
    /// Provider-reported reason when status is failed.
    pub error_message: Option<String>,
    /// Number of dispatch attempts made so far (outbound only).
    pub dispatch_attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// A human profile in a company. Source of the Responsibles projection.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub company_id: String,
    pub display_name: String,
    pub active: bool,
    /// Personal set of enabled automated agents (JSON array of agent ids).
    pub agents: serde_json::Value,
}

impl Profile {
    /// Whether this profile has the given agent enabled in its personal set.
    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.agents
            .as_array()
            .map(|list| list.iter().any(|v| v.as_str() == Some(agent_id)))
            .unwrap_or(false)
    }
}

/// One entry of the cached Responsibles projection.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ResponsibleEntry {
    pub company_id: String,
    pub display_name: String,
    /// "human" or "agent".
    pub kind: String,
    pub profile_id: Option<Uuid>,
}

/// Immutable record of a state-changing action.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub company_id: String,
    /// Null for system-initiated actions.
    pub actor_user_id: Option<Uuid>,
    pub action: String,
    /// Structured payload, including best-effort display-name snapshots.
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ============ Domain Enums ============

/// Who is actively handling a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handler {
    Human,
    Agent,
}

impl Handler {
    /// Wire/storage label ("Humano" / "Agente").
    pub fn as_str(&self) -> &'static str {
        match self {
            Handler::Human => "Humano",
            Handler::Agent => "Agente",
        }
    }

    /// Parses a stored label, ignoring case ("Humano" and "humano" are the
    /// same handler). Unknown labels yield None; callers treat that as an
    /// orphaned conversation.
    pub fn from_label(label: &str) -> Option<Handler> {
        match label.trim().to_lowercase().as_str() {
            "humano" => Some(Handler::Human),
            "agente" => Some(Handler::Agent),
            _ => None,
        }
    }

    /// The other side of the hand-off.
    pub fn toggled(&self) -> Handler {
        match self {
            Handler::Human => Handler::Agent,
            Handler::Agent => Handler::Human,
        }
    }

    /// Next handler for a toggle with no explicit target. A missing or
    /// unrecognized current state lands on Human: claiming an orphaned
    /// conversation beats leaving it unattended.
    pub fn next_after_toggle(current: Option<Handler>) -> Handler {
        match current {
            Some(state) => state.toggled(),
            None => Handler::Human,
        }
    }
}

/// Typed responsible assignment: a human profile or the automated agent.
///
/// The free-text `responsible` column on leads is only a display cache of
/// this union.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Responsible {
    Human {
        profile_id: Uuid,
        display_name: String,
    },
    Agent {
        agent_id: String,
        display_name: String,
    },
}

impl Responsible {
    pub fn display_name(&self) -> &str {
        match self {
            Responsible::Human { display_name, .. } => display_name,
            Responsible::Agent { display_name, .. } => display_name,
        }
    }

    /// The discriminator this assignment implies.
    pub fn implied_handler(&self) -> Handler {
        match self {
            Responsible::Human { .. } => Handler::Human,
            Responsible::Agent { .. } => Handler::Agent,
        }
    }
}

/// Fixed title-cased channel vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    WhatsApp,
    LinkedIn,
    WebChat,
    Instagram,
    Facebook,
    Email,
    Sms,
    Phone,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::WhatsApp => "WhatsApp",
            Channel::LinkedIn => "LinkedIn",
            Channel::WebChat => "WebChat",
            Channel::Instagram => "Instagram",
            Channel::Facebook => "Facebook",
            Channel::Email => "Email",
            Channel::Sms => "SMS",
            Channel::Phone => "Phone",
        }
    }

    /// Maps a free-form channel label into the fixed vocabulary.
    /// Unrecognized values default to WhatsApp.
    pub fn from_label(label: &str) -> Channel {
        match label.trim().to_lowercase().as_str() {
            "whatsapp" | "wpp" | "zap" => Channel::WhatsApp,
            "linkedin" => Channel::LinkedIn,
            "webchat" | "web" | "site" | "chat" => Channel::WebChat,
            "instagram" | "ig" => Channel::Instagram,
            "facebook" | "fb" | "messenger" => Channel::Facebook,
            "email" | "e-mail" => Channel::Email,
            "sms" => Channel::Sms,
            "phone" | "telefone" | "call" => Channel::Phone,
            _ => Channel::WhatsApp,
        }
    }
}

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Inbound => "in",
            MessageDirection::Outbound => "out",
        }
    }
}

/// Delivery-status ladder. Transitions only move forward
/// (pending → sent → delivered → read); `failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<MessageStatus> {
        match value {
            "pending" => Some(MessageStatus::Pending),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// Position on the forward ladder. `failed` sits outside it.
    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    /// Whether a transition reporting `next` may be applied on top of `self`.
    ///
    /// Duplicate and out-of-order callbacks are rejected; nothing leaves
    /// `failed`, and `failed` is only reachable from `pending`. Once the
    /// provider accepted a message it cannot un-send it.
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        if *self == MessageStatus::Failed || next == MessageStatus::Pending {
            return false;
        }
        if next == MessageStatus::Failed {
            return *self == MessageStatus::Pending;
        }
        next.rank() > self.rank()
    }

    /// Maps a provider callback marker onto the ladder. The provider reports
    /// "completed" for a delivered message.
    pub fn from_callback_marker(marker: &str) -> Option<MessageStatus> {
        match marker.trim().to_lowercase().as_str() {
            "sent" => Some(MessageStatus::Sent),
            "completed" | "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// Audit action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    LeadCreated,
    LeadDeleted,
    ResponsibilityToggled,
    ConversationTransferred,
    LeadQualificationUpdated,
    ResponsiblesResynced,
    MessageDispatched,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::LeadCreated => "LEAD_CREATED",
            AuditAction::LeadDeleted => "LEAD_DELETED",
            AuditAction::ResponsibilityToggled => "RESPONSIBILITY_TOGGLED",
            AuditAction::ConversationTransferred => "CONVERSATION_TRANSFERRED",
            AuditAction::LeadQualificationUpdated => "LEAD_QUALIFICATION_UPDATED",
            AuditAction::ResponsiblesResynced => "RESPONSIBLES_RESYNCED",
            AuditAction::MessageDispatched => "MESSAGE_DISPATCHED",
        }
    }
}

// ============ Wire Payloads ============

/// One inbound intake event from the CRM ingestion boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeEvent {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub company_id: String,
    pub message: Option<String>,
    pub source: Option<String>,
    pub channel: Option<String>,
}

/// Intake payload: the boundary posts either a single event or a batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IntakePayload {
    Single(IntakeEvent),
    Batch(Vec<IntakeEvent>),
}

impl IntakePayload {
    pub fn into_events(self) -> Vec<IntakeEvent> {
        match self {
            IntakePayload::Single(event) => vec![event],
            IntakePayload::Batch(events) => events,
        }
    }
}

/// Summary returned to the intake webhook caller.
#[derive(Debug, Serialize)]
pub struct IntakeResponse {
    pub status: String,
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
}

/// Single element of the outbound dispatch array payload. Field names are the
/// provider's contract, typos included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayloadItem {
    pub conversa_id: Uuid,
    pub empresa_id: String,
    pub mensage_body: String,
    pub message_type: String,
    pub message_midia_url: Option<String>,
    /// Internal message id; the provider treats duplicate ids as no-ops.
    pub message_id: Uuid,
}

/// Asynchronous delivery/read callback from the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryCallback {
    #[serde(alias = "request_id")]
    pub message_id: Uuid,
    pub status: String,
}

/// Toggle request: optional current-status hint from the UI.
#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub company_id: String,
    pub current_status: Option<String>,
    pub actor_user_id: Option<Uuid>,
    /// Which UI path or webhook initiated the toggle.
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    pub lead_id: Uuid,
    pub quem_atende: String,
}

/// Transfer request: explicit reassignment to a named responsible.
#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub company_id: String,
    #[serde(flatten)]
    pub target: Responsible,
    pub actor_user_id: Option<Uuid>,
    pub context: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QualificationRequest {
    pub company_id: String,
    pub qualification: String,
    pub actor_user_id: Option<Uuid>,
}

/// Outbound send request.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub actor_user_id: Option<Uuid>,
}
