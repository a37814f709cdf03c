//! Marketplace data model: listings, queries, quotes, and conversation messages.
//!
//! Everything here is plain data: serde-serialisable, cheap to clone, and
//! free of channel handles. The conversation state machine lives on
//! [`ConversationState::next`] so both the router and the wrappers agree on
//! the same transition table.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MarketplaceError;

/// Agent identifier: first 16 hex chars of `SHA256(verifying_key)`.
pub type AgentId = String;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Unique id of a service listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(Uuid);

impl ServiceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique id of a conversation between one consumer and one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique id of a single conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Pricing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingUnit {
    PerRequest,
    PerMessage,
    PerMinute,
}

/// Listed price of a service. `amount` is in minor units of `currency`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub amount: u64,
    pub currency: String,
    pub unit: PricingUnit,
}

impl Pricing {
    pub fn free() -> Self {
        Self {
            amount: 0,
            currency: "credits".to_string(),
            unit: PricingUnit::PerRequest,
        }
    }

    pub fn per_request(amount: u64, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
            unit: PricingUnit::PerRequest,
        }
    }

    pub fn is_free(&self) -> bool {
        self.amount == 0
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Self::free()
    }
}

// ── Listings ─────────────────────────────────────────────────────────────────

/// A service a provider offers on the marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceListing {
    pub id: ServiceId,
    /// Owning provider. Stamped by `MarketplaceProvider::register_service`.
    pub provider_id: AgentId,
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub pricing: Pricing,
    pub created_at: DateTime<Utc>,
}

impl ServiceListing {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ServiceId::new(),
            provider_id: String::new(),
            name: name.into(),
            description: String::new(),
            capabilities: Vec::new(),
            tags: Vec::new(),
            pricing: Pricing::free(),
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }
}

/// Discovery filter. Every criterion that is set must match; an empty
/// query matches every listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceQuery {
    pub capability: Option<String>,
    pub tag: Option<String>,
    pub provider_id: Option<AgentId>,
    pub max_price: Option<u64>,
    pub currency: Option<String>,
    /// Case-insensitive substring of name or description.
    pub text: Option<String>,
    pub limit: Option<usize>,
}

impl ServiceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn provider(mut self, provider_id: impl Into<AgentId>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn max_price(mut self, max_price: u64) -> Self {
        self.max_price = Some(max_price);
        self
    }

    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, listing: &ServiceListing) -> bool {
        if let Some(cap) = &self.capability
            && !listing.capabilities.iter().any(|c| c.eq_ignore_ascii_case(cap))
        {
            return false;
        }
        if let Some(tag) = &self.tag
            && !listing.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
        {
            return false;
        }
        if let Some(provider_id) = &self.provider_id
            && &listing.provider_id != provider_id
        {
            return false;
        }
        if let Some(max) = self.max_price
            && listing.pricing.amount > max
        {
            return false;
        }
        if let Some(currency) = &self.currency
            && !listing.pricing.currency.eq_ignore_ascii_case(currency)
        {
            return false;
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            if !listing.name.to_lowercase().contains(&needle)
                && !listing.description.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

// ── Quotes ───────────────────────────────────────────────────────────────────

/// A provider's price offer inside a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub amount: u64,
    pub currency: String,
    pub unit: PricingUnit,
    pub expires_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl Quote {
    pub fn from_pricing(pricing: &Pricing) -> Self {
        Self {
            amount: pricing.amount,
            currency: pricing.currency.clone(),
            unit: pricing.unit,
            expires_at: None,
            note: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

// ── Conversations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Consumer,
    Provider,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Consumer => Role::Provider,
            Role::Provider => Role::Consumer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Consumer => "consumer",
            Role::Provider => "provider",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
    Offer { quote: Quote },
    Accept,
    Reject { reason: String },
    Result { payload: Value },
    Close { reason: Option<String> },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::Offer { .. } => MessageKind::Offer,
            MessageBody::Accept => MessageKind::Accept,
            MessageBody::Reject { .. } => MessageKind::Reject,
            MessageBody::Result { .. } => MessageKind::Result,
            MessageBody::Close { .. } => MessageKind::Close,
        }
    }

    /// Whether a party playing `role` may send this body.
    pub fn allowed_for(&self, role: Role) -> bool {
        match self.kind() {
            MessageKind::Offer | MessageKind::Result => role == Role::Provider,
            MessageKind::Accept | MessageKind::Reject => role == Role::Consumer,
            MessageKind::Text | MessageKind::Close => true,
        }
    }

    /// Short human-readable rendering, used by transcripts and logs.
    pub fn render(&self) -> String {
        match self {
            MessageBody::Text { text } => text.clone(),
            MessageBody::Offer { quote } => format!("offer: {} {}", quote.amount, quote.currency),
            MessageBody::Accept => "accept".to_string(),
            MessageBody::Reject { reason } => format!("reject: {reason}"),
            MessageBody::Result { payload } => format!("result: {payload}"),
            MessageBody::Close { reason: Some(reason) } => format!("close: {reason}"),
            MessageBody::Close { reason: None } => "close".to_string(),
        }
    }
}

/// Discriminant of [`MessageBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Offer,
    Accept,
    Reject,
    Result,
    Close,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Text => "text",
            MessageKind::Offer => "offer",
            MessageKind::Accept => "accept",
            MessageKind::Reject => "reject",
            MessageKind::Result => "result",
            MessageKind::Close => "close",
        };
        f.write_str(s)
    }
}

/// Negotiation state of a conversation.
///
/// ```text
/// Open ──offer──► Negotiating ──accept──► Active ──result──► Completed
///  ▲                  │
///  └─────reject───────┘           (close from any state ──► Closed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Open,
    Negotiating,
    Active,
    Completed,
    Closed,
}

impl ConversationState {
    pub fn is_terminal(self) -> bool {
        self == ConversationState::Closed
    }

    /// State after `body` is exchanged, or `None` if `body` is not valid here.
    pub fn next(self, body: &MessageBody) -> Option<ConversationState> {
        use ConversationState::*;
        match (self, body.kind()) {
            (Closed, _) => None,
            (_, MessageKind::Close) => Some(Closed),
            (state, MessageKind::Text) => Some(state),
            (Open | Negotiating, MessageKind::Offer) => Some(Negotiating),
            (Negotiating, MessageKind::Accept) => Some(Active),
            (Negotiating, MessageKind::Reject) => Some(Open),
            (Active, MessageKind::Result) => Some(Completed),
            _ => None,
        }
    }
}

/// A signed message exchanged inside a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: AgentId,
    pub role: Role,
    /// Per-sender sequence number, starting at 1.
    pub seq: u64,
    pub body: MessageBody,
    pub sent_at: DateTime<Utc>,
    /// Hex-encoded ed25519 verifying key of `sender`.
    pub sender_key: String,
    /// Hex-encoded ed25519 signature over [`Self::signing_bytes`].
    pub signature: String,
}

/// Borrowed view of every signed field.
#[derive(Serialize)]
struct SignedFields<'a> {
    id: &'a MessageId,
    conversation_id: &'a ConversationId,
    sender: &'a str,
    role: Role,
    seq: u64,
    body: &'a MessageBody,
    sent_at: &'a DateTime<Utc>,
    sender_key: &'a str,
}

impl ConversationMessage {
    /// Canonical bytes covered by the signature: JSON of every field except
    /// `signature`, in declaration order.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, MarketplaceError> {
        let fields = SignedFields {
            id: &self.id,
            conversation_id: &self.conversation_id,
            sender: &self.sender,
            role: self.role,
            seq: self.seq,
            body: &self.body,
            sent_at: &self.sent_at,
            sender_key: &self.sender_key,
        };
        Ok(serde_json::to_vec(&fields)?)
    }
}

/// Router-side view of a live conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: ConversationId,
    pub service_id: ServiceId,
    pub consumer_id: AgentId,
    pub provider_id: AgentId,
    pub messages_relayed: u64,
    pub opened_at: DateTime<Utc>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
